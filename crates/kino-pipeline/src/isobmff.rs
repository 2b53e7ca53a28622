//! In-place ISOBMFF rewrites used for PTS restamping
//!
//! Only the handful of boxes that carry timing are touched: `mvhd`/`mdhd`
//! timescale and duration in init segments, `tfdt` base decode time and
//! `trun`/`tfhd` sample durations in media segments. Box sizes never change.

use tracing::{trace, warn};

const MOOV: [u8; 4] = *b"moov";
const MVHD: [u8; 4] = *b"mvhd";
const TRAK: [u8; 4] = *b"trak";
const MDIA: [u8; 4] = *b"mdia";
const MDHD: [u8; 4] = *b"mdhd";
const MOOF: [u8; 4] = *b"moof";
const TRAF: [u8; 4] = *b"traf";
const TFHD: [u8; 4] = *b"tfhd";
const TFDT: [u8; 4] = *b"tfdt";
const TRUN: [u8; 4] = *b"trun";

const TOP_LEVEL: [[u8; 4]; 8] = [
    *b"ftyp", *b"styp", *b"moov", *b"moof", *b"sidx", *b"emsg", *b"mdat", *b"prft",
];

const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x02;
const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x08;

const TRUN_DATA_OFFSET: u32 = 0x001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x004;
const TRUN_SAMPLE_DURATION: u32 = 0x100;
const TRUN_SAMPLE_SIZE: u32 = 0x200;
const TRUN_SAMPLE_FLAGS: u32 = 0x400;
const TRUN_SAMPLE_CTO: u32 = 0x800;

/// Parsed view over a single box inside a parent byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoxView {
    start: usize,
    end: usize,
    fourcc: [u8; 4],
    body_start: usize,
}

/// Read a box header: returns `(total_box_size, fourcc, header_size)`
fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc = [data[4], data[5], data[6], data[7]];

    match size {
        1 => {
            let ext = data.get(8..16)?;
            let ext_size = u64::from_be_bytes(ext.try_into().ok()?);
            Some((usize::try_from(ext_size).ok()?, fourcc, 16))
        }
        0 => Some((data.len(), fourcc, 8)),
        _ => Some((size as usize, fourcc, 8)),
    }
}

fn box_at(data: &[u8], offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end {
        return None;
    }
    let (size, fourcc, header_size) = read_box_header(data.get(offset..end)?)?;
    if size < header_size {
        return None;
    }
    let box_end = offset.checked_add(size).filter(|e| *e <= end)?;
    Some(BoxView {
        start: offset,
        end: box_end,
        fourcc,
        body_start: offset + header_size,
    })
}

/// All boxes with the given FourCC directly inside `[start..end)`
fn find_boxes(data: &[u8], start: usize, end: usize, target: [u8; 4]) -> Vec<BoxView> {
    let mut found = Vec::new();
    let mut offset = start;
    while let Some(parsed) = box_at(data, offset, end) {
        if parsed.end <= offset {
            break;
        }
        if parsed.fourcc == target {
            found.push(parsed);
        }
        offset = parsed.end;
    }
    found
}

fn find_first_box(data: &[u8], start: usize, end: usize, target: [u8; 4]) -> Option<BoxView> {
    let mut offset = start;
    while offset < end {
        let parsed = box_at(data, offset, end)?;
        if parsed.end <= offset {
            return None;
        }
        if parsed.fourcc == target {
            return Some(parsed);
        }
        offset = parsed.end;
    }
    None
}

fn find_path(data: &[u8], path: &[[u8; 4]]) -> Option<BoxView> {
    let mut current: Option<BoxView> = None;
    for fourcc in path {
        let (start, end) = match current {
            Some(parent) => (parent.body_start, parent.end),
            None => (0, data.len()),
        };
        current = Some(find_first_box(data, start, end, *fourcc)?);
    }
    current
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) -> bool {
    match data.get_mut(offset..offset + 4) {
        Some(slot) => {
            slot.copy_from_slice(&value.to_be_bytes());
            true
        }
        None => false,
    }
}

fn write_u64(data: &mut [u8], offset: usize, value: u64) -> bool {
    match data.get_mut(offset..offset + 8) {
        Some(slot) => {
            slot.copy_from_slice(&value.to_be_bytes());
            true
        }
        None => false,
    }
}

/// `(version, flags)` of a full box
fn full_box_header(data: &[u8], view: BoxView) -> Option<(u8, u32)> {
    let word = read_u32(data, view.body_start)?;
    Some(((word >> 24) as u8, word & 0x00ff_ffff))
}

/// Offset of the timescale field in an `mvhd` or `mdhd` box
fn header_timescale_offset(data: &[u8], view: BoxView) -> Option<usize> {
    let (version, _) = full_box_header(data, view)?;
    let offset = match version {
        1 => view.body_start + 4 + 16,
        _ => view.body_start + 4 + 8,
    };
    (offset + 4 <= view.end).then_some(offset)
}

/// True if the payload starts with a recognizable top-level box
pub fn is_isobmff(data: &[u8]) -> bool {
    box_at(data, 0, data.len()).is_some_and(|view| TOP_LEVEL.contains(&view.fourcc))
}

/// Media timescale from the first track's `mdhd`
pub fn media_timescale(data: &[u8]) -> Option<u32> {
    let mdhd = find_path(data, &[MOOV, TRAK, MDIA, MDHD])?;
    read_u32(data, header_timescale_offset(data, mdhd)?)
}

/// Rewrite the movie and media timescale of an init segment
pub fn set_timescale(data: &mut [u8], timescale: u32) -> bool {
    let Some(mvhd) = find_path(data, &[MOOV, MVHD]) else {
        warn!("mvhd box not found in init segment");
        return false;
    };
    let Some(mdhd) = find_path(data, &[MOOV, TRAK, MDIA, MDHD]) else {
        warn!("mdhd box not found in init segment");
        return false;
    };
    let (Some(mvhd_at), Some(mdhd_at)) = (
        header_timescale_offset(data, mvhd),
        header_timescale_offset(data, mdhd),
    ) else {
        return false;
    };
    trace!(timescale, "Setting mvhd and mdhd timescale");
    write_u32(data, mvhd_at, timescale) && write_u32(data, mdhd_at, timescale)
}

/// Zero the media header duration of an init segment
pub fn clear_media_header_duration(data: &mut [u8]) -> bool {
    let Some(mdhd) = find_path(data, &[MOOV, TRAK, MDIA, MDHD]) else {
        return false;
    };
    let Some((version, _)) = full_box_header(data, mdhd) else {
        return false;
    };
    let Some(timescale_at) = header_timescale_offset(data, mdhd) else {
        return false;
    };
    let duration_at = timescale_at + 4;
    match version {
        1 => write_u64(data, duration_at, 0),
        _ => write_u32(data, duration_at, 0),
    }
}

/// Set the base decode time of the first fragment and the duration of its samples
///
/// `pts` and `duration` are in the segment's timescale.
pub fn set_pts_and_duration(data: &mut [u8], pts: u64, duration: u64) -> bool {
    let Some(traf) = find_path(data, &[MOOF, TRAF]) else {
        warn!("moof/traf box missing in media segment");
        return false;
    };

    let mut updated = false;
    match find_first_box(data, traf.body_start, traf.end, TFDT) {
        Some(tfdt) => updated |= write_decode_time(data, tfdt, pts),
        None => warn!("tfdt box unexpectedly missing"),
    }

    let trun = find_first_box(data, traf.body_start, traf.end, TRUN);
    let tfhd = find_first_box(data, traf.body_start, traf.end, TFHD);
    match (trun, tfhd) {
        (Some(trun), Some(tfhd)) => {
            if !update_sample_duration(data, trun, tfhd, duration) {
                warn!("Sample duration not set");
            }
        }
        _ => warn!("trun or tfhd box unexpectedly missing"),
    }
    updated
}

/// Shift every `tfdt` by `offset` ticks
///
/// Returns the first decode time before and after the shift.
pub fn restamp_pts(data: &mut [u8], offset: i64) -> Option<(u64, u64)> {
    let mut first: Option<(u64, u64)> = None;
    for moof in find_boxes(data, 0, data.len(), MOOF) {
        for traf in find_boxes(data, moof.body_start, moof.end, TRAF) {
            for tfdt in find_boxes(data, traf.body_start, traf.end, TFDT) {
                let Some(before) = read_decode_time(data, tfdt) else {
                    continue;
                };
                let after = before.saturating_add_signed(offset);
                if write_decode_time(data, tfdt, after) && first.is_none() {
                    first = Some((before, after));
                }
            }
        }
    }
    first
}

fn read_decode_time(data: &[u8], tfdt: BoxView) -> Option<u64> {
    let (version, _) = full_box_header(data, tfdt)?;
    let at = tfdt.body_start + 4;
    match version {
        1 => read_u64(data, at),
        _ => read_u32(data, at).map(u64::from),
    }
}

fn write_decode_time(data: &mut [u8], tfdt: BoxView, value: u64) -> bool {
    let Some((version, _)) = full_box_header(data, tfdt) else {
        return false;
    };
    let at = tfdt.body_start + 4;
    match version {
        1 => write_u64(data, at, value),
        _ => write_u32(data, at, value as u32),
    }
}

fn update_sample_duration(data: &mut [u8], trun: BoxView, tfhd: BoxView, duration: u64) -> bool {
    let Some((_, trun_flags)) = full_box_header(data, trun) else {
        return false;
    };
    if trun_flags & TRUN_SAMPLE_DURATION != 0 {
        let Some(sample_count) = read_u32(data, trun.body_start + 4) else {
            return false;
        };
        let mut at = trun.body_start + 8;
        if trun_flags & TRUN_DATA_OFFSET != 0 {
            at += 4;
        }
        if trun_flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
            at += 4;
        }
        let per_sample_fields = [
            TRUN_SAMPLE_DURATION,
            TRUN_SAMPLE_SIZE,
            TRUN_SAMPLE_FLAGS,
            TRUN_SAMPLE_CTO,
        ]
        .iter()
        .filter(|flag| trun_flags & **flag != 0)
        .count();
        let stride = per_sample_fields * 4;
        let sample_duration = (duration / u64::from(sample_count.max(1))) as u32;
        for sample in 0..sample_count as usize {
            if !write_u32(data, at + sample * stride, sample_duration) {
                return false;
            }
        }
        return sample_count > 0;
    }

    let Some((_, tfhd_flags)) = full_box_header(data, tfhd) else {
        return false;
    };
    if tfhd_flags & TFHD_DEFAULT_SAMPLE_DURATION == 0 {
        return false;
    }
    let mut at = tfhd.body_start + 8;
    if tfhd_flags & TFHD_BASE_DATA_OFFSET != 0 {
        at += 8;
    }
    if tfhd_flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        at += 4;
    }
    write_u32(data, at, duration as u32)
}


#[cfg(test)]
mod tests {
    use super::test_boxes::*;
    use super::*;

    fn tfdt_of(data: &[u8]) -> u64 {
        let tfdt = find_path(data, &[MOOF, TRAF, TFDT]).unwrap();
        read_decode_time(data, tfdt).unwrap()
    }

    #[test]
    fn test_set_timescale_and_clear_duration() {
        let mut init = init_segment(90_000, 4_500_000);
        assert!(is_isobmff(&init));
        assert_eq!(media_timescale(&init), Some(90_000));

        assert!(set_timescale(&mut init, 100_000));
        assert!(clear_media_header_duration(&mut init));
        assert_eq!(media_timescale(&init), Some(100_000));

        let mvhd = find_path(&init, &[MOOV, MVHD]).unwrap();
        assert_eq!(read_u32(&init, header_timescale_offset(&init, mvhd).unwrap()), Some(100_000));

        let mdhd = find_path(&init, &[MOOV, TRAK, MDIA, MDHD]).unwrap();
        let duration_at = header_timescale_offset(&init, mdhd).unwrap() + 4;
        assert_eq!(read_u32(&init, duration_at), Some(0));
    }

    #[test]
    fn test_set_pts_and_duration() {
        let mut media = media_segment(900_000, 180_000);
        assert!(set_pts_and_duration(&mut media, 25_000, 33_333));
        assert_eq!(tfdt_of(&media), 25_000);

        let trun = find_path(&media, &[MOOF, TRAF, TRUN]).unwrap();
        assert_eq!(read_u32(&media, trun.body_start + 8), Some(33_333));
    }

    #[test]
    fn test_restamp_pts_offset() {
        let mut media = media_segment(1_000, 512);
        assert_eq!(restamp_pts(&mut media, 9_000), Some((1_000, 10_000)));
        assert_eq!(tfdt_of(&media), 10_000);
    }

    #[test]
    fn test_non_isobmff_payload_is_untouched() {
        let mut payload = b"\x47\x40\x00\x10 transport stream".to_vec();
        let before = payload.clone();
        assert!(!is_isobmff(&payload));
        assert!(!set_timescale(&mut payload, 100_000));
        assert!(!set_pts_and_duration(&mut payload, 0, 0));
        assert_eq!(restamp_pts(&mut payload, 100), None);
        assert_eq!(payload, before);
    }

    #[test]
    fn test_oversized_largesize_rejected() {
        for largesize in [u64::MAX, u64::MAX / 2, 4096] {
            let mut data = make_box(b"ftyp", b"iso6\0\0\0\0");
            data.extend_from_slice(&1u32.to_be_bytes());
            data.extend_from_slice(b"moov");
            data.extend_from_slice(&largesize.to_be_bytes());
            data.extend_from_slice(&[0u8; 8]);

            assert!(is_isobmff(&data));
            assert_eq!(media_timescale(&data), None);
            assert!(!set_timescale(&mut data, 100_000));
            assert!(find_boxes(&data, 0, data.len(), MOOV).is_empty());
        }

        let mut traf = 1u32.to_be_bytes().to_vec();
        traf.extend_from_slice(b"traf");
        traf.extend_from_slice(&(u64::MAX - 15).to_be_bytes());
        let mut media = make_box(b"moof", &traf);
        assert_eq!(restamp_pts(&mut media, 100), None);
    }
}
