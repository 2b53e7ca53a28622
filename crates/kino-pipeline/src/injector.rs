//! Per-track injection loop
//!
//! Takes fragments from the ring in publish order and hands them to the
//! sink, after cross-track catch-up, discontinuity pairing and timestamp
//! correction.

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::context::SegmentPacket;
use crate::discontinuity::DiscontinuityOutcome;
use crate::error::PlayerError;
use crate::fragment::CachedFragment;
use crate::stream::Shared;
use crate::sync::{CatchupExit, CrossTrackSynchronizer, ReleaseReason};
use crate::track::MediaTrack;
use crate::trickplay::{apply_pts_offset, clear_init_duration, Rewrite};
use crate::types::{is_trickplay_rate, TrackType};
use crate::Error;

enum Flow {
    Continue,
    Stop,
}

/// Injector thread body
pub(crate) fn run_injector(shared: Arc<Shared>, kind: TrackType) {
    let track = shared.track(kind);
    info!(track = %kind, "Injector started");

    loop {
        if track.is_reload_pending() && !track.wait_for_reload(shared.config.catchup_poll()) {
            break;
        }
        let taken = match track.ring().take_for_inject() {
            Ok(taken) => taken,
            Err(Error::EndOfStream { .. }) => {
                shared.on_track_end(kind);
                break;
            }
            Err(Error::Aborted { .. }) => break,
            Err(e) => {
                warn!(track = %kind, error = %e, "Injector stopping on ring error");
                break;
            }
        };

        let flow = inject_fragment(&shared, track, taken.fragment);

        match track.ring().release(taken.ticket) {
            Ok(()) => {}
            Err(Error::StaleTicket { .. }) => trace!(track = %kind, "Slot flushed while injecting"),
            Err(e) => warn!(track = %kind, error = %e, "Slot release failed"),
        }

        if let Flow::Stop = flow {
            break;
        }
    }
    info!(track = %kind, injected = track.injected_duration(), "Injector stopped");
}

fn inject_fragment(shared: &Shared, track: &MediaTrack, mut fragment: CachedFragment) -> Flow {
    let kind = track.kind();
    let muxed = shared.is_muxed();

    if let Some(anchor) = CrossTrackSynchronizer::anchor_for(kind, muxed) {
        if shared.track(anchor).is_enabled() {
            let exit = shared
                .sync
                .wait_for_anchor(kind, || shared.catchup_probe(kind, anchor));
            if exit == CatchupExit::Released(ReleaseReason::FollowerAborted) {
                return Flow::Stop;
            }
        }
    }

    // Trick modes restamp a continuous timeline; the renderer never sees a break
    let rate = shared.rate();
    let mut discontinuity = false;
    if fragment.discontinuity && !is_trickplay_rate(rate) {
        match process_discontinuity(shared, track, muxed) {
            DiscontinuityOutcome::Applied => {
                discontinuity = true;
                track.set_discontinuity_processed(true);
                shared.metrics.record_applied_discontinuity();
            }
            DiscontinuityOutcome::Ignored => {}
            DiscontinuityOutcome::Aborted => return Flow::Stop,
        }
    }

    if shared.config.pts_restamp_enabled && shared.protocol.supports_pts_restamp() {
        let rewrite = if is_trickplay_rate(rate) {
            track.restamper().restamp(&mut fragment, rate)
        } else if fragment.init_fragment {
            clear_init_duration(&mut fragment)
        } else {
            apply_pts_offset(&mut fragment)
        };
        if rewrite == Rewrite::PayloadFailed {
            warn!(
                track = %kind,
                position = fragment.position,
                init = fragment.init_fragment,
                rate,
                "Timestamp rewrite failed, payload keeps its original box timing"
            );
            shared.metrics.record_rewrite_failure();
        }
    }

    if fragment.is_dummy {
        trace!(track = %kind, position = fragment.position, "Dummy fragment skipped");
        track.update_after_inject(&fragment);
        return Flow::Continue;
    }

    let packet = SegmentPacket {
        track: kind,
        payload: std::mem::take(&mut fragment.fragment).freeze(),
        pts: fragment.position,
        dts: fragment.position,
        duration: fragment.duration,
        pts_offset: fragment.pts_offset_sec,
        init_fragment: fragment.init_fragment,
        discontinuity,
    };

    if shared.sink.send_media_segment(packet).is_accepted() {
        track.update_after_inject(&fragment);
        track.set_sink_buffer_full(shared.sink.is_buffer_full(kind));
        shared.metrics.record_injected();
        if !fragment.init_fragment {
            if shared.clock.start() {
                info!(track = %kind, position = fragment.position, "First fragment injected, playback clock started");
            }
            if !discontinuity {
                track.set_discontinuity_processed(false);
            }
        }
        debug!(
            track = %kind,
            position = fragment.position,
            duration = fragment.duration,
            init = fragment.init_fragment,
            discontinuity,
            "Fragment injected"
        );
        shared.after_inject(kind, &fragment);
        return Flow::Continue;
    }

    let failures = track.record_inject_failure();
    shared.metrics.record_discard();
    warn!(
        track = %kind,
        position = fragment.position,
        failures,
        "Fragment discarded by sink"
    );
    if failures >= shared.config.segment_inject_fail_threshold {
        error!(track = %kind, failures, "Too many discarded fragments, stopping injection");
        shared.report_fatal(PlayerError::PtsError {
            track: kind,
            discarded: failures,
        });
        return Flow::Stop;
    }
    Flow::Continue
}

fn process_discontinuity(shared: &Shared, track: &MediaTrack, muxed: bool) -> DiscontinuityOutcome {
    let kind = track.kind();

    // Nothing injected yet: the renderer has no timeline to break
    if track.injected_duration() == 0.0 {
        info!(track = %kind, "Discontinuity before first injection ignored");
        if shared.protocol.has_periods() {
            shared.discontinuity.note_ignored(kind);
        }
        shared.metrics.record_ignored_discontinuity();
        return DiscontinuityOutcome::Ignored;
    }

    let peer_enabled = kind
        .pairing_peer()
        .is_some_and(|peer| shared.track(peer).is_enabled());
    if kind.pairing_peer().is_some() && !peer_enabled && !muxed {
        let verdict = shared.sink.apply_discontinuity(kind);
        return if verdict.is_accepted() {
            DiscontinuityOutcome::Applied
        } else {
            DiscontinuityOutcome::Ignored
        };
    }

    // Let a follower that is waiting on us move up to its own discontinuity
    if kind == TrackType::Video {
        shared.sync.notify(TrackType::Audio);
    }
    shared
        .discontinuity
        .process(kind, muxed, shared.sink.as_ref())
}
