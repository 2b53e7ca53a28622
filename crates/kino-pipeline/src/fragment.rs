//! Cached fragment representation

use crate::types::BitrateChangeReason;
use bytes::BytesMut;

/// One buffered unit of a track's timeline
///
/// Owned by the track's ring while resident. The payload moves into the ring
/// on publish and out of it again when the injector takes the fragment.
#[derive(Debug, Clone, Default)]
pub struct CachedFragment {
    /// Fragment bytes
    pub fragment: BytesMut,
    /// Presentation start (seconds)
    pub position: f64,
    /// Duration (seconds)
    pub duration: f64,
    /// Absolute position, independent of discontinuities (seconds)
    pub abs_position: f64,
    /// Offset added to the container PTS at normal rate (seconds)
    pub pts_offset_sec: f64,
    /// First fragment after a timeline discontinuity
    pub discontinuity: bool,
    /// Container initialization segment
    pub init_fragment: bool,
    /// Profile the fragment was fetched at
    pub profile_index: usize,
    /// Media timescale of the payload
    pub timescale: u32,
    /// Placeholder with no payload, injected to keep the timeline moving
    pub is_dummy: bool,
    /// Source URI, for diagnostics
    pub uri: String,
    /// Discontinuity sequence the fragment belongs to
    pub discontinuity_index: u32,
    /// Bandwidth of the profile at fetch time (bps)
    pub bandwidth_bps: u64,
    /// Why the fetch profile was chosen
    pub bitrate_reason: BitrateChangeReason,
}

impl CachedFragment {
    /// Media fragment with the given timing
    pub fn media(position: f64, duration: f64, payload: impl Into<BytesMut>) -> Self {
        Self {
            fragment: payload.into(),
            position,
            duration,
            abs_position: position,
            ..Default::default()
        }
    }

    /// Initialization segment
    pub fn init(payload: impl Into<BytesMut>) -> Self {
        Self {
            fragment: payload.into(),
            init_fragment: true,
            ..Default::default()
        }
    }

    pub fn with_discontinuity(mut self, discontinuity: bool) -> Self {
        self.discontinuity = discontinuity;
        self
    }

    pub fn with_profile(mut self, profile_index: usize, bandwidth_bps: u64) -> Self {
        self.profile_index = profile_index;
        self.bandwidth_bps = bandwidth_bps;
        self
    }

    pub fn with_timescale(mut self, timescale: u32) -> Self {
        self.timescale = timescale;
        self
    }

    pub fn with_pts_offset(mut self, pts_offset_sec: f64) -> Self {
        self.pts_offset_sec = pts_offset_sec;
        self
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.fragment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragment.is_empty()
    }
}

/// Metadata a fetcher attaches when publishing a downloaded fragment
#[derive(Debug, Clone, Default)]
pub struct FragmentMeta {
    pub position: f64,
    pub duration: f64,
    pub abs_position: Option<f64>,
    pub pts_offset_sec: f64,
    pub discontinuity: bool,
    pub init_fragment: bool,
    pub profile_index: usize,
    pub timescale: u32,
    pub is_dummy: bool,
    pub uri: String,
    pub discontinuity_index: u32,
}

impl FragmentMeta {
    pub fn media(position: f64, duration: f64) -> Self {
        Self {
            position,
            duration,
            ..Default::default()
        }
    }

    pub fn init() -> Self {
        Self {
            init_fragment: true,
            ..Default::default()
        }
    }

    pub fn with_discontinuity(mut self, discontinuity: bool) -> Self {
        self.discontinuity = discontinuity;
        self
    }

    pub fn with_profile(mut self, profile_index: usize) -> Self {
        self.profile_index = profile_index;
        self
    }

    pub fn with_timescale(mut self, timescale: u32) -> Self {
        self.timescale = timescale;
        self
    }

    /// Combine with the downloaded payload
    pub(crate) fn into_fragment(self, payload: BytesMut) -> CachedFragment {
        CachedFragment {
            fragment: payload,
            position: self.position,
            duration: self.duration,
            abs_position: self.abs_position.unwrap_or(self.position),
            pts_offset_sec: self.pts_offset_sec,
            discontinuity: self.discontinuity,
            init_fragment: self.init_fragment,
            profile_index: self.profile_index,
            timescale: self.timescale,
            is_dummy: self.is_dummy,
            uri: self.uri,
            discontinuity_index: self.discontinuity_index,
            bandwidth_bps: 0,
            bitrate_reason: BitrateChangeReason::default(),
        }
    }
}
