//! Core types for the Kino fragment pipeline

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normal playback rate
pub const NORMAL_PLAY_RATE: f64 = 1.0;

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tracks
// ============================================================================

/// Elementary track handled by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
    AuxAudio,
}

impl TrackType {
    /// All tracks, in slot order
    pub const ALL: [TrackType; 4] = [
        TrackType::Video,
        TrackType::Audio,
        TrackType::Subtitle,
        TrackType::AuxAudio,
    ];

    /// Stable index used for per-track arrays
    pub fn index(self) -> usize {
        match self {
            TrackType::Video => 0,
            TrackType::Audio => 1,
            TrackType::Subtitle => 2,
            TrackType::AuxAudio => 3,
        }
    }

    /// The track that takes part in video/audio discontinuity pairing with this one
    pub fn pairing_peer(self) -> Option<TrackType> {
        match self {
            TrackType::Video => Some(TrackType::Audio),
            TrackType::Audio => Some(TrackType::Video),
            TrackType::Subtitle | TrackType::AuxAudio => None,
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, TrackType::Audio | TrackType::AuxAudio)
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackType::Video => write!(f, "video"),
            TrackType::Audio => write!(f, "audio"),
            TrackType::Subtitle => write!(f, "subtitle"),
            TrackType::AuxAudio => write!(f, "aux-audio"),
        }
    }
}

/// Buffer health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BufferHealth {
    #[default]
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for BufferHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferHealth::Green => write!(f, "GREEN"),
            BufferHealth::Yellow => write!(f, "YELLOW"),
            BufferHealth::Red => write!(f, "RED"),
        }
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// Why the active profile changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitrateChangeReason {
    #[default]
    Tune,
    Seek,
    Trickplay,
    Abr,
    Rampdown,
    BufferEmpty,
    Manual,
}

impl std::fmt::Display for BitrateChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BitrateChangeReason::Tune => write!(f, "tune"),
            BitrateChangeReason::Seek => write!(f, "seek"),
            BitrateChangeReason::Trickplay => write!(f, "trickplay"),
            BitrateChangeReason::Abr => write!(f, "abr"),
            BitrateChangeReason::Rampdown => write!(f, "rampdown"),
            BitrateChangeReason::BufferEmpty => write!(f, "buffer-empty"),
            BitrateChangeReason::Manual => write!(f, "manual"),
        }
    }
}

/// A single rendition the video track can be fetched at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Advertised bandwidth in bits per second
    pub bandwidth_bps: u64,
    /// Iframe-only rendition used for trickplay
    #[serde(default)]
    pub iframe: bool,
    /// Optional picture height, for reporting
    #[serde(default)]
    pub height: Option<u32>,
}

impl Profile {
    pub fn new(bandwidth_bps: u64) -> Self {
        Self {
            bandwidth_bps,
            iframe: false,
            height: None,
        }
    }

    pub fn iframe(bandwidth_bps: u64) -> Self {
        Self {
            bandwidth_bps,
            iframe: true,
            height: None,
        }
    }
}

// ============================================================================
// Protocols
// ============================================================================

/// Streaming protocol the session was detected as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
    #[default]
    Dash,
    Hls,
    Progressive,
}

impl StreamProtocol {
    /// Fragmented ISOBMFF payloads whose PTS can be rewritten in place
    pub fn supports_pts_restamp(self) -> bool {
        matches!(self, StreamProtocol::Dash | StreamProtocol::Hls)
    }

    /// Low-latency chunked delivery
    pub fn supports_chunk_mode(self) -> bool {
        matches!(self, StreamProtocol::Dash)
    }

    /// Periods can end with an unpaired discontinuity on one track
    pub fn has_periods(self) -> bool {
        matches!(self, StreamProtocol::Dash)
    }
}

impl std::fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamProtocol::Dash => write!(f, "DASH"),
            StreamProtocol::Hls => write!(f, "HLS"),
            StreamProtocol::Progressive => write!(f, "Progressive"),
        }
    }
}

/// Returns true when `rate` needs trickplay restamping (fast forward or rewind)
pub fn is_trickplay_rate(rate: f64) -> bool {
    rate > NORMAL_PLAY_RATE || rate < 0.0
}
