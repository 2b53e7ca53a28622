//! Collaborator interfaces injected into the pipeline
//!
//! The pipeline never reaches for a global player object. Everything it needs
//! from the surrounding player goes through [`PlayerContext`], and everything
//! it produces goes to a [`MediaSink`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::PlayerError;
use crate::events::EventRecord;
use crate::types::TrackType;

/// Why the pipeline asks the player for a retune
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetuneReason {
    StallAfterDiscontinuity,
    PlaybackStalled,
}

/// Narrow query/command surface of the owning player
pub trait PlayerContext: Send + Sync {
    /// Fetching and injection may proceed
    fn downloads_enabled(&self) -> bool;

    /// Downstream currently accepts data for `track`
    fn is_ingestion_enabled(&self, track: TrackType) -> bool;

    fn pause_ingestion(&self, track: TrackType);

    fn resume_ingestion(&self, track: TrackType);

    /// The renderer reported an underflow that has not cleared yet
    fn is_underflow(&self) -> bool;

    /// Latest externally measured bandwidth, if any
    fn network_bandwidth(&self) -> Option<u64> {
        None
    }

    /// Terminal failure; the pipeline stops after reporting it
    fn report_error(&self, error: PlayerError);

    fn schedule_retune(&self, track: TrackType, reason: RetuneReason);

    /// Initial pre-roll buffering finished
    fn on_caching_complete(&self) {}

    fn on_event(&self, _record: &EventRecord) {}
}

/// Downstream verdict on a hand-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkVerdict {
    Accepted,
    Rejected,
}

impl SinkVerdict {
    pub fn is_accepted(self) -> bool {
        self == SinkVerdict::Accepted
    }
}

/// One fragment handed to the renderer; the payload is owned by the sink from here on
#[derive(Debug, Clone)]
pub struct SegmentPacket {
    pub track: TrackType,
    pub payload: Bytes,
    pub pts: f64,
    pub dts: f64,
    pub duration: f64,
    pub pts_offset: f64,
    pub init_fragment: bool,
    pub discontinuity: bool,
}

/// Renderer side of the pipeline
pub trait MediaSink: Send + Sync {
    fn send_media_segment(&self, packet: SegmentPacket) -> SinkVerdict;

    /// Flush and reconfigure the renderer for `track` at a timeline break
    fn apply_discontinuity(&self, track: TrackType) -> SinkVerdict;

    fn signal_end_of_stream(&self, track: TrackType);

    /// Renderer queue for `track` cannot take more data right now
    fn is_buffer_full(&self, _track: TrackType) -> bool {
        false
    }
}
