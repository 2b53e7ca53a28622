//! Pipeline event reporting
//!
//! Captures:
//! - Bitrate changes seen at injection time
//! - Buffer health transitions
//! - Discontinuity and rampdown diagnostics
//! - Counters for reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::context::PlayerContext;
use crate::error::PlayerError;
use crate::types::{BitrateChangeReason, BufferHealth, SessionId, TrackType};

/// Pipeline event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// Video injection moved to a fragment of another profile
    BitrateChanged {
        profile_index: usize,
        bandwidth_bps: u64,
        reason: BitrateChangeReason,
        position: f64,
    },

    /// Buffer health classification changed
    BufferHealthChanged {
        track: TrackType,
        from: BufferHealth,
        to: BufferHealth,
        buffered_seconds: f64,
    },

    /// A one-sided discontinuity was released without being applied
    DiscontinuityIgnored {
        track: TrackType,
        injected_duration: f64,
        other_injected_duration: f64,
    },

    /// Initial caching reached its target
    CachingComplete {
        cached_seconds: f64,
    },

    /// Fetch failure forced a lower profile
    RampDown {
        from_profile: usize,
        to_profile: usize,
        buffered_seconds: f64,
    },

    /// Terminal pipeline error
    Error {
        error: PlayerError,
    },
}

/// Event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event ID
    pub id: Uuid,
    /// Session ID
    pub session_id: SessionId,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Sequence number
    pub sequence: u64,
    /// The event
    #[serde(flatten)]
    pub event: PlayerEvent,
}

/// Stamps events and forwards them to the player context
pub struct EventEmitter {
    session_id: SessionId,
    sequence: Mutex<u64>,
    context: Arc<dyn PlayerContext>,
}

impl EventEmitter {
    pub fn new(session_id: SessionId, context: Arc<dyn PlayerContext>) -> Self {
        Self {
            session_id,
            sequence: Mutex::new(0),
            context,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn emit(&self, event: PlayerEvent) {
        let sequence = {
            let mut seq = self.sequence.lock();
            *seq += 1;
            *seq
        };
        let record = EventRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            timestamp: Utc::now(),
            sequence,
            event,
        };
        debug!(event_id = %record.id, sequence, event = ?record.event, "Pipeline event");
        self.context.on_event(&record);
    }
}

/// Counters kept for reporting
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    bitrate_changes: AtomicU64,
    buffer_health_changes: AtomicU64,
    discarded_fragments: AtomicU64,
    ignored_discontinuities: AtomicU64,
    applied_discontinuities: AtomicU64,
    ramp_downs: AtomicU64,
    injected_fragments: AtomicU64,
    rewrite_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub bitrate_changes: u64,
    pub buffer_health_changes: u64,
    pub discarded_fragments: u64,
    pub ignored_discontinuities: u64,
    pub applied_discontinuities: u64,
    pub ramp_downs: u64,
    pub injected_fragments: u64,
    /// ISOBMFF payloads whose timestamps could not be rewritten
    pub rewrite_failures: u64,
}

impl PipelineMetrics {
    pub fn record_bitrate_change(&self) {
        self.bitrate_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_health_change(&self) {
        self.buffer_health_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded_fragments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored_discontinuity(&self) {
        self.ignored_discontinuities.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied_discontinuity(&self) {
        self.applied_discontinuities.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ramp_down(&self) {
        self.ramp_downs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_injected(&self) {
        self.injected_fragments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rewrite_failure(&self) {
        self.rewrite_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bitrate_changes: self.bitrate_changes.load(Ordering::Relaxed),
            buffer_health_changes: self.buffer_health_changes.load(Ordering::Relaxed),
            discarded_fragments: self.discarded_fragments.load(Ordering::Relaxed),
            ignored_discontinuities: self.ignored_discontinuities.load(Ordering::Relaxed),
            applied_discontinuities: self.applied_discontinuities.load(Ordering::Relaxed),
            ramp_downs: self.ramp_downs.load(Ordering::Relaxed),
            injected_fragments: self.injected_fragments.load(Ordering::Relaxed),
            rewrite_failures: self.rewrite_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_record_serialization() {
        let record = EventRecord {
            id: Uuid::new_v4(),
            session_id: SessionId::new(),
            timestamp: Utc::now(),
            sequence: 7,
            event: PlayerEvent::BufferHealthChanged {
                track: TrackType::Video,
                from: BufferHealth::Green,
                to: BufferHealth::Red,
                buffered_seconds: 0.0,
            },
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"event\":\"buffer_health_changed\""));
        assert!(json.contains("\"to\":\"RED\""));
        assert!(json.contains("\"sequence\":7"));
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = PipelineMetrics::default();
        metrics.record_discard();
        metrics.record_discard();
        metrics.record_ramp_down();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.discarded_fragments, 2);
        assert_eq!(snapshot.ramp_downs, 1);
        assert_eq!(snapshot.bitrate_changes, 0);
    }
}
