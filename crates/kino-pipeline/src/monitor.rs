//! Buffer health monitoring
//!
//! One low-frequency thread per track classifies how much media the
//! renderer holds and runs the periodic discontinuity and deadlock checks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::events::PlayerEvent;
use crate::stream::Shared;
use crate::types::{is_trickplay_rate, BufferHealth, TrackType};

/// Classify a track's buffer
///
/// `cached` is the number of fragments held in the ring; chunk mode passes 0
/// since its buffered seconds already count the queued chunks.
pub fn classify(cached: usize, buffered_seconds: f64, green_threshold: f64) -> BufferHealth {
    if cached == 0 && buffered_seconds <= 0.0 {
        BufferHealth::Red
    } else if cached == 0 && buffered_seconds <= green_threshold {
        BufferHealth::Yellow
    } else {
        BufferHealth::Green
    }
}

/// Interruptible sleep shared by the monitor threads
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Sleep for `duration`; false if stopped before or during the sleep
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.cond.wait_for(&mut stopped, duration);
        }
        !*stopped
    }

    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.stopped.lock() = false;
    }
}

/// Monitor thread body
pub(crate) fn run_monitor(shared: Arc<Shared>, kind: TrackType) {
    info!(track = %kind, "Buffer monitor started");
    let mut interval = shared.config.monitor_delay();
    while shared.stop.sleep(interval) {
        interval = shared.config.monitor_interval();
        if !shared.track(kind).is_enabled() || is_trickplay_rate(shared.rate()) {
            continue;
        }
        check_buffer_health(&shared, kind);
    }
    info!(track = %kind, "Buffer monitor stopped");
}

/// One monitor tick
pub(crate) fn check_buffer_health(shared: &Shared, kind: TrackType) {
    let track = shared.track(kind);
    let buffered = track.buffered_duration(shared.clock.elapsed_seconds());
    let cached = if shared.config.low_latency_mode {
        0
    } else {
        track.ring().occupancy()
    };
    let health = classify(cached, buffered, shared.config.green_threshold());

    if let Some(previous) = track.set_health(health) {
        warn!(
            track = %kind,
            from = %previous,
            to = %health,
            buffered,
            cached = track.ring().occupancy(),
            "Buffer health changed"
        );
        shared.metrics.record_buffer_health_change();
        shared.emitter.emit(PlayerEvent::BufferHealthChanged {
            track: kind,
            from: previous,
            to: health,
            buffered_seconds: buffered,
        });
    } else {
        debug!(track = %kind, health = %health, buffered, "Buffer health");
    }

    shared.check_for_injection_stall(kind);
    shared.check_discontinuity_timeout(kind);

    if kind == TrackType::Video {
        shared.check_for_playback_stall(false);
        if shared.context.is_underflow()
            && health == BufferHealth::Green
            && !shared.context.is_ingestion_enabled(kind)
        {
            warn!(
                track = %kind,
                buffered,
                "Possible deadlock: underflow with a healthy buffer and ingestion paused, resuming"
            );
            shared.context.resume_ingestion(kind);
        }
    }
}
