//! Playback clock used to derive buffered seconds

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct ClockState {
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

/// Wall-clock playback time, excluding pauses
///
/// Starts when the first fragment is injected.
#[derive(Debug, Default)]
pub struct PlaybackClock {
    state: Mutex<ClockState>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock; later calls are no-ops until [`reset`](Self::reset)
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.started_at.is_some() {
            return false;
        }
        state.started_at = Some(Instant::now());
        true
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started_at.is_some()
    }

    pub fn notify_playback_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        match (paused, state.paused_at) {
            (true, None) => state.paused_at = Some(Instant::now()),
            (false, Some(since)) => {
                state.paused_total += since.elapsed();
                state.paused_at = None;
            }
            _ => {}
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused_at.is_some()
    }

    /// Seconds of playback since start
    pub fn elapsed_seconds(&self) -> f64 {
        let state = self.state.lock();
        let Some(started) = state.started_at else {
            return 0.0;
        };
        let mut paused = state.paused_total;
        if let Some(since) = state.paused_at {
            paused += since.elapsed();
        }
        started.elapsed().saturating_sub(paused).as_secs_f64()
    }

    pub fn reset(&self) {
        *self.state.lock() = ClockState::default();
    }
}
