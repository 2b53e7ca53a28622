//! Per-track state shared by the fetch side, the injector and the monitor

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::fragment::CachedFragment;
use crate::isobmff;
use crate::ring::FragmentSlotRing;
use crate::trickplay::TrickplayRestamper;
use crate::types::{BufferHealth, TrackType};

/// Running counters of a track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackStats {
    pub total_fetched_duration: f64,
    pub total_injected_duration: f64,
    pub last_injected_position: f64,
    /// Duration of the last published media fragment
    pub fragment_duration_seconds: f64,
    pub total_fragments_downloaded: u64,
    pub total_fragments_injected: u64,
    /// Consecutive fragments the sink refused
    pub inject_fail_count: u32,
    /// Media cached while initial caching is in progress
    pub initial_cache_duration: f64,
    pub current_bandwidth_bps: u64,
}

/// Point-in-time view of a track, safe to hand to another track's logic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub track: TrackType,
    pub enabled: bool,
    #[serde(flatten)]
    pub stats: TrackStats,
    pub occupancy: usize,
    pub queued_duration: f64,
    pub health: BufferHealth,
    pub eos_reached: bool,
    pub aborted: bool,
    pub discontinuity_processed: bool,
    pub caching_completed: bool,
}

/// One elementary track: its fragment ring plus bookkeeping
pub struct MediaTrack {
    kind: TrackType,
    ring: FragmentSlotRing,
    chunk_mode: bool,
    stats: Mutex<TrackStats>,
    enabled: AtomicBool,
    eos_reached: AtomicBool,
    discontinuity_processed: AtomicBool,
    sink_buffer_full: AtomicBool,
    caching_completed: AtomicBool,
    /// Media timescale of the last init segment
    timescale: AtomicU32,
    health: Mutex<BufferHealth>,
    restamper: Mutex<TrickplayRestamper>,
    reload_pending: Mutex<bool>,
    reload_cond: Condvar,
}

impl MediaTrack {
    pub fn new(kind: TrackType, config: &PipelineConfig) -> Self {
        Self {
            kind,
            ring: FragmentSlotRing::new(kind, config.ring_capacity()),
            chunk_mode: config.low_latency_mode,
            stats: Mutex::new(TrackStats::default()),
            enabled: AtomicBool::new(false),
            eos_reached: AtomicBool::new(false),
            discontinuity_processed: AtomicBool::new(false),
            sink_buffer_full: AtomicBool::new(false),
            caching_completed: AtomicBool::new(false),
            timescale: AtomicU32::new(0),
            health: Mutex::new(BufferHealth::Green),
            restamper: Mutex::new(TrickplayRestamper::new(config.trickplay_fps)),
            reload_pending: Mutex::new(false),
            reload_cond: Condvar::new(),
        }
    }

    pub fn kind(&self) -> TrackType {
        self.kind
    }

    pub fn ring(&self) -> &FragmentSlotRing {
        &self.ring
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn stats(&self) -> TrackStats {
        self.stats.lock().clone()
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            track: self.kind,
            enabled: self.is_enabled(),
            stats: self.stats(),
            occupancy: self.ring.occupancy(),
            queued_duration: self.ring.queued_duration(),
            health: self.health(),
            eos_reached: self.is_eos_reached(),
            aborted: self.ring.is_aborted(),
            discontinuity_processed: self.is_discontinuity_processed(),
            caching_completed: self.is_caching_completed(),
        }
    }

    /// Fill in the payload timescale from the track's init segment
    pub(crate) fn resolve_timescale(&self, fragment: &mut CachedFragment) {
        if fragment.init_fragment {
            if fragment.timescale == 0 && isobmff::is_isobmff(&fragment.fragment) {
                fragment.timescale = isobmff::media_timescale(&fragment.fragment).unwrap_or(0);
            }
            if fragment.timescale != 0 {
                self.timescale.store(fragment.timescale, Ordering::Release);
            }
        } else if fragment.timescale == 0 {
            fragment.timescale = self.timescale.load(Ordering::Acquire);
        }
    }

    pub fn injected_duration(&self) -> f64 {
        self.stats.lock().total_injected_duration
    }

    pub fn fetched_duration(&self) -> f64 {
        self.stats.lock().total_fetched_duration
    }

    pub fn fragment_duration(&self) -> f64 {
        self.stats.lock().fragment_duration_seconds
    }

    pub fn last_injected_position(&self) -> f64 {
        self.stats.lock().last_injected_position
    }

    /// Seconds of media handed downstream but not yet played
    ///
    /// In chunk mode the queued chunk duration is used instead.
    pub fn buffered_duration(&self, elapsed_seconds: f64) -> f64 {
        if self.chunk_mode {
            self.ring.queued_duration()
        } else {
            self.injected_duration() - elapsed_seconds
        }
    }

    /// Bookkeeping after a media fragment was published
    pub(crate) fn update_after_fetch(&self, duration: f64, bandwidth_bps: u64) {
        let mut stats = self.stats.lock();
        stats.total_fetched_duration += duration;
        stats.total_fragments_downloaded += 1;
        stats.fragment_duration_seconds = duration;
        stats.current_bandwidth_bps = bandwidth_bps;
        if !self.caching_completed.load(Ordering::Acquire) {
            stats.initial_cache_duration += duration;
        }
    }

    /// Bookkeeping after the sink accepted a fragment
    pub(crate) fn update_after_inject(&self, fragment: &CachedFragment) {
        let mut stats = self.stats.lock();
        stats.inject_fail_count = 0;
        if fragment.init_fragment {
            return;
        }
        stats.total_injected_duration += fragment.duration.max(0.0);
        stats.last_injected_position = fragment.position;
        stats.total_fragments_injected += 1;
    }

    /// Count a sink refusal; returns the consecutive count
    pub(crate) fn record_inject_failure(&self) -> u32 {
        let mut stats = self.stats.lock();
        stats.inject_fail_count += 1;
        stats.inject_fail_count
    }

    pub fn health(&self) -> BufferHealth {
        *self.health.lock()
    }

    /// Store a new classification, returning the previous one if it changed
    pub(crate) fn set_health(&self, health: BufferHealth) -> Option<BufferHealth> {
        let mut current = self.health.lock();
        if *current == health {
            return None;
        }
        let previous = *current;
        *current = health;
        Some(previous)
    }

    pub fn is_eos_reached(&self) -> bool {
        self.eos_reached.load(Ordering::Acquire)
    }

    pub(crate) fn set_eos_reached(&self, reached: bool) {
        self.eos_reached.store(reached, Ordering::Release);
    }

    pub fn is_discontinuity_processed(&self) -> bool {
        self.discontinuity_processed.load(Ordering::Acquire)
    }

    pub(crate) fn set_discontinuity_processed(&self, processed: bool) {
        self.discontinuity_processed.store(processed, Ordering::Release);
    }

    pub fn is_sink_buffer_full(&self) -> bool {
        self.sink_buffer_full.load(Ordering::Acquire)
    }

    pub(crate) fn set_sink_buffer_full(&self, full: bool) {
        self.sink_buffer_full.store(full, Ordering::Release);
    }

    pub fn is_caching_completed(&self) -> bool {
        self.caching_completed.load(Ordering::Acquire)
    }

    /// Returns true only for the call that completed caching
    pub(crate) fn mark_caching_completed(&self) -> bool {
        !self.caching_completed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn restamper(&self) -> MutexGuard<'_, TrickplayRestamper> {
        self.restamper.lock()
    }

    /// Park the injector until fragments of a newly selected rendition arrive
    pub fn begin_reload(&self) {
        *self.reload_pending.lock() = true;
        info!(track = %self.kind, "Track reload started");
    }

    pub(crate) fn finish_reload(&self) {
        let mut pending = self.reload_pending.lock();
        if *pending {
            *pending = false;
            self.reload_cond.notify_all();
            debug!(track = %self.kind, "Track reload finished");
        }
    }

    pub fn is_reload_pending(&self) -> bool {
        *self.reload_pending.lock()
    }

    /// Block while a reload is pending; false if the track was aborted
    pub(crate) fn wait_for_reload(&self, poll: Duration) -> bool {
        let mut pending = self.reload_pending.lock();
        while *pending {
            if self.ring.is_aborted() {
                return false;
            }
            let _ = self.reload_cond.wait_for(&mut pending, poll);
        }
        !self.ring.is_aborted()
    }

    /// Abort every wait on this track
    pub fn abort(&self) {
        self.ring.abort();
        let _pending = self.reload_pending.lock();
        self.reload_cond.notify_all();
    }

    /// Drop queued fragments, keeping counters
    pub fn flush_fetched_fragments(&self) -> usize {
        let dropped = self.ring.flush();
        debug!(track = %self.kind, dropped, "Fetched fragments flushed");
        dropped
    }

    /// Reset the ring and, unless a reload is in progress, the counters
    pub fn flush_fragments(&self) {
        let dropped = self.ring.flush();
        if !self.is_reload_pending() {
            *self.stats.lock() = TrackStats::default();
        }
        self.set_eos_reached(false);
        self.set_discontinuity_processed(false);
        warn!(track = %self.kind, dropped, "Track fragments flushed");
    }

    /// Shift counters after a seamless rendition change
    pub fn offset_track_params(&self, delta_fetched: f64, delta_injected: f64, delta_fragments: u64) {
        let mut stats = self.stats.lock();
        info!(
            track = %self.kind,
            fetched = stats.total_fetched_duration,
            injected = stats.total_injected_duration,
            downloaded = stats.total_fragments_downloaded,
            "Track params before offset"
        );
        stats.total_fetched_duration -= delta_fetched;
        stats.total_injected_duration -= delta_injected;
        stats.total_fragments_downloaded = stats.total_fragments_downloaded.saturating_sub(delta_fragments);
        info!(
            track = %self.kind,
            fetched = stats.total_fetched_duration,
            injected = stats.total_injected_duration,
            downloaded = stats.total_fragments_downloaded,
            "Track params after offset"
        );
    }

    /// Prepare for a new stream position
    pub(crate) fn reset(&self) {
        self.ring.flush();
        self.ring.clear_abort();
        *self.stats.lock() = TrackStats::default();
        *self.health.lock() = BufferHealth::Green;
        self.restamper.lock().reset();
        *self.reload_pending.lock() = false;
        self.set_eos_reached(false);
        self.set_discontinuity_processed(false);
        self.set_sink_buffer_full(false);
        self.caching_completed.store(false, Ordering::Release);
    }
}
