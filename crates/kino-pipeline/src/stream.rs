//! Stream engine
//!
//! Composes the per-track rings, injectors and monitors with the shared
//! ABR, discontinuity and catch-up services. Fetchers talk to the engine
//! through the reserve/publish boundary; the engine talks to the player
//! through [`PlayerContext`] and to the renderer through [`MediaSink`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::abr::{AbrEngine, AbrInput, FetchFailure, ProfileLadder};
use crate::clock::PlaybackClock;
use crate::config::PipelineConfig;
use crate::context::{MediaSink, PlayerContext, RetuneReason};
use crate::discontinuity::{DiscontinuityCoordinator, PeerProgress, Resolution, StallVerdict};
use crate::error::PlayerError;
use crate::events::{EventEmitter, MetricsSnapshot, PipelineMetrics, PlayerEvent};
use crate::fragment::{CachedFragment, FragmentMeta};
use crate::injector::run_injector;
use crate::monitor::{self, run_monitor, StopSignal};
use crate::ring::{FetchWait, SlotReservation};
use crate::sync::{CatchupProbe, CrossTrackSynchronizer};
use crate::track::{MediaTrack, TrackSnapshot};
use crate::types::{
    is_trickplay_rate, BitrateChangeReason, SessionId, StreamProtocol, TrackType, NORMAL_PLAY_RATE,
};
use crate::{Error, Result};

/// A reserved ring slot plus the buffer the fetcher downloads into
#[must_use = "a fetch slot holds ring capacity until published or cancelled"]
#[derive(Debug)]
pub struct FetchSlot {
    reservation: SlotReservation,
    /// Download target; moved into the ring on publish
    pub buffer: BytesMut,
}

impl FetchSlot {
    pub fn initialize(&self) -> bool {
        self.reservation.initialize()
    }
}

/// What a fetcher should do after a failed download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchRecovery {
    /// Retry the same fragment at this profile
    RetryAtProfile(usize),
    /// Move on to the next fragment
    SkipFragment,
}

/// State shared by the engine handle and its worker threads
pub(crate) struct Shared {
    pub(crate) config: PipelineConfig,
    pub(crate) protocol: StreamProtocol,
    pub(crate) context: Arc<dyn PlayerContext>,
    pub(crate) sink: Arc<dyn MediaSink>,
    tracks: [MediaTrack; 4],
    pub(crate) abr: Mutex<AbrEngine>,
    pub(crate) discontinuity: DiscontinuityCoordinator,
    pub(crate) sync: CrossTrackSynchronizer,
    pub(crate) clock: PlaybackClock,
    pub(crate) emitter: EventEmitter,
    pub(crate) metrics: PipelineMetrics,
    pub(crate) stop: StopSignal,
    rate: Mutex<f64>,
    muxed: AtomicBool,
    last_fragment_parsed: Mutex<Option<Instant>>,
}

impl Shared {
    pub(crate) fn track(&self, kind: TrackType) -> &MediaTrack {
        &self.tracks[kind.index()]
    }

    pub(crate) fn rate(&self) -> f64 {
        *self.rate.lock()
    }

    pub(crate) fn is_muxed(&self) -> bool {
        self.muxed.load(Ordering::Acquire)
    }

    fn elapsed_seconds(&self) -> f64 {
        self.clock.elapsed_seconds()
    }

    fn buffered_duration(&self, kind: TrackType) -> f64 {
        self.track(kind).buffered_duration(self.elapsed_seconds())
    }

    pub(crate) fn catchup_probe(&self, follower: TrackType, anchor: TrackType) -> CatchupProbe {
        let f = self.track(follower);
        let a = self.track(anchor);
        let anchor_stats = a.stats();
        CatchupProbe {
            downloads_enabled: self.context.downloads_enabled(),
            follower_aborted: f.ring().is_aborted(),
            follower_discontinuity_processed: f.is_discontinuity_processed(),
            anchor_aborted: a.ring().is_aborted(),
            anchor_eos: a.is_eos_reached(),
            video_discontinuity_pending: self.discontinuity.state().contains(TrackType::Video),
            follower_injected: f.injected_duration(),
            anchor_injected: anchor_stats.total_injected_duration,
            anchor_fragment_duration: anchor_stats.fragment_duration_seconds,
        }
    }

    /// Post-injection work: ABR, bitrate notification, follower wake-ups
    pub(crate) fn after_inject(&self, kind: TrackType, fragment: &CachedFragment) {
        match kind {
            TrackType::Video if !fragment.init_fragment => self.after_video_inject(fragment),
            TrackType::Audio => self.sync.notify(TrackType::Subtitle),
            _ => {}
        }
    }

    fn after_video_inject(&self, fragment: &CachedFragment) {
        let video = self.track(TrackType::Video);
        let stats = video.stats();

        let notification = {
            let mut abr = self.abr.lock();
            if !is_trickplay_rate(self.rate()) {
                abr.evaluate(AbrInput {
                    buffered_seconds: video.buffered_duration(self.elapsed_seconds()),
                    fragment_duration: stats.fragment_duration_seconds,
                    network_bandwidth: self.context.network_bandwidth(),
                    injection_aborted: video.ring().is_aborted(),
                });
            }
            abr.take_bitrate_notification(fragment.profile_index)
        };
        if let Some((profile_index, _)) = notification {
            info!(
                profile = profile_index,
                bandwidth = fragment.bandwidth_bps,
                reason = %fragment.bitrate_reason,
                position = fragment.position,
                "Bitrate changed"
            );
            self.metrics.record_bitrate_change();
            self.emitter.emit(PlayerEvent::BitrateChanged {
                profile_index,
                bandwidth_bps: fragment.bandwidth_bps,
                reason: fragment.bitrate_reason,
                position: fragment.position,
            });
        }

        let followers: Vec<(TrackType, f64)> = [TrackType::Audio, TrackType::AuxAudio]
            .into_iter()
            .filter(|&t| self.track(t).is_enabled())
            .map(|t| (t, self.track(t).injected_duration()))
            .collect();
        self.sync.reassess_and_resume(
            stats.total_injected_duration,
            stats.fragment_duration_seconds,
            &followers,
        );
    }

    /// Injector reached the end of a drained, end-of-stream ring
    pub(crate) fn on_track_end(&self, kind: TrackType) {
        let track = self.track(kind);
        track.set_eos_reached(true);
        info!(track = %kind, injected = track.injected_duration(), "End of track reached");
        if kind != TrackType::Subtitle {
            self.sink.signal_end_of_stream(kind);
            if kind == TrackType::Video && self.is_muxed() && !is_trickplay_rate(self.rate()) {
                self.sink.signal_end_of_stream(TrackType::Audio);
            }
        }
        self.sync.notify_all();
    }

    pub(crate) fn report_fatal(&self, error: PlayerError) {
        error!(code = error.error_code(), error = ?error, "Fatal pipeline error");
        self.context.report_error(error.clone());
        self.emitter.emit(PlayerEvent::Error { error });
    }

    /// Decide whether a one-sided discontinuity on `kind` should be released
    pub(crate) fn check_for_injection_stall(&self, kind: TrackType) {
        let Some(peer) = kind.pairing_peer() else {
            return;
        };
        if !self.discontinuity.is_one_sided(kind) {
            return;
        }
        let other = self.track(peer);
        let other_stats = other.stats();
        let progress = PeerProgress {
            injected_duration: other_stats.total_injected_duration,
            fragment_duration: other_stats.fragment_duration_seconds,
            future: other.ring().future_discontinuity(),
        };
        let injected = self.track(kind).injected_duration();

        match DiscontinuityCoordinator::evaluate_stall(
            kind,
            injected,
            &progress,
            self.config.discontinuity_stall_fragment_factor,
        ) {
            StallVerdict::Wait => {}
            StallVerdict::WakeAudioCatchup => {
                debug!(track = %kind, "Peer has a queued discontinuity, waking audio catch-up");
                self.sync.notify(TrackType::Audio);
            }
            StallVerdict::Spurious => {
                if self.config.retune_for_unpaired_discontinuity
                    && kind != TrackType::Audio
                    && self.context.is_underflow()
                {
                    warn!(
                        track = %kind,
                        injected,
                        other_injected = progress.injected_duration,
                        "Unpaired discontinuity during underflow, scheduling retune"
                    );
                    self.context
                        .schedule_retune(kind, RetuneReason::StallAfterDiscontinuity);
                    return;
                }
                if self.discontinuity.release(kind, Resolution::Spurious) {
                    self.on_discontinuity_ignored(kind, injected, progress.injected_duration);
                }
            }
        }
    }

    /// Release a one-sided block that outlived the discontinuity timeout
    pub(crate) fn check_discontinuity_timeout(&self, kind: TrackType) {
        if self.clock.is_paused() || !self.discontinuity.is_one_sided(kind) {
            return;
        }
        let Some(pending) = self.discontinuity.pending_for() else {
            return;
        };
        if pending < self.config.discontinuity_timeout() || !self.track(kind).ring().is_empty() {
            return;
        }
        warn!(
            track = %kind,
            pending_ms = pending.as_millis() as u64,
            "Discontinuity wait timed out"
        );
        if self.discontinuity.release(kind, Resolution::TimedOut) {
            let other = kind
                .pairing_peer()
                .map(|peer| self.track(peer).injected_duration())
                .unwrap_or_default();
            self.on_discontinuity_ignored(kind, self.track(kind).injected_duration(), other);
        }
    }

    fn on_discontinuity_ignored(&self, kind: TrackType, injected: f64, other_injected: f64) {
        warn!(
            track = %kind,
            injected,
            other_injected,
            "Discontinuity ignored, no matching discontinuity on the other track"
        );
        if self.protocol.has_periods() {
            self.discontinuity.note_ignored(kind);
        }
        self.metrics.record_ignored_discontinuity();
        self.emitter.emit(PlayerEvent::DiscontinuityIgnored {
            track: kind,
            injected_duration: injected,
            other_injected_duration: other_injected,
        });
    }

    /// Record fragment arrival, or detect that playback stopped receiving any
    pub(crate) fn check_for_playback_stall(&self, fragment_parsed: bool) {
        let mut last = self.last_fragment_parsed.lock();
        if fragment_parsed {
            *last = Some(Instant::now());
            return;
        }
        let Some(parsed_at) = *last else {
            return;
        };
        let stalled = parsed_at.elapsed();
        if stalled < Duration::from_millis(self.config.stall_timeout_ms)
            || !self.track(TrackType::Video).ring().is_empty()
            || !self.is_running_dry()
        {
            return;
        }
        *last = Some(Instant::now());
        drop(last);

        let stalled_ms = stalled.as_millis() as u64;
        warn!(stalled_ms, "No fragment received and buffers are empty, playback stalled");
        self.report_fatal(PlayerError::PlaybackStalled { stalled_ms });
        self.context
            .schedule_retune(TrackType::Video, RetuneReason::PlaybackStalled);
    }

    fn is_running_dry(&self) -> bool {
        let video = self.track(TrackType::Video);
        let audio = self.track(TrackType::Audio);
        video.ring().is_empty() || (audio.is_enabled() && audio.ring().is_empty())
    }

    /// Track whose cached duration drives the caching-complete notification
    fn caching_track(&self) -> TrackType {
        if self.track(TrackType::Video).is_enabled() {
            TrackType::Video
        } else {
            TrackType::Audio
        }
    }

    fn check_caching_complete(&self, kind: TrackType) {
        if kind != self.caching_track() {
            return;
        }
        let track = self.track(kind);
        if track.is_caching_completed() {
            return;
        }
        let cached = track.stats().initial_cache_duration;
        let initial = self.config.initial_buffer_seconds;
        let reached = initial > 0.0 && cached >= initial;
        let full = track.ring().is_full() || track.is_sink_buffer_full();
        if (reached || full || track.ring().is_eos()) && track.mark_caching_completed() {
            info!(track = %kind, cached, "Initial caching complete");
            self.context.on_caching_complete();
            self.emitter.emit(PlayerEvent::CachingComplete {
                cached_seconds: cached,
            });
        }
    }
}

/// Fragment pipeline for one playback session
pub struct StreamEngine {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamEngine {
    /// Create an engine; tracks start disabled
    pub fn new(
        config: PipelineConfig,
        protocol: StreamProtocol,
        ladder: ProfileLadder,
        context: Arc<dyn PlayerContext>,
        sink: Arc<dyn MediaSink>,
    ) -> Result<Self> {
        config.validate()?;
        let mut config = config;
        if config.low_latency_mode && !protocol.supports_chunk_mode() {
            warn!(protocol = %protocol, "Low latency mode needs chunked delivery, disabled");
            config.low_latency_mode = false;
        }
        let session_id = SessionId::new();
        let abr = AbrEngine::new(ladder, &config);
        let shared = Shared {
            tracks: TrackType::ALL.map(|kind| MediaTrack::new(kind, &config)),
            abr: Mutex::new(abr),
            discontinuity: DiscontinuityCoordinator::new(),
            sync: CrossTrackSynchronizer::from_config(&config),
            clock: PlaybackClock::new(),
            emitter: EventEmitter::new(session_id, Arc::clone(&context)),
            metrics: PipelineMetrics::default(),
            stop: StopSignal::new(),
            rate: Mutex::new(NORMAL_PLAY_RATE),
            muxed: AtomicBool::new(false),
            last_fragment_parsed: Mutex::new(None),
            config,
            protocol,
            context,
            sink,
        };
        info!(session = %session_id, protocol = %protocol, "Stream engine created");
        Ok(Self {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.emitter.session_id()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn protocol(&self) -> StreamProtocol {
        self.shared.protocol
    }

    // ------------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------------

    pub fn enable_track(&self, kind: TrackType) {
        self.shared.track(kind).set_enabled(true);
        debug!(track = %kind, "Track enabled");
    }

    pub fn disable_track(&self, kind: TrackType) {
        self.shared.track(kind).set_enabled(false);
        debug!(track = %kind, "Track disabled");
    }

    pub fn is_track_enabled(&self, kind: TrackType) -> bool {
        self.shared.track(kind).is_enabled()
    }

    /// Audio is carried inside the video track
    pub fn set_muxed(&self, muxed: bool) {
        self.shared.muxed.store(muxed, Ordering::Release);
    }

    pub fn is_muxed(&self) -> bool {
        self.shared.is_muxed()
    }

    /// Hold downstream ingestion of `kind` (ad insertion, DRM license waits)
    pub fn pause_ingestion(&self, kind: TrackType) {
        info!(track = %kind, "Ingestion paused");
        self.shared.context.pause_ingestion(kind);
    }

    pub fn resume_ingestion(&self, kind: TrackType) {
        info!(track = %kind, "Ingestion resumed");
        self.shared.context.resume_ingestion(kind);
    }

    pub fn track_snapshot(&self, kind: TrackType) -> TrackSnapshot {
        self.shared.track(kind).snapshot()
    }

    pub fn last_injected_position(&self, kind: TrackType) -> f64 {
        self.shared.track(kind).last_injected_position()
    }

    pub fn buffered_video_duration(&self) -> f64 {
        self.shared.buffered_duration(TrackType::Video)
    }

    pub fn buffered_audio_duration(&self) -> f64 {
        self.shared.buffered_duration(TrackType::Audio)
    }

    /// All enabled tracks other than subtitles reached their end
    pub fn is_eos_reached(&self) -> bool {
        let mut any = false;
        for kind in [TrackType::Video, TrackType::Audio, TrackType::AuxAudio] {
            let track = self.shared.track(kind);
            if track.is_enabled() {
                if !track.is_eos_reached() {
                    return false;
                }
                any = true;
            }
        }
        any
    }

    /// Video ring empty, or enabled audio ring empty
    pub fn check_if_player_running_dry(&self) -> bool {
        self.shared.is_running_dry()
    }

    pub fn flush_fetched_fragments(&self, kind: TrackType) -> usize {
        self.shared.track(kind).flush_fetched_fragments()
    }

    pub fn flush_fragments(&self, kind: TrackType) {
        self.shared.track(kind).flush_fragments();
    }

    pub fn offset_track_params(
        &self,
        kind: TrackType,
        delta_fetched: f64,
        delta_injected: f64,
        delta_fragments: u64,
    ) {
        self.shared
            .track(kind)
            .offset_track_params(delta_fetched, delta_injected, delta_fragments);
    }

    /// Park the injector of `kind` until the first fragment of a new rendition
    pub fn begin_track_reload(&self, kind: TrackType) {
        let track = self.shared.track(kind);
        track.begin_reload();
        track.flush_fetched_fragments();
    }

    // ------------------------------------------------------------------------
    // Fetch boundary
    // ------------------------------------------------------------------------

    /// Reserve a ring slot for the next download of `kind`
    pub fn reserve_fetch_slot(&self, kind: TrackType, initialize: bool, wait: FetchWait) -> Result<FetchSlot> {
        let track = self.shared.track(kind);
        if !track.is_enabled() {
            return Err(Error::TrackNotEnabled(kind));
        }
        let reservation = track.ring().reserve_for_fetch(initialize, wait)?;
        Ok(FetchSlot {
            reservation,
            buffer: BytesMut::new(),
        })
    }

    /// Give back a slot whose download failed
    pub fn cancel_fetch_slot(&self, kind: TrackType, slot: FetchSlot) {
        self.shared.track(kind).ring().cancel(slot.reservation);
    }

    /// Publish a downloaded fragment; returns the ring occupancy
    pub fn publish_fetched_fragment(&self, kind: TrackType, slot: FetchSlot, meta: FragmentMeta) -> Result<usize> {
        let shared = &self.shared;
        let track = shared.track(kind);

        let mut fragment = meta.into_fragment(slot.buffer);
        track.resolve_timescale(&mut fragment);
        if kind == TrackType::Video {
            let abr = shared.abr.lock();
            fragment.bandwidth_bps = abr.ladder().bandwidth(fragment.profile_index);
            fragment.bitrate_reason = abr.selection().reason;
        }
        let init = fragment.init_fragment;
        let duration = fragment.duration;
        let bandwidth = fragment.bandwidth_bps;
        let position = fragment.position;

        let occupancy = track.ring().publish(slot.reservation, fragment)?;
        if !init {
            track.update_after_fetch(duration, bandwidth);
            track.finish_reload();
        }
        debug!(track = %kind, position, duration, init, occupancy, "Fragment published");

        track.set_sink_buffer_full(shared.sink.is_buffer_full(kind));
        shared.check_caching_complete(kind);
        if kind == TrackType::Video {
            shared.check_for_playback_stall(true);
        }
        Ok(occupancy)
    }

    /// No more fragments will be published for `kind`
    pub fn set_end_of_stream(&self, kind: TrackType) {
        let track = self.shared.track(kind);
        track.ring().set_eos();
        info!(track = %kind, fetched = track.fetched_duration(), "Fetch reached end of stream");
        self.shared.check_caching_complete(kind);
    }

    #[instrument(skip(self))]
    pub fn record_download(&self, bytes: usize, elapsed: Duration) {
        self.shared.abr.lock().record_download(bytes, elapsed);
    }

    pub fn resolve_bandwidth_to_profile_index(&self, bandwidth_bps: u64) -> usize {
        self.shared.abr.lock().resolve_bandwidth_to_profile_index(bandwidth_bps)
    }

    /// Profile the next video fetch should use
    pub fn current_profile(&self) -> usize {
        self.shared.abr.lock().current_profile()
    }

    /// Returns the new profile if it differs from the last fetched one
    pub fn check_for_profile_change(&self, last_fetched_profile: usize) -> Option<usize> {
        let current = self.current_profile();
        (current != last_fetched_profile).then_some(current)
    }

    /// Pin a profile
    pub fn set_profile(&self, index: usize) -> Result<bool> {
        self.shared
            .abr
            .lock()
            .set_profile(index, BitrateChangeReason::Manual)
    }

    /// Download timeout for the next video fetch
    pub fn timeout_for_buffer(&self) -> Duration {
        let buffered = self.buffered_video_duration();
        self.shared.abr.lock().timeout_for_buffer(buffered)
    }

    /// React to a failed video download
    pub fn on_fetch_failure(&self, kind: TrackType, failure: FetchFailure) -> FetchRecovery {
        if kind != TrackType::Video {
            debug!(track = %kind, %failure, "Fetch failed, skipping fragment");
            return FetchRecovery::SkipFragment;
        }
        let buffered = self.buffered_video_duration();
        let (ramped, from, to, limit_reached) = {
            let mut abr = self.shared.abr.lock();
            let from = abr.current_profile();
            let ramped = abr.check_for_ramp_down(failure, buffered);
            let limit_reached = ramped && abr.ramp_down_limit_reached();
            (ramped, from, abr.current_profile(), limit_reached)
        };
        if !ramped {
            return FetchRecovery::SkipFragment;
        }
        warn!(%failure, from, to, buffered, "Fetch failure, ramped down");
        self.shared.metrics.record_ramp_down();
        self.shared.emitter.emit(PlayerEvent::RampDown {
            from_profile: from,
            to_profile: to,
            buffered_seconds: buffered,
        });
        if limit_reached {
            FetchRecovery::SkipFragment
        } else {
            FetchRecovery::RetryAtProfile(to)
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Spawn an injector for every enabled track, plus monitors at normal rate
    #[instrument(skip(self))]
    pub fn start_injection(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        self.shared.stop.reset();
        if self.shared.discontinuity.is_aborted() {
            self.shared.discontinuity.reset();
        }
        let normal_rate = !is_trickplay_rate(self.shared.rate());

        for kind in TrackType::ALL {
            if !self.shared.track(kind).is_enabled() {
                continue;
            }
            self.shared.track(kind).ring().clear_abort();
            let shared = Arc::clone(&self.shared);
            workers.push(spawn_worker(format!("kino-inject-{kind}"), move || {
                run_injector(shared, kind)
            })?);
            if normal_rate {
                let shared = Arc::clone(&self.shared);
                workers.push(spawn_worker(format!("kino-monitor-{kind}"), move || {
                    run_monitor(shared, kind)
                })?);
            }
        }
        info!(workers = workers.len(), "Injection started");
        Ok(())
    }

    /// Stop and join every injector and monitor; fetchers are left alone
    #[instrument(skip(self))]
    pub fn stop_injection(&self) {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for kind in TrackType::ALL {
            self.shared.track(kind).ring().abort_inject();
        }
        self.shared.discontinuity.abort();
        self.shared.sync.notify_all();
        self.shared.stop.stop();

        for handle in handles {
            if handle.join().is_err() {
                error!("Pipeline worker panicked");
            }
        }
        info!("Injection stopped");
    }

    /// Abort every fetcher and injector wait, then join the workers
    pub fn abort(&self) {
        for kind in TrackType::ALL {
            self.shared.track(kind).abort();
        }
        self.stop_injection();
    }

    /// Stop injection and reset every track for a new position
    #[instrument(skip(self))]
    pub fn seek(&self) {
        self.abort();
        self.reset(BitrateChangeReason::Seek);
    }

    /// Change the playback rate; trick rates play video only
    #[instrument(skip(self))]
    pub fn set_rate(&self, rate: f64) {
        self.abort();
        *self.shared.rate.lock() = rate;
        let trickplay = is_trickplay_rate(rate);
        if trickplay {
            for kind in [TrackType::Audio, TrackType::Subtitle, TrackType::AuxAudio] {
                self.disable_track(kind);
            }
        }
        let reason = if trickplay {
            BitrateChangeReason::Trickplay
        } else {
            BitrateChangeReason::Seek
        };
        self.reset(reason);
        info!(rate, trickplay, "Playback rate changed");
    }

    pub fn rate(&self) -> f64 {
        self.shared.rate()
    }

    fn reset(&self, reason: BitrateChangeReason) {
        for kind in TrackType::ALL {
            self.shared.track(kind).reset();
        }
        self.shared.discontinuity.reset();
        self.shared.clock.reset();
        *self.shared.last_fragment_parsed.lock() = None;
        let trickplay = is_trickplay_rate(self.shared.rate());
        self.shared.abr.lock().select_initial(trickplay, reason);
    }

    // ------------------------------------------------------------------------
    // Periodic checks (also run by the monitors)
    // ------------------------------------------------------------------------

    pub fn check_buffer_health(&self, kind: TrackType) {
        monitor::check_buffer_health(&self.shared, kind);
    }

    pub fn check_for_injection_stall(&self, kind: TrackType) {
        self.shared.check_for_injection_stall(kind);
    }

    pub fn check_discontinuity_timeout(&self, kind: TrackType) {
        self.shared.check_discontinuity_timeout(kind);
    }

    pub fn check_for_playback_stall(&self, fragment_parsed: bool) {
        self.shared.check_for_playback_stall(fragment_parsed);
    }

    pub fn notify_playback_paused(&self, paused: bool) {
        self.shared.clock.notify_playback_paused(paused);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if !self.workers.lock().is_empty() {
            self.abort();
        }
    }
}

fn spawn_worker<F>(name: String, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|e| {
            error!(thread = %name, error = %e, "Failed to spawn worker");
            Error::ThreadSpawn(name)
        })
}
