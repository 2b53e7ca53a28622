//! Synthetic VOD session driven through the fragment pipeline
//!
//! One fetcher thread per enabled track publishes generated fragments while
//! the engine's own injectors hand them to a sink that only counts what it
//! receives.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use kino_pipeline::{
    is_trickplay_rate, BufferHealth, Error, EventRecord, FetchFailure, FetchRecovery, FetchWait,
    FragmentMeta, MediaSink, MetricsSnapshot, PipelineConfig, PlayerContext, PlayerError, Profile,
    ProfileLadder, RetuneReason, SegmentPacket, SessionId, SinkVerdict, StreamEngine,
    StreamProtocol, TrackSnapshot, TrackType, NORMAL_PLAY_RATE,
};

/// Synthetic payloads are capped so long sessions stay cheap
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Parameters of one simulated session
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Video ladder bandwidths (bps)
    pub profiles: Vec<u64>,
    pub fragments: usize,
    pub fragment_duration: f64,
    pub audio: bool,
    pub muxed: bool,
    pub rate: f64,
    /// Simulated network throughput (bps)
    pub bandwidth: u64,
    /// Fail every Nth video download once
    pub fail_every: Option<usize>,
    /// Fragment index that starts a new period on every track
    pub discontinuity_at: Option<usize>,
    pub protocol: StreamProtocol,
    pub timeout: Duration,
    pub config: PipelineConfig,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            profiles: vec![400_000, 1_200_000, 3_000_000],
            fragments: 30,
            fragment_duration: 2.0,
            audio: true,
            muxed: false,
            rate: NORMAL_PLAY_RATE,
            bandwidth: 2_500_000,
            fail_every: None,
            discontinuity_at: None,
            protocol: StreamProtocol::Dash,
            timeout: Duration::from_secs(60),
            config: PipelineConfig::default(),
        }
    }
}

// ============================================================================
// Player side
// ============================================================================

/// Player context with a fixed network and no renderer backpressure
struct SimContext {
    bandwidth: u64,
    downloads_enabled: AtomicBool,
    ingestion_paused: [AtomicBool; 4],
    caching_complete: AtomicBool,
    retunes: AtomicUsize,
    errors: Mutex<Vec<PlayerError>>,
    events: Mutex<Vec<EventRecord>>,
}

impl SimContext {
    fn new(bandwidth: u64) -> Self {
        Self {
            bandwidth,
            downloads_enabled: AtomicBool::new(true),
            ingestion_paused: Default::default(),
            caching_complete: AtomicBool::new(false),
            retunes: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    fn has_failed(&self) -> bool {
        !self.errors.lock().is_empty()
    }
}

impl PlayerContext for SimContext {
    fn downloads_enabled(&self) -> bool {
        self.downloads_enabled.load(Ordering::Acquire)
    }

    fn is_ingestion_enabled(&self, track: TrackType) -> bool {
        !self.ingestion_paused[track.index()].load(Ordering::Acquire)
    }

    fn pause_ingestion(&self, track: TrackType) {
        self.ingestion_paused[track.index()].store(true, Ordering::Release);
    }

    fn resume_ingestion(&self, track: TrackType) {
        self.ingestion_paused[track.index()].store(false, Ordering::Release);
    }

    fn is_underflow(&self) -> bool {
        false
    }

    fn network_bandwidth(&self) -> Option<u64> {
        Some(self.bandwidth)
    }

    fn report_error(&self, error: PlayerError) {
        warn!(%error, "Pipeline reported a fatal error");
        self.errors.lock().push(error);
    }

    fn schedule_retune(&self, track: TrackType, reason: RetuneReason) {
        info!(track = %track, ?reason, "Retune requested");
        self.retunes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_caching_complete(&self) {
        self.caching_complete.store(true, Ordering::Release);
    }

    fn on_event(&self, record: &EventRecord) {
        self.events.lock().push(record.clone());
    }
}

/// Renderer stand-in that counts deliveries per track
#[derive(Default)]
struct CountingSink {
    delivered: [AtomicUsize; 4],
    bytes: [AtomicU64; 4],
    discontinuities: [AtomicUsize; 4],
    end_of_stream: [AtomicBool; 4],
}

impl CountingSink {
    fn total_delivered(&self) -> usize {
        self.delivered.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }
}

impl MediaSink for CountingSink {
    fn send_media_segment(&self, packet: SegmentPacket) -> SinkVerdict {
        let slot = packet.track.index();
        self.bytes[slot].fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        if !packet.init_fragment {
            self.delivered[slot].fetch_add(1, Ordering::Relaxed);
        }
        SinkVerdict::Accepted
    }

    fn apply_discontinuity(&self, track: TrackType) -> SinkVerdict {
        self.discontinuities[track.index()].fetch_add(1, Ordering::Relaxed);
        SinkVerdict::Accepted
    }

    fn signal_end_of_stream(&self, track: TrackType) {
        self.end_of_stream[track.index()].store(true, Ordering::Release);
    }
}

// ============================================================================
// Report
// ============================================================================

/// How the session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Cancelled => write!(f, "cancelled"),
            Outcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// What one fetcher did
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchSummary {
    pub track: Option<TrackType>,
    pub published: usize,
    pub failures: usize,
    pub retries: usize,
    pub skipped: usize,
}

/// Sink-side and engine-side view of one track
#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub delivered: usize,
    pub bytes: u64,
    pub discontinuities_applied: usize,
    pub end_of_stream_signalled: bool,
    #[serde(flatten)]
    pub snapshot: TrackSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub session_id: SessionId,
    pub protocol: StreamProtocol,
    pub rate: f64,
    pub outcome: Outcome,
    pub elapsed_ms: u64,
    pub caching_complete: bool,
    pub final_profile: usize,
    pub final_bandwidth_bps: u64,
    pub tracks: Vec<TrackReport>,
    pub fetchers: Vec<FetchSummary>,
    pub metrics: MetricsSnapshot,
    pub retunes: usize,
    pub errors: Vec<PlayerError>,
    pub events: Vec<EventRecord>,
}

impl SimulationReport {
    /// Worst health across the reported tracks
    pub fn worst_health(&self) -> BufferHealth {
        if self.tracks.iter().any(|t| t.snapshot.health == BufferHealth::Red) {
            BufferHealth::Red
        } else if self.tracks.iter().any(|t| t.snapshot.health == BufferHealth::Yellow) {
            BufferHealth::Yellow
        } else {
            BufferHealth::Green
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Ladder for the session; trick rates get an iframe rung below the lowest profile
pub fn build_ladder(options: &SimulationOptions) -> anyhow::Result<ProfileLadder> {
    let mut profiles: Vec<Profile> = options.profiles.iter().copied().map(Profile::new).collect();
    if is_trickplay_rate(options.rate) {
        let lowest = options.profiles.iter().copied().min().unwrap_or(400_000);
        profiles.push(Profile::iframe((lowest / 2).max(64_000)));
    }
    ProfileLadder::new(profiles).context("invalid profile ladder")
}

/// Run one session to completion, failure, timeout or cancellation
pub fn run(
    options: SimulationOptions,
    cancel: Arc<AtomicBool>,
    show_progress: bool,
) -> anyhow::Result<SimulationReport> {
    let ladder = build_ladder(&options)?;
    let context = Arc::new(SimContext::new(options.bandwidth));
    let sink = Arc::new(CountingSink::default());

    let engine = Arc::new(StreamEngine::new(
        options.config.clone(),
        options.protocol,
        ladder.clone(),
        Arc::clone(&context) as Arc<dyn PlayerContext>,
        Arc::clone(&sink) as Arc<dyn MediaSink>,
    )?);

    if options.rate != NORMAL_PLAY_RATE {
        engine.set_rate(options.rate);
    }
    let tracks = session_tracks(&options);
    for &kind in &tracks {
        engine.enable_track(kind);
    }
    engine.set_muxed(options.muxed);

    info!(
        session = %engine.session_id(),
        protocol = %options.protocol,
        rate = options.rate,
        tracks = tracks.len(),
        "Starting simulated session"
    );
    let started = Instant::now();
    engine.start_injection()?;

    let options = Arc::new(options);
    let mut fetchers = Vec::with_capacity(tracks.len());
    for &kind in &tracks {
        let engine = Arc::clone(&engine);
        let options = Arc::clone(&options);
        let ladder = ladder.clone();
        let handle = thread::Builder::new()
            .name(format!("kino-fetch-{kind}"))
            .spawn(move || run_fetcher(&engine, kind, &options, &ladder))
            .with_context(|| format!("failed to spawn {kind} fetcher"))?;
        fetchers.push(handle);
    }

    let progress = if show_progress {
        let bar = ProgressBar::new((options.fragments * tracks.len()) as u64);
        if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} fragments {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar
    } else {
        ProgressBar::hidden()
    };

    let outcome = loop {
        progress.set_position(sink.total_delivered() as u64);
        if context.has_failed() {
            break Outcome::Failed;
        }
        if engine.is_eos_reached() {
            break Outcome::Completed;
        }
        if cancel.load(Ordering::Acquire) {
            break Outcome::Cancelled;
        }
        if started.elapsed() >= options.timeout {
            break Outcome::TimedOut;
        }
        thread::sleep(POLL_INTERVAL);
    };
    progress.finish_with_message(outcome.to_string());

    // Unblocks fetchers waiting on a full ring as well as the injectors
    context.downloads_enabled.store(false, Ordering::Release);
    engine.abort();

    let mut summaries = Vec::with_capacity(fetchers.len());
    for handle in fetchers {
        match handle.join() {
            Ok(Ok(summary)) => summaries.push(summary),
            Ok(Err(e)) => warn!(error = %e, "Fetcher failed"),
            Err(_) => warn!("Fetcher thread panicked"),
        }
    }

    let report = SimulationReport {
        session_id: engine.session_id(),
        protocol: engine.protocol(),
        rate: engine.rate(),
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
        caching_complete: context.caching_complete.load(Ordering::Acquire),
        final_profile: engine.current_profile(),
        final_bandwidth_bps: ladder.bandwidth(engine.current_profile()),
        tracks: tracks
            .iter()
            .map(|&kind| {
                let slot = kind.index();
                TrackReport {
                    delivered: sink.delivered[slot].load(Ordering::Relaxed),
                    bytes: sink.bytes[slot].load(Ordering::Relaxed),
                    discontinuities_applied: sink.discontinuities[slot].load(Ordering::Relaxed),
                    end_of_stream_signalled: sink.end_of_stream[slot].load(Ordering::Acquire),
                    snapshot: engine.track_snapshot(kind),
                }
            })
            .collect(),
        fetchers: summaries,
        metrics: engine.metrics(),
        retunes: context.retunes.load(Ordering::Relaxed),
        errors: context.errors.lock().clone(),
        events: context.events.lock().clone(),
    };
    info!(outcome = %report.outcome, elapsed_ms = report.elapsed_ms, "Simulated session finished");
    Ok(report)
}

fn session_tracks(options: &SimulationOptions) -> Vec<TrackType> {
    let mut tracks = vec![TrackType::Video];
    if options.audio && !options.muxed && !is_trickplay_rate(options.rate) {
        tracks.push(TrackType::Audio);
    }
    tracks
}

/// Publish every fragment of `kind`, then mark end of stream
fn run_fetcher(
    engine: &StreamEngine,
    kind: TrackType,
    options: &SimulationOptions,
    ladder: &ProfileLadder,
) -> anyhow::Result<FetchSummary> {
    let mut summary = FetchSummary {
        track: Some(kind),
        ..Default::default()
    };
    let mut profile = engine.current_profile();

    if !publish(engine, kind, FragmentMeta::init().with_profile(profile), 8)? {
        return Ok(summary);
    }

    let mut index = 0;
    let mut retrying = false;
    while index < options.fragments {
        if kind == TrackType::Video {
            if let Some(next) = engine.check_for_profile_change(profile) {
                debug!(from = profile, to = next, "Fetcher switching profile");
                profile = next;
            }
        }

        let bandwidth = if kind == TrackType::Video {
            ladder.bandwidth(profile)
        } else {
            128_000
        };
        let full_size = (bandwidth as f64 * options.fragment_duration / 8.0) as usize;

        let fails = kind == TrackType::Video
            && !retrying
            && options.fail_every.is_some_and(|n| n > 0 && (index + 1) % n == 0);
        if fails {
            summary.failures += 1;
            match engine.on_fetch_failure(kind, FetchFailure::Timeout) {
                FetchRecovery::RetryAtProfile(next) => {
                    summary.retries += 1;
                    profile = next;
                    retrying = true;
                }
                FetchRecovery::SkipFragment => {
                    summary.skipped += 1;
                    index += 1;
                }
            }
            continue;
        }

        if kind == TrackType::Video {
            let download = Duration::from_secs_f64(full_size as f64 * 8.0 / options.bandwidth.max(1) as f64);
            engine.record_download(full_size, download);
        }

        let meta = FragmentMeta::media(index as f64 * options.fragment_duration, options.fragment_duration)
            .with_profile(if kind == TrackType::Video { profile } else { 0 })
            .with_discontinuity(options.discontinuity_at == Some(index));
        if !publish(engine, kind, meta, full_size.min(MAX_PAYLOAD_BYTES))? {
            return Ok(summary);
        }
        summary.published += 1;
        retrying = false;
        index += 1;
    }

    engine.set_end_of_stream(kind);
    Ok(summary)
}

/// Returns false once the ring has been aborted
fn publish(engine: &StreamEngine, kind: TrackType, meta: FragmentMeta, size: usize) -> anyhow::Result<bool> {
    let mut slot = match engine.reserve_fetch_slot(kind, false, FetchWait::Blocking) {
        Ok(slot) => slot,
        Err(Error::Aborted { .. }) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    slot.buffer.resize(size, 0);
    match engine.publish_fetched_fragment(kind, slot, meta) {
        Ok(_) => Ok(true),
        Err(Error::Aborted { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
