//! Integration tests for Kino Pipeline

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kino_pipeline::{
    AbrEngine, AbrInput, AbrReason, Error, EventRecord, FetchFailure, FetchRecovery, FetchWait,
    FragmentMeta, MediaSink, PipelineConfig, PlayerContext, PlayerError, PlayerEvent, Profile,
    ProfileLadder, RetuneReason, Rewrite, SegmentPacket, SinkVerdict, StreamEngine,
    StreamProtocol, TrackType, TrickplayRestamper,
};

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct MockContext {
    downloads_disabled: AtomicBool,
    underflow: AtomicBool,
    ingestion_paused: AtomicBool,
    caching_complete: AtomicU32,
    errors: Mutex<Vec<PlayerError>>,
    retunes: Mutex<Vec<(TrackType, RetuneReason)>>,
    resumed: Mutex<Vec<TrackType>>,
    events: Mutex<Vec<EventRecord>>,
}

impl MockContext {
    fn events_matching(&self, pred: impl Fn(&PlayerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|r| pred(&r.event)).count()
    }
}

impl PlayerContext for MockContext {
    fn downloads_enabled(&self) -> bool {
        !self.downloads_disabled.load(Ordering::SeqCst)
    }

    fn is_ingestion_enabled(&self, _track: TrackType) -> bool {
        !self.ingestion_paused.load(Ordering::SeqCst)
    }

    fn pause_ingestion(&self, _track: TrackType) {
        self.ingestion_paused.store(true, Ordering::SeqCst);
    }

    fn resume_ingestion(&self, track: TrackType) {
        self.ingestion_paused.store(false, Ordering::SeqCst);
        self.resumed.lock().push(track);
    }

    fn is_underflow(&self) -> bool {
        self.underflow.load(Ordering::SeqCst)
    }

    fn report_error(&self, error: PlayerError) {
        self.errors.lock().push(error);
    }

    fn schedule_retune(&self, track: TrackType, reason: RetuneReason) {
        self.retunes.lock().push((track, reason));
    }

    fn on_caching_complete(&self) {
        self.caching_complete.fetch_add(1, Ordering::SeqCst);
    }

    fn on_event(&self, record: &EventRecord) {
        self.events.lock().push(record.clone());
    }
}

#[derive(Debug, Clone)]
struct Delivered {
    track: TrackType,
    pts: f64,
    duration: f64,
    init: bool,
    discontinuity: bool,
    payload: Vec<u8>,
}

#[derive(Default)]
struct RecordingSink {
    reject_media: AtomicBool,
    delivered: Mutex<Vec<Delivered>>,
    discontinuities: Mutex<Vec<TrackType>>,
    end_of_stream: Mutex<Vec<TrackType>>,
}

impl RecordingSink {
    fn media(&self, track: TrackType) -> Vec<Delivered> {
        self.delivered
            .lock()
            .iter()
            .filter(|d| d.track == track && !d.init)
            .cloned()
            .collect()
    }
}

impl MediaSink for RecordingSink {
    fn send_media_segment(&self, packet: SegmentPacket) -> SinkVerdict {
        if self.reject_media.load(Ordering::SeqCst) && !packet.init_fragment {
            return SinkVerdict::Rejected;
        }
        self.delivered.lock().push(Delivered {
            track: packet.track,
            pts: packet.pts,
            duration: packet.duration,
            init: packet.init_fragment,
            discontinuity: packet.discontinuity,
            payload: packet.payload.to_vec(),
        });
        SinkVerdict::Accepted
    }

    fn apply_discontinuity(&self, track: TrackType) -> SinkVerdict {
        self.discontinuities.lock().push(track);
        SinkVerdict::Accepted
    }

    fn signal_end_of_stream(&self, track: TrackType) {
        self.end_of_stream.lock().push(track);
    }
}

fn test_ladder() -> ProfileLadder {
    ProfileLadder::new(vec![
        Profile::new(200_000),
        Profile::new(800_000),
        Profile::new(3_000_000),
    ])
    .unwrap()
}

fn create_engine(
    config: PipelineConfig,
    protocol: StreamProtocol,
) -> (Arc<StreamEngine>, Arc<MockContext>, Arc<RecordingSink>) {
    let context = Arc::new(MockContext::default());
    let sink = Arc::new(RecordingSink::default());
    let engine = StreamEngine::new(
        config,
        protocol,
        test_ladder(),
        Arc::clone(&context) as Arc<dyn PlayerContext>,
        Arc::clone(&sink) as Arc<dyn MediaSink>,
    )
    .unwrap();
    (Arc::new(engine), context, sink)
}

fn publish(engine: &StreamEngine, track: TrackType, meta: FragmentMeta, payload: &[u8]) {
    let mut slot = engine
        .reserve_fetch_slot(track, false, FetchWait::Blocking)
        .unwrap();
    slot.buffer.extend_from_slice(payload);
    engine.publish_fetched_fragment(track, slot, meta).unwrap();
}

/// Publish `count` media fragments from a background fetcher
fn spawn_fetcher(
    engine: &Arc<StreamEngine>,
    track: TrackType,
    count: usize,
    duration: f64,
    discontinuity_at: Option<usize>,
) -> thread::JoinHandle<()> {
    let engine = Arc::clone(engine);
    thread::spawn(move || {
        publish(&engine, track, FragmentMeta::init(), b"init");
        for i in 0..count {
            let meta = FragmentMeta::media(i as f64 * duration, duration)
                .with_profile(1)
                .with_discontinuity(discontinuity_at == Some(i));
            publish(&engine, track, meta, format!("{track}-{i}").as_bytes());
        }
    })
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn injected(engine: &StreamEngine, track: TrackType) -> f64 {
    engine.track_snapshot(track).stats.total_injected_duration
}

// =============================================================================
// Ring Tests
// =============================================================================

#[test]
fn test_ring_capacity_three_blocks_fourth_reservation() {
    let config = PipelineConfig {
        max_cached_fragments_per_track: 3,
        ..Default::default()
    };
    let (engine, _context, sink) = create_engine(config, StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);

    for i in 0..3 {
        publish(
            &engine,
            TrackType::Video,
            FragmentMeta::media(f64::from(i) * 2.0, 2.0),
            format!("d{i}").as_bytes(),
        );
    }
    assert!(matches!(
        engine.reserve_fetch_slot(TrackType::Video, false, FetchWait::NonBlocking),
        Err(Error::RingFull { .. })
    ));
    assert!(matches!(
        engine.reserve_fetch_slot(TrackType::Video, false, FetchWait::Timeout(Duration::from_millis(20))),
        Err(Error::RingFull { .. })
    ));

    engine.start_injection().unwrap();
    let slot = engine
        .reserve_fetch_slot(TrackType::Video, false, FetchWait::Timeout(Duration::from_secs(5)))
        .unwrap();
    engine.cancel_fetch_slot(TrackType::Video, slot);

    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Video).len() == 3));
    let payloads: Vec<Vec<u8>> = sink
        .media(TrackType::Video)
        .into_iter()
        .map(|d| d.payload)
        .collect();
    assert_eq!(payloads, vec![b"d0".to_vec(), b"d1".to_vec(), b"d2".to_vec()]);
    engine.stop_injection();
}

#[test]
fn test_reserve_on_disabled_track_fails() {
    let (engine, _context, _sink) = create_engine(PipelineConfig::default(), StreamProtocol::Hls);
    assert!(matches!(
        engine.reserve_fetch_slot(TrackType::Audio, false, FetchWait::NonBlocking),
        Err(Error::TrackNotEnabled(TrackType::Audio))
    ));
}

#[test]
fn test_invalid_config_rejected() {
    let config = PipelineConfig {
        max_cached_fragments_per_track: 0,
        ..Default::default()
    };
    let result = StreamEngine::new(
        config,
        StreamProtocol::Dash,
        test_ladder(),
        Arc::new(MockContext::default()),
        Arc::new(RecordingSink::default()),
    );
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

// =============================================================================
// Injection Tests
// =============================================================================

#[test]
fn test_end_to_end_injection_and_end_of_stream() {
    let config = PipelineConfig {
        initial_buffer_seconds: 4.0,
        ..Default::default()
    };
    let (engine, context, sink) = create_engine(config, StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);
    engine.enable_track(TrackType::Audio);
    engine.start_injection().unwrap();

    let video = spawn_fetcher(&engine, TrackType::Video, 6, 2.0, None);
    let audio = spawn_fetcher(&engine, TrackType::Audio, 6, 2.0, None);
    video.join().unwrap();
    audio.join().unwrap();
    engine.set_end_of_stream(TrackType::Video);
    engine.set_end_of_stream(TrackType::Audio);

    assert!(wait_until(Duration::from_secs(10), || engine.is_eos_reached()));

    for track in [TrackType::Video, TrackType::Audio] {
        let media = sink.media(track);
        assert_eq!(media.len(), 6);
        let positions: Vec<f64> = media.iter().map(|d| d.pts).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(injected(&engine, track), 12.0);
    }
    for buffered in [engine.buffered_video_duration(), engine.buffered_audio_duration()] {
        assert!(buffered > 0.0 && buffered <= 12.0);
    }

    let mut ended = sink.end_of_stream.lock().clone();
    ended.sort_by_key(|t| t.index());
    assert_eq!(ended, vec![TrackType::Video, TrackType::Audio]);

    assert_eq!(context.caching_complete.load(Ordering::SeqCst), 1);
    assert_eq!(
        context.events_matching(|e| matches!(e, PlayerEvent::BitrateChanged { profile_index: 1, .. })),
        1
    );
    assert_eq!(engine.metrics().injected_fragments, 14);
    engine.stop_injection();
}

#[test]
fn test_muxed_video_signals_audio_end_of_stream() {
    let (engine, _context, sink) = create_engine(PipelineConfig::default(), StreamProtocol::Hls);
    engine.enable_track(TrackType::Video);
    engine.set_muxed(true);
    engine.start_injection().unwrap();

    spawn_fetcher(&engine, TrackType::Video, 2, 2.0, None).join().unwrap();
    engine.set_end_of_stream(TrackType::Video);

    assert!(wait_until(Duration::from_secs(5), || sink.end_of_stream.lock().len() == 2));
    assert_eq!(
        *sink.end_of_stream.lock(),
        vec![TrackType::Video, TrackType::Audio]
    );
    engine.stop_injection();
}

#[test]
fn test_audio_held_within_lead_of_video_until_video_advances() {
    let (engine, _context, sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);
    engine.enable_track(TrackType::Audio);
    engine.start_injection().unwrap();

    publish(&engine, TrackType::Video, FragmentMeta::media(0.0, 2.0), b"v0");
    assert!(wait_until(Duration::from_secs(5), || injected(&engine, TrackType::Video) == 2.0));

    // Lead allowance is one video fragment: audio may reach 2.0 + 2.0 before blocking
    for i in 0..4 {
        publish(
            &engine,
            TrackType::Audio,
            FragmentMeta::media(f64::from(i) * 2.0, 2.0),
            format!("a{i}").as_bytes(),
        );
    }
    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Audio).len() == 3));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(sink.media(TrackType::Audio).len(), 3);
    assert_eq!(injected(&engine, TrackType::Audio), 6.0);

    publish(&engine, TrackType::Video, FragmentMeta::media(2.0, 2.0), b"v1");
    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Audio).len() == 4));

    publish(&engine, TrackType::Audio, FragmentMeta::media(8.0, 2.0), b"a4");
    thread::sleep(Duration::from_millis(300));
    assert_eq!(sink.media(TrackType::Audio).len(), 4);

    engine.set_end_of_stream(TrackType::Video);
    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Audio).len() == 5));
    assert_eq!(injected(&engine, TrackType::Audio), 10.0);
    engine.stop_injection();
}

#[test]
fn test_discard_threshold_reports_pts_error() {
    let config = PipelineConfig {
        segment_inject_fail_threshold: 3,
        ..Default::default()
    };
    let (engine, context, sink) = create_engine(config, StreamProtocol::Dash);
    sink.reject_media.store(true, Ordering::SeqCst);
    engine.enable_track(TrackType::Video);
    engine.start_injection().unwrap();

    spawn_fetcher(&engine, TrackType::Video, 3, 2.0, None).join().unwrap();

    assert!(wait_until(Duration::from_secs(5), || !context.errors.lock().is_empty()));
    assert_eq!(
        context.errors.lock()[0],
        PlayerError::PtsError {
            track: TrackType::Video,
            discarded: 3
        }
    );
    assert_eq!(engine.metrics().discarded_fragments, 3);
    assert_eq!(context.events_matching(|e| matches!(e, PlayerEvent::Error { .. })), 1);
    engine.stop_injection();
}

// =============================================================================
// Discontinuity Tests
// =============================================================================

#[test]
fn test_paired_discontinuity_applied_once_per_track() {
    let (engine, context, sink) = create_engine(PipelineConfig::default(), StreamProtocol::Hls);
    engine.enable_track(TrackType::Video);
    engine.enable_track(TrackType::Audio);
    engine.start_injection().unwrap();

    let video = spawn_fetcher(&engine, TrackType::Video, 4, 2.0, Some(2));
    let audio = spawn_fetcher(&engine, TrackType::Audio, 4, 2.0, Some(2));
    video.join().unwrap();
    audio.join().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        injected(&engine, TrackType::Video) == 8.0 && injected(&engine, TrackType::Audio) == 8.0
    }));

    let mut applied = sink.discontinuities.lock().clone();
    applied.sort_by_key(|t| t.index());
    assert_eq!(applied, vec![TrackType::Video, TrackType::Audio]);
    for track in [TrackType::Video, TrackType::Audio] {
        let flagged: Vec<f64> = sink
            .media(track)
            .iter()
            .filter(|d| d.discontinuity)
            .map(|d| d.pts)
            .collect();
        assert_eq!(flagged, vec![4.0]);
    }
    assert_eq!(engine.metrics().applied_discontinuities, 2);
    assert_eq!(
        context.events_matching(|e| matches!(e, PlayerEvent::DiscontinuityIgnored { .. })),
        0
    );
    engine.stop_injection();
}

#[test]
fn test_unpaired_video_discontinuity_released_as_ignored() {
    let (engine, context, sink) = create_engine(PipelineConfig::default(), StreamProtocol::Hls);
    engine.enable_track(TrackType::Video);
    engine.enable_track(TrackType::Audio);
    engine.start_injection().unwrap();

    // Video: five 2s fragments, then a discontinuity at 10s
    let video = spawn_fetcher(&engine, TrackType::Video, 6, 2.0, Some(5));
    // Audio: thirteen 1s fragments, never a discontinuity
    let audio = spawn_fetcher(&engine, TrackType::Audio, 13, 1.0, None);
    audio.join().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        injected(&engine, TrackType::Video) == 10.0 && injected(&engine, TrackType::Audio) == 13.0
    }));
    // Blocked waiting for audio
    thread::sleep(Duration::from_millis(50));
    assert_eq!(injected(&engine, TrackType::Video), 10.0);

    engine.check_for_injection_stall(TrackType::Video);
    video.join().unwrap();

    assert!(wait_until(Duration::from_secs(5), || injected(&engine, TrackType::Video) == 12.0));
    assert!(sink.discontinuities.lock().is_empty());
    let last = sink.media(TrackType::Video).pop().unwrap();
    assert_eq!(last.pts, 10.0);
    assert!(!last.discontinuity);

    assert_eq!(engine.metrics().ignored_discontinuities, 1);
    assert_eq!(
        context.events_matching(|e| matches!(
            e,
            PlayerEvent::DiscontinuityIgnored {
                track: TrackType::Video,
                ..
            }
        )),
        1
    );
    engine.stop_injection();
}

#[test]
fn test_unpaired_discontinuity_during_underflow_schedules_retune() {
    let (engine, context, _sink) = create_engine(PipelineConfig::default(), StreamProtocol::Hls);
    context.underflow.store(true, Ordering::SeqCst);
    engine.enable_track(TrackType::Video);
    engine.enable_track(TrackType::Audio);
    engine.start_injection().unwrap();

    let video = spawn_fetcher(&engine, TrackType::Video, 6, 2.0, Some(5));
    spawn_fetcher(&engine, TrackType::Audio, 13, 1.0, None).join().unwrap();
    video.join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        injected(&engine, TrackType::Video) == 10.0 && injected(&engine, TrackType::Audio) == 13.0
    }));
    thread::sleep(Duration::from_millis(50));

    engine.check_for_injection_stall(TrackType::Video);
    assert_eq!(
        *context.retunes.lock(),
        vec![(TrackType::Video, RetuneReason::StallAfterDiscontinuity)]
    );
    // Still blocked until the retune happens
    thread::sleep(Duration::from_millis(50));
    assert_eq!(injected(&engine, TrackType::Video), 10.0);
    engine.stop_injection();
}

#[test]
fn test_discontinuity_timeout_releases_block() {
    let config = PipelineConfig {
        discontinuity_timeout_ms: 50,
        ..Default::default()
    };
    let (engine, context, sink) = create_engine(config, StreamProtocol::Hls);
    engine.enable_track(TrackType::Video);
    engine.enable_track(TrackType::Audio);
    engine.start_injection().unwrap();

    spawn_fetcher(&engine, TrackType::Video, 2, 2.0, Some(1)).join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || injected(&engine, TrackType::Video) == 2.0));
    thread::sleep(Duration::from_millis(150));

    engine.check_discontinuity_timeout(TrackType::Video);
    assert!(wait_until(Duration::from_secs(5), || injected(&engine, TrackType::Video) == 4.0));
    assert!(sink.discontinuities.lock().is_empty());
    assert_eq!(
        context.events_matching(|e| matches!(e, PlayerEvent::DiscontinuityIgnored { .. })),
        1
    );
    engine.stop_injection();
}

#[test]
fn test_discontinuity_timeout_waits_while_paused() {
    let config = PipelineConfig {
        discontinuity_timeout_ms: 50,
        ..Default::default()
    };
    let (engine, _context, _sink) = create_engine(config, StreamProtocol::Hls);
    engine.enable_track(TrackType::Video);
    engine.enable_track(TrackType::Audio);
    engine.start_injection().unwrap();

    spawn_fetcher(&engine, TrackType::Video, 2, 2.0, Some(1)).join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || injected(&engine, TrackType::Video) == 2.0));
    engine.notify_playback_paused(true);
    thread::sleep(Duration::from_millis(150));

    engine.check_discontinuity_timeout(TrackType::Video);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(injected(&engine, TrackType::Video), 2.0);

    engine.notify_playback_paused(false);
    engine.check_discontinuity_timeout(TrackType::Video);
    assert!(wait_until(Duration::from_secs(5), || injected(&engine, TrackType::Video) == 4.0));
    engine.stop_injection();
}

#[test]
fn test_stop_injection_wakes_blocked_injector() {
    let (engine, _context, _sink) = create_engine(PipelineConfig::default(), StreamProtocol::Hls);
    engine.enable_track(TrackType::Video);
    engine.enable_track(TrackType::Audio);
    engine.start_injection().unwrap();

    spawn_fetcher(&engine, TrackType::Video, 2, 2.0, Some(1)).join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || injected(&engine, TrackType::Video) == 2.0));
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    engine.stop_injection();
    assert!(start.elapsed() < Duration::from_secs(2));
}

// =============================================================================
// ABR Tests
// =============================================================================

#[test]
fn test_abr_emergency_floor_selects_lowest() {
    let mut abr = AbrEngine::new(test_ladder(), &PipelineConfig::default());
    assert_eq!(abr.current_profile(), 1);

    let decision = abr.evaluate(AbrInput {
        buffered_seconds: 0.0,
        fragment_duration: 2.0,
        network_bandwidth: Some(50_000_000),
        injection_aborted: false,
    });
    assert_eq!(decision.selected, 0);
    assert_eq!(decision.reason, AbrReason::EmergencyFloor);
    assert!(decision.changed);
}

#[test]
fn test_fetch_failure_ramps_down_until_lowest() {
    let (engine, context, _sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);
    assert!(engine.set_profile(2).unwrap());

    assert_eq!(
        engine.on_fetch_failure(TrackType::Video, FetchFailure::Http(404)),
        FetchRecovery::RetryAtProfile(1)
    );
    assert_eq!(
        engine.on_fetch_failure(TrackType::Video, FetchFailure::Timeout),
        FetchRecovery::RetryAtProfile(0)
    );
    assert_eq!(
        engine.on_fetch_failure(TrackType::Video, FetchFailure::Http(404)),
        FetchRecovery::SkipFragment
    );
    assert_eq!(
        engine.on_fetch_failure(TrackType::Audio, FetchFailure::Http(500)),
        FetchRecovery::SkipFragment
    );

    assert_eq!(engine.metrics().ramp_downs, 2);
    assert_eq!(context.events_matching(|e| matches!(e, PlayerEvent::RampDown { .. })), 2);
    assert_eq!(engine.check_for_profile_change(2), Some(0));
    assert_eq!(engine.check_for_profile_change(0), None);
}

#[test]
fn test_ramp_down_limit_skips_fragment() {
    let config = PipelineConfig {
        ramp_down_limit: 1,
        ..Default::default()
    };
    let (engine, _context, _sink) = create_engine(config, StreamProtocol::Dash);
    engine.set_profile(2).unwrap();
    assert_eq!(
        engine.on_fetch_failure(TrackType::Video, FetchFailure::Http(503)),
        FetchRecovery::SkipFragment
    );
    assert_eq!(engine.current_profile(), 1);
}

#[test]
fn test_resolve_bandwidth_to_profile_index() {
    let (engine, _context, _sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    assert_eq!(engine.resolve_bandwidth_to_profile_index(800_000), 1);
    assert_eq!(engine.resolve_bandwidth_to_profile_index(3_000_000), 2);
}

// =============================================================================
// Trickplay Tests
// =============================================================================

#[test]
fn test_trickplay_six_x_restamp() {
    let mut restamper = TrickplayRestamper::new(4);
    let mut first = kino_pipeline::CachedFragment::media(100.0, 2.0, &b"a"[..]);
    let mut second = kino_pipeline::CachedFragment::media(102.0, 2.0, &b"b"[..]);

    assert_eq!(restamper.restamp(&mut first, 6.0), Rewrite::Applied);
    let first_duration = (2.0_f64 / 6.0).max(0.25);
    assert!((first.duration - first_duration).abs() < 1e-9);
    assert_eq!(first.position, 0.0);

    assert_eq!(restamper.restamp(&mut second, 6.0), Rewrite::Applied);
    assert!((second.position - (first.position + second.duration)).abs() < 1e-9);
}

#[test]
fn test_trickplay_injection_restamps_video_only() {
    let (engine, _context, sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    engine.enable_track(TrackType::Audio);
    engine.set_rate(6.0);
    assert!(!engine.is_track_enabled(TrackType::Audio));
    engine.enable_track(TrackType::Video);
    engine.start_injection().unwrap();

    spawn_fetcher(&engine, TrackType::Video, 3, 2.0, None).join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Video).len() == 3));

    let media = sink.media(TrackType::Video);
    let step = 2.0 / 6.0;
    for (i, delivered) in media.iter().enumerate() {
        assert!((delivered.pts - i as f64 * step).abs() < 1e-9);
        assert!((delivered.duration - step).abs() < 1e-9);
    }
    engine.stop_injection();
}

#[test]
fn test_trickplay_discontinuity_not_signalled_downstream() {
    let (engine, _context, sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);
    engine.set_rate(6.0);
    engine.start_injection().unwrap();

    spawn_fetcher(&engine, TrackType::Video, 4, 2.0, Some(2)).join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Video).len() == 4));

    assert!(sink.discontinuities.lock().is_empty());
    assert!(sink.media(TrackType::Video).iter().all(|d| !d.discontinuity));
    assert_eq!(engine.metrics().applied_discontinuities, 0);

    let positions: Vec<f64> = sink.media(TrackType::Video).iter().map(|d| d.pts).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    engine.stop_injection();
}

// =============================================================================
// Monitoring Tests
// =============================================================================

#[test]
fn test_buffer_health_transitions() {
    let (engine, context, _sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);

    engine.check_buffer_health(TrackType::Video);
    assert_eq!(
        engine.track_snapshot(TrackType::Video).health,
        kino_pipeline::BufferHealth::Red
    );

    publish(&engine, TrackType::Video, FragmentMeta::media(0.0, 2.0), b"v");
    engine.check_buffer_health(TrackType::Video);
    assert_eq!(
        engine.track_snapshot(TrackType::Video).health,
        kino_pipeline::BufferHealth::Green
    );
    assert_eq!(engine.metrics().buffer_health_changes, 2);
    assert_eq!(
        context.events_matching(|e| matches!(e, PlayerEvent::BufferHealthChanged { .. })),
        2
    );
}

#[test]
fn test_low_latency_health_uses_queued_chunk_duration() {
    let config = PipelineConfig {
        low_latency_mode: true,
        ..Default::default()
    };
    let (engine, _context, _sink) = create_engine(config, StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);
    let health = |engine: &StreamEngine| {
        engine.check_buffer_health(TrackType::Video);
        engine.track_snapshot(TrackType::Video).health
    };

    assert_eq!(health(&engine), kino_pipeline::BufferHealth::Red);

    publish(&engine, TrackType::Video, FragmentMeta::media(0.0, 0.2), b"c0");
    assert_eq!(health(&engine), kino_pipeline::BufferHealth::Yellow);

    for i in 1..6 {
        publish(
            &engine,
            TrackType::Video,
            FragmentMeta::media(f64::from(i) * 0.2, 0.2),
            format!("c{i}").as_bytes(),
        );
    }
    assert_eq!(health(&engine), kino_pipeline::BufferHealth::Green);
}

#[test]
fn test_underflow_deadlock_resumes_ingestion() {
    let (engine, context, _sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);
    context.underflow.store(true, Ordering::SeqCst);
    engine.pause_ingestion(TrackType::Video);
    assert!(!context.is_ingestion_enabled(TrackType::Video));

    publish(&engine, TrackType::Video, FragmentMeta::media(0.0, 2.0), b"v");
    engine.check_buffer_health(TrackType::Video);
    assert_eq!(*context.resumed.lock(), vec![TrackType::Video]);
    assert!(context.is_ingestion_enabled(TrackType::Video));
}

#[test]
fn test_playback_stall_reported() {
    let config = PipelineConfig {
        stall_timeout_ms: 50,
        ..Default::default()
    };
    let (engine, context, _sink) = create_engine(config, StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);

    publish(&engine, TrackType::Video, FragmentMeta::media(0.0, 2.0), b"v");
    engine.check_for_playback_stall(false);
    assert!(context.errors.lock().is_empty());

    assert_eq!(engine.flush_fetched_fragments(TrackType::Video), 1);
    assert!(engine.check_if_player_running_dry());
    thread::sleep(Duration::from_millis(80));
    engine.check_for_playback_stall(false);

    assert!(matches!(
        context.errors.lock().as_slice(),
        [PlayerError::PlaybackStalled { .. }]
    ));
    assert_eq!(
        *context.retunes.lock(),
        vec![(TrackType::Video, RetuneReason::PlaybackStalled)]
    );
}

#[test]
fn test_track_reload_drops_queued_fragments_and_resumes() {
    let (engine, _context, sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);
    engine.start_injection().unwrap();
    publish(&engine, TrackType::Video, FragmentMeta::media(0.0, 2.0), b"old-0");
    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Video).len() == 1));

    engine.begin_track_reload(TrackType::Video);
    assert_eq!(engine.track_snapshot(TrackType::Video).occupancy, 0);
    assert_eq!(injected(&engine, TrackType::Video), 2.0);

    publish(
        &engine,
        TrackType::Video,
        FragmentMeta::media(2.0, 2.0).with_profile(2),
        b"new-1",
    );
    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Video).len() == 2));
    assert_eq!(sink.media(TrackType::Video)[1].payload, b"new-1".to_vec());
    assert_eq!(engine.last_injected_position(TrackType::Video), 2.0);
    engine.stop_injection();
}

#[test]
fn test_seek_resets_tracks() {
    let (engine, _context, sink) = create_engine(PipelineConfig::default(), StreamProtocol::Dash);
    engine.enable_track(TrackType::Video);
    engine.start_injection().unwrap();
    spawn_fetcher(&engine, TrackType::Video, 2, 2.0, None).join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || injected(&engine, TrackType::Video) == 4.0));

    engine.seek();
    assert_eq!(injected(&engine, TrackType::Video), 0.0);
    assert_eq!(engine.track_snapshot(TrackType::Video).occupancy, 0);

    engine.start_injection().unwrap();
    publish(&engine, TrackType::Video, FragmentMeta::media(60.0, 2.0), b"after-seek");
    assert!(wait_until(Duration::from_secs(5), || sink.media(TrackType::Video).len() == 3));
    assert_eq!(engine.last_injected_position(TrackType::Video), 60.0);
    engine.stop_injection();
}
