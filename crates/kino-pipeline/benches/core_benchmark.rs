//! Benchmark tests for kino-pipeline operations
//!
//! Run with: cargo bench -p kino-pipeline

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use kino_pipeline::{
    AbrEngine, AbrInput, CachedFragment, FetchWait, FragmentSlotRing, PipelineConfig, Profile,
    ProfileLadder, TrackType, TrickplayRestamper,
};

// ============================================================================
// Helpers
// ============================================================================

fn create_ladder(rungs: usize) -> ProfileLadder {
    let profiles = (0..rungs)
        .map(|i| Profile::new(200_000 * (i as u64 + 1)))
        .chain(std::iter::once(Profile::iframe(100_000)))
        .collect();
    ProfileLadder::new(profiles).unwrap()
}

fn create_fragment(position: f64) -> CachedFragment {
    CachedFragment::media(position, 2.0, &[0u8; 1024][..])
}

// ============================================================================
// Ring Benchmarks
// ============================================================================

fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");

    for capacity in [4usize, 20] {
        group.bench_with_input(
            BenchmarkId::new("reserve_publish_take_release", capacity),
            &capacity,
            |b, &capacity| {
                let ring = FragmentSlotRing::new(TrackType::Video, capacity);
                let mut position = 0.0;
                b.iter(|| {
                    let reservation = ring.reserve_for_fetch(false, FetchWait::NonBlocking).unwrap();
                    ring.publish(reservation, create_fragment(position)).unwrap();
                    let taken = ring.take_for_inject().unwrap();
                    black_box(&taken.fragment);
                    ring.release(taken.ticket).unwrap();
                    position += 2.0;
                });
            },
        );
    }

    group.bench_function("future_discontinuity_full_ring", |b| {
        let ring = FragmentSlotRing::new(TrackType::Audio, 20);
        for i in 0..20 {
            let reservation = ring.reserve_for_fetch(false, FetchWait::NonBlocking).unwrap();
            ring.publish(reservation, create_fragment(f64::from(i) * 2.0)).unwrap();
        }
        b.iter(|| black_box(ring.future_discontinuity()));
    });

    group.finish();
}

// ============================================================================
// ABR Benchmarks
// ============================================================================

fn bench_abr(c: &mut Criterion) {
    let mut group = c.benchmark_group("abr");
    let config = PipelineConfig::default();

    for rungs in [3usize, 8] {
        group.bench_with_input(BenchmarkId::new("evaluate", rungs), &rungs, |b, &rungs| {
            let mut abr = AbrEngine::new(create_ladder(rungs), &config);
            let mut bandwidth = 500_000u64;
            b.iter(|| {
                bandwidth = (bandwidth * 7 / 5) % 5_000_000 + 100_000;
                black_box(abr.evaluate(AbrInput {
                    buffered_seconds: 8.0,
                    fragment_duration: 2.0,
                    network_bandwidth: Some(bandwidth),
                    injection_aborted: false,
                }))
            });
        });
    }

    group.bench_function("resolve_bandwidth", |b| {
        let ladder = create_ladder(8);
        b.iter(|| black_box(ladder.resolve_bandwidth(black_box(900_000))));
    });

    group.finish();
}

// ============================================================================
// Trickplay Benchmarks
// ============================================================================

fn bench_trickplay(c: &mut Criterion) {
    c.bench_function("trickplay_restamp", |b| {
        let mut restamper = TrickplayRestamper::new(4);
        let mut position = 0.0;
        b.iter(|| {
            let mut fragment = create_fragment(position);
            restamper.restamp(&mut fragment, 6.0);
            position += 2.0;
            black_box(fragment.position)
        });
    });
}

criterion_group!(benches, bench_ring, bench_abr, bench_trickplay);
criterion_main!(benches);
