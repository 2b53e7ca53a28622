//! Cross-track catch-up
//!
//! A follower track's injector must not run ahead of its anchor:
//! audio and aux audio follow video, subtitles follow audio (video when
//! muxed). The follower polls its anchor's progress and can be woken early
//! by the anchor's injector.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::PipelineConfig;
use crate::types::TrackType;

/// Why a follower stopped waiting before catching up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    DownloadsDisabled,
    FollowerAborted,
    DiscontinuityProcessed,
    AnchorAborted,
    AnchorEnded,
    VideoDiscontinuity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupExit {
    /// Follower is within its allowed lead
    CaughtUp,
    Released(ReleaseReason),
}

/// Sampled state of a follower and its anchor
#[derive(Debug, Clone, Copy, Default)]
pub struct CatchupProbe {
    pub downloads_enabled: bool,
    pub follower_aborted: bool,
    pub follower_discontinuity_processed: bool,
    pub anchor_aborted: bool,
    pub anchor_eos: bool,
    pub video_discontinuity_pending: bool,
    pub follower_injected: f64,
    pub anchor_injected: f64,
    pub anchor_fragment_duration: f64,
}

struct Gate {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

pub struct CrossTrackSynchronizer {
    poll: Duration,
    subtitle_lead: f64,
    gates: [Gate; 4],
}

impl CrossTrackSynchronizer {
    pub fn new(poll: Duration, subtitle_lead: f64) -> Self {
        Self {
            poll,
            subtitle_lead,
            gates: [Gate::new(), Gate::new(), Gate::new(), Gate::new()],
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.catchup_poll(), config.subtitle_lead_seconds)
    }

    /// The track `follower` must not outrun, if any
    pub fn anchor_for(follower: TrackType, muxed: bool) -> Option<TrackType> {
        match follower {
            TrackType::Video => None,
            TrackType::Audio | TrackType::AuxAudio => Some(TrackType::Video),
            TrackType::Subtitle if muxed => Some(TrackType::Video),
            TrackType::Subtitle => Some(TrackType::Audio),
        }
    }

    /// How far ahead of its anchor the follower may run, in seconds
    pub fn lead_allowance(&self, follower: TrackType, anchor_fragment_duration: f64) -> f64 {
        match follower {
            TrackType::Subtitle => anchor_fragment_duration + self.subtitle_lead,
            _ => anchor_fragment_duration,
        }
    }

    /// Block `follower` until it is within its lead of the anchor
    ///
    /// `probe` is sampled on entry, on every poll and on every notification.
    pub fn wait_for_anchor<F>(&self, follower: TrackType, mut probe: F) -> CatchupExit
    where
        F: FnMut() -> CatchupProbe,
    {
        let gate = &self.gates[follower.index()];
        let mut waited = false;
        loop {
            let sample = probe();
            if let Some(reason) = Self::release_reason(&sample) {
                if waited {
                    debug!(track = %follower, reason = ?reason, "Catch-up wait released");
                }
                return CatchupExit::Released(reason);
            }
            let allowed = sample.anchor_injected + self.lead_allowance(follower, sample.anchor_fragment_duration);
            if sample.follower_injected <= allowed {
                if waited {
                    debug!(
                        track = %follower,
                        injected = sample.follower_injected,
                        anchor = sample.anchor_injected,
                        "Caught up with anchor"
                    );
                }
                return CatchupExit::CaughtUp;
            }

            trace!(
                track = %follower,
                injected = sample.follower_injected,
                anchor = sample.anchor_injected,
                "Waiting for anchor track"
            );
            waited = true;
            let mut notified = gate.notified.lock();
            if !*notified {
                let _ = gate.cond.wait_for(&mut notified, self.poll);
            }
            *notified = false;
        }
    }

    fn release_reason(sample: &CatchupProbe) -> Option<ReleaseReason> {
        if !sample.downloads_enabled {
            Some(ReleaseReason::DownloadsDisabled)
        } else if sample.follower_aborted {
            Some(ReleaseReason::FollowerAborted)
        } else if sample.follower_discontinuity_processed {
            Some(ReleaseReason::DiscontinuityProcessed)
        } else if sample.anchor_aborted {
            Some(ReleaseReason::AnchorAborted)
        } else if sample.anchor_eos {
            Some(ReleaseReason::AnchorEnded)
        } else if sample.video_discontinuity_pending {
            Some(ReleaseReason::VideoDiscontinuity)
        } else {
            None
        }
    }

    /// Wake `follower` so it re-samples immediately
    pub fn notify(&self, follower: TrackType) {
        let gate = &self.gates[follower.index()];
        *gate.notified.lock() = true;
        gate.cond.notify_all();
    }

    pub fn notify_all(&self) {
        for track in TrackType::ALL {
            self.notify(track);
        }
    }

    /// Video side: wake audio followers that are no longer far ahead
    ///
    /// `followers` holds each enabled follower with its injected duration.
    /// Returns the tracks that were woken.
    pub fn reassess_and_resume(
        &self,
        video_injected: f64,
        video_fragment_duration: f64,
        followers: &[(TrackType, f64)],
    ) -> Vec<TrackType> {
        let limit = video_injected + 2.0 * video_fragment_duration;
        let mut woken = Vec::new();
        for &(track, injected) in followers {
            if track.is_audio() && injected < limit {
                self.notify(track);
                woken.push(track);
            }
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn probe(follower: f64, anchor: f64) -> CatchupProbe {
        CatchupProbe {
            downloads_enabled: true,
            follower_injected: follower,
            anchor_injected: anchor,
            anchor_fragment_duration: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_anchor_mapping() {
        assert_eq!(CrossTrackSynchronizer::anchor_for(TrackType::Video, false), None);
        assert_eq!(
            CrossTrackSynchronizer::anchor_for(TrackType::Audio, false),
            Some(TrackType::Video)
        );
        assert_eq!(
            CrossTrackSynchronizer::anchor_for(TrackType::Subtitle, false),
            Some(TrackType::Audio)
        );
        assert_eq!(
            CrossTrackSynchronizer::anchor_for(TrackType::Subtitle, true),
            Some(TrackType::Video)
        );
    }

    #[test]
    fn test_within_lead_returns_immediately() {
        let sync = CrossTrackSynchronizer::new(Duration::from_millis(100), 15.0);
        assert_eq!(
            sync.wait_for_anchor(TrackType::Audio, || probe(12.0, 10.0)),
            CatchupExit::CaughtUp
        );
        // Subtitles get extra slack
        assert_eq!(
            sync.wait_for_anchor(TrackType::Subtitle, || probe(25.0, 10.0)),
            CatchupExit::CaughtUp
        );
    }

    #[test]
    fn test_waits_until_anchor_advances() {
        let sync = CrossTrackSynchronizer::new(Duration::from_millis(10), 15.0);
        let polls = AtomicU32::new(0);
        let exit = sync.wait_for_anchor(TrackType::Audio, || {
            let n = polls.fetch_add(1, Ordering::SeqCst);
            probe(20.0, 10.0 + 4.0 * f64::from(n))
        });
        assert_eq!(exit, CatchupExit::CaughtUp);
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_release_conditions() {
        let sync = CrossTrackSynchronizer::new(Duration::from_millis(10), 15.0);
        let mut sample = probe(30.0, 10.0);
        sample.anchor_eos = true;
        assert_eq!(
            sync.wait_for_anchor(TrackType::Audio, || sample),
            CatchupExit::Released(ReleaseReason::AnchorEnded)
        );

        let mut sample = probe(30.0, 10.0);
        sample.downloads_enabled = false;
        assert_eq!(
            sync.wait_for_anchor(TrackType::Audio, || sample),
            CatchupExit::Released(ReleaseReason::DownloadsDisabled)
        );

        let mut sample = probe(30.0, 10.0);
        sample.video_discontinuity_pending = true;
        assert_eq!(
            sync.wait_for_anchor(TrackType::Audio, || sample),
            CatchupExit::Released(ReleaseReason::VideoDiscontinuity)
        );
    }

    #[test]
    fn test_notify_cuts_poll_short() {
        let sync = Arc::new(CrossTrackSynchronizer::new(Duration::from_secs(5), 15.0));
        let anchor = Arc::new(parking_lot::Mutex::new(0.0_f64));

        let waiter = {
            let sync = Arc::clone(&sync);
            let anchor = Arc::clone(&anchor);
            thread::spawn(move || {
                let start = Instant::now();
                let exit = sync.wait_for_anchor(TrackType::Audio, || probe(10.0, *anchor.lock()));
                (exit, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        *anchor.lock() = 9.0;
        let woken = sync.reassess_and_resume(9.0, 2.0, &[(TrackType::Audio, 10.0), (TrackType::Subtitle, 0.0)]);
        assert_eq!(woken, vec![TrackType::Audio]);

        let (exit, elapsed) = waiter.join().unwrap();
        assert_eq!(exit, CatchupExit::CaughtUp);
        assert!(elapsed < Duration::from_secs(4));
    }
}
