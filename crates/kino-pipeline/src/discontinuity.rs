//! Cross-track discontinuity pairing
//!
//! A timeline break (period boundary, codec change) must reach the renderer
//! for video and audio together. The first track to reach its marked
//! fragment parks on the coordinator; the second completes the pair and
//! both apply their own transition exactly once. A one-sided block is
//! released by the stall check, the timeout check or an abort.
//!
//! ```text
//!            video            audio
//!   FREE ─────────▶ VIDEO ──────────▶ BOTH ─┐
//!     │  audio                  video  ▲    │ pair: epoch += 1
//!     └─────────▶ AUDIO ───────────────┘    │
//!     ▲                                     │
//!     └─────────────────────────────────────┘
//!       (also on spurious release, timeout, abort)
//! ```

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::MediaSink;
use crate::ring::FutureDiscontinuity;
use crate::types::TrackType;

/// Which tracks have signalled a pending discontinuity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiscontinuityState {
    #[default]
    Free,
    Video,
    Audio,
    Both,
}

impl DiscontinuityState {
    /// State after `track` signals
    pub fn with(self, track: TrackType) -> Self {
        use DiscontinuityState::*;
        match (self, track) {
            (Free, TrackType::Video) => Video,
            (Free, TrackType::Audio) => Audio,
            (Audio, TrackType::Video) | (Video, TrackType::Audio) => Both,
            (state, _) => state,
        }
    }

    /// State after `track` clears its bit
    pub fn without(self, track: TrackType) -> Self {
        use DiscontinuityState::*;
        match (self, track) {
            (Video, TrackType::Video) | (Audio, TrackType::Audio) => Free,
            (Both, TrackType::Video) => Audio,
            (Both, TrackType::Audio) => Video,
            (state, _) => state,
        }
    }

    pub fn contains(self, track: TrackType) -> bool {
        use DiscontinuityState::*;
        matches!(
            (self, track),
            (Both, TrackType::Video | TrackType::Audio)
                | (Video, TrackType::Video)
                | (Audio, TrackType::Audio)
        )
    }
}

/// How the last pending discontinuity was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Paired,
    Spurious,
    TimedOut,
    Aborted,
}

/// Result of [`DiscontinuityCoordinator::process`] for the calling track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscontinuityOutcome {
    /// Transition delivered downstream; inject the fragment as discontinuous
    Applied,
    /// Transition skipped; inject the fragment as a regular one
    Ignored,
    /// Injection is being torn down
    Aborted,
}

/// Progress of the track that is not blocked, sampled without its lock held
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerProgress {
    pub injected_duration: f64,
    pub fragment_duration: f64,
    pub future: FutureDiscontinuity,
}

/// What the periodic stall check should do about a blocked track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    /// Keep waiting
    Wait,
    /// Audio is behind its own queued discontinuity; let it catch up
    WakeAudioCatchup,
    /// The peer has no matching discontinuity nearby
    Spurious,
}

struct CoordinatorState {
    state: DiscontinuityState,
    epoch: u64,
    resolution: Resolution,
    aborted: bool,
    pending_since: Option<Instant>,
    /// A track released its half unpaired; the peer's half is dropped too
    ignored: [bool; 2],
}

fn pairing_slot(track: TrackType) -> usize {
    match track {
        TrackType::Audio => 1,
        _ => 0,
    }
}

/// Mutex-guarded pairing state machine with a single condition variable
pub struct DiscontinuityCoordinator {
    inner: Mutex<CoordinatorState>,
    cond: Condvar,
}

impl Default for DiscontinuityCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscontinuityCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoordinatorState {
                state: DiscontinuityState::Free,
                epoch: 0,
                resolution: Resolution::Paired,
                aborted: false,
                pending_since: None,
                ignored: [false; 2],
            }),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> DiscontinuityState {
        self.inner.lock().state
    }

    /// How long a one-sided discontinuity has been waiting
    pub fn pending_for(&self) -> Option<Duration> {
        self.inner.lock().pending_since.map(|since| since.elapsed())
    }

    /// Handle a discontinuity-marked fragment of `track`
    ///
    /// Blocks the first of video/audio to arrive until the peer arrives or
    /// the block is released. `muxed` streams carry audio inside video and
    /// apply both transitions at once.
    pub fn process(&self, track: TrackType, muxed: bool, sink: &dyn MediaSink) -> DiscontinuityOutcome {
        match track {
            TrackType::Subtitle => return DiscontinuityOutcome::Applied,
            TrackType::AuxAudio => return Self::apply(track, sink),
            TrackType::Video if muxed => {
                let outcome = Self::apply(TrackType::Video, sink);
                if !sink.apply_discontinuity(TrackType::Audio).is_accepted() {
                    warn!("Muxed audio discontinuity rejected by sink");
                }
                return outcome;
            }
            _ => {}
        }

        let mut inner = self.inner.lock();
        if inner.aborted {
            return DiscontinuityOutcome::Aborted;
        }

        if let Some(peer) = track.pairing_peer() {
            let slot = pairing_slot(peer);
            if inner.ignored[slot] {
                inner.ignored[slot] = false;
                info!(
                    track = %track,
                    peer = %peer,
                    "Ignoring discontinuity, peer already ignored its half"
                );
                return DiscontinuityOutcome::Ignored;
            }
        }

        let before = inner.state;
        inner.state = before.with(track);

        if inner.state == DiscontinuityState::Both && !before.contains(track) {
            inner.state = DiscontinuityState::Free;
            inner.epoch += 1;
            inner.resolution = Resolution::Paired;
            inner.pending_since = None;
            drop(inner);
            self.cond.notify_all();
            debug!(track = %track, "Discontinuity paired");
            return Self::apply(track, sink);
        }

        if inner.pending_since.is_none() {
            inner.pending_since = Some(Instant::now());
        }
        let epoch = inner.epoch;
        debug!(track = %track, state = ?inner.state, "Waiting for peer discontinuity");
        while inner.epoch == epoch && !inner.aborted {
            self.cond.wait(&mut inner);
        }

        if inner.epoch == epoch {
            inner.state = inner.state.without(track);
            return DiscontinuityOutcome::Aborted;
        }
        match inner.resolution {
            Resolution::Paired => {
                drop(inner);
                Self::apply(track, sink)
            }
            Resolution::Spurious | Resolution::TimedOut => DiscontinuityOutcome::Ignored,
            Resolution::Aborted => DiscontinuityOutcome::Aborted,
        }
    }

    fn apply(track: TrackType, sink: &dyn MediaSink) -> DiscontinuityOutcome {
        if sink.apply_discontinuity(track).is_accepted() {
            info!(track = %track, "Discontinuity applied");
            DiscontinuityOutcome::Applied
        } else {
            warn!(track = %track, "Discontinuity rejected by sink, continuing without it");
            DiscontinuityOutcome::Ignored
        }
    }

    /// Record that `track` dropped a discontinuity before pairing started
    pub fn note_ignored(&self, track: TrackType) {
        if track.pairing_peer().is_some() {
            self.inner.lock().ignored[pairing_slot(track)] = true;
        }
    }

    /// Decide whether a one-sided block on `track` is spurious
    ///
    /// `factor` scales the peer's fragment duration into the tolerated lead.
    pub fn evaluate_stall(
        track: TrackType,
        injected_duration: f64,
        peer: &PeerProgress,
        factor: f64,
    ) -> StallVerdict {
        let diff = peer.injected_duration - injected_duration;
        let tolerance = factor * peer.fragment_duration;

        if peer.injected_duration >= injected_duration {
            if peer.future.present {
                if track == TrackType::Video {
                    return StallVerdict::WakeAudioCatchup;
                }
                return StallVerdict::Wait;
            }
            // A zero fragment duration means the peer just fetched an init segment
            if peer.fragment_duration > 0.0 && diff + peer.future.cached_duration > tolerance {
                return StallVerdict::Spurious;
            }
        } else if peer.fragment_duration > 0.0 && diff.abs() > tolerance {
            return StallVerdict::Spurious;
        }
        StallVerdict::Wait
    }

    /// True when only `track` is blocked
    pub fn is_one_sided(&self, track: TrackType) -> bool {
        let state = self.inner.lock().state;
        state.contains(track) && state != DiscontinuityState::Both
    }

    /// Release a one-sided block on `track` without applying it
    pub fn release(&self, track: TrackType, resolution: Resolution) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.contains(track) || inner.state == DiscontinuityState::Both {
            return false;
        }
        inner.state = DiscontinuityState::Free;
        inner.epoch += 1;
        inner.resolution = resolution;
        inner.pending_since = None;
        drop(inner);
        self.cond.notify_all();
        warn!(track = %track, resolution = ?resolution, "Pending discontinuity released");
        true
    }

    /// Wake every waiter; they return [`DiscontinuityOutcome::Aborted`]
    pub fn abort(&self) {
        self.inner.lock().aborted = true;
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    /// Clear all state for a restarted stream
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = DiscontinuityState::Free;
        inner.epoch += 1;
        inner.resolution = Resolution::Aborted;
        inner.aborted = false;
        inner.pending_since = None;
        inner.ignored = [false; 2];
        drop(inner);
        self.cond.notify_all();
    }
}
