//! Trickplay PTS restamping
//!
//! Fast forward and rewind fetch sparse iframe fragments whose source
//! timestamps jump around. Before injection each fragment is given a
//! synthetic, monotonically increasing timeline in a fixed timescale.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fragment::CachedFragment;
use crate::isobmff;
use crate::types::is_trickplay_rate;

/// Timescale written into init segments while in trick mode
pub const TRICKMODE_TIMESCALE: u32 = 100_000;

/// Outcome of a timestamp rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
    /// Nothing to do for this fragment or rate
    Skipped,
    /// Timing updated; ISOBMFF payloads were rewritten in place
    Applied,
    /// Timing updated, but an ISOBMFF payload could not be rewritten
    PayloadFailed,
}

/// Restamping state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestampState {
    #[default]
    Undef,
    FirstFragment,
    Discontinuity,
    Steady,
}

/// Per-track restamping context, reset on every rate change or seek
#[derive(Debug, Clone)]
pub struct TrickplayRestamper {
    state: RestampState,
    restamped_pts: f64,
    restamped_duration: f64,
    last_fragment_pts: f64,
    trick_fps: u32,
}

impl TrickplayRestamper {
    pub fn new(trick_fps: u32) -> Self {
        Self {
            state: RestampState::Undef,
            restamped_pts: 0.0,
            restamped_duration: 0.0,
            last_fragment_pts: 0.0,
            trick_fps: trick_fps.max(1),
        }
    }

    pub fn state(&self) -> RestampState {
        self.state
    }

    pub fn restamped_pts(&self) -> f64 {
        self.restamped_pts
    }

    pub fn restamped_duration(&self) -> f64 {
        self.restamped_duration
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.trick_fps);
    }

    /// Rewrite the fragment's timing for playback at `rate`
    ///
    /// Rates that are not fast forward or rewind leave the fragment untouched
    /// and return [`Rewrite::Skipped`]. Payloads that are not ISOBMFF only
    /// get their position and duration restamped.
    pub fn restamp(&mut self, fragment: &mut CachedFragment, rate: f64) -> Rewrite {
        if !is_trickplay_rate(rate) {
            warn!(rate, "Unsupported trickplay rate, cannot restamp");
            return Rewrite::Skipped;
        }
        let source_position = fragment.position;
        let source_duration = fragment.duration;
        let speed = rate.abs();
        let boxed = isobmff::is_isobmff(&fragment.fragment);
        let mut rewritten = true;

        if fragment.init_fragment {
            if boxed {
                rewritten = isobmff::set_timescale(&mut fragment.fragment, TRICKMODE_TIMESCALE)
                    && isobmff::clear_media_header_duration(&mut fragment.fragment);
            }
            fragment.timescale = TRICKMODE_TIMESCALE;

            if fragment.discontinuity {
                self.state = RestampState::Discontinuity;
                self.restamped_pts += self.restamped_duration;
            } else if self.state == RestampState::Undef {
                self.state = RestampState::FirstFragment;
            }
        } else {
            match self.state {
                // Undef: media without a preceding init segment
                RestampState::Undef | RestampState::FirstFragment => {
                    self.restamped_duration =
                        (source_duration / speed).max(1.0 / f64::from(self.trick_fps));
                }
                RestampState::Discontinuity => {}
                RestampState::Steady => {
                    let delta = (source_position - self.last_fragment_pts).abs();
                    self.restamped_duration = delta / speed;
                    self.restamped_pts += self.restamped_duration;
                }
            }
            self.state = RestampState::Steady;
            self.last_fragment_pts = source_position;
            fragment.duration = self.restamped_duration;

            if boxed {
                let scale = f64::from(TRICKMODE_TIMESCALE);
                rewritten = isobmff::set_pts_and_duration(
                    &mut fragment.fragment,
                    (self.restamped_pts * scale) as u64,
                    (self.restamped_duration * scale) as u64,
                );
            }
        }
        fragment.position = self.restamped_pts;

        debug!(
            state = ?self.state,
            rate,
            init = fragment.init_fragment,
            discontinuity = fragment.discontinuity,
            source_position,
            source_duration,
            position = fragment.position,
            duration = fragment.duration,
            "Trickplay fragment restamped"
        );
        if rewritten {
            Rewrite::Applied
        } else {
            Rewrite::PayloadFailed
        }
    }
}

/// Shift a normal-rate media fragment's decode times by its PTS offset
pub fn apply_pts_offset(fragment: &mut CachedFragment) -> Rewrite {
    if fragment.init_fragment || fragment.pts_offset_sec == 0.0 {
        return Rewrite::Skipped;
    }
    let timescale = match fragment.timescale {
        0 => return Rewrite::Skipped,
        timescale => timescale,
    };
    if !isobmff::is_isobmff(&fragment.fragment) {
        return Rewrite::Skipped;
    }
    let offset = (fragment.pts_offset_sec * f64::from(timescale)) as i64;
    match isobmff::restamp_pts(&mut fragment.fragment, offset) {
        Some((before, after)) => {
            debug!(timescale, before, after, uri = %fragment.uri, "PTS offset applied");
            Rewrite::Applied
        }
        None => Rewrite::PayloadFailed,
    }
}

/// Clear the media header duration of a normal-rate init segment
pub fn clear_init_duration(fragment: &mut CachedFragment) -> Rewrite {
    if !fragment.init_fragment || !isobmff::is_isobmff(&fragment.fragment) {
        return Rewrite::Skipped;
    }
    if isobmff::clear_media_header_duration(&mut fragment.fragment) {
        Rewrite::Applied
    } else {
        Rewrite::PayloadFailed
    }
}
