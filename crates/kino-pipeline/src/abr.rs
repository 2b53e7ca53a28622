//! Adaptive bitrate decision engine for the video track
//!
//! Implements:
//! - Emergency floor: drop straight to the lowest profile when the buffer drains
//! - Bandwidth based ramp up/down gated by a network consistency count
//! - Buffer based overrides and steady-state ramp up/down with hysteresis
//! - Reactive rampdown after fetch failures, capped by a rampdown limit
//! - Buffer based download timeouts

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::types::{BitrateChangeReason, Profile};
use crate::{Error, Result};

// ============================================================================
// Profile ladder
// ============================================================================

/// Profiles sorted by bandwidth; iframe renditions share the index space
#[derive(Debug, Clone)]
pub struct ProfileLadder {
    profiles: Vec<Profile>,
}

impl ProfileLadder {
    pub fn new(mut profiles: Vec<Profile>) -> Result<Self> {
        if profiles.iter().all(|p| p.iframe) {
            return Err(Error::NoProfiles);
        }
        profiles.sort_by_key(|p| (p.iframe, p.bandwidth_bps));
        Ok(Self { profiles })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Profile> {
        self.profiles.get(index)
    }

    pub fn bandwidth(&self, index: usize) -> u64 {
        self.profiles.get(index).map_or(0, |p| p.bandwidth_bps)
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    fn indices(&self, iframe: bool) -> impl DoubleEndedIterator<Item = usize> + '_ {
        self.profiles
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.iframe == iframe)
            .map(|(i, _)| i)
    }

    pub fn lowest_index(&self, iframe: bool) -> Option<usize> {
        self.indices(iframe).next()
    }

    pub fn highest_index(&self, iframe: bool) -> Option<usize> {
        self.indices(iframe).next_back()
    }

    fn is_iframe(&self, index: usize) -> bool {
        self.profiles.get(index).is_some_and(|p| p.iframe)
    }

    /// Next profile up of the same kind
    pub fn step_up(&self, index: usize) -> Option<usize> {
        let iframe = self.is_iframe(index);
        self.indices(iframe).find(|&i| i > index)
    }

    /// Next profile down of the same kind
    pub fn step_down(&self, index: usize) -> Option<usize> {
        let iframe = self.is_iframe(index);
        self.indices(iframe).rev().find(|&i| i < index)
    }

    /// Highest profile of the given kind whose bandwidth is at most `bandwidth_bps`
    pub fn best_at_or_below(&self, bandwidth_bps: u64, iframe: bool) -> Option<usize> {
        self.indices(iframe)
            .rev()
            .find(|&i| self.profiles[i].bandwidth_bps <= bandwidth_bps)
    }

    /// Map an advertised bandwidth to a profile index
    ///
    /// An exact match wins; otherwise the profile just above the last one
    /// below `bandwidth_bps`, clamped to the top of the ladder.
    pub fn resolve_bandwidth(&self, bandwidth_bps: u64) -> usize {
        let normal: Vec<usize> = self.indices(false).collect();
        if let Some(&exact) = normal
            .iter()
            .find(|&&i| self.profiles[i].bandwidth_bps == bandwidth_bps)
        {
            return exact;
        }
        let below = normal
            .iter()
            .position(|&i| self.profiles[i].bandwidth_bps > bandwidth_bps)
            .unwrap_or(normal.len());
        normal[below.min(normal.len() - 1)]
    }
}

// ============================================================================
// Bandwidth estimation
// ============================================================================

/// Bandwidth measurement sample
#[derive(Debug, Clone)]
pub struct BandwidthMeasurement {
    /// Bytes downloaded
    pub bytes: usize,
    /// Time taken
    pub duration: Duration,
    /// Timestamp
    pub timestamp: Instant,
}

impl BandwidthMeasurement {
    /// Calculate throughput in bits per second
    pub fn throughput_bps(&self) -> u64 {
        if self.duration.as_secs_f64() > 0.0 {
            ((self.bytes as f64 * 8.0) / self.duration.as_secs_f64()) as u64
        } else {
            0
        }
    }
}

#[derive(Debug, Default)]
struct BandwidthEstimator {
    history: VecDeque<BandwidthMeasurement>,
    estimate: u64,
}

impl BandwidthEstimator {
    const MAX_HISTORY: usize = 20;

    fn record(&mut self, measurement: BandwidthMeasurement) -> u64 {
        let sample = measurement.throughput_bps();
        if self.history.len() >= Self::MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(measurement);

        if self.estimate == 0 {
            self.estimate = sample;
        } else {
            // EWMA with alpha = 0.2
            self.estimate = ((self.estimate as f64 * 0.8) + (sample as f64 * 0.2)) as u64;
        }
        sample
    }

    fn estimate(&self) -> Option<u64> {
        (self.estimate > 0).then_some(self.estimate)
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Shared profile selection state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSelection {
    pub current: usize,
    /// Selected but not yet seen at the injector
    pub pending: Option<usize>,
    pub reason: BitrateChangeReason,
    pub low_buffer_count: u32,
    pub high_buffer_count: u32,
    pub ramp_down_count: u32,
    /// Skip the consistency gate on the next evaluation
    pub bypass_consistency: bool,
    /// Last profile reported downstream as a bitrate change
    pub last_notified: Option<usize>,
}

/// Why the engine picked a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbrReason {
    EmergencyFloor,
    NetworkUp,
    NetworkDown,
    HeldForBuffer,
    SteadyRampUp,
    SteadyRampDown,
    NoChange,
    Disabled,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbrDecision {
    pub previous: usize,
    pub selected: usize,
    pub reason: AbrReason,
    pub changed: bool,
}

/// Inputs sampled by the video injector before each evaluation
#[derive(Debug, Clone, Copy, Default)]
pub struct AbrInput {
    /// Seconds of video injected ahead of the playhead
    pub buffered_seconds: f64,
    /// Duration of the last video fragment
    pub fragment_duration: f64,
    /// Measured bandwidth; falls back to the engine's own estimate
    pub network_bandwidth: Option<u64>,
    /// Video injection is being torn down
    pub injection_aborted: bool,
}

/// Fetch failure classes the fetcher reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailure {
    Http(u16),
    Timeout,
    PartialFile,
    Other,
}

impl FetchFailure {
    fn triggers_rampdown(self) -> bool {
        match self {
            FetchFailure::Http(code) => matches!(code, 403 | 404 | 500 | 503),
            FetchFailure::Timeout | FetchFailure::PartialFile => true,
            FetchFailure::Other => false,
        }
    }
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Http(code) => write!(f, "HTTP {}", code),
            FetchFailure::Timeout => write!(f, "timeout"),
            FetchFailure::PartialFile => write!(f, "partial file"),
            FetchFailure::Other => write!(f, "other"),
        }
    }
}

/// ABR thresholds copied out of [`PipelineConfig`]
#[derive(Debug, Clone)]
struct AbrSettings {
    enabled: bool,
    buffer_check_enabled: bool,
    emergency_floor: f64,
    min_buffer: f64,
    max_buffer: f64,
    consistency_count: u32,
    buffer_counter: u32,
    ramp_down_limit: i32,
    initial_bitrate: u64,
    network_timeout: Duration,
    low_latency: bool,
}

impl From<&PipelineConfig> for AbrSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            enabled: config.abr_enabled,
            buffer_check_enabled: config.abr_buffer_check_enabled,
            emergency_floor: config.abr_emergency_floor,
            min_buffer: config.abr_min_buffer,
            max_buffer: config.abr_max_buffer,
            consistency_count: config.abr_network_consistency_count,
            buffer_counter: config.abr_buffer_counter,
            ramp_down_limit: config.ramp_down_limit,
            initial_bitrate: config.default_initial_bitrate,
            network_timeout: config.network_timeout(),
            low_latency: config.low_latency_mode,
        }
    }
}

/// ABR engine; the stream keeps it behind a single mutex
pub struct AbrEngine {
    ladder: ProfileLadder,
    settings: AbrSettings,
    selection: ProfileSelection,
    bandwidth: BandwidthEstimator,
    up_count: u32,
    down_count: u32,
}

impl AbrEngine {
    pub fn new(ladder: ProfileLadder, config: &PipelineConfig) -> Self {
        let mut engine = Self {
            ladder,
            settings: AbrSettings::from(config),
            selection: ProfileSelection {
                current: 0,
                pending: None,
                reason: BitrateChangeReason::Tune,
                low_buffer_count: 0,
                high_buffer_count: 0,
                ramp_down_count: 0,
                bypass_consistency: true,
                last_notified: None,
            },
            bandwidth: BandwidthEstimator::default(),
            up_count: 0,
            down_count: 0,
        };
        engine.select_initial(false, BitrateChangeReason::Tune);
        engine
    }

    pub fn ladder(&self) -> &ProfileLadder {
        &self.ladder
    }

    pub fn selection(&self) -> &ProfileSelection {
        &self.selection
    }

    pub fn current_profile(&self) -> usize {
        self.selection.current
    }

    pub fn current_bandwidth(&self) -> u64 {
        self.ladder.bandwidth(self.selection.current)
    }

    pub fn bandwidth_estimate(&self) -> Option<u64> {
        self.bandwidth.estimate()
    }

    /// Pick the starting profile after tune, seek or a rate change
    ///
    /// Trickplay starts on the lowest iframe profile; otherwise the profile
    /// closest to the configured initial bitrate.
    pub fn select_initial(&mut self, trickplay: bool, reason: BitrateChangeReason) -> usize {
        let iframe = trickplay && self.ladder.lowest_index(true).is_some();
        let index = if iframe {
            self.ladder.lowest_index(true)
        } else {
            self.ladder
                .best_at_or_below(self.settings.initial_bitrate, false)
                .or_else(|| self.ladder.lowest_index(false))
        }
        .unwrap_or(0);

        self.selection.current = index;
        self.selection.pending = None;
        self.selection.reason = reason;
        self.selection.bypass_consistency = true;
        self.reset_counters();
        info!(
            profile = index,
            bandwidth = self.ladder.bandwidth(index),
            reason = %reason,
            "Initial profile selected"
        );
        index
    }

    /// Force a specific profile
    pub fn set_profile(&mut self, index: usize, reason: BitrateChangeReason) -> Result<bool> {
        if index >= self.ladder.len() {
            return Err(Error::ProfileOutOfRange {
                index,
                len: self.ladder.len(),
            });
        }
        let changed = index != self.selection.current;
        self.apply(index, reason);
        Ok(changed)
    }

    /// Record a fragment download for bandwidth estimation
    #[instrument(skip(self))]
    pub fn record_download(&mut self, bytes: usize, duration: Duration) {
        let sample = self.bandwidth.record(BandwidthMeasurement {
            bytes,
            duration,
            timestamp: Instant::now(),
        });
        debug!(
            bytes = bytes,
            duration_ms = duration.as_millis(),
            throughput_mbps = sample as f64 / 1_000_000.0,
            estimate_mbps = self.bandwidth.estimate as f64 / 1_000_000.0,
            "Bandwidth measurement recorded"
        );
    }

    /// Evaluate the next video profile
    pub fn evaluate(&mut self, input: AbrInput) -> AbrDecision {
        let previous = self.selection.current;

        if input.buffered_seconds <= self.settings.emergency_floor {
            let lowest = self
                .ladder
                .lowest_index(self.ladder.is_iframe(previous))
                .unwrap_or(0);
            if lowest != previous {
                warn!(
                    buffered = input.buffered_seconds,
                    from = previous,
                    "Switching to lowest profile, buffer is about to drain"
                );
            }
            self.reset_counters();
            self.apply(lowest, BitrateChangeReason::BufferEmpty);
            self.selection.bypass_consistency = false;
            return self.decision(previous, AbrReason::EmergencyFloor);
        }

        if !self.settings.enabled || self.ladder.is_iframe(previous) {
            return self.decision(previous, AbrReason::Disabled);
        }

        let bypass = self.selection.bypass_consistency && !self.settings.low_latency;
        let consistency = if bypass { 1 } else { self.settings.consistency_count };
        let bandwidth = input.network_bandwidth.or_else(|| self.bandwidth.estimate());

        let mut desired = self.profile_by_bandwidth(previous, bandwidth, consistency);
        let mut reason = match desired.cmp(&previous) {
            std::cmp::Ordering::Greater => AbrReason::NetworkUp,
            std::cmp::Ordering::Less => AbrReason::NetworkDown,
            std::cmp::Ordering::Equal => AbrReason::NoChange,
        };

        if !self.selection.bypass_consistency && self.settings.buffer_check_enabled {
            if desired != previous {
                let held = self.desired_on_buffer(previous, desired, &input);
                if held != desired {
                    desired = held;
                    reason = AbrReason::HeldForBuffer;
                }
            }
            if let Some((steady, steady_reason)) =
                self.desired_on_steady_state(previous, desired, bandwidth, &input)
            {
                desired = steady;
                reason = steady_reason;
            }
        }
        self.selection.bypass_consistency = false;

        let change_reason = match reason {
            AbrReason::SteadyRampDown => BitrateChangeReason::BufferEmpty,
            _ => BitrateChangeReason::Abr,
        };
        if desired != previous {
            self.apply(desired, change_reason);
        }
        self.decision(previous, reason)
    }

    /// Bandwidth comparison with the consistency gate
    ///
    /// Unknown bandwidth keeps the current profile and resets the gate.
    pub fn profile_by_bandwidth(
        &mut self,
        current: usize,
        bandwidth: Option<u64>,
        consistency: u32,
    ) -> usize {
        let Some(network) = bandwidth else {
            self.up_count = 0;
            self.down_count = 0;
            return current;
        };
        let current_bw = self.ladder.bandwidth(current);

        if network > current_bw {
            let desired = self.ladder.best_at_or_below(network, false).unwrap_or(current).max(current);
            self.down_count = 0;
            if desired != current && self.ladder.step_up(current) == Some(desired) {
                self.up_count += 1;
                if self.up_count < consistency {
                    return current;
                }
            }
            self.up_count = 0;
            desired
        } else {
            let desired = self
                .ladder
                .best_at_or_below(network, false)
                .or_else(|| self.ladder.lowest_index(false))
                .unwrap_or(current);
            self.up_count = 0;
            if desired != current && self.ladder.step_down(current) == Some(desired) {
                self.down_count += 1;
                if self.down_count < consistency {
                    return current;
                }
            }
            self.down_count = 0;
            desired
        }
    }

    /// Hold switches the buffer cannot justify
    fn desired_on_buffer(&self, current: usize, desired: usize, input: &AbrInput) -> usize {
        let min_needed = if self.settings.low_latency {
            self.settings.min_buffer
        } else {
            input.fragment_duration + self.settings.network_timeout.as_secs_f64()
        };
        if desired > current && input.buffered_seconds < min_needed {
            debug!(
                buffered = input.buffered_seconds,
                min_needed, "Upswitch held until buffer builds"
            );
            return current;
        }
        if desired < current && input.buffered_seconds > self.settings.max_buffer {
            debug!(buffered = input.buffered_seconds, "Downswitch held, buffer is ample");
            return current;
        }
        desired
    }

    /// Steady state hysteresis on a stable candidate
    fn desired_on_steady_state(
        &mut self,
        current: usize,
        desired: usize,
        bandwidth: Option<u64>,
        input: &AbrInput,
    ) -> Option<(usize, AbrReason)> {
        if input.buffered_seconds <= 0.0 || current != desired {
            self.selection.low_buffer_count = 0;
            self.selection.high_buffer_count = 0;
            return None;
        }

        let mut result = None;
        if input.buffered_seconds > self.settings.max_buffer && !self.settings.low_latency {
            self.selection.high_buffer_count += 1;
            self.selection.low_buffer_count = 0;
            if self.selection.high_buffer_count > self.settings.buffer_counter {
                if let Some(up) = self.ladder.step_up(current) {
                    let affordable =
                        bandwidth.is_some_and(|bw| bw >= self.ladder.bandwidth(up));
                    if affordable {
                        result = Some((up, AbrReason::SteadyRampUp));
                    }
                }
                self.selection.high_buffer_count = 0;
            }
        }

        if input.buffered_seconds < self.settings.min_buffer
            && !input.injection_aborted
            && (self.settings.low_latency || bandwidth.is_none())
        {
            self.selection.low_buffer_count += 1;
            self.selection.high_buffer_count = 0;
            if self.selection.low_buffer_count >= self.settings.buffer_counter {
                if let Some(down) = self.ladder.step_down(current) {
                    result = Some((down, AbrReason::SteadyRampDown));
                }
                self.selection.low_buffer_count = 0;
            }
        }
        result
    }

    /// Reactive rampdown after a fetch failure
    ///
    /// Returns true when a lower profile was selected.
    pub fn ramp_down_profile(&mut self, buffered_seconds: f64) -> bool {
        let current = self.selection.current;
        let target = if self.ladder.is_iframe(current) {
            self.ladder.lowest_index(true)
        } else if buffered_seconds <= 0.0 || buffered_seconds > self.settings.max_buffer {
            self.ladder.step_down(current)
        } else {
            let ratio = buffered_seconds / self.settings.max_buffer;
            let target_bw = (self.current_bandwidth() as f64 * ratio) as u64;
            match self.ladder.best_at_or_below(target_bw, false) {
                Some(index) if index < current => Some(index),
                _ => self.ladder.step_down(current),
            }
        };

        match target {
            Some(target) if target != current => {
                warn!(
                    from = current,
                    to = target,
                    buffered = buffered_seconds,
                    "Ramping down profile"
                );
                self.reset_counters();
                self.apply(target, BitrateChangeReason::Rampdown);
                true
            }
            _ => false,
        }
    }

    /// Decide whether a failed fetch should be retried at a lower profile
    pub fn check_for_ramp_down(&mut self, failure: FetchFailure, buffered_seconds: f64) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let current = self.selection.current;
        if Some(current) == self.ladder.lowest_index(self.ladder.is_iframe(current)) {
            debug!(%failure, "Already at lowest profile, no rampdown");
            return false;
        }
        if !failure.triggers_rampdown() {
            return false;
        }

        let mut ramped = false;
        if failure == FetchFailure::Timeout {
            if let Some(estimate) = self.bandwidth.estimate() {
                let desired = self.profile_by_bandwidth(current, Some(estimate), 1);
                if desired < current {
                    self.apply(desired, BitrateChangeReason::Rampdown);
                    ramped = true;
                }
            }
        }
        if !ramped {
            ramped = self.ramp_down_profile(buffered_seconds);
        }
        if ramped {
            self.selection.ramp_down_count += 1;
        }
        ramped
    }

    /// True once the configured number of consecutive rampdowns is reached
    ///
    /// Reaching the limit resets the count; the caller skips the fragment.
    pub fn ramp_down_limit_reached(&mut self) -> bool {
        let limit = self.settings.ramp_down_limit;
        if limit >= 0 && self.selection.ramp_down_count >= limit as u32 {
            warn!(limit, "Rampdown limit reached");
            self.selection.ramp_down_count = 0;
            return true;
        }
        false
    }

    /// Download timeout for the next fetch given the buffered duration
    pub fn timeout_for_buffer(&self, buffered_seconds: f64) -> Duration {
        let network = self.settings.network_timeout;
        if buffered_seconds <= 0.0 || buffered_seconds < self.settings.max_buffer {
            return network;
        }
        let half = Duration::from_secs_f64((buffered_seconds / 2.0).min(self.settings.max_buffer));
        half.max(network)
    }

    pub fn resolve_bandwidth_to_profile_index(&self, bandwidth_bps: u64) -> usize {
        self.ladder.resolve_bandwidth(bandwidth_bps)
    }

    /// Returns the profile to report when an injected fragment's profile
    /// differs from the last reported one
    pub fn take_bitrate_notification(
        &mut self,
        injected_profile: usize,
    ) -> Option<(usize, BitrateChangeReason)> {
        if self.selection.pending == Some(injected_profile) {
            self.selection.pending = None;
        }
        if self.selection.last_notified == Some(injected_profile) {
            return None;
        }
        self.selection.last_notified = Some(injected_profile);
        Some((injected_profile, self.selection.reason))
    }

    fn apply(&mut self, index: usize, reason: BitrateChangeReason) {
        if index != self.selection.current {
            info!(
                from = self.selection.current,
                to = index,
                bandwidth = self.ladder.bandwidth(index),
                reason = %reason,
                "Profile changed"
            );
            self.selection.reason = reason;
            self.selection.pending = Some(index);
        }
        self.selection.current = index;
    }

    fn reset_counters(&mut self) {
        self.selection.low_buffer_count = 0;
        self.selection.high_buffer_count = 0;
        self.up_count = 0;
        self.down_count = 0;
    }

    fn decision(&self, previous: usize, reason: AbrReason) -> AbrDecision {
        let selected = self.selection.current;
        debug!(
            previous,
            selected,
            reason = ?reason,
            "Rendition selected"
        );
        AbrDecision {
            previous,
            selected,
            reason,
            changed: previous != selected,
        }
    }
}
