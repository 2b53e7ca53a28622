//! Pipeline tunables
//!
//! Every threshold and hysteresis parameter used by the ring, monitor, ABR,
//! discontinuity and injection logic lives here. Configurations are plain
//! JSON; missing keys fall back to the defaults below.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fragments cached per track before fetchers block
    pub max_cached_fragments_per_track: usize,
    /// Chunks cached per track in low-latency mode
    pub max_cached_fragment_chunks_per_track: usize,
    /// Cached video needed before caching is reported complete (seconds)
    pub initial_buffer_seconds: f64,
    /// Buffered seconds above which a track is GREEN
    pub buffer_health_green_threshold: f64,
    /// GREEN threshold in low-latency mode (seconds)
    pub low_latency_green_threshold: f64,
    /// Delay before the first health check (seconds)
    pub buffer_health_monitor_delay_secs: u64,
    /// Interval between health checks (seconds)
    pub buffer_health_monitor_interval_secs: u64,

    /// Enable bandwidth based profile switching
    ///
    /// The emergency floor still forces the lowest profile when disabled.
    pub abr_enabled: bool,
    /// Enable buffer based overrides of the bandwidth decision
    pub abr_buffer_check_enabled: bool,
    /// Buffered seconds at or below which the lowest profile is forced
    pub abr_emergency_floor: f64,
    /// Low buffer threshold for steady-state rampdown (seconds)
    pub abr_min_buffer: f64,
    /// High buffer threshold for steady-state rampup (seconds)
    pub abr_max_buffer: f64,
    /// Consecutive agreeing measurements before a one-step switch
    pub abr_network_consistency_count: u32,
    /// Consecutive buffer checks before a steady-state switch
    pub abr_buffer_counter: u32,
    /// Maximum consecutive reactive rampdowns, -1 for unlimited
    pub ramp_down_limit: i32,
    /// Bitrate used to pick the initial profile (bps)
    pub default_initial_bitrate: u64,

    /// Maximum time a one-sided discontinuity may stay pending (ms)
    pub discontinuity_timeout_ms: u64,
    /// Multiple of the peer fragment duration after which a pending
    /// discontinuity is considered unpaired
    pub discontinuity_stall_fragment_factor: f64,
    /// Schedule a retune instead of ignoring an unpaired discontinuity
    /// while the sink reports underflow
    pub retune_for_unpaired_discontinuity: bool,

    /// Consecutive sink discards before the pipeline gives up
    pub segment_inject_fail_threshold: u32,
    /// Target frames per second while restamping trickplay fragments
    pub trickplay_fps: u32,
    /// Apply per-fragment PTS offsets at normal rate
    pub pts_restamp_enabled: bool,
    /// Low-latency chunked delivery
    pub low_latency_mode: bool,

    /// Download timeout used when the buffer is low (ms)
    pub network_timeout_ms: u64,
    /// Time without parsed fragments before playback is declared stalled (ms)
    pub stall_timeout_ms: u64,
    /// Extra lead subtitles may have over their anchor track (seconds)
    pub subtitle_lead_seconds: f64,
    /// Poll slice for bounded cross-track waits (ms)
    pub catchup_poll_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_cached_fragments_per_track: 4,
            max_cached_fragment_chunks_per_track: 20,
            initial_buffer_seconds: 0.0,
            buffer_health_green_threshold: 4.0,
            low_latency_green_threshold: 1.0,
            buffer_health_monitor_delay_secs: 10,
            buffer_health_monitor_interval_secs: 5,
            abr_enabled: true,
            abr_buffer_check_enabled: true,
            abr_emergency_floor: 0.0,
            abr_min_buffer: 6.0,
            abr_max_buffer: 10.0,
            abr_network_consistency_count: 2,
            abr_buffer_counter: 4,
            ramp_down_limit: -1,
            default_initial_bitrate: 2_500_000,
            discontinuity_timeout_ms: 3000,
            discontinuity_stall_fragment_factor: 2.0,
            retune_for_unpaired_discontinuity: true,
            segment_inject_fail_threshold: 10,
            trickplay_fps: 4,
            pts_restamp_enabled: true,
            low_latency_mode: false,
            network_timeout_ms: 10_000,
            stall_timeout_ms: 10_000,
            subtitle_lead_seconds: 15.0,
            catchup_poll_ms: 100,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.max_cached_fragments_per_track == 0 {
            return Err(Error::InvalidConfig(
                "max_cached_fragments_per_track must be at least 1".into(),
            ));
        }
        if self.max_cached_fragment_chunks_per_track == 0 {
            return Err(Error::InvalidConfig(
                "max_cached_fragment_chunks_per_track must be at least 1".into(),
            ));
        }
        if self.buffer_health_monitor_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "buffer_health_monitor_interval_secs must be positive".into(),
            ));
        }
        if self.buffer_health_monitor_delay_secs < self.buffer_health_monitor_interval_secs {
            return Err(Error::InvalidConfig(format!(
                "monitor delay {}s is shorter than interval {}s",
                self.buffer_health_monitor_delay_secs, self.buffer_health_monitor_interval_secs
            )));
        }
        if self.abr_min_buffer > self.abr_max_buffer {
            return Err(Error::InvalidConfig(format!(
                "abr_min_buffer {} exceeds abr_max_buffer {}",
                self.abr_min_buffer, self.abr_max_buffer
            )));
        }
        if self.abr_network_consistency_count == 0 {
            return Err(Error::InvalidConfig(
                "abr_network_consistency_count must be at least 1".into(),
            ));
        }
        if self.trickplay_fps == 0 {
            return Err(Error::InvalidConfig("trickplay_fps must be positive".into()));
        }
        if self.ramp_down_limit < -1 {
            return Err(Error::InvalidConfig(
                "ramp_down_limit must be -1 or non-negative".into(),
            ));
        }
        if self.discontinuity_stall_fragment_factor <= 0.0 {
            return Err(Error::InvalidConfig(
                "discontinuity_stall_fragment_factor must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Ring capacity for the active delivery mode
    pub fn ring_capacity(&self) -> usize {
        if self.low_latency_mode {
            self.max_cached_fragment_chunks_per_track
        } else {
            self.max_cached_fragments_per_track
        }
    }

    /// GREEN threshold for the active delivery mode
    pub fn green_threshold(&self) -> f64 {
        if self.low_latency_mode {
            self.low_latency_green_threshold
        } else {
            self.buffer_health_green_threshold
        }
    }

    pub fn monitor_delay(&self) -> Duration {
        Duration::from_secs(self.buffer_health_monitor_delay_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.buffer_health_monitor_interval_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn catchup_poll(&self) -> Duration {
        Duration::from_millis(self.catchup_poll_ms.max(1))
    }

    pub fn discontinuity_timeout(&self) -> Duration {
        Duration::from_millis(self.discontinuity_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_cached_fragments_per_track, 4);
        assert_eq!(config.ring_capacity(), 4);
        assert_eq!(config.green_threshold(), 4.0);
        assert_eq!(config.ramp_down_limit, -1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_low_latency_mode() {
        let config = PipelineConfig {
            low_latency_mode: true,
            ..Default::default()
        };
        assert_eq!(config.ring_capacity(), 20);
        assert_eq!(config.green_threshold(), 1.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            PipelineConfig::from_json_str(r#"{"max_cached_fragments_per_track": 3, "trickplay_fps": 8}"#)
                .unwrap();
        assert_eq!(config.max_cached_fragments_per_track, 3);
        assert_eq!(config.trickplay_fps, 8);
        assert_eq!(config.abr_max_buffer, 10.0);
    }

    #[test]
    fn test_validation_rejects_inverted_buffers() {
        let err = PipelineConfig::from_json_str(r#"{"abr_min_buffer": 20.0}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_malformed_json() {
        let err = PipelineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }
}
