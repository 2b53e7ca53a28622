//! Error types for the Kino fragment pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TrackType;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error types
#[derive(Error, Debug)]
pub enum Error {
    // Ring contract violations
    #[error("{track} ring: slot was not reserved by this fetcher")]
    SlotNotReserved { track: TrackType },

    #[error("{track} ring: ticket belongs to a flushed generation")]
    StaleTicket { track: TrackType },

    #[error("{track} ring: release out of order (expected #{expected}, got #{got})")]
    ReleaseOutOfOrder {
        track: TrackType,
        expected: u64,
        got: u64,
    },

    // Wait outcomes
    #[error("{track} ring is full")]
    RingFull { track: TrackType },

    #[error("{track} wait aborted")]
    Aborted { track: TrackType },

    #[error("{track} reached end of stream")]
    EndOfStream { track: TrackType },

    // Track errors
    #[error("Track not enabled: {0}")]
    TrackNotEnabled(TrackType),

    // ABR errors
    #[error("Profile ladder is empty")]
    NoProfiles,

    #[error("Profile index {index} out of range (ladder has {len})")]
    ProfileOutOfRange { index: usize, len: usize },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    // Internal errors
    #[error("Failed to spawn {0} thread")]
    ThreadSpawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the caller can retry or continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RingFull { .. } | Error::Aborted { .. } | Error::EndOfStream { .. }
        )
    }

    /// Returns true for ring contract violations made by the caller
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::SlotNotReserved { .. }
                | Error::StaleTicket { .. }
                | Error::ReleaseOutOfOrder { .. }
        )
    }

    /// Returns the error code for diagnostics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::SlotNotReserved { .. } => "SLOT_NOT_RESERVED",
            Error::StaleTicket { .. } => "STALE_TICKET",
            Error::ReleaseOutOfOrder { .. } => "RELEASE_ORDER",
            Error::RingFull { .. } => "RING_FULL",
            Error::Aborted { .. } => "ABORTED",
            Error::EndOfStream { .. } => "END_OF_STREAM",
            Error::TrackNotEnabled(_) => "TRACK_DISABLED",
            Error::NoProfiles => "NO_PROFILES",
            Error::ProfileOutOfRange { .. } => "PROFILE_RANGE",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::ConfigParse(_) => "CONFIG_PARSE",
            Error::ThreadSpawn(_) => "THREAD_SPAWN",
            Error::Io(_) => "IO",
        }
    }
}

/// Terminal player-level failures, reported through
/// [`PlayerContext::report_error`](crate::context::PlayerContext::report_error).
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerError {
    #[error("{track}: {discarded} consecutive fragments discarded by the sink")]
    PtsError { track: TrackType, discarded: u32 },

    #[error("Playback stalled: no fragment for {stalled_ms}ms")]
    PlaybackStalled { stalled_ms: u64 },
}

impl PlayerError {
    /// Returns the error code for diagnostics
    pub fn error_code(&self) -> &'static str {
        match self {
            PlayerError::PtsError { .. } => "PTS_ERROR",
            PlayerError::PlaybackStalled { .. } => "PLAYBACK_STALLED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::RingFull { track: TrackType::Video };
        assert_eq!(err.error_code(), "RING_FULL");
        assert!(err.is_recoverable());
        assert!(!err.is_contract_violation());

        let err = Error::ReleaseOutOfOrder {
            track: TrackType::Audio,
            expected: 1,
            got: 2,
        };
        assert!(err.is_contract_violation());
        assert_eq!(err.to_string(), "audio ring: release out of order (expected #1, got #2)");
    }

    #[test]
    fn test_player_error_serialization() {
        let err = PlayerError::PtsError {
            track: TrackType::Video,
            discarded: 10,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"pts_error\""));
        assert_eq!(err.error_code(), "PTS_ERROR");
    }
}
