//! Kino Pipeline - Fragment Buffering and Injection Engine for Kino
//!
//! This crate sits between the fragment fetchers and the renderer:
//! - Bounded per-track fragment rings with reserve/publish/take/release
//! - Per-track injector threads with cross-track catch-up
//! - Video/audio discontinuity pairing
//! - Trickplay PTS restamping of ISOBMFF fragments
//! - Buffer driven adaptive bitrate (ABR) selection
//! - Buffer health monitoring and stall detection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Kino Pipeline                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   fetchers ──reserve/publish──┐                                 │
//! │                               ▼                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Video Ring  │  │  Audio Ring  │  │ Subtitle Ring│   ...     │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │ take            │ take            │ take              │
//! │  ┌──────┴───────┐  ┌──────┴───────┐  ┌──────┴───────┐           │
//! │  │   Injector   │◀─│   Injector   │◀─│   Injector   │  catch-up │
//! │  └──┬───────┬───┘  └──────┬───────┘  └──────┬───────┘           │
//! │     │       │             │                 │                   │
//! │  ┌──┴───┐ ┌─┴─────────────┴──┐              │                   │
//! │  │ ABR  │ │  Discontinuity   │              │                   │
//! │  │Engine│ │   Coordinator    │              │                   │
//! │  └──────┘ └──────────────────┘              │                   │
//! │                    │                        │                   │
//! │                    ▼                        ▼                   │
//! │              ┌───────────────────────────────────┐              │
//! │              │            Media Sink             │              │
//! │              └───────────────────────────────────┘              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod fragment;
pub mod ring;
pub mod isobmff;
pub mod trickplay;
pub mod abr;
pub mod context;
pub mod events;
pub mod clock;
pub mod discontinuity;
pub mod sync;
pub mod track;
pub mod monitor;
mod injector;
pub mod stream;

pub use error::{Error, PlayerError, Result};
pub use types::*;
pub use config::PipelineConfig;
pub use fragment::{CachedFragment, FragmentMeta};
pub use ring::{FetchWait, FragmentSlotRing, FutureDiscontinuity, InjectTicket, SlotReservation};
pub use trickplay::{RestampState, Rewrite, TrickplayRestamper, TRICKMODE_TIMESCALE};
pub use abr::{AbrDecision, AbrEngine, AbrInput, AbrReason, FetchFailure, ProfileLadder};
pub use context::{MediaSink, PlayerContext, RetuneReason, SegmentPacket, SinkVerdict};
pub use events::{EventRecord, MetricsSnapshot, PlayerEvent};
pub use discontinuity::{DiscontinuityCoordinator, DiscontinuityOutcome, DiscontinuityState};
pub use sync::CrossTrackSynchronizer;
pub use track::{TrackSnapshot, TrackStats};
pub use stream::{FetchRecovery, FetchSlot, StreamEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the pipeline library
pub fn init() {
    tracing::info!(version = VERSION, "Kino Pipeline initialized");
}
