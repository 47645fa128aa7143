//! # parley-core
//!
//! Real-time audio pipeline for live spoken conversation with a remote
//! voice agent.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC ring → capture worker ─► OutboundSink (PcmBlob, 16 kHz)
//!                                           resample + 4096-sample frames
//!
//! ServerEvent ─► ConversationEngine::handle_event ─► playback thread (PlaybackScheduler)
//!                        │                                  │ RenderUnit (SPSC)
//!                        │                                  ▼
//!                        │                     output callback (Renderer, 24 kHz) → speaker
//!                        │                                  │ tap ring
//!                        ▼                                  ▼
//!                 TurnAggregator → ConversationLog   render_tick → SpectrumAnalyser → FeatureSnapshot
//! ```
//!
//! Both audio callbacks are lock-free and allocation-free in steady state:
//! the playback callback holds a fixed-capacity unit list and the scheduler
//! never keeps more units alive than fit in it.
//! All decoding, resampling and scheduling happens on worker threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod analysis;
pub mod audio;
pub mod buffering;
pub mod codec;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod transcript;

// Convenience re-exports for downstream crates
pub use analysis::{AnalyserConfig, FeatureExtractor, FeatureSnapshot, SpectrumAnalyser};
pub use audio::output::{OutputDevice, OutputWiring, VirtualOutput};
pub use codec::PcmBlob;
pub use diagnostics::DiagnosticsSnapshot;
pub use engine::capture::{ChannelSink, OutboundSink};
pub use engine::{ConversationEngine, EngineConfig};
pub use error::ParleyError;
pub use ipc::events::{
    ClientEvent, Message, RenderFrame, Role, ServerEvent, SessionStatus, SessionStatusEvent,
};
pub use playback::{PlaybackScheduler, ScheduledUnit, UnitId};
pub use transcript::{ConversationLog, TurnAggregator};
