//! # colloquy-core
//!
//! Real-time duplex voice-session engine: stream the microphone to a remote
//! conversational agent while its synthesized speech streams back and plays
//! gaplessly, with barge-in, live transcription, and web-grounding citations.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC ring → uplink pump ──encode──► transport
//!                                                                    │
//!                                            dispatch loop ◄─────────┘
//!                                             │        │
//!                                   TranscriptState  PlaybackScheduler
//!                                             │        │ ScheduledUnit
//!                                broadcast events     Renderer → speaker
//! ```
//!
//! Audio callbacks are allocation- and lock-free; all heavier work happens on
//! the uplink pump thread and the session's dispatch task. The dispatch task
//! is the single writer for the playback schedule and the transcript state,
//! applying protocol events strictly in arrival order.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod codec;
pub mod credentials;
pub mod error;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transcript;
pub mod transport;

// Convenience re-exports for downstream crates
pub use codec::{EncodedChunk, PlaybackUnit, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
pub use credentials::{CredentialSelector, EnvCredentialSelector};
pub use error::ColloquyError;
pub use events::{
    AudioActivityEvent, GroundingCitation, SessionPhase, SessionStateEvent, TranscriptEvent,
};
pub use session::{LiveSession, SessionConfig, SessionState};
pub use transport::{Connection, Connector, TransportEvent, TransportHandle};

#[cfg(feature = "transport-ws")]
pub use transport::ws::WsConnector;
