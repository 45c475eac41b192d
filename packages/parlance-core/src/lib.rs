//! Parlance Core - shared library for the Parlance STT comparison service.
//!
//! This crate provides the core functionality for Parlance, a real-time
//! speech-to-text comparison and voice-assistant server. It is designed to
//! be used by the standalone headless server and by embedding applications.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`audio`]: Frame parsing, codec facade (ffmpeg), resampling
//! - [`providers`]: The STT adapter interface and registry
//! - [`session`]: Per-connection orchestration, provider lanes, replay, voice
//! - [`batch`]: The file transcription pipeline and scoring
//! - [`storage`]: Append-only JSONL stores, history, realtime journal
//! - [`api`]: HTTP/WebSocket surface
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! Two seams decouple the core from its collaborators:
//!
//! - [`SttProvider`](providers::SttProvider): speech-to-text adapters
//! - [`AssistantVoice`](session::AssistantVoice): the dialogue backend of
//!   the voice endpoint
//!
//! Both have deterministic in-crate implementations (the mock provider, the
//! echo assistant) suitable for development and tests.

#![warn(clippy::all)]

pub mod api;
pub mod audio;
pub mod batch;
pub mod error;
pub mod latency;
pub mod normalize;
pub mod protocol_constants;
pub mod providers;
pub mod session;
pub mod state;
pub mod storage;
pub mod utils;
pub mod wire;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, AppStateBuilder, ServerError, WsConnectionManager};
pub use audio::{AudioFormat, ChunkMeta, FrameHeader, StreamResampler};
pub use error::{ErrorCode, ParlanceError, ParlanceResult};
pub use latency::{LatencyStats, LatencySummary};
pub use normalize::{normalize, NormalizationConfig, NormalizePreset, NormalizedText};
pub use providers::{PartialTranscript, ProviderRegistry, SttProvider};
pub use session::{
    AssistantVoice, EchoAssistant, ReplaySessionStore, SessionContext, SessionMode, StreamSession,
    VoiceGate,
};
pub use state::{BacklogConfig, Config, JobsConfig, RetentionConfig, StreamingConfig};
pub use storage::{JobHistory, RealtimeLog, Stores};
pub use utils::{now_millis, now_millis_u64};
pub use wire::{ClientMessage, ServerMessage, StreamConfig, WireTranscript};
