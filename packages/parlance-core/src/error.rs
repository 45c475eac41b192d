//! Centralized error types for the Parlance core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while parsing or validating the client protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The first text frame was not valid JSON.
    #[error("malformed config frame: {0}")]
    MalformedConfig(String),

    /// The config frame parsed but violated the schema contract.
    #[error("invalid config: {0}")]
    ConfigViolation(String),

    /// Binary audio arrived before the config handshake completed.
    #[error("binary frame received before config")]
    BinaryBeforeConfig,

    /// A raw-PCM frame was shorter than the metadata header or carried an
    /// out-of-range duration.
    #[error("invalid PCM frame: {0}")]
    InvalidFrame(String),

    /// Channel split requested in compare (multi-provider) mode.
    #[error("channelSplit is not supported in compare mode")]
    ChannelSplitInCompare,

    /// Context/dictionary phrase list exceeded the configured cap.
    #[error("dictionary over size limit: {count} phrases (max {max})")]
    DictionaryTooLarge { count: usize, max: usize },
}

impl ErrorCode for ProtocolError {
    fn code(&self) -> &'static str {
        match self {
            Self::MalformedConfig(_) => "malformed_config",
            Self::ConfigViolation(_) => "invalid_config",
            Self::BinaryBeforeConfig => "binary_before_config",
            Self::InvalidFrame(_) => "invalid_frame",
            Self::ChannelSplitInCompare => "channel_split_in_compare",
            Self::DictionaryTooLarge { .. } => "dictionary_too_large",
        }
    }
}

/// Errors from the audio decode/resample pipeline.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The codec child process could not be spawned.
    #[error("failed to spawn codec process: {0}")]
    CodecSpawn(std::io::Error),

    /// The codec child process exited with a non-zero status.
    #[error("codec process exited with status {status}")]
    CodecExit { status: i32 },

    /// Writing to or reading from the codec process failed.
    #[error("codec pipe error: {0}")]
    CodecPipe(std::io::Error),

    /// A binary frame was too short to contain the metadata header.
    #[error("frame shorter than header ({len} bytes)")]
    InvalidFrame { len: usize },

    /// Audio duration could not be determined from the decoded stream.
    #[error("could not determine audio duration for {0}")]
    DurationUnknown(String),

    /// Decoded replay audio was shorter than the minimum threshold.
    #[error("decoded audio too short: {decoded_ms}ms < {min_ms}ms")]
    ReplayTooShort { decoded_ms: u64, min_ms: u64 },

    /// Resampler internals rejected the stream parameters.
    #[error("resampler error: {0}")]
    Resample(String),
}

impl ErrorCode for AudioError {
    fn code(&self) -> &'static str {
        match self {
            Self::CodecSpawn(_) => "codec_spawn_failed",
            Self::CodecExit { .. } => "codec_exit_nonzero",
            Self::CodecPipe(_) => "codec_pipe_error",
            Self::InvalidFrame { .. } => "invalid_frame",
            Self::DurationUnknown(_) => "duration_unknown",
            Self::ReplayTooShort { .. } => "replay_too_short",
            Self::Resample(_) => "resample_failed",
        }
    }
}

/// Errors on the socket/backlog transport layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Client stopped answering keepalive pings.
    #[error("stream keepalive timeout")]
    KeepaliveTimeout,

    /// A provider's pending-send count reached the hard limit.
    #[error("provider send backlog hard limit reached")]
    BacklogHardLimit,

    /// A provider's dropped-audio budget was exhausted.
    #[error("backlog drop budget exceeded")]
    DropBudgetExceeded,

    /// The socket send queue overflowed past the grace window.
    #[error("socket send queue overflow")]
    QueueOverflow,
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::BacklogHardLimit => "backlog_hard_limit",
            Self::DropBudgetExceeded => "drop_budget_exceeded",
            Self::QueueOverflow => "queue_overflow",
        }
    }
}

/// Errors surfaced by provider adapters.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    /// The adapter reported an error on its error channel.
    #[error("provider error: {0}")]
    Adapter(String),

    /// The adapter closed its stream before we called `end()`.
    #[error("provider closed unexpectedly")]
    ClosedUnexpectedly,

    /// `start_streaming` itself failed.
    #[error("provider failed to start: {0}")]
    StartFailed(String),

    /// The requested provider id is not registered.
    #[error("unknown provider: {0}")]
    Unknown(String),
}

impl ErrorCode for ProviderError {
    fn code(&self) -> &'static str {
        match self {
            Self::Adapter(_) => "provider_error",
            Self::ClosedUnexpectedly => "provider_closed",
            Self::StartFailed(_) => "provider_start_failed",
            Self::Unknown(_) => "unknown_provider",
        }
    }
}

/// Errors from the batch pipeline.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The manifest did not contain an entry for an input file.
    #[error("manifest has no entry for {0}")]
    ManifestMiss(String),

    /// Input audio failed validation (unsupported format, too long).
    #[error("audio validation failed for {path}: {reason}")]
    AudioInvalid { path: String, reason: String },

    /// The adapter's file transcription failed.
    #[error("transcription failed: {0}")]
    Transcription(String),

    /// Persisting the file result failed; the result is kept out of memory
    /// to mirror storage.
    #[error("storage append failed: {0}")]
    StorageAppend(String),

    /// The job id is not known (evicted or never existed).
    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl ErrorCode for BatchError {
    fn code(&self) -> &'static str {
        match self {
            Self::ManifestMiss(_) => "manifest_miss",
            Self::AudioInvalid { .. } => "audio_invalid",
            Self::Transcription(_) => "transcription_failed",
            Self::StorageAppend(_) => "storage_append_failed",
            Self::JobNotFound(_) => "job_not_found",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Error
// ─────────────────────────────────────────────────────────────────────────────

/// Application-wide error type for the Parlance server.
#[derive(Debug, Error)]
pub enum ParlanceError {
    /// Client protocol violation (fatal to the session).
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Audio pipeline failure.
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// Transport-level failure (keepalive, backlog).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Provider adapter failure.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Batch pipeline failure.
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// Requested replay session does not exist or was already consumed.
    #[error("Replay session not found or already consumed: {0}")]
    ReplayNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Persistent storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParlanceError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(e) => e.code(),
            Self::Audio(e) => e.code(),
            Self::Transport(e) => e.code(),
            Self::Provider(e) => e.code(),
            Self::Batch(e) => e.code(),
            Self::ReplayNotFound(_) => "replay_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ReplayNotFound(_) | Self::Batch(BatchError::JobNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            Self::Protocol(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Provider(ProviderError::Unknown(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type ParlanceResult<T> = Result<T, ParlanceError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for ParlanceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
