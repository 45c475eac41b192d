//! Fixed protocol constants that should NOT be changed.
//!
//! These values are part of the wire contract between clients, the server,
//! and provider adapters. Changing them breaks recorded sessions and the
//! browser capture clients.

// ─────────────────────────────────────────────────────────────────────────────
// Binary Frame Header
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the metadata header prefixed to raw-PCM audio frames (bytes).
///
/// Layout (little-endian): `seq: u32 @0`, `capture_ts: f64 ms @4`,
/// `duration_ms: f32 @12`.
pub const FRAME_HEADER_LEN: usize = 16;

/// Maximum accepted chunk duration in a PCM frame header (ms).
///
/// Anything longer indicates a broken capture client; the frame is rejected.
pub const MAX_FRAME_DURATION_MS: f32 = 5000.0;

// ─────────────────────────────────────────────────────────────────────────────
// Audio Standards
// ─────────────────────────────────────────────────────────────────────────────

/// Default decode target sample rate (Hz).
///
/// 16kHz mono is what most streaming STT providers consume natively.
pub const DEFAULT_TARGET_SAMPLE_RATE: u32 = 16000;

/// Default number of audio channels on the decode path (mono).
pub const DEFAULT_CHANNELS: u16 = 1;

/// Chunk interval for PCM read from the codec process (ms).
pub const DEFAULT_CHUNK_MS: u32 = 100;

/// Minimum decoded audio required for a replay session (ms).
///
/// Guards against silent or corrupt uploads producing an empty run.
pub const MIN_REPLAY_DURATION_MS: u32 = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Backlog Governor Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Pending sends at or above which chunks are dropped instead of queued.
pub const BACKLOG_SOFT_LIMIT: usize = 8;

/// Derives the hard limit from a soft limit: `max(soft * 4, 32)`.
pub const fn backlog_hard_limit(soft_limit: usize) -> usize {
    let quad = soft_limit * 4;
    if quad > 32 {
        quad
    } else {
        32
    }
}

/// Total dropped audio tolerated before a provider is failed (ms).
pub const BACKLOG_MAX_DROP_MS: f64 = 1000.0;

/// Multiplier applied to the hard limit in meeting mode.
///
/// Meeting audio tolerates deeper queues; the drop budget still engages first.
pub const MEETING_QUEUE_FACTOR: usize = 4;

// ─────────────────────────────────────────────────────────────────────────────
// Keepalive
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between server `ping` frames while streaming (ms).
pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;

/// Unanswered pings tolerated before the session is failed.
pub const MAX_MISSED_PONGS: u32 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Handshake Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum number of context/dictionary phrases accepted in a config frame.
pub const MAX_DICTIONARY_PHRASES: usize = 500;

/// Maximum length of a single context/dictionary phrase (chars).
pub const MAX_PHRASE_LEN: usize = 128;

// ─────────────────────────────────────────────────────────────────────────────
// Retention Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// How long a terminal batch job stays queryable in memory (ms).
pub const JOB_RETENTION_MS: u64 = 10 * 60 * 1000;

/// Default realtime log retention (ms): 30 days.
pub const REALTIME_LOG_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Default realtime log row cap.
pub const REALTIME_LOG_MAX_ROWS: usize = 100_000;

/// Lifetime of an unconsumed replay session binding (ms).
pub const REPLAY_SESSION_TTL_MS: u64 = 5 * 60 * 1000;

// ─────────────────────────────────────────────────────────────────────────────
// Voice Session
// ─────────────────────────────────────────────────────────────────────────────

/// Window kept open after a wake word is heard (ms).
pub const WAKE_WINDOW_MS: u64 = 8_000;

/// Ratio of mic RMS over the estimated assistant echo floor that counts as
/// barge-in (4x ≈ +12 dB).
pub const BARGE_IN_RATIO: f64 = 4.0;

/// Absolute mic RMS below which barge-in never triggers, regardless of the
/// echo floor estimate. 16-bit full scale is 32767.
pub const BARGE_IN_MIN_RMS: f64 = 700.0;

/// Smoothing factor for the assistant echo floor EWMA.
pub const ECHO_FLOOR_ALPHA: f64 = 0.2;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the health endpoint.
///
/// Capture clients probe /health and expect this exact string to identify
/// a Parlance server. The core runs in several deployment shapes, so the
/// identifier stays generic.
pub const SERVICE_ID: &str = "parlance";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_limit_is_quadruple_soft_with_floor() {
        assert_eq!(backlog_hard_limit(8), 32);
        assert_eq!(backlog_hard_limit(2), 32);
        assert_eq!(backlog_hard_limit(16), 64);
    }
}
