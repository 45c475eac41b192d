//! Provider adapter interface.
//!
//! STT providers (Deepgram, ElevenLabs, OpenAI, local Whisper, ...) live
//! outside this crate; the core consumes them through the narrow seam defined
//! here. A streaming adapter hands back a [`StreamingController`] for audio
//! plus one sum-typed event channel: transcripts, errors, and close all
//! arrive in-band, so the session manager consumes exactly one stream per
//! provider.

pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;

/// Source channel a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptChannel {
    Mic,
    File,
    Meeting,
}

/// Punctuation behavior requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PunctuationPolicy {
    None,
    #[default]
    Basic,
    Full,
}

/// Word-level timing reported by some providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordTiming {
    pub word: String,
    pub start_ms: f64,
    pub end_ms: f64,
}

/// A partial or final transcript emitted by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialTranscript {
    pub text: String,
    pub is_final: bool,
    pub channel: TranscriptChannel,
    /// Adapter-side emission timestamp (ms since epoch).
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTiming>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    pub provider: String,
}

/// Events delivered on an adapter's event channel.
///
/// The onData/onError/onClose callback triple of provider SDKs collapses to
/// this one ordered stream.
#[derive(Debug)]
pub enum AdapterEvent {
    Transcript(PartialTranscript),
    Error(ProviderError),
    Closed,
}

/// Options passed to [`SttProvider::start_streaming`].
#[derive(Debug, Clone)]
pub struct StreamingOpts {
    pub lang: String,
    /// Rate of the PCM this session will send.
    pub sample_rate: u32,
    pub channels: u16,
    pub enable_interim: bool,
    pub enable_vad: bool,
    pub punctuation: PunctuationPolicy,
    /// Bias phrases forwarded to providers that support them.
    pub context_phrases: Vec<String>,
    pub channel: TranscriptChannel,
}

/// Handle for pushing audio into a live provider stream.
#[async_trait]
pub trait StreamingController: Send {
    /// Sends one PCM chunk; returns when the adapter has accepted it.
    async fn send_audio(&mut self, chunk: Bytes, capture_ts: Option<f64>)
        -> Result<(), ProviderError>;

    /// Signals end of audio; the adapter flushes pending transcripts.
    async fn end(&mut self) -> Result<(), ProviderError>;

    /// Releases the stream. Idempotent, best-effort.
    async fn close(&mut self);
}

/// A live streaming session: controller plus its event stream.
pub struct StreamingSession {
    pub controller: Box<dyn StreamingController>,
    pub events: mpsc::Receiver<AdapterEvent>,
}

/// Options for one-shot file transcription.
#[derive(Debug, Clone)]
pub struct BatchOpts {
    pub lang: String,
    pub sample_rate: u32,
    pub punctuation: PunctuationPolicy,
}

/// Result of a one-shot file transcription.
#[derive(Debug, Clone)]
pub struct BatchTranscript {
    pub text: String,
    /// Audio duration as measured by the adapter, when it reports one.
    pub duration_sec: Option<f64>,
    /// True when the adapter fell back to a lower-fidelity path.
    pub degraded: bool,
}

/// A speech-to-text provider adapter.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Stable provider identifier used in URLs and persisted records.
    fn id(&self) -> &str;

    /// Human-readable name for listings.
    fn label(&self) -> &str {
        self.id()
    }

    /// Sample rate this provider consumes natively.
    fn preferred_sample_rate(&self) -> u32 {
        16000
    }

    /// Whether rate conversion for this provider must go through the
    /// high-quality transcode path even for small rate gaps.
    fn requires_high_quality_resample(&self) -> bool {
        false
    }

    /// Opens a live streaming transcription session.
    async fn start_streaming(&self, opts: StreamingOpts)
        -> Result<StreamingSession, ProviderError>;

    /// Transcribes a complete PCM16 buffer at `opts.sample_rate`.
    async fn transcribe_file_from_pcm(
        &self,
        pcm: Bytes,
        opts: BatchOpts,
    ) -> Result<BatchTranscript, ProviderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Lookup table of registered provider adapters.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn SttProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own id. Later registrations win.
    pub fn register(&mut self, provider: Arc<dyn SttProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    /// Looks up a provider by id.
    pub fn get(&self, id: &str) -> Result<Arc<dyn SttProvider>, ProviderError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::Unknown(id.to_string()))
    }

    /// Lists registered provider ids, sorted for stable API output.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves a comma-separated provider list, failing on the first
    /// unknown id.
    pub fn resolve_list(&self, ids: &[String]) -> Result<Vec<Arc<dyn SttProvider>>, ProviderError> {
        ids.iter().map(|id| self.get(id)).collect()
    }
}
