//! Deterministic in-process provider adapter.
//!
//! Used by the test suite to script adapter behavior (synthetic send latency,
//! transcript delay, mid-stream failure) and by development deployments that
//! have no real provider credentials configured.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::providers::{
    AdapterEvent, BatchOpts, BatchTranscript, PartialTranscript, StreamingController,
    StreamingOpts, StreamingSession, SttProvider, TranscriptChannel,
};
use crate::utils::now_millis;

/// Scriptable behavior for a [`MockProvider`].
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Time `send_audio` takes to accept a chunk.
    pub send_delay: Duration,
    /// When set, `send_audio` never resolves (backlog testing).
    pub send_never_resolves: bool,
    /// Delay between audio acceptance and the transcript event.
    pub transcript_delay: Duration,
    /// Emit an interim transcript before each final.
    pub emit_interim: bool,
    /// Fail `send_audio` after this many accepted chunks.
    pub fail_after_chunks: Option<usize>,
    /// Text template; `{n}` is replaced with the chunk index.
    pub text_template: String,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            send_delay: Duration::from_millis(0),
            send_never_resolves: false,
            transcript_delay: Duration::from_millis(5),
            emit_interim: false,
            fail_after_chunks: None,
            text_template: "transcript {n}".to_string(),
        }
    }
}

/// Mock STT provider with deterministic, scriptable behavior.
pub struct MockProvider {
    id: String,
    preferred_rate: u32,
    behavior: MockBehavior,
}

impl MockProvider {
    /// Creates a mock with default behavior under the given id.
    pub fn named(id: &str) -> Self {
        Self {
            id: id.to_string(),
            preferred_rate: 16000,
            behavior: MockBehavior::default(),
        }
    }

    /// Overrides the scripted behavior.
    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Overrides the preferred sample rate (to exercise the resample path).
    pub fn with_preferred_rate(mut self, rate: u32) -> Self {
        self.preferred_rate = rate;
        self
    }
}

struct MockController {
    provider_id: String,
    behavior: MockBehavior,
    events: mpsc::Sender<AdapterEvent>,
    channel: TranscriptChannel,
    accepted: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl StreamingController for MockController {
    async fn send_audio(
        &mut self,
        _chunk: Bytes,
        _capture_ts: Option<f64>,
    ) -> Result<(), ProviderError> {
        if self.behavior.send_never_resolves {
            std::future::pending::<()>().await;
        }
        if !self.behavior.send_delay.is_zero() {
            tokio::time::sleep(self.behavior.send_delay).await;
        }

        let n = self.accepted.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.behavior.fail_after_chunks {
            if n >= limit {
                return Err(ProviderError::Adapter("scripted failure".to_string()));
            }
        }

        let text = self.behavior.text_template.replace("{n}", &n.to_string());
        let events = self.events.clone();
        let provider = self.provider_id.clone();
        let channel = self.channel;
        let delay = self.behavior.transcript_delay;
        let interim = self.behavior.emit_interim;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if interim {
                let _ = events
                    .send(AdapterEvent::Transcript(PartialTranscript {
                        text: text.clone(),
                        is_final: false,
                        channel,
                        timestamp: now_millis(),
                        words: None,
                        confidence: None,
                        speaker_id: None,
                        provider: provider.clone(),
                    }))
                    .await;
            }
            let _ = events
                .send(AdapterEvent::Transcript(PartialTranscript {
                    text,
                    is_final: true,
                    channel,
                    timestamp: now_millis(),
                    words: None,
                    confidence: Some(0.92),
                    speaker_id: None,
                    provider,
                }))
                .await;
        });
        Ok(())
    }

    async fn end(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.events.send(AdapterEvent::Closed).await;
        }
    }
}

#[async_trait]
impl SttProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn preferred_sample_rate(&self) -> u32 {
        self.preferred_rate
    }

    async fn start_streaming(
        &self,
        opts: StreamingOpts,
    ) -> Result<StreamingSession, ProviderError> {
        let (tx, rx) = mpsc::channel(64);
        Ok(StreamingSession {
            controller: Box::new(MockController {
                provider_id: self.id.clone(),
                behavior: self.behavior.clone(),
                events: tx,
                channel: opts.channel,
                accepted: Arc::new(AtomicUsize::new(0)),
                closed: false,
            }),
            events: rx,
        })
    }

    async fn transcribe_file_from_pcm(
        &self,
        pcm: Bytes,
        opts: BatchOpts,
    ) -> Result<BatchTranscript, ProviderError> {
        if !self.behavior.transcript_delay.is_zero() {
            tokio::time::sleep(self.behavior.transcript_delay).await;
        }
        let duration_sec = pcm.len() as f64 / (2.0 * opts.sample_rate as f64);
        Ok(BatchTranscript {
            text: self.behavior.text_template.replace("{n}", "0"),
            duration_sec: Some(duration_sec),
            degraded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_emits_one_final_per_chunk() {
        let provider = MockProvider::named("mock");
        let mut session = provider
            .start_streaming(StreamingOpts {
                lang: "en".into(),
                sample_rate: 16000,
                channels: 1,
                enable_interim: false,
                enable_vad: false,
                punctuation: Default::default(),
                context_phrases: vec![],
                channel: TranscriptChannel::Mic,
            })
            .await
            .unwrap();

        session
            .controller
            .send_audio(Bytes::from_static(&[0u8; 320]), None)
            .await
            .unwrap();

        match session.events.recv().await {
            Some(AdapterEvent::Transcript(t)) => {
                assert!(t.is_final);
                assert_eq!(t.text, "transcript 0");
                assert_eq!(t.provider, "mock");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_failure_after_limit() {
        let provider = MockProvider::named("mock").with_behavior(MockBehavior {
            fail_after_chunks: Some(1),
            ..Default::default()
        });
        let mut session = provider
            .start_streaming(StreamingOpts {
                lang: "en".into(),
                sample_rate: 16000,
                channels: 1,
                enable_interim: false,
                enable_vad: false,
                punctuation: Default::default(),
                context_phrases: vec![],
                channel: TranscriptChannel::Mic,
            })
            .await
            .unwrap();

        assert!(session
            .controller
            .send_audio(Bytes::from_static(&[0u8; 4]), None)
            .await
            .is_ok());
        assert!(session
            .controller
            .send_audio(Bytes::from_static(&[0u8; 4]), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn batch_reports_duration_from_pcm_length() {
        let provider = MockProvider::named("mock");
        // 1 second of 16kHz mono PCM16
        let pcm = Bytes::from(vec![0u8; 32000]);
        let result = provider
            .transcribe_file_from_pcm(
                pcm,
                BatchOpts {
                    lang: "en".into(),
                    sample_rate: 16000,
                    punctuation: Default::default(),
                },
            )
            .await
            .unwrap();
        assert!((result.duration_sec.unwrap() - 1.0).abs() < 1e-9);
    }
}
