//! Voice-assistant session logic: barge-in, gating, wake windows.
//!
//! The voice endpoint reuses the whole streaming core; what it adds is a
//! gate between the microphone and the provider. While the assistant is
//! speaking, mic chunks are withheld (they mostly contain the assistant's
//! own echo); a chunk loud enough above the estimated echo floor is a
//! barge-in and reopens the mic. Wake words, when configured, bound the
//! window in which final transcripts count as addressed to the assistant.

use async_trait::async_trait;
use bytes::Bytes;

use crate::audio::pcm16_rms;
use crate::error::ParlanceError;
use crate::protocol_constants::{
    BARGE_IN_MIN_RMS, BARGE_IN_RATIO, ECHO_FLOOR_ALPHA, WAKE_WINDOW_MS,
};

/// Decision for one inbound mic chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicDecision {
    /// Forward to the provider.
    Forward,
    /// Assistant is speaking and the chunk is below the barge-in threshold.
    Withheld,
    /// The user talked over the assistant; playback should stop and the
    /// chunk flows through.
    BargeIn,
}

/// Mic/assistant arbitration state for one voice session.
#[derive(Debug)]
pub struct VoiceGate {
    assistant_speaking: bool,
    /// EWMA of assistant-audio RMS, the expected echo power at the mic.
    echo_floor: f64,
    wake_words: Vec<String>,
    wake_window_ms: u64,
    window_until: Option<u64>,
    meeting_mode: bool,
}

impl VoiceGate {
    pub fn new(wake_words: &[String], meeting_mode: bool) -> Self {
        Self {
            assistant_speaking: false,
            echo_floor: 0.0,
            wake_words: wake_words.iter().map(|w| w.to_lowercase()).collect(),
            wake_window_ms: WAKE_WINDOW_MS,
            window_until: None,
            meeting_mode,
        }
    }

    pub fn is_assistant_speaking(&self) -> bool {
        self.assistant_speaking
    }

    pub fn meeting_mode(&self) -> bool {
        self.meeting_mode
    }

    /// Assistant TTS playback started.
    pub fn assistant_started(&mut self) {
        self.assistant_speaking = true;
    }

    /// Assistant TTS playback finished (or was stopped).
    pub fn assistant_stopped(&mut self) {
        self.assistant_speaking = false;
        self.echo_floor = 0.0;
    }

    /// Feeds one chunk of assistant output into the echo-floor estimate.
    pub fn observe_assistant_audio(&mut self, pcm: &[u8]) {
        let rms = pcm16_rms(pcm);
        self.echo_floor = if self.echo_floor == 0.0 {
            rms
        } else {
            self.echo_floor * (1.0 - ECHO_FLOOR_ALPHA) + rms * ECHO_FLOOR_ALPHA
        };
    }

    /// Gates one inbound mic chunk.
    pub fn admit_mic_chunk(&mut self, pcm: &[u8]) -> MicDecision {
        if !self.assistant_speaking {
            return MicDecision::Forward;
        }
        let rms = pcm16_rms(pcm);
        let threshold = (self.echo_floor * BARGE_IN_RATIO).max(BARGE_IN_MIN_RMS);
        if rms > threshold {
            self.assistant_stopped();
            return MicDecision::BargeIn;
        }
        MicDecision::Withheld
    }

    /// Scans a final transcript for a wake word; a match opens the window.
    ///
    /// Returns the matched wake word.
    pub fn observe_transcript(&mut self, text: &str, now_ms: u64) -> Option<String> {
        if self.wake_words.is_empty() {
            return None;
        }
        let lowered = text.to_lowercase();
        let matched = self.wake_words.iter().find(|w| lowered.contains(w.as_str()))?;
        self.window_until = Some(now_ms + self.wake_window_ms);
        Some(matched.clone())
    }

    /// Whether final transcripts currently count as addressed to the
    /// assistant. Sessions without wake words are always active.
    pub fn window_active(&self, now_ms: u64) -> bool {
        if self.wake_words.is_empty() {
            return true;
        }
        matches!(self.window_until, Some(until) if now_ms < until)
    }

    /// Client-driven reset: close the window and stop any playback gating.
    pub fn reset(&mut self) {
        self.assistant_stopped();
        self.window_until = None;
    }
}

/// Reply produced by the assistant backend for one user utterance.
#[derive(Debug, Clone)]
pub struct AssistantReply {
    pub text: String,
    /// TTS audio (PCM16) to stream back, when the backend produced any.
    pub pcm: Option<Bytes>,
    pub sample_rate: u32,
}

/// The dialogue backend consumed by the voice endpoint.
///
/// LLM/TTS orchestration lives outside the core; this seam is all the voice
/// session needs from it.
#[async_trait]
pub trait AssistantVoice: Send + Sync {
    /// Produces a reply for a final user transcript.
    async fn respond(&self, user_text: &str, lang: &str) -> Result<AssistantReply, ParlanceError>;

    /// Clears any dialogue history (client `reset_history` command).
    async fn reset(&self) {}
}

/// Canned assistant used by development deployments and tests.
pub struct EchoAssistant;

#[async_trait]
impl AssistantVoice for EchoAssistant {
    async fn respond(&self, user_text: &str, _lang: &str) -> Result<AssistantReply, ParlanceError> {
        Ok(AssistantReply {
            text: format!("You said: {}", user_text),
            // 100ms of silence at 16kHz so clients exercise the audio path.
            pcm: Some(Bytes::from(vec![0u8; 3200])),
            sample_rate: 16000,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_at(amplitude: i16, frames: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            data.extend_from_slice(&amplitude.to_le_bytes());
        }
        data
    }

    #[test]
    fn mic_forwards_while_assistant_silent() {
        let mut gate = VoiceGate::new(&[], false);
        assert_eq!(gate.admit_mic_chunk(&pcm_at(50, 160)), MicDecision::Forward);
    }

    #[test]
    fn quiet_mic_is_withheld_during_playback() {
        let mut gate = VoiceGate::new(&[], false);
        gate.assistant_started();
        gate.observe_assistant_audio(&pcm_at(2000, 160));
        assert_eq!(
            gate.admit_mic_chunk(&pcm_at(500, 160)),
            MicDecision::Withheld
        );
        assert!(gate.is_assistant_speaking());
    }

    #[test]
    fn loud_mic_barges_in_and_reopens() {
        let mut gate = VoiceGate::new(&[], false);
        gate.assistant_started();
        gate.observe_assistant_audio(&pcm_at(2000, 160));

        // 4x the echo floor and above the absolute minimum.
        assert_eq!(
            gate.admit_mic_chunk(&pcm_at(16000, 160)),
            MicDecision::BargeIn
        );
        assert!(!gate.is_assistant_speaking());
        // Subsequent chunks forward normally.
        assert_eq!(gate.admit_mic_chunk(&pcm_at(500, 160)), MicDecision::Forward);
    }

    #[test]
    fn barge_in_needs_absolute_minimum_when_echo_floor_is_low() {
        let mut gate = VoiceGate::new(&[], false);
        gate.assistant_started();
        // No assistant audio observed yet: echo floor 0, threshold falls to
        // the absolute minimum.
        assert_eq!(
            gate.admit_mic_chunk(&pcm_at(300, 160)),
            MicDecision::Withheld
        );
        assert_eq!(
            gate.admit_mic_chunk(&pcm_at(5000, 160)),
            MicDecision::BargeIn
        );
    }

    #[test]
    fn wake_word_opens_window() {
        let mut gate = VoiceGate::new(&["computer".to_string()], true);
        assert!(!gate.window_active(1_000));

        let matched = gate.observe_transcript("Hey Computer, what time is it", 1_000);
        assert_eq!(matched.as_deref(), Some("computer"));
        assert!(gate.window_active(1_001));
        assert!(gate.window_active(1_000 + WAKE_WINDOW_MS - 1));
        assert!(!gate.window_active(1_000 + WAKE_WINDOW_MS));
    }

    #[test]
    fn no_wake_words_means_always_active() {
        let gate = VoiceGate::new(&[], false);
        assert!(gate.window_active(u64::MAX - 1));
    }

    #[test]
    fn reset_clears_window_and_playback() {
        let mut gate = VoiceGate::new(&["computer".to_string()], false);
        gate.observe_transcript("computer", 1_000);
        gate.assistant_started();
        gate.reset();
        assert!(!gate.is_assistant_speaking());
        assert!(!gate.window_active(1_001));
    }

    #[tokio::test]
    async fn echo_assistant_replies_with_audio() {
        let reply = EchoAssistant.respond("hello", "en").await.unwrap();
        assert!(reply.text.contains("hello"));
        assert!(reply.pcm.is_some());
    }
}
