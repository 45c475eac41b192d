//! Socket wire protocol: tagged JSON messages and the config schema.
//!
//! Text frames carry one JSON object tagged by `type`. The first client
//! frame must be a `config`; everything after is audio (binary) plus `pong`
//! replies and, on the voice endpoint, commands. Validation failures here
//! are fatal protocol errors.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::normalize::{NormalizePreset, NormalizedText};
use crate::protocol_constants::{MAX_DICTIONARY_PHRASES, MAX_PHRASE_LEN};
use crate::providers::{PartialTranscript, PunctuationPolicy};

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

/// Voice-endpoint client commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceCommand {
    BargeIn,
    StopSpeaking,
    ResetHistory,
}

/// Incoming text-frame envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Config(StreamConfig),
    Pong { ts: f64 },
    Command { command: VoiceCommand },
}

/// Nested options block of the config frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamOptions {
    /// Meeting audio tolerates deeper provider queues.
    pub meeting_mode: bool,
    /// Wake words that open an active transcription window (voice mode).
    pub wake_words: Vec<String>,
}

/// The config handshake frame.
///
/// Defaults mirror the capture clients; `validate` enforces the contracts
/// that cannot be expressed structurally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// Raw-PCM mode: binary frames carry the 16-byte metadata header.
    pub pcm: bool,
    /// Client-side capture rate; required when `pcm` is set.
    pub client_sample_rate: Option<u32>,
    pub enable_interim: bool,
    pub channels: u16,
    /// Treat L/R as independent speakers (streaming endpoint only).
    pub channel_split: bool,
    pub context_phrases: Vec<String>,
    pub dictionary_phrases: Vec<String>,
    pub punctuation_policy: PunctuationPolicy,
    pub enable_vad: bool,
    pub normalize_preset: Option<NormalizePreset>,
    pub options: StreamOptions,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pcm: false,
            client_sample_rate: None,
            enable_interim: true,
            channels: 1,
            channel_split: false,
            context_phrases: Vec::new(),
            dictionary_phrases: Vec::new(),
            punctuation_policy: PunctuationPolicy::default(),
            enable_vad: false,
            normalize_preset: None,
            options: StreamOptions::default(),
        }
    }
}

impl StreamConfig {
    /// Validates the schema contracts. `compare_mode` is true on the
    /// multi-provider endpoint, where channel split is forbidden.
    pub fn validate(&self, compare_mode: bool) -> Result<(), ProtocolError> {
        if self.pcm && self.client_sample_rate.is_none() {
            return Err(ProtocolError::ConfigViolation(
                "clientSampleRate is required when pcm is true".to_string(),
            ));
        }
        if let Some(rate) = self.client_sample_rate {
            if !(8000..=96000).contains(&rate) {
                return Err(ProtocolError::ConfigViolation(format!(
                    "clientSampleRate {rate} out of range 8000..=96000"
                )));
            }
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ProtocolError::ConfigViolation(format!(
                "channels must be 1 or 2, got {}",
                self.channels
            )));
        }
        if self.channel_split {
            if compare_mode {
                return Err(ProtocolError::ChannelSplitInCompare);
            }
            if self.channels != 2 {
                return Err(ProtocolError::ConfigViolation(
                    "channelSplit requires channels: 2".to_string(),
                ));
            }
        }

        let phrase_count = self.context_phrases.len() + self.dictionary_phrases.len();
        if phrase_count > MAX_DICTIONARY_PHRASES {
            return Err(ProtocolError::DictionaryTooLarge {
                count: phrase_count,
                max: MAX_DICTIONARY_PHRASES,
            });
        }
        for phrase in self.context_phrases.iter().chain(&self.dictionary_phrases) {
            if phrase.chars().count() > MAX_PHRASE_LEN {
                return Err(ProtocolError::ConfigViolation(format!(
                    "phrase exceeds {MAX_PHRASE_LEN} chars"
                )));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

/// A transcript as emitted on the wire: the adapter transcript plus the
/// attribution the session manager computed for it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTranscript {
    #[serde(flatten)]
    pub transcript: PartialTranscript,
    /// Capture timestamp of the audio span this transcript was attributed to.
    pub origin_capture_ts: f64,
    /// `now - origin_capture_ts`, clamped to >= 0; omitted when not finite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// True when frames were dropped or normalization used a fallback.
    pub degraded: bool,
}

/// Voice session state announced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    Listening,
    Thinking,
    Speaking,
}

/// Outgoing text-frame envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Session {
        session_id: String,
        provider: String,
        lang: String,
        /// Negotiated input rate (client or decode target).
        input_sample_rate: u32,
        /// Rate actually delivered to this provider.
        provider_sample_rate: u32,
    },
    Transcript(WireTranscript),
    #[serde(rename_all = "camelCase")]
    Normalized {
        provider: String,
        is_final: bool,
        #[serde(flatten)]
        text: NormalizedText,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    Ping {
        ts: f64,
    },
    #[serde(rename_all = "camelCase")]
    VoiceSession {
        session_id: String,
        provider: String,
        lang: String,
    },
    VoiceState {
        state: VoiceState,
    },
    VoiceUserTranscript(WireTranscript),
    #[serde(rename_all = "camelCase")]
    VoiceAssistantText {
        text: String,
        is_final: bool,
    },
    VoiceAssistantAudioStart,
    VoiceAssistantAudioEnd,
    #[serde(rename_all = "camelCase")]
    VoiceMeetingWindow {
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        wake_word: Option<String>,
    },
}

impl ServerMessage {
    /// Serializes to the JSON text payload, `None` on serialization failure.
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TranscriptChannel;
    use serde_json::json;

    #[test]
    fn config_frame_parses_with_defaults() {
        let msg: ClientMessage = serde_json::from_value(json!({"type": "config"})).unwrap();
        match msg {
            ClientMessage::Config(cfg) => {
                assert!(!cfg.pcm);
                assert_eq!(cfg.channels, 1);
                assert!(cfg.enable_interim);
            }
            _ => panic!("expected config"),
        }
    }

    #[test]
    fn pcm_config_requires_client_sample_rate() {
        let cfg = StreamConfig {
            pcm: true,
            ..Default::default()
        };
        assert!(cfg.validate(false).is_err());

        let cfg = StreamConfig {
            pcm: true,
            client_sample_rate: Some(48000),
            ..Default::default()
        };
        assert!(cfg.validate(false).is_ok());
    }

    #[test]
    fn channel_split_rejected_in_compare_mode() {
        let cfg = StreamConfig {
            channels: 2,
            channel_split: true,
            ..Default::default()
        };
        assert!(cfg.validate(false).is_ok());
        assert!(matches!(
            cfg.validate(true),
            Err(ProtocolError::ChannelSplitInCompare)
        ));
    }

    #[test]
    fn channel_split_requires_stereo() {
        let cfg = StreamConfig {
            channels: 1,
            channel_split: true,
            ..Default::default()
        };
        assert!(cfg.validate(false).is_err());
    }

    #[test]
    fn oversized_dictionary_rejected() {
        let cfg = StreamConfig {
            dictionary_phrases: vec!["word".to_string(); MAX_DICTIONARY_PHRASES + 1],
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(false),
            Err(ProtocolError::DictionaryTooLarge { .. })
        ));
    }

    #[test]
    fn pong_frame_parses() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "pong", "ts": 123.0})).unwrap();
        assert!(matches!(msg, ClientMessage::Pong { ts } if ts == 123.0));
    }

    #[test]
    fn voice_command_parses() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "command", "command": "barge_in"})).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Command {
                command: VoiceCommand::BargeIn
            }
        ));
    }

    #[test]
    fn transcript_message_serializes_flat() {
        let msg = ServerMessage::Transcript(WireTranscript {
            transcript: PartialTranscript {
                text: "hello".into(),
                is_final: true,
                channel: TranscriptChannel::Mic,
                timestamp: 1.0,
                words: None,
                confidence: None,
                speaker_id: Some("L".into()),
                provider: "mock".into(),
            },
            origin_capture_ts: 1000.0,
            latency_ms: Some(120.0),
            degraded: false,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["text"], "hello");
        assert_eq!(json["isFinal"], true);
        assert_eq!(json["speakerId"], "L");
        assert_eq!(json["originCaptureTs"], 1000.0);
        assert_eq!(json["latencyMs"], 120.0);
    }

    #[test]
    fn omitted_latency_is_absent_from_json() {
        let msg = ServerMessage::Transcript(WireTranscript {
            transcript: PartialTranscript {
                text: "x".into(),
                is_final: false,
                channel: TranscriptChannel::Mic,
                timestamp: 1.0,
                words: None,
                confidence: None,
                speaker_id: None,
                provider: "mock".into(),
            },
            origin_capture_ts: 0.0,
            latency_ms: None,
            degraded: true,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("latencyMs").is_none());
        assert_eq!(json["degraded"], true);
    }

    #[test]
    fn error_message_tags_provider_scope() {
        let msg = ServerMessage::Error {
            message: "backlog drop budget exceeded".into(),
            provider: Some("mock".into()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["provider"], "mock");
    }
}
