//! Per-connection stream session orchestration.
//!
//! One [`StreamSession`] exists per live socket. It owns the provider lanes,
//! fans inbound audio out to them (independently, under the backlog policy),
//! turns adapter events into wire messages, and runs the drain sequence at
//! close: stop intake, end controllers, persist latency summaries, journal
//! session-end.
//!
//! The socket loop itself (frame parsing, keepalive select) lives in the API
//! layer; everything here is socket-agnostic and directly testable.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::audio::{ChunkMeta, FrameHeader};
use crate::error::{ParlanceError, ProtocolError, ProviderError};
use crate::latency::{LatencyStats, LatencySummary};
use crate::normalize::normalize;
use crate::normalize::NormalizationConfig;
use crate::protocol_constants::MAX_FRAME_DURATION_MS;
use crate::providers::{ProviderRegistry, StreamingOpts, TranscriptChannel};
use crate::session::provider_session::{
    ProviderKey, ProviderSession, PublishResult, SessionEvent,
};
use crate::state::Config;
use crate::storage::jsonl::JsonlStore;
use crate::storage::RealtimeLog;
use crate::utils::{now_millis, now_millis_u64};
use crate::wire::{ServerMessage, StreamConfig};

/// Capacity of the merged per-session event channel.
const SESSION_EVENT_CAPACITY: usize = 256;

/// Which endpoint opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Single provider, live microphone.
    Stream,
    /// Multiple providers, one audio input.
    Compare,
    /// Server-side playback of an uploaded file.
    Replay,
    /// Voice assistant (single provider plus gating).
    Voice,
}

impl SessionMode {
    pub fn is_compare(&self) -> bool {
        matches!(self, Self::Compare)
    }
}

/// Lifecycle phase, advanced by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Negotiating,
    Streaming,
    Draining,
    Closed,
}

/// Shared services a session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ProviderRegistry>,
    pub realtime_log: Arc<RealtimeLog>,
    pub latency_store: Arc<JsonlStore<LatencySummary>>,
    pub config: Arc<Config>,
}

struct Lane {
    key: ProviderKey,
    session: ProviderSession,
}

/// One live streaming session.
pub struct StreamSession {
    pub session_id: String,
    mode: SessionMode,
    lang: String,
    stream_config: StreamConfig,
    context: SessionContext,
    lanes: Vec<Lane>,
    events_rx: mpsc::Receiver<SessionEvent>,
    phase: SessionPhase,
    started_at: u64,
    /// Rate of the PCM this session publishes to lanes.
    input_rate: u32,
    /// Sequence counter for the container-decoded path.
    decode_seq: u32,
}

impl StreamSession {
    /// Validates the config, starts one lane per (provider, channel), and
    /// journals a `session` row per lane.
    ///
    /// Any lane failing to start aborts the whole negotiation (the already
    /// started lanes are shut down best-effort).
    pub async fn negotiate(
        context: SessionContext,
        mode: SessionMode,
        provider_ids: &[String],
        lang: &str,
        stream_config: StreamConfig,
    ) -> Result<Self, ParlanceError> {
        stream_config.validate(mode.is_compare())?;
        if provider_ids.is_empty() {
            return Err(ProtocolError::ConfigViolation("no providers requested".into()).into());
        }

        let providers = context.registry.resolve_list(provider_ids)?;
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let input_rate = match stream_config.client_sample_rate {
            Some(rate) if stream_config.pcm => rate,
            _ => context.config.streaming.target_sample_rate,
        };
        let transcript_channel = match mode {
            SessionMode::Replay => TranscriptChannel::File,
            _ if stream_config.options.meeting_mode => TranscriptChannel::Meeting,
            _ => TranscriptChannel::Mic,
        };

        let channel_labels: Vec<Option<&str>> = if stream_config.channel_split {
            vec![Some("L"), Some("R")]
        } else {
            vec![None]
        };

        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let mut lanes = Vec::new();
        for provider in &providers {
            for label in &channel_labels {
                let key = ProviderKey::new(provider.id(), *label);
                let opts = StreamingOpts {
                    lang: lang.to_string(),
                    sample_rate: input_rate,
                    channels: if stream_config.channel_split {
                        1
                    } else {
                        stream_config.channels
                    },
                    enable_interim: stream_config.enable_interim,
                    enable_vad: stream_config.enable_vad,
                    punctuation: stream_config.punctuation_policy,
                    context_phrases: stream_config
                        .context_phrases
                        .iter()
                        .chain(&stream_config.dictionary_phrases)
                        .cloned()
                        .collect(),
                    channel: transcript_channel,
                };
                let lane = ProviderSession::start(
                    Arc::clone(provider),
                    key.clone(),
                    opts,
                    input_rate,
                    context.config.streaming.backlog,
                    stream_config.options.meeting_mode,
                    events_tx.clone(),
                )
                .await;
                match lane {
                    Ok(session) => lanes.push(Lane { key, session }),
                    Err(e) => {
                        for lane in lanes {
                            lane.session.shutdown().await;
                        }
                        return Err(e.into());
                    }
                }
            }
        }

        let session = Self {
            session_id,
            mode,
            lang: lang.to_string(),
            stream_config,
            context,
            lanes,
            events_rx,
            phase: SessionPhase::Negotiating,
            started_at: now_millis_u64(),
            input_rate,
            decode_seq: 0,
        };

        let config_snapshot =
            serde_json::to_value(&session.stream_config).unwrap_or(serde_json::Value::Null);
        for lane in &session.lanes {
            session.context.realtime_log.log_session(
                &session.session_id,
                &lane.key.provider_id,
                &session.lang,
                config_snapshot.clone(),
            );
        }
        Ok(session)
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream_config
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Marks the end of negotiation. The owner emits the session messages.
    pub fn mark_streaming(&mut self) {
        self.phase = SessionPhase::Streaming;
    }

    /// One `session` wire message per lane (dedup'd per provider in
    /// channel-split mode, where both lanes share the provider).
    pub fn session_messages(&self) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        let mut messages = Vec::new();
        for lane in &self.lanes {
            if seen.contains(&lane.key.provider_id) {
                continue;
            }
            seen.push(lane.key.provider_id.clone());
            messages.push(ServerMessage::Session {
                session_id: self.session_id.clone(),
                provider: lane.key.provider_id.clone(),
                lang: self.lang.clone(),
                input_sample_rate: self.input_rate,
                provider_sample_rate: lane.session.provider_sample_rate(),
            });
        }
        messages
    }

    /// Ingests one raw-PCM binary frame (header + samples).
    ///
    /// Validates the header (capture timestamp clamped to now, duration
    /// bounded), routes channel-split frames by sequence parity, and fans
    /// out. Returns wire messages produced by lane failures.
    pub fn ingest_pcm_frame(&mut self, frame: &Bytes) -> Result<Vec<ServerMessage>, ParlanceError> {
        let (header, payload) = FrameHeader::decode(frame)
            .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;

        if !header.duration_ms.is_finite()
            || header.duration_ms <= 0.0
            || header.duration_ms > MAX_FRAME_DURATION_MS
        {
            return Err(
                ProtocolError::InvalidFrame(format!("duration {}ms", header.duration_ms)).into(),
            );
        }
        let now = now_millis();
        let capture_ts = if header.capture_ts_ms.is_finite() {
            header.capture_ts_ms.min(now)
        } else {
            now
        };
        let meta = ChunkMeta {
            capture_ts,
            duration_ms: header.duration_ms as f64,
            seq: header.seq,
        };

        let channel_filter: Option<&str> = if self.stream_config.channel_split {
            Some(if header.seq % 2 == 0 { "L" } else { "R" })
        } else {
            None
        };
        Ok(self.fan_out(payload, meta, channel_filter))
    }

    /// Ingests one chunk from the codec process (container path). Capture
    /// time is synthesized at read time.
    pub fn ingest_decoded_chunk(&mut self, chunk: Bytes) -> Vec<ServerMessage> {
        let chunk_ms = self.context.config.streaming.chunk_ms as f64;
        let meta = ChunkMeta {
            capture_ts: now_millis(),
            duration_ms: chunk_ms,
            seq: self.decode_seq,
        };
        self.decode_seq = self.decode_seq.wrapping_add(1);
        self.fan_out(chunk, meta, None)
    }

    /// Publishes one chunk to every matching, non-failed lane.
    ///
    /// Lanes are independent: a slow or failed lane never blocks the others.
    fn fan_out(
        &mut self,
        chunk: Bytes,
        meta: ChunkMeta,
        channel_filter: Option<&str>,
    ) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        for lane in &mut self.lanes {
            if let Some(filter) = channel_filter {
                if lane.key.channel.as_deref() != Some(filter) {
                    continue;
                }
            }
            match lane.session.publish(chunk.clone(), meta) {
                PublishResult::Sent | PublishResult::Dropped | PublishResult::Skipped => {}
                PublishResult::Failed(message) => {
                    self.context.realtime_log.log_error(
                        &self.session_id,
                        &lane.key.provider_id,
                        &self.lang,
                        &message,
                    );
                    messages.push(ServerMessage::Error {
                        message,
                        provider: Some(lane.key.provider_id.clone()),
                    });
                }
            }
        }
        messages
    }

    /// Receives the next merged lane event.
    pub async fn recv_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Turns one lane event into wire messages.
    pub fn on_event(&mut self, event: SessionEvent) -> Vec<ServerMessage> {
        match event {
            SessionEvent::Transcript { key, transcript } => {
                let Some(lane) = self.lanes.iter().find(|l| l.key == key) else {
                    return Vec::new();
                };
                let Some(wire) = lane.session.shared().process_transcript(transcript, now_millis())
                else {
                    return Vec::new();
                };

                self.context.realtime_log.log_transcript(
                    &self.session_id,
                    &key.provider_id,
                    &self.lang,
                    &wire.transcript.text,
                    wire.transcript.is_final,
                    wire.latency_ms,
                );

                let mut messages = Vec::new();
                if let Some(preset) = self.stream_config.normalize_preset {
                    let normalized = normalize(
                        &wire.transcript.text,
                        &NormalizationConfig {
                            preset,
                            strip_space: false,
                        },
                    );
                    messages.push(ServerMessage::Normalized {
                        provider: key.provider_id.clone(),
                        is_final: wire.transcript.is_final,
                        text: normalized,
                    });
                }
                messages.insert(0, ServerMessage::Transcript(wire));
                messages
            }
            SessionEvent::ProviderError { key, error } => self.fail_lane(&key, &error.to_string()),
            SessionEvent::ProviderClosed { key } => {
                let Some(lane) = self.lanes.iter().find(|l| l.key == key) else {
                    return Vec::new();
                };
                if self.phase == SessionPhase::Draining || lane.session.shared().is_failed() {
                    return Vec::new();
                }
                // Adapter closed before we ended it: treat as a failure.
                self.fail_lane(&key, &ProviderError::ClosedUnexpectedly.to_string())
            }
        }
    }

    fn fail_lane(&mut self, key: &ProviderKey, message: &str) -> Vec<ServerMessage> {
        let Some(lane) = self.lanes.iter().find(|l| l.key == *key) else {
            return Vec::new();
        };
        lane.session.shared().mark_failed();
        self.context.realtime_log.log_error(
            &self.session_id,
            &key.provider_id,
            &self.lang,
            message,
        );
        vec![ServerMessage::Error {
            message: message.to_string(),
            provider: Some(key.provider_id.clone()),
        }]
    }

    /// True when every lane has failed; the owner escalates to session-fatal.
    pub fn all_failed(&self) -> bool {
        !self.lanes.is_empty()
            && self
                .lanes
                .iter()
                .all(|lane| lane.session.shared().is_failed())
    }

    /// Journals error rows for every attached provider, then returns the
    /// session-fatal wire error. Rows are written first so diagnostics
    /// survive a socket that is already gone.
    pub fn fatal(&mut self, message: &str) -> ServerMessage {
        self.phase = SessionPhase::Draining;
        for lane in &self.lanes {
            self.context.realtime_log.log_error(
                &self.session_id,
                &lane.key.provider_id,
                &self.lang,
                message,
            );
        }
        ServerMessage::Error {
            message: message.to_string(),
            provider: None,
        }
    }

    /// Drain sequence: flush resampler tails, end and close every lane,
    /// persist per-lane latency summaries (non-empty only), journal one
    /// session-end row per provider.
    pub async fn shutdown(mut self) {
        self.phase = SessionPhase::Draining;

        for lane in &mut self.lanes {
            lane.session.flush_resampler();
        }

        let mut ended_providers: Vec<String> = Vec::new();
        for lane in std::mem::take(&mut self.lanes) {
            let samples = lane.session.shared().latency_samples();
            if let Some(stats) = LatencyStats::from_samples(&samples) {
                let summary = LatencySummary {
                    session_id: self.session_id.clone(),
                    provider: lane.key.provider_id.clone(),
                    lang: self.lang.clone(),
                    stats,
                    started_at: self.started_at,
                    ended_at: now_millis_u64(),
                };
                if let Err(e) = self.context.latency_store.append(summary) {
                    log::warn!("[Session] latency summary persist failed: {}", e);
                }
            }

            let provider_id = lane.key.provider_id.clone();
            lane.session.shutdown().await;
            if !ended_providers.contains(&provider_id) {
                self.context.realtime_log.log_session_end(
                    &self.session_id,
                    &provider_id,
                    &self.lang,
                );
                ended_providers.push(provider_id);
            }
        }
        self.phase = SessionPhase::Closed;
        log::info!("[Session] {} closed", self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{MockBehavior, MockProvider};
    use crate::state::RetentionConfig;
    use crate::storage::Stores;
    use std::collections::HashMap;
    use std::time::Duration;

    fn context_with(providers: Vec<MockProvider>) -> (SessionContext, Arc<Stores>) {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(Arc::new(provider));
        }
        let stores = Arc::new(Stores::in_memory());
        let context = SessionContext {
            registry: Arc::new(registry),
            realtime_log: Arc::new(RealtimeLog::new(
                Arc::clone(&stores.realtime),
                RetentionConfig::default(),
            )),
            latency_store: Arc::clone(&stores.latency),
            config: Arc::new(Config::default()),
        };
        (context, stores)
    }

    fn pcm_frame(seq: u32, capture_ts: f64, duration_ms: f32, frames: usize) -> Bytes {
        let header = FrameHeader {
            seq,
            capture_ts_ms: capture_ts,
            duration_ms,
        };
        header.encode(&vec![0u8; frames * 2])
    }

    fn pcm_config() -> StreamConfig {
        StreamConfig {
            pcm: true,
            client_sample_rate: Some(16000),
            ..Default::default()
        }
    }

    async fn collect_transcripts(
        session: &mut StreamSession,
        expected: usize,
        deadline: Duration,
    ) -> Vec<crate::wire::WireTranscript> {
        let mut transcripts = Vec::new();
        let collect = async {
            while transcripts.len() < expected {
                let Some(event) = session.recv_event().await else {
                    break;
                };
                for message in session.on_event(event) {
                    if let ServerMessage::Transcript(wire) = message {
                        transcripts.push(wire);
                    }
                }
            }
        };
        let _ = tokio::time::timeout(deadline, collect).await;
        transcripts
    }

    #[tokio::test]
    async fn compare_fanout_latency_is_independent_per_provider() {
        let fast = MockProvider::named("fast").with_behavior(MockBehavior {
            transcript_delay: Duration::from_millis(10),
            ..Default::default()
        });
        let slow = MockProvider::named("slow").with_behavior(MockBehavior {
            transcript_delay: Duration::from_millis(500),
            ..Default::default()
        });
        let (context, stores) = context_with(vec![fast, slow]);

        let mut session = StreamSession::negotiate(
            context,
            SessionMode::Compare,
            &["fast".into(), "slow".into()],
            "en",
            pcm_config(),
        )
        .await
        .unwrap();
        session.mark_streaming();
        assert_eq!(session.session_messages().len(), 2);

        for seq in 0..5u32 {
            let frame = pcm_frame(seq, now_millis() - 60.0, 50.0, 800);
            let errors = session.ingest_pcm_frame(&frame).unwrap();
            assert!(errors.is_empty());
        }

        let transcripts =
            collect_transcripts(&mut session, 10, Duration::from_secs(3)).await;
        assert_eq!(transcripts.len(), 10);

        let mut by_provider: HashMap<String, Vec<f64>> = HashMap::new();
        for wire in &transcripts {
            by_provider
                .entry(wire.transcript.provider.clone())
                .or_default()
                .push(wire.latency_ms.unwrap());
        }
        let fast_latencies = &by_provider["fast"];
        let slow_latencies = &by_provider["slow"];
        assert_eq!(fast_latencies.len(), 5);
        assert_eq!(slow_latencies.len(), 5);

        // Fast provider latencies sit near capture-age + its 10ms delay and
        // are not dragged toward the slow provider's 500ms.
        for latency in fast_latencies {
            assert!(*latency < 300.0, "fast latency shifted: {latency}");
        }
        for latency in slow_latencies {
            assert!(*latency >= 500.0, "slow latency too low: {latency}");
        }

        session.shutdown().await;
        let summaries = stores.latency.scan();
        assert_eq!(summaries.len(), 2);
        for summary in &summaries {
            assert_eq!(summary.stats.count, 5);
        }
    }

    #[tokio::test]
    async fn raw_pcm_attribution_times_against_capture_ts() {
        let provider = MockProvider::named("mock").with_behavior(MockBehavior {
            transcript_delay: Duration::from_millis(120),
            ..Default::default()
        });
        let (context, _stores) = context_with(vec![provider]);

        let mut session = StreamSession::negotiate(
            context,
            SessionMode::Stream,
            &["mock".into()],
            "en",
            pcm_config(),
        )
        .await
        .unwrap();

        let capture_ts = now_millis();
        let frame = pcm_frame(0, capture_ts, 50.0, 800);
        session.ingest_pcm_frame(&frame).unwrap();

        let transcripts = collect_transcripts(&mut session, 1, Duration::from_secs(2)).await;
        assert_eq!(transcripts.len(), 1);
        let wire = &transcripts[0];
        assert_eq!(wire.origin_capture_ts, capture_ts);
        let latency = wire.latency_ms.unwrap();
        assert!(
            (100.0..400.0).contains(&latency),
            "latency out of range: {latency}"
        );
        session.shutdown().await;
    }

    #[tokio::test]
    async fn channel_split_routes_by_sequence_parity() {
        let (context, _stores) = context_with(vec![MockProvider::named("mock")]);
        let config = StreamConfig {
            pcm: true,
            client_sample_rate: Some(16000),
            channels: 2,
            channel_split: true,
            ..Default::default()
        };

        let mut session = StreamSession::negotiate(
            context,
            SessionMode::Stream,
            &["mock".into()],
            "en",
            config,
        )
        .await
        .unwrap();
        // Two lanes, one session message (same provider).
        assert_eq!(session.session_messages().len(), 1);

        for seq in 0..4u32 {
            let frame = pcm_frame(seq, now_millis(), 20.0, 320);
            session.ingest_pcm_frame(&frame).unwrap();
        }

        let transcripts = collect_transcripts(&mut session, 4, Duration::from_secs(2)).await;
        assert_eq!(transcripts.len(), 4);
        let left = transcripts
            .iter()
            .filter(|t| t.transcript.speaker_id.as_deref() == Some("L"))
            .count();
        let right = transcripts
            .iter()
            .filter(|t| t.transcript.speaker_id.as_deref() == Some("R"))
            .count();
        assert_eq!(left, 2);
        assert_eq!(right, 2);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn channel_split_rejected_in_compare() {
        let (context, _stores) =
            context_with(vec![MockProvider::named("a"), MockProvider::named("b")]);
        let config = StreamConfig {
            pcm: true,
            client_sample_rate: Some(16000),
            channels: 2,
            channel_split: true,
            ..Default::default()
        };
        let result = StreamSession::negotiate(
            context,
            SessionMode::Compare,
            &["a".into(), "b".into()],
            "en",
            config,
        )
        .await;
        assert!(matches!(
            result,
            Err(ParlanceError::Protocol(ProtocolError::ChannelSplitInCompare))
        ));
    }

    #[tokio::test]
    async fn all_lanes_failed_escalates() {
        let failing = |name: &str| {
            MockProvider::named(name).with_behavior(MockBehavior {
                fail_after_chunks: Some(0),
                ..Default::default()
            })
        };
        let (context, stores) = context_with(vec![failing("a"), failing("b")]);

        let mut session = StreamSession::negotiate(
            context,
            SessionMode::Compare,
            &["a".into(), "b".into()],
            "en",
            pcm_config(),
        )
        .await
        .unwrap();

        let frame = pcm_frame(0, now_millis(), 20.0, 320);
        session.ingest_pcm_frame(&frame).unwrap();

        let mut error_messages = 0;
        while !session.all_failed() {
            let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_secs(2), session.recv_event()).await
            else {
                break;
            };
            for message in session.on_event(event) {
                if matches!(message, ServerMessage::Error { .. }) {
                    error_messages += 1;
                }
            }
        }
        assert!(session.all_failed());
        assert!(error_messages >= 2);

        // Session-fatal path journals an error row per provider before the
        // wire error goes out.
        let rows_before = stores.realtime.len();
        let wire = session.fatal("every provider failed");
        assert!(matches!(wire, ServerMessage::Error { provider: None, .. }));
        assert_eq!(stores.realtime.len(), rows_before + 2);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn empty_session_persists_no_latency_summary() {
        let (context, stores) = context_with(vec![MockProvider::named("mock")]);
        let session = StreamSession::negotiate(
            context,
            SessionMode::Stream,
            &["mock".into()],
            "en",
            pcm_config(),
        )
        .await
        .unwrap();
        session.shutdown().await;
        assert!(stores.latency.is_empty());

        // Session-end row still written.
        let sessions = stores.realtime.scan();
        assert!(sessions
            .iter()
            .any(|row| matches!(row.payload, crate::storage::RealtimePayload::SessionEnd {})));
    }

    #[tokio::test]
    async fn invalid_duration_frame_is_protocol_error() {
        let (context, _stores) = context_with(vec![MockProvider::named("mock")]);
        let mut session = StreamSession::negotiate(
            context,
            SessionMode::Stream,
            &["mock".into()],
            "en",
            pcm_config(),
        )
        .await
        .unwrap();

        let frame = pcm_frame(0, now_millis(), 6001.0, 320);
        assert!(session.ingest_pcm_frame(&frame).is_err());

        let negative = pcm_frame(0, now_millis(), -5.0, 320);
        assert!(session.ingest_pcm_frame(&negative).is_err());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn future_capture_ts_is_clamped_to_now() {
        let (context, _stores) = context_with(vec![MockProvider::named("mock")]);
        let mut session = StreamSession::negotiate(
            context,
            SessionMode::Stream,
            &["mock".into()],
            "en",
            pcm_config(),
        )
        .await
        .unwrap();

        let future_ts = now_millis() + 60_000.0;
        let frame = pcm_frame(0, future_ts, 50.0, 800);
        session.ingest_pcm_frame(&frame).unwrap();

        let transcripts = collect_transcripts(&mut session, 1, Duration::from_secs(2)).await;
        assert_eq!(transcripts.len(), 1);
        // Clamped at ingest: origin is "now at ingest", so latency is a
        // small non-negative number rather than omitted or negative.
        assert!(transcripts[0].origin_capture_ts < future_ts);
        assert!(transcripts[0].latency_ms.unwrap() >= 0.0);
        session.shutdown().await;
    }
}
