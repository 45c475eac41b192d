//! Per-(session, provider) state and plumbing.
//!
//! Each provider attached to a live session gets one of these. It owns the
//! adapter controller behind a dedicated worker task (sends are serialized
//! through a bounded queue, so a slow provider only backs up its own lane),
//! the attribution queue, the backlog governor, the latency samples, and the
//! duplicate-suppression signature. The session manager fans audio out by
//! calling [`ProviderSession::publish`] on every non-failed provider; publish
//! never awaits the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{ChunkMeta, StreamResampler};
use crate::error::ProviderError;
use crate::providers::{AdapterEvent, PartialTranscript, StreamingOpts, SttProvider};
use crate::session::attribution::{Attribution, AttributionQueue};
use crate::session::backlog::{Admission, BacklogGovernor};
use crate::state::BacklogConfig;
use crate::utils::now_millis;
use crate::wire::WireTranscript;

/// How long teardown waits for an inflight send before aborting the worker.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Identifies one provider lane within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub provider_id: String,
    /// Channel label in channel-split mode ("L"/"R").
    pub channel: Option<String>,
}

impl ProviderKey {
    pub fn new(provider_id: &str, channel: Option<&str>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            channel: channel.map(str::to_string),
        }
    }
}

impl std::fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.channel {
            Some(ch) => write!(f, "{}:{}", self.provider_id, ch),
            None => write!(f, "{}", self.provider_id),
        }
    }
}

/// Events the session manager consumes from all provider lanes.
#[derive(Debug)]
pub enum SessionEvent {
    Transcript {
        key: ProviderKey,
        transcript: PartialTranscript,
    },
    ProviderError {
        key: ProviderKey,
        error: ProviderError,
    },
    ProviderClosed {
        key: ProviderKey,
    },
}

/// Outcome of publishing one chunk to one provider lane.
#[derive(Debug, PartialEq)]
pub enum PublishResult {
    Sent,
    Dropped,
    /// Lane failed; the message goes out as a provider-scoped wire error.
    Failed(String),
    /// Lane already failed; chunk ignored.
    Skipped,
}

enum OutboundJob {
    Send { chunk: Bytes, capture_ts: f64 },
    Flush,
}

/// State shared between the session manager, the worker, and the pump.
pub struct ProviderShared {
    pub key: ProviderKey,
    attribution: Mutex<AttributionQueue>,
    governor: BacklogGovernor,
    failed: AtomicBool,
    closed: AtomicBool,
    degraded: AtomicBool,
    latency_samples: Mutex<Vec<f64>>,
    last_signature: Mutex<Option<(String, String, bool, String)>>,
}

impl ProviderShared {
    fn new(key: ProviderKey, backlog: BacklogConfig, meeting_mode: bool) -> Self {
        Self {
            key,
            attribution: Mutex::new(AttributionQueue::new()),
            governor: BacklogGovernor::new(backlog, meeting_mode),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            latency_samples: Mutex::new(Vec::new()),
            last_signature: Mutex::new(None),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Snapshot of the recorded latency samples.
    pub fn latency_samples(&self) -> Vec<f64> {
        self.latency_samples.lock().clone()
    }

    /// Attribution queue depth (for diagnostics and tests).
    pub fn attribution_depth(&self) -> usize {
        self.attribution.lock().len()
    }

    /// Attributes, deduplicates, and times one adapter transcript.
    ///
    /// Returns the wire transcript to emit, or `None` when the transcript is
    /// a consecutive duplicate. Latency is recorded (finals only) after
    /// suppression so duplicates never pollute the summary.
    pub fn process_transcript(
        &self,
        mut transcript: PartialTranscript,
        now: f64,
    ) -> Option<WireTranscript> {
        let attribution = self.attribution.lock().attribute(now);
        let origin_capture_ts = attribution.capture_ts;

        let raw_latency = now - origin_capture_ts;
        let latency_ms = if raw_latency.is_finite() {
            Some(raw_latency.max(0.0))
        } else {
            None
        };

        // Channel-split lanes tag the speaker with the channel label unless
        // the adapter already diarized.
        if transcript.speaker_id.is_none() {
            transcript.speaker_id = self.key.channel.clone();
        }

        let signature = (
            format!("{:?}", transcript.channel),
            transcript
                .speaker_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            transcript.is_final,
            transcript.text.clone(),
        );
        {
            let mut last = self.last_signature.lock();
            if last.as_ref() == Some(&signature) {
                return None;
            }
            *last = Some(signature);
        }

        if transcript.is_final {
            if let Some(latency) = latency_ms {
                self.latency_samples.lock().push(latency);
            }
        }

        Some(WireTranscript {
            transcript,
            origin_capture_ts,
            latency_ms,
            degraded: self.is_degraded(),
        })
    }
}

/// One provider lane of a live session.
pub struct ProviderSession {
    shared: Arc<ProviderShared>,
    outbound: Option<mpsc::Sender<OutboundJob>>,
    worker: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    resampler: Option<StreamResampler>,
    provider_sample_rate: u32,
}

impl ProviderSession {
    /// Starts the provider's streaming session and wires the worker + pump.
    ///
    /// `input_rate` is the rate of the PCM this session will publish; when it
    /// differs from the provider's preferred rate a per-lane resampler is
    /// inserted ahead of the governor.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        provider: Arc<dyn SttProvider>,
        key: ProviderKey,
        opts: StreamingOpts,
        input_rate: u32,
        backlog: BacklogConfig,
        meeting_mode: bool,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, ProviderError> {
        let provider_rate = provider.preferred_sample_rate();
        let channels = opts.channels;

        let resampler = if input_rate != provider_rate {
            Some(
                StreamResampler::new(input_rate, provider_rate, channels)
                    .map_err(|e| ProviderError::StartFailed(e.to_string()))?,
            )
        } else {
            None
        };

        let adapter_opts = StreamingOpts {
            sample_rate: provider_rate,
            ..opts
        };
        let session = provider.start_streaming(adapter_opts).await?;

        let shared = Arc::new(ProviderShared::new(key.clone(), backlog, meeting_mode));
        let (outbound_tx, outbound_rx) = mpsc::channel(backlog.hard_limit.max(1));

        let worker = tokio::spawn(worker_loop(
            session.controller,
            outbound_rx,
            Arc::clone(&shared),
            events_tx.clone(),
        ));
        let pump = tokio::spawn(pump_loop(
            session.events,
            key,
            Arc::clone(&shared),
            events_tx,
        ));

        Ok(Self {
            shared,
            outbound: Some(outbound_tx),
            worker: Some(worker),
            pump: Some(pump),
            resampler,
            provider_sample_rate: provider_rate,
        })
    }

    /// The shared lane state (attribution, latency, flags).
    pub fn shared(&self) -> &Arc<ProviderShared> {
        &self.shared
    }

    /// Rate actually delivered to the adapter.
    pub fn provider_sample_rate(&self) -> u32 {
        self.provider_sample_rate
    }

    /// Publishes one chunk to this lane under the backlog policy.
    ///
    /// Never awaits: fan-out across lanes must not serialize on any one
    /// adapter. The chunk is resampled if the lane needs it, admitted by the
    /// governor, attributed, and handed to the worker queue.
    pub fn publish(&mut self, chunk: Bytes, meta: ChunkMeta) -> PublishResult {
        if self.shared.is_failed() {
            return PublishResult::Skipped;
        }
        let Some(outbound) = self.outbound.as_ref() else {
            return PublishResult::Skipped;
        };

        let pieces = match self.resampler.as_mut() {
            Some(resampler) => match resampler.push(chunk, meta) {
                Ok(pieces) => pieces,
                Err(e) => {
                    self.shared.mark_failed();
                    return PublishResult::Failed(e.to_string());
                }
            },
            None => vec![(chunk, meta)],
        };

        let mut outcome = PublishResult::Dropped;
        for (piece, piece_meta) in pieces {
            match self.shared.governor.admit(piece_meta.duration_ms) {
                Admission::Send => {
                    let now = now_millis();
                    self.shared.attribution.lock().push(
                        Attribution {
                            capture_ts: piece_meta.capture_ts,
                            duration_ms: piece_meta.duration_ms,
                            seq: piece_meta.seq,
                        },
                        now,
                    );
                    let job = OutboundJob::Send {
                        chunk: piece,
                        capture_ts: piece_meta.capture_ts,
                    };
                    if outbound.try_send(job).is_err() {
                        // Queue full despite admission: treat as a drop.
                        self.shared.governor.complete();
                        self.shared.degraded.store(true, Ordering::SeqCst);
                        continue;
                    }
                    outcome = PublishResult::Sent;
                }
                Admission::Drop => {
                    self.shared.degraded.store(true, Ordering::SeqCst);
                }
                Admission::Fail(err) => {
                    self.shared.mark_failed();
                    return PublishResult::Failed(err.to_string());
                }
            }
        }
        outcome
    }

    /// Resampler tail flush at end of input.
    pub fn flush_resampler(&mut self) {
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };
        if let Ok(Some((chunk, meta))) = resampler.flush() {
            let _ = self.publish_raw(chunk, meta);
        }
    }

    fn publish_raw(&mut self, chunk: Bytes, meta: ChunkMeta) -> PublishResult {
        let resampler = self.resampler.take();
        let result = self.publish(chunk, meta);
        self.resampler = resampler;
        result
    }

    /// Drains and releases the lane: flush sentinel, close, join the worker.
    ///
    /// A stuck adapter is aborted after a grace period so teardown always
    /// completes in finite time.
    pub async fn shutdown(mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.try_send(OutboundJob::Flush);
            // Dropping the sender lets the worker run out and close.
        }
        if let Some(mut worker) = self.worker.take() {
            if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, &mut worker)
                .await
                .is_err()
            {
                log::warn!(
                    "[Session] {} worker did not drain in time, aborting",
                    self.shared.key
                );
                worker.abort();
            }
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for ProviderSession {
    fn drop(&mut self) {
        // Best-effort: a session dropped without shutdown() still stops its
        // tasks. The worker exits once the outbound sender is gone.
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Serializes sends to the adapter controller and completes governor slots.
async fn worker_loop(
    mut controller: Box<dyn crate::providers::StreamingController>,
    mut rx: mpsc::Receiver<OutboundJob>,
    shared: Arc<ProviderShared>,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            OutboundJob::Send { chunk, capture_ts } => {
                let result = controller.send_audio(chunk, Some(capture_ts)).await;
                shared.governor.complete();
                if let Err(error) = result {
                    shared.mark_failed();
                    let _ = events_tx
                        .send(SessionEvent::ProviderError {
                            key: shared.key.clone(),
                            error,
                        })
                        .await;
                    break;
                }
            }
            OutboundJob::Flush => {
                if let Err(e) = controller.end().await {
                    log::debug!("[Session] {} end() failed: {}", shared.key, e);
                }
            }
        }
    }
    // Release governor slots for any jobs we will never send.
    while let Ok(job) = rx.try_recv() {
        if matches!(job, OutboundJob::Send { .. }) {
            shared.governor.complete();
        }
    }
    controller.close().await;
    shared.closed.store(true, Ordering::SeqCst);
}

/// Forwards adapter events into the session's merged event stream.
async fn pump_loop(
    mut events: mpsc::Receiver<AdapterEvent>,
    key: ProviderKey,
    shared: Arc<ProviderShared>,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let forwarded = match event {
            AdapterEvent::Transcript(transcript) => SessionEvent::Transcript {
                key: key.clone(),
                transcript,
            },
            AdapterEvent::Error(error) => {
                shared.mark_failed();
                SessionEvent::ProviderError {
                    key: key.clone(),
                    error,
                }
            }
            AdapterEvent::Closed => SessionEvent::ProviderClosed { key: key.clone() },
        };
        if events_tx.send(forwarded).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::providers::mock::{MockBehavior, MockProvider};
    use crate::providers::{PunctuationPolicy, TranscriptChannel};
    use std::time::Duration;

    fn opts() -> StreamingOpts {
        StreamingOpts {
            lang: "en".into(),
            sample_rate: 16000,
            channels: 1,
            enable_interim: true,
            enable_vad: false,
            punctuation: PunctuationPolicy::Basic,
            context_phrases: vec![],
            channel: TranscriptChannel::Mic,
        }
    }

    fn transcript(text: &str, is_final: bool) -> PartialTranscript {
        PartialTranscript {
            text: text.into(),
            is_final,
            channel: TranscriptChannel::Mic,
            timestamp: now_millis(),
            words: None,
            confidence: None,
            speaker_id: None,
            provider: "mock".into(),
        }
    }

    fn shared_for_test() -> ProviderShared {
        ProviderShared::new(
            ProviderKey::new("mock", None),
            BacklogConfig::default(),
            false,
        )
    }

    fn push_chunk(shared: &ProviderShared, capture_ts: f64, duration_ms: f64) {
        shared.attribution.lock().push(
            Attribution {
                capture_ts,
                duration_ms,
                seq: 0,
            },
            now_millis(),
        );
    }

    #[test]
    fn transcript_attributes_against_queued_chunk() {
        let shared = shared_for_test();
        let t0 = now_millis() - 120.0;
        push_chunk(&shared, t0, 50.0);

        let wire = shared
            .process_transcript(transcript("hello", true), now_millis())
            .unwrap();
        assert_eq!(wire.origin_capture_ts, t0);
        let latency = wire.latency_ms.unwrap();
        assert!(latency >= 100.0 && latency < 400.0, "latency {latency}");
    }

    #[test]
    fn future_capture_ts_clamps_latency_to_zero() {
        let shared = shared_for_test();
        push_chunk(&shared, now_millis() + 10_000.0, 50.0);

        let wire = shared
            .process_transcript(transcript("early", true), now_millis())
            .unwrap();
        assert_eq!(wire.latency_ms, Some(0.0));
    }

    #[test]
    fn consecutive_duplicates_are_suppressed() {
        let shared = shared_for_test();
        push_chunk(&shared, now_millis(), 50.0);
        push_chunk(&shared, now_millis(), 50.0);

        assert!(shared
            .process_transcript(transcript("same", true), now_millis())
            .is_some());
        assert!(shared
            .process_transcript(transcript("same", true), now_millis())
            .is_none());
        // A different text breaks the run.
        assert!(shared
            .process_transcript(transcript("different", true), now_millis())
            .is_some());
    }

    #[test]
    fn duplicate_latency_is_not_recorded() {
        let shared = shared_for_test();
        push_chunk(&shared, now_millis() - 50.0, 50.0);
        push_chunk(&shared, now_millis() - 50.0, 50.0);

        shared.process_transcript(transcript("dup", true), now_millis());
        shared.process_transcript(transcript("dup", true), now_millis());
        assert_eq!(shared.latency_samples().len(), 1);
    }

    #[test]
    fn interim_transcripts_do_not_record_latency() {
        let shared = shared_for_test();
        push_chunk(&shared, now_millis() - 50.0, 50.0);

        let wire = shared
            .process_transcript(transcript("interim", false), now_millis())
            .unwrap();
        assert!(wire.latency_ms.is_some());
        assert!(shared.latency_samples().is_empty());
    }

    #[test]
    fn channel_label_becomes_default_speaker() {
        let shared = ProviderShared::new(
            ProviderKey::new("mock", Some("L")),
            BacklogConfig::default(),
            false,
        );
        push_chunk(&shared, now_millis(), 50.0);
        let wire = shared
            .process_transcript(transcript("left", true), now_millis())
            .unwrap();
        assert_eq!(wire.transcript.speaker_id.as_deref(), Some("L"));
    }

    #[tokio::test]
    async fn publish_send_pushes_attribution_and_transcript_flows() {
        let provider = Arc::new(MockProvider::named("mock"));
        let (tx, mut rx) = mpsc::channel(16);
        let mut lane = ProviderSession::start(
            provider,
            ProviderKey::new("mock", None),
            opts(),
            16000,
            BacklogConfig::default(),
            false,
            tx,
        )
        .await
        .unwrap();

        let meta = ChunkMeta {
            capture_ts: now_millis(),
            duration_ms: 50.0,
            seq: 0,
        };
        let result = lane.publish(Bytes::from(vec![0u8; 1600]), meta);
        assert_eq!(result, PublishResult::Sent);

        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
        {
            Some(SessionEvent::Transcript { transcript, .. }) => {
                assert_eq!(transcript.text, "transcript 0");
            }
            other => panic!("unexpected: {other:?}"),
        }
        lane.shutdown().await;
    }

    #[tokio::test]
    async fn send_error_marks_lane_failed() {
        let provider = Arc::new(MockProvider::named("mock").with_behavior(MockBehavior {
            fail_after_chunks: Some(0),
            ..Default::default()
        }));
        let (tx, mut rx) = mpsc::channel(16);
        let mut lane = ProviderSession::start(
            provider,
            ProviderKey::new("mock", None),
            opts(),
            16000,
            BacklogConfig::default(),
            false,
            tx,
        )
        .await
        .unwrap();

        let meta = ChunkMeta {
            capture_ts: now_millis(),
            duration_ms: 20.0,
            seq: 0,
        };
        assert_eq!(
            lane.publish(Bytes::from(vec![0u8; 640]), meta),
            PublishResult::Sent
        );

        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
        {
            Some(SessionEvent::ProviderError { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(lane.shared().is_failed());

        // Failed lanes skip further publishes.
        let meta2 = ChunkMeta {
            capture_ts: now_millis(),
            duration_ms: 20.0,
            seq: 1,
        };
        assert_eq!(
            lane.publish(Bytes::from(vec![0u8; 640]), meta2),
            PublishResult::Skipped
        );
        lane.shutdown().await;
    }

    #[tokio::test]
    async fn stuck_adapter_drops_then_fails_on_budget() {
        // soft=1: first chunk occupies the only slot forever, later chunks
        // burn the 500ms drop budget, the fourth fails the lane.
        let provider = Arc::new(MockProvider::named("stuck").with_behavior(MockBehavior {
            send_never_resolves: true,
            ..Default::default()
        }));
        let backlog = BacklogConfig {
            soft_limit: 1,
            hard_limit: 10,
            max_drop_ms: 500.0,
        };
        let (tx, _rx) = mpsc::channel(16);
        let mut lane = ProviderSession::start(
            provider,
            ProviderKey::new("stuck", None),
            opts(),
            16000,
            backlog,
            false,
            tx,
        )
        .await
        .unwrap();

        let chunk = Bytes::from(vec![0u8; 8000]);
        let meta = |seq| ChunkMeta {
            capture_ts: now_millis(),
            duration_ms: 250.0,
            seq,
        };
        assert_eq!(lane.publish(chunk.clone(), meta(0)), PublishResult::Sent);
        // Give the worker a beat to pull the job into its stuck send.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lane.publish(chunk.clone(), meta(1)), PublishResult::Dropped);
        assert_eq!(lane.publish(chunk.clone(), meta(2)), PublishResult::Dropped);
        assert_eq!(
            lane.publish(chunk.clone(), meta(3)),
            PublishResult::Failed(TransportError::DropBudgetExceeded.to_string())
        );
        assert!(lane.shared().is_failed());
        assert!(lane.shared().is_degraded());
        lane.shutdown().await;
    }

    #[tokio::test]
    async fn resampling_lane_converts_before_governor() {
        let provider = Arc::new(MockProvider::named("hq").with_preferred_rate(24000));
        let (tx, _rx) = mpsc::channel(16);
        let mut lane = ProviderSession::start(
            provider,
            ProviderKey::new("hq", None),
            opts(),
            16000,
            BacklogConfig::default(),
            false,
            tx,
        )
        .await
        .unwrap();
        assert_eq!(lane.provider_sample_rate(), 24000);

        // 2048 input frames: enough for the resampler to emit.
        let meta = ChunkMeta {
            capture_ts: now_millis(),
            duration_ms: 128.0,
            seq: 0,
        };
        let result = lane.publish(Bytes::from(vec![0u8; 4096]), meta);
        assert_eq!(result, PublishResult::Sent);
        assert!(lane.shared().attribution_depth() >= 1);
        lane.shutdown().await;
    }
}
