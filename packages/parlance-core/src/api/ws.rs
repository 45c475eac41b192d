//! WebSocket handlers for the stream, compare, and replay endpoints.
//!
//! The handshake and keepalive live here; everything stateful about a
//! session is delegated to [`StreamSession`]. One connection drives one
//! session; the select loop multiplexes socket frames, codec output, lane
//! events, and the keepalive metronome.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use serde::Deserialize;

use crate::api::{AppState, ConnectionGuard, Endpoint};
use crate::audio::{AudioFormat, CodecInput, CodecStream};
use crate::error::{AudioError, ParlanceError, ProtocolError};
use crate::session::{SessionMode, StreamSession};
use crate::utils::now_millis;
use crate::wire::{ClientMessage, ServerMessage, StreamConfig};

/// Query parameters of `/ws/stream`.
#[derive(Deserialize)]
pub struct StreamQuery {
    pub provider: String,
    #[serde(default)]
    pub lang: Option<String>,
}

/// Query parameters of `/ws/compare`.
#[derive(Deserialize)]
pub struct CompareQuery {
    /// Comma-separated provider ids.
    pub providers: String,
    #[serde(default)]
    pub lang: Option<String>,
}

/// Query parameters of `/ws/replay`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayQuery {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub providers: Option<String>,
    pub session_id: String,
}

/// `/ws/stream` upgrade handler.
pub async fn stream_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let lang = query.lang.unwrap_or_else(|| "en".to_string());
        handle_live_socket(socket, state, SessionMode::Stream, vec![query.provider], lang).await;
    })
}

/// `/ws/compare` upgrade handler.
pub async fn compare_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<CompareQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let providers: Vec<String> = query
            .providers
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let lang = query.lang.unwrap_or_else(|| "en".to_string());
        handle_live_socket(socket, state, SessionMode::Compare, providers, lang).await;
    })
}

/// `/ws/replay` upgrade handler.
pub async fn replay_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ReplayQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_replay_socket(socket, state, query).await;
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Send Helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> bool {
    match message.to_json() {
        Some(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        None => true,
    }
}

pub(crate) async fn send_all(
    sender: &mut SplitSink<WebSocket, Message>,
    messages: &[ServerMessage],
) -> bool {
    for message in messages {
        if !send_message(sender, message).await {
            return false;
        }
    }
    true
}

async fn send_error_and_close(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &str,
    provider: Option<String>,
) {
    let wire = ServerMessage::Error {
        message: message.to_string(),
        provider,
    };
    let _ = send_message(sender, &wire).await;
    let _ = sender.close().await;
}

/// Waits for the config frame. Binary before config is a fatal protocol
/// error; a closed socket surfaces as a malformed-config error the caller
/// discards silently.
pub(crate) async fn await_config(
    receiver: &mut SplitStream<WebSocket>,
) -> Result<StreamConfig, ParlanceError> {
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                return match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Config(config)) => Ok(config),
                    Ok(_) => Err(ProtocolError::MalformedConfig(
                        "first message must be a config frame".to_string(),
                    )
                    .into()),
                    Err(e) => Err(ProtocolError::MalformedConfig(e.to_string()).into()),
                };
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(ProtocolError::BinaryBeforeConfig.into());
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => {
                return Err(ProtocolError::MalformedConfig(
                    "connection closed before config".to_string(),
                )
                .into());
            }
        }
    }
}

/// Polls the codec stream when one exists, pending forever otherwise.
async fn next_codec_chunk(
    codec: &mut Option<CodecStream>,
) -> Option<Result<Bytes, AudioError>> {
    match codec {
        Some(stream) => stream.next_chunk().await,
        None => std::future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Live (stream / compare) Sessions
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_live_socket(
    socket: WebSocket,
    state: AppState,
    mode: SessionMode,
    provider_ids: Vec<String>,
    lang: String,
) {
    let endpoint = if mode.is_compare() {
        Endpoint::Compare
    } else {
        Endpoint::Stream
    };
    let conn_guard = state.ws_manager.register(endpoint);
    let (mut sender, mut receiver) = socket.split();

    let config = match await_config(&mut receiver).await {
        Ok(config) => config,
        Err(e) => {
            log::warn!("[WS] handshake failed: {}", e);
            send_error_and_close(&mut sender, &e.to_string(), None).await;
            return;
        }
    };

    let session = StreamSession::negotiate(
        state.session_context(),
        mode,
        &provider_ids,
        &lang,
        config,
    )
    .await;
    let mut session = match session {
        Ok(session) => session,
        Err(e) => {
            send_error_and_close(&mut sender, &e.to_string(), None).await;
            return;
        }
    };

    // Container-decoded path: binary frames feed a codec child process.
    let mut codec = if !session.stream_config().pcm {
        let format = AudioFormat::new(session.input_rate(), state.config.streaming.target_channels);
        match CodecStream::spawn(
            CodecInput::Stdin,
            format,
            state.config.streaming.chunk_ms,
            false,
        ) {
            Ok(stream) => Some(stream),
            Err(e) => {
                let wire = session.fatal(&e.to_string());
                let _ = send_message(&mut sender, &wire).await;
                session.shutdown().await;
                return;
            }
        }
    } else {
        None
    };

    session.mark_streaming();
    if !send_all(&mut sender, &session.session_messages()).await {
        session.shutdown().await;
        return;
    }
    log::info!(
        "[WS] session {} streaming ({} providers)",
        session.session_id,
        provider_ids.len()
    );

    let fatal = run_session_loop(
        &mut sender,
        &mut receiver,
        &mut session,
        &mut codec,
        &state,
        &conn_guard,
    )
    .await;

    if let Some(message) = fatal {
        let wire = session.fatal(&message);
        let _ = send_message(&mut sender, &wire).await;
        let _ = sender.close().await;
    }
    if let Some(codec) = codec.as_mut() {
        codec.end_input();
    }
    session.shutdown().await;
}

/// Runs the streaming select loop. Returns the fatal message, if any.
async fn run_session_loop(
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    session: &mut StreamSession,
    codec: &mut Option<CodecStream>,
    state: &AppState,
    conn_guard: &ConnectionGuard,
) -> Option<String> {
    let mut ping_interval = tokio::time::interval(Duration::from_millis(
        state.config.streaming.keepalive_ms.max(1),
    ));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await; // the immediate first tick
    let max_missed = state.config.streaming.max_missed_pongs;
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            _ = conn_guard.cancel_token().cancelled() => {
                log::info!("[WS] connection {} force-closed", conn_guard.id());
                return None;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Pong { .. }) = serde_json::from_str(&text) {
                            missed_pongs = 0;
                        }
                        // Other text frames on this endpoint are ignored.
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if session.stream_config().pcm {
                            match session.ingest_pcm_frame(&data) {
                                Ok(messages) => {
                                    if !send_all(sender, &messages).await {
                                        return None;
                                    }
                                }
                                Err(e) => return Some(e.to_string()),
                            }
                        } else if let Some(stream) = codec.as_mut() {
                            if let Err(e) = stream.write(&data).await {
                                return Some(e.to_string());
                            }
                        }
                        if session.all_failed() {
                            return Some("all providers failed".to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                    _ => {}
                }
            }
            chunk = next_codec_chunk(codec) => {
                match chunk {
                    Some(Ok(pcm)) => {
                        let messages = session.ingest_decoded_chunk(pcm);
                        if !send_all(sender, &messages).await {
                            return None;
                        }
                        if session.all_failed() {
                            return Some("all providers failed".to_string());
                        }
                    }
                    Some(Err(e)) => return Some(e.to_string()),
                    None => return None,
                }
            }
            event = session.recv_event() => {
                let Some(event) = event else {
                    return Some("all providers closed".to_string());
                };
                let messages = session.on_event(event);
                if !send_all(sender, &messages).await {
                    return None;
                }
                if session.all_failed() {
                    return Some("all providers failed".to_string());
                }
            }
            _ = ping_interval.tick() => {
                if missed_pongs >= max_missed {
                    return Some("stream keepalive timeout".to_string());
                }
                missed_pongs += 1;
                if !send_message(sender, &ServerMessage::Ping { ts: now_millis() }).await {
                    return None;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay Sessions
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_replay_socket(socket: WebSocket, state: AppState, query: ReplayQuery) {
    let conn_guard = state.ws_manager.register(Endpoint::Replay);
    let (mut sender, mut receiver) = socket.split();

    let Some(binding) = state.replay_sessions.take(&query.session_id) else {
        let err = ParlanceError::ReplayNotFound(query.session_id.clone());
        send_error_and_close(&mut sender, &err.to_string(), None).await;
        return;
    };

    // The query's provider list, when present, must agree with the binding.
    let requested: Vec<String> = query
        .providers
        .as_deref()
        .map(|list| list.split(',').map(|p| p.trim().to_string()).collect())
        .or_else(|| query.provider.clone().map(|p| vec![p]))
        .unwrap_or_default();
    if !requested.is_empty() {
        let mut want = requested.clone();
        let mut have = binding.providers.clone();
        want.sort();
        have.sort();
        if want != have {
            send_error_and_close(&mut sender, "replay provider list mismatch", None).await;
            return;
        }
    }

    let session = StreamSession::negotiate(
        state.session_context(),
        SessionMode::Replay,
        &binding.providers,
        &binding.lang,
        StreamConfig::default(),
    )
    .await;
    let mut session = match session {
        Ok(session) => session,
        Err(e) => {
            send_error_and_close(&mut sender, &e.to_string(), None).await;
            return;
        }
    };

    // Decode the bound file at realtime pacing through the same fan-out.
    let format = AudioFormat::new(session.input_rate(), state.config.streaming.target_channels);
    let codec = CodecStream::spawn(
        CodecInput::File(binding.file_path.clone()),
        format,
        state.config.streaming.chunk_ms,
        true,
    );
    let mut codec = match codec {
        Ok(stream) => stream,
        Err(e) => {
            let wire = session.fatal(&e.to_string());
            let _ = send_message(&mut sender, &wire).await;
            session.shutdown().await;
            return;
        }
    };

    session.mark_streaming();
    if !send_all(&mut sender, &session.session_messages()).await {
        session.shutdown().await;
        return;
    }

    let min_ms = state.config.streaming.min_replay_duration_ms as f64;
    let mut decoded_bytes = 0usize;
    let mut fatal: Option<String> = None;

    loop {
        tokio::select! {
            _ = conn_guard.cancel_token().cancelled() => break,
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {} // pongs and stray frames
                }
            }
            chunk = codec.next_chunk() => {
                match chunk {
                    Some(Ok(pcm)) => {
                        decoded_bytes += pcm.len();
                        let messages = session.ingest_decoded_chunk(pcm);
                        if !send_all(&mut sender, &messages).await {
                            break;
                        }
                        if session.all_failed() {
                            fatal = Some("all providers failed".to_string());
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        fatal = Some(e.to_string());
                        break;
                    }
                    None => {
                        // End of file: enforce the minimum decoded threshold.
                        let decoded_ms = format.bytes_to_ms(decoded_bytes);
                        if decoded_ms < min_ms {
                            fatal = Some(
                                AudioError::ReplayTooShort {
                                    decoded_ms: decoded_ms as u64,
                                    min_ms: min_ms as u64,
                                }
                                .to_string(),
                            );
                        }
                        break;
                    }
                }
            }
            event = session.recv_event() => {
                let Some(event) = event else { break };
                let messages = session.on_event(event);
                if !send_all(&mut sender, &messages).await {
                    break;
                }
            }
        }
    }

    // Late transcripts: give adapters a short grace window after EOF.
    if fatal.is_none() {
        let grace = async {
            while let Some(event) = session.recv_event().await {
                let messages = session.on_event(event);
                if !send_all(&mut sender, &messages).await {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_millis(750), grace).await;
    }

    if let Some(message) = fatal {
        let wire = session.fatal(&message);
        let _ = send_message(&mut sender, &wire).await;
        let _ = sender.close().await;
    }
    session.shutdown().await;

    if let Err(e) = std::fs::remove_file(&binding.file_path) {
        log::debug!(
            "[WS] replay file {} not removed: {}",
            binding.file_path.display(),
            e
        );
    }
}
