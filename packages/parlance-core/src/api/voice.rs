//! WebSocket handler for the voice-assistant endpoint.
//!
//! Reuses the streaming core (one provider lane, same attribution and
//! backlog machinery) and layers the voice gate on the mic path: assistant
//! playback withholds mic audio, barge-in reopens it, wake words bound the
//! window in which finals are treated as addressed to the assistant.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;

use crate::api::ws::{await_config, send_all, send_message};
use crate::api::{AppState, Endpoint};
use crate::audio::{AudioFormat, CodecInput, CodecStream, FrameHeader};
use crate::session::{MicDecision, SessionMode, StreamSession, VoiceGate};
use crate::utils::{now_millis, now_millis_u64};
use crate::wire::{ClientMessage, ServerMessage, VoiceCommand, VoiceState};

/// Query parameters of `/ws/voice`.
#[derive(Deserialize)]
pub struct VoiceQuery {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
}

/// `/ws/voice` upgrade handler.
pub async fn voice_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<VoiceQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_voice_socket(socket, state, query).await;
    })
}

async fn handle_voice_socket(socket: WebSocket, state: AppState, query: VoiceQuery) {
    let conn_guard = state.ws_manager.register(Endpoint::Voice);
    let (mut sender, mut receiver) = socket.split();

    let config = match await_config(&mut receiver).await {
        Ok(config) => config,
        Err(e) => {
            let _ = send_message(
                &mut sender,
                &ServerMessage::Error {
                    message: e.to_string(),
                    provider: None,
                },
            )
            .await;
            return;
        }
    };

    let provider_id = match query.provider.or_else(|| state.registry.ids().first().cloned()) {
        Some(id) => id,
        None => {
            let _ = send_message(
                &mut sender,
                &ServerMessage::Error {
                    message: "no providers registered".to_string(),
                    provider: None,
                },
            )
            .await;
            return;
        }
    };
    let lang = query.lang.unwrap_or_else(|| "en".to_string());

    let mut gate = VoiceGate::new(&config.options.wake_words, config.options.meeting_mode);
    let session = StreamSession::negotiate(
        state.session_context(),
        SessionMode::Voice,
        &[provider_id.clone()],
        &lang,
        config,
    )
    .await;
    let mut session = match session {
        Ok(session) => session,
        Err(e) => {
            let _ = send_message(
                &mut sender,
                &ServerMessage::Error {
                    message: e.to_string(),
                    provider: None,
                },
            )
            .await;
            return;
        }
    };

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
    let opening = ServerMessage::VoiceSession {
        session_id: session.session_id.clone(),
        provider: provider_id.clone(),
        lang: lang.clone(),
    };
    if !send_message(&mut sender, &opening).await
        || !send_message(&mut sender, &ServerMessage::VoiceState { state: VoiceState::Listening })
            .await
    {
        session.shutdown().await;
        return;
    }

    let mut ping_interval = tokio::time::interval(Duration::from_millis(
        state.config.streaming.keepalive_ms.max(1),
    ));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;
    let max_missed = state.config.streaming.max_missed_pongs;
    let mut missed_pongs: u32 = 0;

    // Estimated end of client-side playback of the last assistant reply.
    let mut speaking_until: Option<Instant> = None;
    let mut fatal: Option<String> = None;

    loop {
        // Estimated playback finished: reopen the mic.
        if gate.is_assistant_speaking() {
            if let Some(until) = speaking_until {
                if Instant::now() >= until {
                    gate.assistant_stopped();
                    speaking_until = None;
                    let _ = send_message(
                        &mut sender,
                        &ServerMessage::VoiceState { state: VoiceState::Listening },
                    )
                    .await;
                }
            }
        }

        tokio::select! {
            _ = conn_guard.cancel_token().cancelled() => break,
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Pong { .. }) => missed_pongs = 0,
                            Ok(ClientMessage::Command { command }) => {
                                handle_command(
                                    command,
                                    &mut gate,
                                    &mut speaking_until,
                                    &state,
                                    &mut sender,
                                )
                                .await;
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if session.stream_config().pcm {
                            let Ok((_, payload)) = FrameHeader::decode(&data) else {
                                fatal = Some("invalid PCM frame".to_string());
                                break;
                            };
                            match gate.admit_mic_chunk(&payload) {
                                MicDecision::Withheld => continue,
                                MicDecision::BargeIn => {
                                    speaking_until = None;
                                    let _ = send_message(
                                        &mut sender,
                                        &ServerMessage::VoiceState {
                                            state: VoiceState::Listening,
                                        },
                                    )
                                    .await;
                                }
                                MicDecision::Forward => {}
                            }
                            match session.ingest_pcm_frame(&data) {
                                Ok(messages) => {
                                    if !send_all(&mut sender, &messages).await {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    fatal = Some(e.to_string());
                                    break;
                                }
                            }
                        } else if let Some(stream) = codec.as_mut() {
                            if let Err(e) = stream.write(&data).await {
                                fatal = Some(e.to_string());
                                break;
                            }
                        }
                        if session.all_failed() {
                            fatal = Some("provider failed".to_string());
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            chunk = next_voice_codec_chunk(&mut codec) => {
                match chunk {
                    Some(Ok(pcm)) => {
                        match gate.admit_mic_chunk(&pcm) {
                            MicDecision::Withheld => continue,
                            MicDecision::BargeIn => {
                                speaking_until = None;
                                let _ = send_message(
                                    &mut sender,
                                    &ServerMessage::VoiceState { state: VoiceState::Listening },
                                )
                                .await;
                            }
                            MicDecision::Forward => {}
                        }
                        let messages = session.ingest_decoded_chunk(pcm);
                        if !send_all(&mut sender, &messages).await {
                            break;
                        }
                    }
                    Some(Err(e)) => { fatal = Some(e.to_string()); break; }
                    None => break,
                }
            }
            event = session.recv_event() => {
                let Some(event) = event else {
                    fatal = Some("provider closed".to_string());
                    break;
                };
                let messages = session.on_event(event);
                if !forward_voice_messages(
                    messages,
                    &mut session,
                    &mut gate,
                    &mut speaking_until,
                    &state,
                    &lang,
                    &mut sender,
                )
                .await
                {
                    break;
                }
                if session.all_failed() {
                    fatal = Some("provider failed".to_string());
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if missed_pongs >= max_missed {
                    fatal = Some("stream keepalive timeout".to_string());
                    break;
                }
                missed_pongs += 1;
                if !send_message(&mut sender, &ServerMessage::Ping { ts: now_millis() }).await {
                    break;
                }
            }
        }
    }

    if let Some(message) = fatal {
        let wire = session.fatal(&message);
        let _ = send_message(&mut sender, &wire).await;
    }
    if let Some(codec) = codec.as_mut() {
        codec.end_input();
    }
    session.shutdown().await;
}

async fn next_voice_codec_chunk(
    codec: &mut Option<CodecStream>,
) -> Option<Result<bytes::Bytes, crate::error::AudioError>> {
    match codec {
        Some(stream) => stream.next_chunk().await,
        None => std::future::pending().await,
    }
}

async fn handle_command(
    command: VoiceCommand,
    gate: &mut VoiceGate,
    speaking_until: &mut Option<Instant>,
    state: &AppState,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
) {
    match command {
        VoiceCommand::BargeIn | VoiceCommand::StopSpeaking => {
            gate.assistant_stopped();
            *speaking_until = None;
            let _ = send_message(
                sender,
                &ServerMessage::VoiceState { state: VoiceState::Listening },
            )
            .await;
        }
        VoiceCommand::ResetHistory => {
            gate.reset();
            *speaking_until = None;
            state.assistant.reset().await;
            let _ = send_message(
                sender,
                &ServerMessage::VoiceState { state: VoiceState::Listening },
            )
            .await;
        }
    }
}

/// Re-tags session transcript messages for the voice wire and drives the
/// assistant turn on final user transcripts.
async fn forward_voice_messages(
    messages: Vec<ServerMessage>,
    session: &mut StreamSession,
    gate: &mut VoiceGate,
    speaking_until: &mut Option<Instant>,
    state: &AppState,
    lang: &str,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
) -> bool {
    for message in messages {
        match message {
            ServerMessage::Transcript(wire) => {
                let is_final = wire.transcript.is_final;
                let text = wire.transcript.text.clone();
                if !send_message(sender, &ServerMessage::VoiceUserTranscript(wire)).await {
                    return false;
                }
                if is_final
                    && !respond_if_addressed(
                        &text,
                        session,
                        gate,
                        speaking_until,
                        state,
                        lang,
                        sender,
                    )
                    .await
                {
                    return false;
                }
            }
            other => {
                if !send_message(sender, &other).await {
                    return false;
                }
            }
        }
    }
    true
}

async fn respond_if_addressed(
    text: &str,
    _session: &mut StreamSession,
    gate: &mut VoiceGate,
    speaking_until: &mut Option<Instant>,
    state: &AppState,
    lang: &str,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
) -> bool {
    let now = now_millis_u64();

    // The wake word in this very utterance opens the window.
    if let Some(wake_word) = gate.observe_transcript(text, now) {
        if !send_message(
            sender,
            &ServerMessage::VoiceMeetingWindow {
                active: true,
                wake_word: Some(wake_word),
            },
        )
        .await
        {
            return false;
        }
    }
    if !gate.window_active(now) {
        if gate.meeting_mode()
            && !send_message(
                sender,
                &ServerMessage::VoiceMeetingWindow {
                    active: false,
                    wake_word: None,
                },
            )
            .await
        {
            return false;
        }
        return true;
    }

    if !send_message(sender, &ServerMessage::VoiceState { state: VoiceState::Thinking }).await {
        return false;
    }

    match state.assistant.respond(text, lang).await {
        Ok(reply) => {
            let text_msg = ServerMessage::VoiceAssistantText {
                text: reply.text.clone(),
                is_final: true,
            };
            if !send_message(sender, &text_msg).await {
                return false;
            }
            if let Some(pcm) = reply.pcm {
                if !send_message(sender, &ServerMessage::VoiceAssistantAudioStart).await {
                    return false;
                }
                gate.assistant_started();
                gate.observe_assistant_audio(&pcm);
                let playback_ms = (pcm.len() as f64 / 2.0) * 1000.0 / reply.sample_rate as f64;
                if sender
                    .send(Message::Binary(pcm))
                    .await
                    .is_err()
                {
                    return false;
                }
                if !send_message(sender, &ServerMessage::VoiceAssistantAudioEnd).await {
                    return false;
                }
                *speaking_until =
                    Some(Instant::now() + Duration::from_millis(playback_ms as u64));
                if !send_message(
                    sender,
                    &ServerMessage::VoiceState { state: VoiceState::Speaking },
                )
                .await
                {
                    return false;
                }
            } else {
                if !send_message(
                    sender,
                    &ServerMessage::VoiceState { state: VoiceState::Listening },
                )
                .await
                {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            send_message(
                sender,
                &ServerMessage::Error {
                    message: e.to_string(),
                    provider: None,
                },
            )
            .await
        }
    }
}
