use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::hub::{Outbound, ParticipantSink, RoomHub, RoomSnapshot};
use crate::models::{AudioEncoding, AudioFrame, PeerInfo, Role, SignalMessage};
use crate::orchestrator::AgentCommand;

// ─── Application State ──────────────────────────────────────────────────────

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RoomHub>,
    pub config: Arc<AppConfig>,
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/rooms", get(list_rooms))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSnapshot>> {
    Json(state.hub.snapshot())
}

// ─── WebSocket session ──────────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

const JOIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

async fn close_with(socket: &mut WebSocket, reason: String) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.into(),
        })))
        .await;
}

/// Per-participant connection. The first frame must be `join`; afterwards
/// the session relays signaling to the hub, control commands to the
/// room's orchestrator, and binary audio to the router, while an outbound
/// pump drains the participant's hub sink.
async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let first = tokio::time::timeout(JOIN_HANDSHAKE_TIMEOUT, socket.recv()).await;

    let (room_id, peer) = match first {
        Ok(Some(Ok(WsMessage::Text(text)))) => match serde_json::from_str::<SignalMessage>(&text)
        {
            Ok(SignalMessage::Join {
                room_id,
                user_id,
                user_name,
                user_role,
                participant_type,
            }) => {
                if Role::from_identity(&user_id) != Some(user_role) {
                    let err =
                        AppError::BadRequest("identity prefix does not match role".to_string());
                    close_with(&mut socket, err.to_string()).await;
                    return;
                }
                (
                    room_id,
                    PeerInfo {
                        user_id,
                        user_name,
                        user_role,
                        participant_type,
                        should_initiate: None,
                    },
                )
            }
            _ => {
                close_with(&mut socket, "expected join".into()).await;
                return;
            }
        },
        _ => {
            close_with(&mut socket, "no join received".into()).await;
            return;
        }
    };

    let identity = peer.user_id.clone();
    let role = peer.user_role;
    let sink = ParticipantSink::new(state.config.limits.session_queue_capacity);

    if let Err(e) = state.hub.join(&room_id, peer, sink.clone()) {
        close_with(&mut socket, e.to_string()).await;
        return;
    }

    let encoding = AudioEncoding::parse(&state.config.agent.audio_encoding)
        .unwrap_or(AudioEncoding::Linear16);
    let (ws_tx, ws_rx) = socket.split();

    let ping_interval = Duration::from_millis(state.config.limits.ping_interval_ms);
    let mut pump_task = tokio::spawn(outbound_pump(ws_tx, sink.clone(), ping_interval));

    let recv_state = state.clone();
    let recv_sink = sink.clone();
    let recv_room = room_id.clone();
    let recv_identity = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        inbound_loop(
            ws_rx,
            recv_state,
            recv_sink,
            recv_room,
            recv_identity,
            role,
            encoding,
        )
        .await;
    });

    tokio::select! {
        _ = &mut pump_task => recv_task.abort(),
        _ = &mut recv_task => pump_task.abort(),
    }

    // Hold the identity through the grace window; the sweeper finalizes
    // if no rejoin arrives.
    state.hub.disconnected(&room_id, &identity, &sink);
    sink.close();
    tracing::info!(room = %room_id, identity = %identity, "session closed");
}

/// Serialize outbound traffic for one participant: hub sink messages plus
/// the 30 s application-level ping.
async fn outbound_pump(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    sink: Arc<ParticipantSink>,
    ping_interval: Duration,
) {
    let ping_payload = serde_json::to_string(&SignalMessage::Ping).unwrap_or_default();
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            out = sink.pop() => match out {
                Some(Outbound::Text { payload, .. }) => {
                    if ws_tx.send(WsMessage::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Audio(bytes)) => {
                    if ws_tx.send(WsMessage::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Text(ping_payload.clone())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn inbound_loop(
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    state: AppState,
    sink: Arc<ParticipantSink>,
    room_id: String,
    identity: String,
    role: Role,
    encoding: AudioEncoding,
) {
    let idle_timeout = Duration::from_millis(state.config.limits.read_idle_timeout_ms);

    loop {
        let msg = match tokio::time::timeout(idle_timeout, ws_rx.next()).await {
            Err(_) => {
                tracing::info!(room = %room_id, identity = %identity, "session idle, presumed dead");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(msg))) => msg,
        };

        state.hub.touch(&room_id, &identity);

        match msg {
            WsMessage::Close(_) => break,
            WsMessage::Text(text) => {
                handle_text(&state, &sink, &room_id, &identity, role, &text).await;
            }
            WsMessage::Binary(data) => {
                if role.is_human() {
                    if let Some(orchestrator) = state.hub.orchestrator(&room_id) {
                        orchestrator.router.offer_frame(AudioFrame::new(
                            identity.clone(),
                            data,
                            encoding,
                            tokio::time::Instant::now(),
                        ));
                    }
                }
            }
            _ => {}
        }
    }
}

async fn handle_text(
    state: &AppState,
    sink: &Arc<ParticipantSink>,
    room_id: &str,
    identity: &str,
    role: Role,
    text: &str,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                identity,
                "unparseable message: {} — raw: {}",
                e,
                &text[..text.len().min(200)]
            );
            return;
        }
    };

    match serde_json::from_value::<SignalMessage>(value.clone()) {
        Ok(SignalMessage::Ping) => {
            let payload = serde_json::to_string(&SignalMessage::Pong).unwrap_or_default();
            sink.push(Outbound::Text {
                payload,
                critical: true,
            });
        }
        Ok(SignalMessage::Pong) => {}
        Ok(SignalMessage::Join { .. }) => {
            tracing::warn!(identity, "duplicate join ignored");
        }
        Ok(SignalMessage::CoachWhisper { text }) => {
            if role != Role::Coach {
                tracing::warn!(identity, "coach_whisper from non-coach ignored");
                return;
            }
            send_command(
                state,
                room_id,
                AgentCommand::Whisper {
                    from: identity.to_string(),
                    text,
                },
            );
        }
        Ok(SignalMessage::PauseAi { paused }) => {
            if role != Role::Coach {
                tracing::warn!(identity, "pause_ai from non-coach ignored");
                return;
            }
            send_command(state, room_id, AgentCommand::PauseAll { paused });
        }
        // Server-originated shapes arriving from a client are dropped.
        Ok(_) => {}
        // Opaque signaling: offers, answers, candidates, anything else.
        Err(_) => state.hub.route(room_id, identity, value),
    }
}

fn send_command(state: &AppState, room_id: &str, command: AgentCommand) {
    match state.hub.orchestrator(room_id) {
        Some(orchestrator) => {
            if orchestrator.commands.try_send(command).is_err() {
                tracing::warn!(room = room_id, "orchestrator command queue full, dropped");
            }
        }
        None => {
            tracing::warn!(room = room_id, "coach command with no active agent, dropped");
        }
    }
}
