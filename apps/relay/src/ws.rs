//! WebSocket endpoint and the message dispatch shared with the HTTP polling
//! profile. Each connection gets a socket id (which doubles as the client's
//! peer id), a writer task draining an unbounded channel, and a presence
//! binding torn down when the socket closes. Voice state is deliberately not
//! torn down on close; the idle reaper owns that.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lantern_proto::{generate_peer_id, ClientMessage, RoomId, ServerMessage, SocketId, UserId};

use crate::config::Config;
use crate::presence::{PresenceEvent, RoomPresence};
use crate::relay::{SignalingRelay, SocketSender};
use crate::storage::Storage;
use crate::voice::VoiceParticipantRegistry;

/// Per-socket context established by `join-room`. Signal dispatch before the
/// join is rejected.
#[derive(Debug, Clone)]
pub struct SocketContext {
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub presence: Arc<RoomPresence>,
    pub voice: Arc<VoiceParticipantRegistry>,
    pub relay: Arc<SignalingRelay>,
    pub storage: Storage,
    pub contexts: Arc<DashMap<SocketId, SocketContext>>,
    pub heartbeats: Arc<DashMap<SocketId, Instant>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, storage: Storage) -> Self {
        let presence = Arc::new(RoomPresence::new());
        Self {
            config,
            relay: Arc::new(SignalingRelay::new(Arc::clone(&presence))),
            presence,
            voice: Arc::new(VoiceParticipantRegistry::new()),
            storage,
            contexts: Arc::new(DashMap::new()),
            heartbeats: Arc::new(DashMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Stale-socket monitor: sockets silent past the timeout are closed out
    /// exactly as if the websocket dropped.
    pub fn spawn_heartbeat_monitor(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let timeout =
                std::time::Duration::from_secs(state.config.heartbeat_timeout_seconds);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let stale: Vec<SocketId> = state
                    .heartbeats
                    .iter()
                    .filter(|entry| entry.value().elapsed() > timeout)
                    .map(|entry| entry.key().clone())
                    .collect();
                for socket_id in stale {
                    info!(target = "signaling", socket = %socket_id, "heartbeat timeout, removing socket");
                    close_socket(&state, &socket_id);
                }
            }
        });
    }

    /// Voice idle reaper; removals are announced to the channel's room.
    pub fn spawn_voice_reaper(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let max_idle = chrono::Duration::minutes(state.config.voice_idle_minutes);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let reaped = state.voice.reap_idle(max_idle, chrono::Utc::now());
                for (channel_id, user_id) in reaped {
                    info!(
                        target = "signaling",
                        channel = %channel_id,
                        user = %user_id,
                        "reaped idle voice participant"
                    );
                    state.relay.broadcast_to_room(
                        &channel_id,
                        ServerMessage::VoiceParticipantLeft {
                            channel_id: channel_id.clone(),
                            user_id,
                        },
                    );
                }
            }
        });
    }
}

/// Tear down everything bound to one socket and announce the departure when
/// it was the user's last one. Shared by websocket close, heartbeat timeout,
/// and (never) voice — voice survives until the reaper.
pub fn close_socket(state: &AppState, socket_id: &str) {
    state.relay.unregister(socket_id);
    state.heartbeats.remove(socket_id);
    state.contexts.remove(socket_id);
    if let PresenceEvent::LastLeave { room_id, user_id } = state.presence.leave(socket_id) {
        debug!(target = "signaling", user = %user_id, room = %room_id, "last socket closed");
        state
            .relay
            .broadcast_to_room(&room_id, ServerMessage::UserLeft { user_id });
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, state))
}

async fn handle_socket(socket: WebSocket, room_id: String, state: AppState) {
    let socket_id = generate_peer_id();
    info!(target = "signaling", socket = %socket_id, room = %room_id, "websocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.relay.register(&socket_id, SocketSender::Ws(tx));
    state.heartbeats.insert(socket_id.clone(), Instant::now());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            // Some clients ship JSON in binary frames.
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(target = "signaling", socket = %socket_id, "non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(target = "signaling", socket = %socket_id, %err, "websocket read error");
                break;
            }
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => dispatch(&state, &room_id, &socket_id, message),
            Err(err) => {
                warn!(target = "signaling", socket = %socket_id, %err, "unparseable client message");
                state.relay.send_to_socket(
                    &socket_id,
                    ServerMessage::VideoRoomError {
                        message: format!("unparseable message: {err}"),
                    },
                );
            }
        }
    }

    info!(target = "signaling", socket = %socket_id, "websocket disconnected");
    close_socket(&state, &socket_id);
    writer.abort();
}

/// Single dispatch path for both transport profiles. Replies go back through
/// the relay's sender map, so websocket and mailbox clients behave alike.
pub fn dispatch(state: &AppState, room_id: &str, socket_id: &str, message: ClientMessage) {
    match message {
        ClientMessage::JoinRoom {
            room_id: requested,
            user_id,
            display_name,
        } => {
            if requested != room_id {
                warn!(
                    target = "signaling",
                    socket = %socket_id,
                    %requested,
                    endpoint = %room_id,
                    "join-room for a different room than the endpoint, using endpoint"
                );
            }
            let event = state
                .presence
                .join(room_id, &user_id, socket_id, &display_name);
            state.contexts.insert(
                socket_id.to_string(),
                SocketContext {
                    room_id: room_id.to_string(),
                    user_id: user_id.clone(),
                },
            );
            // Snapshot excludes the joiner's own endpoint; it seeds the
            // newcomer's outbound connects.
            let members = state
                .presence
                .members(room_id)
                .into_iter()
                .filter(|m| m.peer_id != socket_id)
                .collect();
            state.relay.send_to_socket(
                socket_id,
                ServerMessage::RoomJoined {
                    room_id: room_id.to_string(),
                    peer_id: socket_id.to_string(),
                    members,
                },
            );
            if let PresenceEvent::FirstJoin(member) = event {
                info!(target = "signaling", user = %member.user_id, room = %room_id, "user joined");
                state.relay.broadcast_to_room_except(
                    room_id,
                    socket_id,
                    ServerMessage::UserJoined { member },
                );
            }
        }
        ClientMessage::Signal { envelope } => {
            state.relay.route(envelope);
        }
        ClientMessage::JoinVoice {
            channel_id,
            meeting_id,
            muted,
            deafened,
            bot,
        } => {
            let Some(context) = socket_context(state, socket_id) else {
                return;
            };
            let participant = state.voice.join_voice(
                &context.user_id,
                &channel_id,
                &meeting_id,
                muted,
                deafened,
                bot,
            );
            state.relay.send_to_socket(
                socket_id,
                ServerMessage::VoiceRoster {
                    channel_id: channel_id.clone(),
                    participants: state.voice.roster(&channel_id),
                },
            );
            state.relay.broadcast_to_room_except(
                &context.room_id,
                socket_id,
                ServerMessage::VoiceStateChanged { participant },
            );
        }
        ClientMessage::LeaveVoice { channel_id } => {
            let Some(context) = socket_context(state, socket_id) else {
                return;
            };
            if state.voice.leave_voice(&channel_id, &context.user_id) {
                state.relay.broadcast_to_room(
                    &context.room_id,
                    ServerMessage::VoiceParticipantLeft {
                        channel_id,
                        user_id: context.user_id,
                    },
                );
            }
        }
        ClientMessage::ToggleMute { channel_id, muted } => {
            let Some(context) = socket_context(state, socket_id) else {
                return;
            };
            if let Some(participant) = state.voice.set_muted(&channel_id, &context.user_id, muted)
            {
                state.relay.broadcast_to_room(
                    &context.room_id,
                    ServerMessage::VoiceStateChanged { participant },
                );
            }
        }
        ClientMessage::ToggleDeafen {
            channel_id,
            deafened,
        } => {
            let Some(context) = socket_context(state, socket_id) else {
                return;
            };
            if let Some(participant) =
                state
                    .voice
                    .set_deafened(&channel_id, &context.user_id, deafened)
            {
                state.relay.broadcast_to_room(
                    &context.room_id,
                    ServerMessage::VoiceStateChanged { participant },
                );
            }
        }
        ClientMessage::PingUserRequest { to, nonce } => {
            let Some(context) = socket_context(state, socket_id) else {
                return;
            };
            state.relay.send_to_user(
                &to,
                ServerMessage::PingUserRequest {
                    from: context.user_id,
                    nonce,
                },
            );
        }
        ClientMessage::PingResponse { to, nonce } => {
            let Some(context) = socket_context(state, socket_id) else {
                return;
            };
            state.relay.send_to_user(
                &to,
                ServerMessage::PingResponse {
                    from: context.user_id,
                    nonce,
                },
            );
        }
        ClientMessage::Ping => {
            state.heartbeats.insert(socket_id.to_string(), Instant::now());
            state.relay.send_to_socket(socket_id, ServerMessage::Pong);
        }
    }
}

fn socket_context(state: &AppState, socket_id: &str) -> Option<SocketContext> {
    let context = state.contexts.get(socket_id).map(|c| c.clone());
    if context.is_none() {
        warn!(target = "signaling", socket = %socket_id, "message before join-room ignored");
    }
    context
}
