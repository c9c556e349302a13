//! HTTP surface: health/stats, presence queries, event injection, and the
//! mailbox endpoints backing the client's HTTP polling profile. Mailbox
//! sockets go through the same dispatch path as websocket sockets, so the
//! two profiles cannot drift apart.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use lantern_proto::{generate_peer_id, ClientMessage, ServerMessage, SocketId, UserId};

use crate::relay::SocketSender;
use crate::ws::{dispatch, AppState};

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "connections": state.relay.connection_count(),
    }))
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "connections": state.presence.connection_count(),
        "users": state.presence.user_count(),
        "rooms": state.presence.room_count(),
        "voiceChannels": state.voice.channel_count(),
    }))
}

pub async fn online_users(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.presence.online_users())
}

/// Live presence when the user has sockets; otherwise the last persisted
/// document from Redis.
pub async fn user_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    if let Some(presence) = state.presence.user_presence(&user_id) {
        return Json(json!(presence)).into_response();
    }
    match state.storage.fetch_presence(&user_id).await {
        Ok(stored) => Json(json!({
            "userId": user_id,
            "online": false,
            "status": stored,
        }))
        .into_response(),
        Err(err) => {
            warn!(target = "signaling", %err, "presence lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePresenceRequest {
    pub user_id: UserId,
    pub status: serde_json::Value,
}

/// Push a presence document to the user's active sockets; with none active,
/// persist it so the next `user-presence` query sees it.
pub async fn update_presence(
    State(state): State<AppState>,
    Json(request): Json<UpdatePresenceRequest>,
) -> impl IntoResponse {
    if state.presence.is_online(&request.user_id) {
        state
            .presence
            .set_status(&request.user_id, request.status.clone());
        let delivered = state.relay.send_to_user(
            &request.user_id,
            ServerMessage::PresenceUpdate {
                user_id: request.user_id.clone(),
                status: request.status,
            },
        );
        return Json(json!({ "delivered": delivered })).into_response();
    }
    match state
        .storage
        .persist_presence(&request.user_id, &request.status)
        .await
    {
        Ok(()) => Json(json!({ "delivered": 0, "persisted": true })).into_response(),
        Err(err) => {
            warn!(target = "signaling", %err, "persisting presence failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitRequest {
    /// Broadcast target; mutually optional with `user_id`.
    pub room_id: Option<String>,
    /// Addressed target covering all of the user's sockets.
    pub user_id: Option<UserId>,
    pub message: ServerMessage,
}

/// Debug/ops injection endpoint: drop an arbitrary server message into a
/// room or at a user.
pub async fn emit(
    State(state): State<AppState>,
    Json(request): Json<EmitRequest>,
) -> impl IntoResponse {
    match (request.room_id, request.user_id) {
        (Some(room_id), None) => {
            state.relay.broadcast_to_room(&room_id, request.message);
            Json(json!({ "target": "room", "roomId": room_id })).into_response()
        }
        (None, Some(user_id)) => {
            let delivered = state.relay.send_to_user(&user_id, request.message);
            Json(json!({ "target": "user", "delivered": delivered })).into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            "exactly one of roomId or userId is required",
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollJoinRequest {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollJoinResponse {
    pub socket_id: SocketId,
    pub message: ServerMessage,
}

/// Register a mailbox socket and join the room. The join ack is returned in
/// the body instead of the mailbox so the client can seed immediately.
pub async fn poll_join(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(request): Json<PollJoinRequest>,
) -> impl IntoResponse {
    let socket_id = generate_peer_id();
    let mailbox = Arc::new(Mutex::new(VecDeque::new()));
    state
        .relay
        .register(&socket_id, SocketSender::Mailbox(Arc::clone(&mailbox)));
    state.heartbeats.insert(socket_id.clone(), Instant::now());
    info!(target = "signaling", socket = %socket_id, room = %room_id, "polling client joined");

    dispatch(
        &state,
        &room_id,
        &socket_id,
        ClientMessage::JoinRoom {
            room_id: room_id.clone(),
            user_id: request.user_id,
            display_name: request.display_name,
        },
    );

    // The join ack is the first message dispatched into the mailbox.
    let message = mailbox.lock().ok().and_then(|mut queue| queue.pop_front());
    match message {
        Some(message) => Json(PollJoinResponse { socket_id, message }).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Drain the mailbox. Polling doubles as the socket's keepalive.
pub async fn poll_events(
    State(state): State<AppState>,
    Path(socket_id): Path<String>,
) -> impl IntoResponse {
    let Some(mailbox) = state.relay.mailbox_of(&socket_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    state.heartbeats.insert(socket_id, Instant::now());
    let drained: Vec<ServerMessage> = match mailbox.lock() {
        Ok(mut queue) => queue.drain(..).collect(),
        Err(_) => Vec::new(),
    };
    Json(drained).into_response()
}

/// Inbound half of the polling profile: one client message per request,
/// dispatched exactly like a websocket frame.
pub async fn poll_send(
    State(state): State<AppState>,
    Path(socket_id): Path<String>,
    Json(message): Json<ClientMessage>,
) -> impl IntoResponse {
    let Some(room_id) = state.presence.room_of(&socket_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    dispatch(&state, &room_id, &socket_id, message);
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Storage;

    fn test_state() -> AppState {
        let storage = Storage::new("redis://127.0.0.1:1", 60).unwrap();
        AppState::new(Config::default(), storage)
    }

    #[tokio::test]
    async fn poll_profile_join_drain_send() {
        let state = test_state();

        // Join via the mailbox profile.
        let response = poll_join(
            State(state.clone()),
            Path("room-1".to_string()),
            Json(PollJoinRequest {
                user_id: "user-a".into(),
                display_name: "Ada".into(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let joined: PollJoinResponse = serde_json::from_slice(&body).unwrap();
        assert!(matches!(joined.message, ServerMessage::RoomJoined { .. }));

        // A second user joins; the mailbox sees userJoined.
        let queue_b = Arc::new(Mutex::new(VecDeque::new()));
        state
            .relay
            .register("sock-b", SocketSender::Mailbox(Arc::clone(&queue_b)));
        dispatch(
            &state,
            "room-1",
            "sock-b",
            ClientMessage::JoinRoom {
                room_id: "room-1".into(),
                user_id: "user-b".into(),
                display_name: "Bea".into(),
            },
        );

        assert!(matches!(
            queue_b.lock().unwrap().front(),
            Some(ServerMessage::RoomJoined { .. })
        ));

        let response = poll_events(State(state.clone()), Path(joined.socket_id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let events: Vec<ServerMessage> = serde_json::from_slice(&body).unwrap();
        assert!(events
            .iter()
            .any(|m| matches!(m, ServerMessage::UserJoined { .. })));

        // Sending through the mailbox uses the same dispatch path.
        let response = poll_send(
            State(state.clone()),
            Path(joined.socket_id.clone()),
            Json(ClientMessage::Ping),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Unknown sockets 404 instead of silently creating state.
        let response = poll_send(
            State(state),
            Path("missing".to_string()),
            Json(ClientMessage::Ping),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn emit_requires_exactly_one_target() {
        let state = test_state();
        let response = emit(
            State(state),
            Json(EmitRequest {
                room_id: None,
                user_id: None,
                message: ServerMessage::Pong,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
