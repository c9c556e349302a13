//! Websocket signaling transport with an inner reconnection loop. The loop
//! here re-establishes the socket and re-joins the room; per-peer recovery is
//! the connection monitor's job and runs independently on top of this.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lantern_proto::{
    ClientMessage, ParticipantState, PeerId, RoomId, RoomMember, ServerMessage, SignalingEnvelope,
    UserId,
};

use crate::config::MeshConfig;
use crate::error::TransportError;
use crate::peer::SignalSink;
use crate::polling::PollingSession;

/// Relay traffic surfaced to the client core, already parsed.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    RoomJoined {
        room_id: RoomId,
        peer_id: PeerId,
        members: Vec<RoomMember>,
    },
    UserJoined {
        member: RoomMember,
    },
    UserLeft {
        user_id: UserId,
    },
    Signal {
        envelope: SignalingEnvelope,
    },
    VoiceRoster {
        channel_id: RoomId,
        participants: Vec<ParticipantState>,
    },
    VoiceStateChanged {
        participant: ParticipantState,
    },
    VoiceParticipantLeft {
        channel_id: RoomId,
        user_id: UserId,
    },
    PingRequest {
        from: UserId,
        nonce: u64,
    },
    PingResponse {
        from: UserId,
        nonce: u64,
    },
    PresenceUpdate {
        user_id: UserId,
        status: serde_json::Value,
    },
    /// The inner loop re-established the socket and re-sent the join.
    Reconnected,
    /// Reconnect attempts exhausted; terminal until `request_reconnect`.
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    GaveUp,
}

/// What the connection monitor needs from the transport: liveness and a way
/// to kick off another reconnection round after exhaustion.
pub trait TransportControl: Send + Sync {
    fn is_connected(&self) -> bool;
    fn request_reconnect(&self);
}

pub(crate) fn map_server_message(message: ServerMessage) -> Option<TransportEvent> {
    match message {
        ServerMessage::RoomJoined {
            room_id,
            peer_id,
            members,
        } => Some(TransportEvent::RoomJoined {
            room_id,
            peer_id,
            members,
        }),
        ServerMessage::UserJoined { member } => Some(TransportEvent::UserJoined { member }),
        ServerMessage::UserLeft { user_id } => Some(TransportEvent::UserLeft { user_id }),
        ServerMessage::Signal { envelope } => Some(TransportEvent::Signal { envelope }),
        ServerMessage::VoiceRoster {
            channel_id,
            participants,
        } => Some(TransportEvent::VoiceRoster {
            channel_id,
            participants,
        }),
        ServerMessage::VoiceStateChanged { participant } => {
            Some(TransportEvent::VoiceStateChanged { participant })
        }
        ServerMessage::VoiceParticipantLeft {
            channel_id,
            user_id,
        } => Some(TransportEvent::VoiceParticipantLeft {
            channel_id,
            user_id,
        }),
        ServerMessage::PingUserRequest { from, nonce } => {
            Some(TransportEvent::PingRequest { from, nonce })
        }
        ServerMessage::PingResponse { from, nonce } => {
            Some(TransportEvent::PingResponse { from, nonce })
        }
        ServerMessage::PresenceUpdate { user_id, status } => {
            Some(TransportEvent::PresenceUpdate { user_id, status })
        }
        ServerMessage::VideoRoomError { message } => {
            tracing::warn!(target = "signaling", %message, "relay reported an error");
            None
        }
        ServerMessage::Pong => None,
    }
}

/// Derive the websocket endpoint from the relay's base HTTP URL.
pub(crate) fn websocket_url(relay_url: &str, room_id: &str) -> String {
    let base = relay_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws/{room_id}")
}

struct TransportShared {
    config: MeshConfig,
    room_id: RoomId,
    user_id: UserId,
    display_name: String,
    connected: AtomicBool,
    status: watch::Sender<TransportStatus>,
}

impl TransportShared {
    fn join_message(&self) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

pub struct SignalingTransport {
    shared: Arc<TransportShared>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    retry: mpsc::UnboundedSender<()>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SignalingTransport {
    /// Connect to the relay and join `room_id`. Returns the transport handle
    /// and the stream of parsed relay events. The actual socket is owned by a
    /// background driver task that also runs the reconnection loop.
    pub fn connect(
        config: MeshConfig,
        room_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (status_tx, _) = watch::channel(TransportStatus::Connecting);
        let shared = Arc::new(TransportShared {
            config,
            room_id: room_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            connected: AtomicBool::new(false),
            status: status_tx,
        });

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(drive(
            Arc::clone(&shared),
            outbound_rx,
            retry_rx,
            events_tx,
        ));

        let transport = Arc::new(Self {
            shared,
            outbound: outbound_tx,
            retry: retry_tx,
            driver: Mutex::new(Some(driver)),
        });
        (transport, events_rx)
    }

    pub fn status(&self) -> watch::Receiver<TransportStatus> {
        self.shared.status.subscribe()
    }

    /// Fire-and-forget send. While disconnected the message is dropped with a
    /// log line; signaling is transient and the reconnect path re-seeds state.
    pub fn send(&self, message: ClientMessage) {
        if !self.shared.connected.load(Ordering::SeqCst) {
            tracing::debug!(target = "signaling", "dropping outbound message while disconnected");
            return;
        }
        if self.outbound.send(message).is_err() {
            tracing::debug!(target = "signaling", "transport driver gone, message dropped");
        }
    }
}

impl SignalSink for SignalingTransport {
    fn send_envelope(&self, envelope: SignalingEnvelope) {
        self.send(ClientMessage::Signal { envelope });
    }

    fn send_message(&self, message: ClientMessage) {
        self.send(message);
    }
}

impl TransportControl for SignalingTransport {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn request_reconnect(&self) {
        let _ = self.retry.send(());
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.driver.lock().take() {
            task.abort();
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay-level keepalive so the relay's stale-socket monitor sees us alive.
const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Outer driver: connect, pump, and on loss back off and rejoin. Exhaustion
/// parks the loop until someone calls `request_reconnect`.
async fn drive(
    shared: Arc<TransportShared>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    mut retry: mpsc::UnboundedReceiver<()>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut attempt: u32 = 0;
    let mut had_session = false;
    loop {
        match open_session(&shared).await {
            Ok(mut session) => {
                attempt = 0;
                shared.connected.store(true, Ordering::SeqCst);
                let _ = shared.status.send(TransportStatus::Connected);
                if had_session {
                    let _ = events.send(TransportEvent::Reconnected);
                }
                had_session = true;
                session.pump(&shared, &mut outbound, &events).await;
                shared.connected.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                tracing::warn!(target = "signaling", %err, "relay connection failed");
            }
        }

        attempt += 1;
        if attempt > shared.config.backoff_max_attempts {
            tracing::error!(
                target = "signaling",
                attempts = shared.config.backoff_max_attempts,
                "reconnect attempts exhausted, giving up until asked again"
            );
            let _ = shared.status.send(TransportStatus::GaveUp);
            let _ = events.send(TransportEvent::GaveUp);
            if retry.recv().await.is_none() {
                return;
            }
            attempt = 1;
        }
        let delay = shared.config.backoff_delay(attempt);
        let _ = shared.status.send(TransportStatus::Reconnecting { attempt });
        tracing::info!(
            target = "signaling",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting to relay"
        );
        tokio::time::sleep(delay).await;
    }
}

enum Session {
    Ws(WsStream),
    Poll(PollingSession),
}

/// Try websocket first; fall back to the HTTP long-poll profile once before
/// surfacing the failure to the backoff loop.
async fn open_session(shared: &TransportShared) -> Result<Session, TransportError> {
    let url = websocket_url(&shared.config.relay_url, &shared.room_id);
    match connect_async(&url).await {
        Ok((mut stream, _)) => {
            let join = serde_json::to_string(&shared.join_message())
                .map_err(TransportError::setup)?;
            stream
                .send(Message::Text(join))
                .await
                .map_err(TransportError::setup)?;
            Ok(Session::Ws(stream))
        }
        Err(err) => {
            tracing::warn!(
                target = "signaling",
                %err,
                "websocket connect failed, trying http polling profile"
            );
            let session = PollingSession::join(
                &shared.config,
                &shared.room_id,
                &shared.user_id,
                &shared.display_name,
            )
            .await?;
            Ok(Session::Poll(session))
        }
    }
}

impl Session {
    async fn pump(
        &mut self,
        shared: &TransportShared,
        outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match self {
            Session::Ws(stream) => pump_ws(stream, outbound, events).await,
            Session::Poll(session) => session.pump(&shared.config, outbound, events).await,
        }
    }
}

async fn pump_ws(
    stream: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { return };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if let Err(err) = stream.send(Message::Text(text)).await {
                    tracing::warn!(target = "signaling", %err, "websocket send failed");
                    return;
                }
            }
            _ = keepalive.tick() => {
                let Ok(text) = serde_json::to_string(&ClientMessage::Ping) else { continue };
                if let Err(err) = stream.send(Message::Text(text)).await {
                    tracing::warn!(target = "signaling", %err, "keepalive send failed");
                    return;
                }
            }
            frame = stream.next() => {
                let Some(frame) = frame else {
                    tracing::info!(target = "signaling", "relay closed the websocket");
                    return;
                };
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!(target = "signaling", "relay closed the websocket");
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(target = "signaling", %err, "websocket read failed");
                        return;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if let Some(event) = map_server_message(message) {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "signaling", %err, "unparseable relay message");
                    }
                }
            }
        }
    }
}
