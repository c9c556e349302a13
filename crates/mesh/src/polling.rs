//! HTTP polling transport profile. Used when the websocket cannot be
//! established (restrictive proxies); the relay exposes mailbox endpoints
//! that mirror the socket dispatch path, so the event vocabulary is
//! identical.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use lantern_proto::{ClientMessage, ServerMessage, SocketId, UserId};

use crate::config::MeshConfig;
use crate::error::TransportError;
use crate::signaling::{map_server_message, TransportEvent};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollJoinRequest<'a> {
    user_id: &'a str,
    display_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollJoinResponse {
    socket_id: SocketId,
    message: ServerMessage,
}

pub struct PollingSession {
    client: reqwest::Client,
    base: String,
    socket_id: SocketId,
    initial: Option<ServerMessage>,
}

impl PollingSession {
    /// Register a mailbox socket with the relay and join the room. The join
    /// ack comes back in the response body rather than over a stream.
    pub async fn join(
        config: &MeshConfig,
        room_id: &str,
        user_id: &UserId,
        display_name: &str,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::new();
        let base = config.relay_url.trim_end_matches('/').to_string();
        let response = client
            .post(format!("{base}/poll/{room_id}/join"))
            .json(&PollJoinRequest {
                user_id,
                display_name,
            })
            .send()
            .await
            .map_err(TransportError::setup)?
            .error_for_status()
            .map_err(TransportError::setup)?
            .json::<PollJoinResponse>()
            .await
            .map_err(TransportError::setup)?;

        tracing::info!(
            target = "signaling",
            socket = %response.socket_id,
            "joined room via http polling profile"
        );
        Ok(Self {
            client,
            base,
            socket_id: response.socket_id,
            initial: Some(response.message),
        })
    }

    /// Drain outbound messages and poll the mailbox until either side fails.
    pub async fn pump(
        &mut self,
        config: &MeshConfig,
        outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        if let Some(message) = self.initial.take() {
            if let Some(event) = map_server_message(message) {
                if events.send(event).is_err() {
                    return;
                }
            }
        }
        let mut tick = tokio::time::interval(config.poll_interval);
        loop {
            tokio::select! {
                message = outbound.recv() => {
                    let Some(message) = message else { return };
                    if let Err(err) = self.post_message(&message).await {
                        tracing::warn!(target = "signaling", %err, "polling send failed");
                        return;
                    }
                }
                _ = tick.tick() => {
                    let drained = match self.drain_mailbox().await {
                        Ok(drained) => drained,
                        Err(err) => {
                            tracing::warn!(target = "signaling", %err, "mailbox poll failed");
                            return;
                        }
                    };
                    for message in drained {
                        if let Some(event) = map_server_message(message) {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn post_message(&self, message: &ClientMessage) -> Result<(), TransportError> {
        self.client
            .post(format!("{}/poll/{}/send", self.base, self.socket_id))
            .json(message)
            .send()
            .await
            .map_err(TransportError::setup)?
            .error_for_status()
            .map_err(TransportError::setup)?;
        Ok(())
    }

    async fn drain_mailbox(&self) -> Result<Vec<ServerMessage>, TransportError> {
        self.client
            .get(format!("{}/poll/{}/events", self.base, self.socket_id))
            .send()
            .await
            .map_err(TransportError::setup)?
            .error_for_status()
            .map_err(TransportError::setup)?
            .json::<Vec<ServerMessage>>()
            .await
            .map_err(TransportError::setup)
    }
}
