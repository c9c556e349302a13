//! Envelope routing. The relay is stateless beyond the per-socket sender
//! map: envelopes are forwarded verbatim, and an envelope addressed to
//! nobody active is dropped with a log line rather than queued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;

use lantern_proto::{ServerMessage, SignalingEnvelope, SocketId};

use crate::presence::RoomPresence;

/// Outbound half of one client connection. Websocket clients drain a channel
/// from their writer task; polling clients drain a mailbox over HTTP.
#[derive(Clone)]
pub enum SocketSender {
    Ws(mpsc::UnboundedSender<ServerMessage>),
    Mailbox(Arc<Mutex<VecDeque<ServerMessage>>>),
}

impl SocketSender {
    fn send(&self, message: ServerMessage) -> bool {
        match self {
            SocketSender::Ws(tx) => tx.send(message).is_ok(),
            SocketSender::Mailbox(queue) => match queue.lock() {
                Ok(mut queue) => {
                    queue.push_back(message);
                    true
                }
                Err(_) => false,
            },
        }
    }
}

pub struct SignalingRelay {
    presence: Arc<RoomPresence>,
    senders: DashMap<SocketId, SocketSender>,
}

impl SignalingRelay {
    pub fn new(presence: Arc<RoomPresence>) -> Self {
        Self {
            presence,
            senders: DashMap::new(),
        }
    }

    pub fn register(&self, socket_id: &str, sender: SocketSender) {
        self.senders.insert(socket_id.to_string(), sender);
    }

    pub fn unregister(&self, socket_id: &str) {
        self.senders.remove(socket_id);
    }

    pub fn connection_count(&self) -> usize {
        self.senders.len()
    }

    /// The mailbox behind a polling socket, if that is what's registered.
    pub fn mailbox_of(&self, socket_id: &str) -> Option<Arc<Mutex<VecDeque<ServerMessage>>>> {
        match self.senders.get(socket_id).map(|s| s.value().clone()) {
            Some(SocketSender::Mailbox(queue)) => Some(queue),
            _ => None,
        }
    }

    pub fn send_to_socket(&self, socket_id: &str, message: ServerMessage) -> bool {
        match self.senders.get(socket_id) {
            Some(sender) => sender.send(message),
            None => false,
        }
    }

    /// Fan a message out to every socket of a logical user; returns how many
    /// sockets received it.
    pub fn send_to_user(&self, user_id: &str, message: ServerMessage) -> usize {
        let mut delivered = 0;
        for socket_id in self.presence.sockets_for(user_id) {
            if self.send_to_socket(&socket_id, message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Forward an addressed envelope unmodified. `to` is resolved first as a
    /// socket (peer) id, then as a user id covering all of that user's
    /// sockets.
    pub fn route(&self, envelope: SignalingEnvelope) {
        let to = envelope.to.clone();
        if self.senders.contains_key(&to) {
            self.send_to_socket(&to, ServerMessage::Signal { envelope });
            return;
        }
        let delivered = self.send_to_user(&to, ServerMessage::Signal { envelope });
        if delivered == 0 {
            tracing::debug!(
                target = "signaling",
                %to,
                "envelope for inactive destination dropped"
            );
        }
    }

    pub fn broadcast_to_room(&self, room_id: &str, message: ServerMessage) {
        for member in self.presence.members(room_id) {
            self.send_to_socket(&member.peer_id, message.clone());
        }
    }

    pub fn broadcast_to_room_except(
        &self,
        room_id: &str,
        except_socket: &str,
        message: ServerMessage,
    ) {
        for member in self.presence.members(room_id) {
            if member.peer_id != except_socket {
                self.send_to_socket(&member.peer_id, message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lantern_proto::{SignalFlags, SignalKind};

    fn mailbox() -> (SocketSender, Arc<Mutex<VecDeque<ServerMessage>>>) {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        (SocketSender::Mailbox(Arc::clone(&queue)), queue)
    }

    fn envelope(to: &str) -> SignalingEnvelope {
        SignalingEnvelope {
            to: to.into(),
            from: "sock-a".into(),
            kind: SignalKind::Candidate,
            payload: serde_json::json!({ "candidate": "candidate:1" }),
            user_id: "user-a".into(),
            user_name: "Ada".into(),
            flags: SignalFlags::default(),
        }
    }

    #[test]
    fn routes_by_socket_id_before_user_id() {
        let presence = Arc::new(RoomPresence::new());
        let relay = SignalingRelay::new(Arc::clone(&presence));
        presence.join("room-1", "user-b", "sock-1", "Bea");
        presence.join("room-1", "user-b", "sock-2", "Bea");
        let (sender1, queue1) = mailbox();
        let (sender2, queue2) = mailbox();
        relay.register("sock-1", sender1);
        relay.register("sock-2", sender2);

        // Socket-addressed: exactly one endpoint.
        relay.route(envelope("sock-1"));
        assert_eq!(queue1.lock().unwrap().len(), 1);
        assert_eq!(queue2.lock().unwrap().len(), 0);

        // User-addressed: every socket of the user.
        relay.route(envelope("user-b"));
        assert_eq!(queue1.lock().unwrap().len(), 2);
        assert_eq!(queue2.lock().unwrap().len(), 1);
    }

    #[test]
    fn envelope_for_unknown_destination_is_dropped() {
        let presence = Arc::new(RoomPresence::new());
        let relay = SignalingRelay::new(presence);
        // Must not panic or queue anywhere.
        relay.route(envelope("nobody"));
        assert_eq!(relay.connection_count(), 0);
    }

    #[test]
    fn room_broadcast_can_exclude_the_origin_socket() {
        let presence = Arc::new(RoomPresence::new());
        let relay = SignalingRelay::new(Arc::clone(&presence));
        presence.join("room-1", "user-a", "sock-1", "Ada");
        presence.join("room-1", "user-b", "sock-2", "Bea");
        let (sender1, queue1) = mailbox();
        let (sender2, queue2) = mailbox();
        relay.register("sock-1", sender1);
        relay.register("sock-2", sender2);

        relay.broadcast_to_room_except("room-1", "sock-1", ServerMessage::Pong);
        assert_eq!(queue1.lock().unwrap().len(), 0);
        assert_eq!(queue2.lock().unwrap().len(), 1);
    }
}
