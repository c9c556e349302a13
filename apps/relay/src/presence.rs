//! Room presence keyed by logical user. A user is online iff they have at
//! least one open socket; all online/offline decisions are made on socket-set
//! cardinality, never on single-socket state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use lantern_proto::{RoomId, RoomMember, SocketId, UserId};

/// What a join/leave did to the user's socket set. Callers broadcast
/// `userJoined` only on `FirstJoin` and `userLeft` only on `LastLeave`.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    FirstJoin(RoomMember),
    AdditionalSocket,
    LastLeave { room_id: RoomId, user_id: UserId },
    NoOp,
}

#[derive(Debug, Clone)]
struct SocketEntry {
    socket_id: SocketId,
    joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    user_id: UserId,
    display_name: String,
    room_id: RoomId,
    /// Insertion-ordered; the user is online while this is non-empty.
    sockets: Vec<SocketEntry>,
    status: Option<serde_json::Value>,
    last_activity: DateTime<Utc>,
}

/// Snapshot returned by presence queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: UserId,
    pub online: bool,
    pub status: Option<serde_json::Value>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct RoomPresence {
    users: DashMap<UserId, PresenceEntry>,
    /// Reverse index so socket close can find its user without scanning.
    sockets: DashMap<SocketId, UserId>,
}

impl RoomPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &self,
        room_id: &str,
        user_id: &str,
        socket_id: &str,
        display_name: &str,
    ) -> PresenceEvent {
        let now = Utc::now();
        self.sockets
            .insert(socket_id.to_string(), user_id.to_string());
        let mut entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceEntry {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                room_id: room_id.to_string(),
                sockets: Vec::new(),
                status: None,
                last_activity: now,
            });
        entry.display_name = display_name.to_string();
        entry.room_id = room_id.to_string();
        entry.last_activity = now;

        let first = entry.sockets.is_empty();
        if entry.sockets.iter().any(|s| s.socket_id == socket_id) {
            return PresenceEvent::NoOp;
        }
        entry.sockets.push(SocketEntry {
            socket_id: socket_id.to_string(),
            joined_at: now,
        });
        if first {
            PresenceEvent::FirstJoin(RoomMember {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                peer_id: socket_id.to_string(),
                joined_at: now,
            })
        } else {
            PresenceEvent::AdditionalSocket
        }
    }

    /// Remove one socket. Only the removal of the last socket flips the user
    /// offline; leaving an unknown socket is an idempotent no-op.
    pub fn leave(&self, socket_id: &str) -> PresenceEvent {
        let Some((_, user_id)) = self.sockets.remove(socket_id) else {
            return PresenceEvent::NoOp;
        };
        let Some(mut entry) = self.users.get_mut(&user_id) else {
            return PresenceEvent::NoOp;
        };
        let before = entry.sockets.len();
        entry.sockets.retain(|s| s.socket_id != socket_id);
        if entry.sockets.len() == before {
            return PresenceEvent::NoOp;
        }
        entry.last_activity = Utc::now();
        if entry.sockets.is_empty() {
            let room_id = entry.room_id.clone();
            drop(entry);
            self.users.remove(&user_id);
            PresenceEvent::LastLeave { room_id, user_id }
        } else {
            PresenceEvent::NoOp
        }
    }

    /// All member endpoints in a room, one entry per socket. A user with two
    /// sockets appears twice with distinct peer ids.
    pub fn members(&self, room_id: &str) -> Vec<RoomMember> {
        let mut members = Vec::new();
        for entry in self.users.iter() {
            if entry.room_id != room_id {
                continue;
            }
            for socket in &entry.sockets {
                members.push(RoomMember {
                    user_id: entry.user_id.clone(),
                    display_name: entry.display_name.clone(),
                    peer_id: socket.socket_id.clone(),
                    joined_at: socket.joined_at,
                });
            }
        }
        members
    }

    pub fn sockets_for(&self, user_id: &str) -> Vec<SocketId> {
        self.users
            .get(user_id)
            .map(|entry| entry.sockets.iter().map(|s| s.socket_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users
            .get(user_id)
            .map(|entry| !entry.sockets.is_empty())
            .unwrap_or(false)
    }

    pub fn room_of(&self, socket_id: &str) -> Option<RoomId> {
        let user_id = self.sockets.get(socket_id)?;
        self.users.get(user_id.value()).map(|e| e.room_id.clone())
    }

    pub fn set_status(&self, user_id: &str, status: serde_json::Value) {
        if let Some(mut entry) = self.users.get_mut(user_id) {
            entry.status = Some(status);
            entry.last_activity = Utc::now();
        }
    }

    pub fn user_presence(&self, user_id: &str) -> Option<UserPresence> {
        self.users.get(user_id).map(|entry| UserPresence {
            user_id: entry.user_id.clone(),
            online: !entry.sockets.is_empty(),
            status: entry.status.clone(),
            last_activity: Some(entry.last_activity),
        })
    }

    pub fn online_users(&self) -> Vec<UserPresence> {
        self.users
            .iter()
            .filter(|entry| !entry.sockets.is_empty())
            .map(|entry| UserPresence {
                user_id: entry.user_id.clone(),
                online: true,
                status: entry.status.clone(),
                last_activity: Some(entry.last_activity),
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn room_count(&self) -> usize {
        let mut rooms: Vec<RoomId> = self.users.iter().map(|e| e.room_id.clone()).collect();
        rooms.sort();
        rooms.dedup();
        rooms.len()
    }
}
