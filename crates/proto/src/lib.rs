//! Wire types shared between the lantern relay and the mesh client core.
//!
//! Everything here is transient signaling vocabulary: envelopes are forwarded
//! by the relay without interpretation and are never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One physical connection endpoint (a single socket / peer connection).
pub type PeerId = String;
/// One logical account; may be reachable through many peer ids at once.
pub type UserId = String;
pub type RoomId = String;
pub type SocketId = String;

/// Generate a fresh peer id for a new physical connection.
pub fn generate_peer_id() -> PeerId {
    Uuid::new_v4().to_string()
}

/// Handshake message kinds carried by a [`SignalingEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Recovery-related flags riding along with an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalFlags {
    #[serde(default, skip_serializing_if = "is_false")]
    pub ice_restart: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_reconnect: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub relay_only: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Addressed out-of-band handshake message, relayed verbatim between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    pub to: PeerId,
    pub from: PeerId,
    pub kind: SignalKind,
    /// Opaque SDP or candidate payload; the relay never looks inside.
    pub payload: serde_json::Value,
    pub user_id: UserId,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "SignalFlags::is_empty")]
    pub flags: SignalFlags,
}

impl SignalFlags {
    pub fn is_empty(&self) -> bool {
        !(self.ice_restart || self.is_reconnect || self.relay_only)
    }
}

/// A room member as reported in presence snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub user_id: UserId,
    pub display_name: String,
    pub peer_id: PeerId,
    pub joined_at: DateTime<Utc>,
}

/// Mute/deafen state of one voice participant, scoped per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    pub user_id: UserId,
    pub channel_id: RoomId,
    pub meeting_id: String,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub is_bot: bool,
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join a room; answered with `room-joined` carrying the member snapshot.
    #[serde(rename = "join-room")]
    JoinRoom {
        room_id: RoomId,
        user_id: UserId,
        display_name: String,
    },
    /// Addressed offer/answer/candidate traffic, forwarded unmodified.
    #[serde(rename = "signal")]
    Signal { envelope: SignalingEnvelope },
    /// Enter a voice channel; answered with the current roster.
    #[serde(rename = "join-voice")]
    JoinVoice {
        channel_id: RoomId,
        meeting_id: String,
        #[serde(default)]
        muted: bool,
        #[serde(default)]
        deafened: bool,
        #[serde(default)]
        bot: bool,
    },
    #[serde(rename = "leave-voice")]
    LeaveVoice { channel_id: RoomId },
    #[serde(rename = "toggle-mute")]
    ToggleMute { channel_id: RoomId, muted: bool },
    #[serde(rename = "toggle-deafen")]
    ToggleDeafen { channel_id: RoomId, deafened: bool },
    /// Peer latency probe, relayed to the target user's sockets.
    #[serde(rename = "ping-user-request")]
    PingUserRequest { to: UserId, nonce: u64 },
    #[serde(rename = "ping-response")]
    PingResponse { to: UserId, nonce: u64 },
    /// Socket keepalive for the relay's stale-connection monitor.
    #[serde(rename = "ping")]
    Ping,
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Join ack plus the member snapshot used to seed outbound connects.
    #[serde(rename = "room-joined")]
    RoomJoined {
        room_id: RoomId,
        peer_id: PeerId,
        members: Vec<RoomMember>,
    },
    /// First socket of a logical user appeared in the room.
    #[serde(rename = "userJoined")]
    UserJoined { member: RoomMember },
    /// Last socket of a logical user left the room.
    #[serde(rename = "userLeft")]
    UserLeft { user_id: UserId },
    #[serde(rename = "signal")]
    Signal { envelope: SignalingEnvelope },
    /// Voice roster snapshot delivered to a new voice joiner.
    #[serde(rename = "voice-roster")]
    VoiceRoster {
        channel_id: RoomId,
        participants: Vec<ParticipantState>,
    },
    #[serde(rename = "voice-state-changed")]
    VoiceStateChanged { participant: ParticipantState },
    #[serde(rename = "voice-participant-left")]
    VoiceParticipantLeft { channel_id: RoomId, user_id: UserId },
    #[serde(rename = "ping-user-request")]
    PingUserRequest { from: UserId, nonce: u64 },
    #[serde(rename = "ping-response")]
    PingResponse { from: UserId, nonce: u64 },
    /// Out-of-band presence document pushed to a user's active sockets.
    #[serde(rename = "presence-update")]
    PresenceUpdate {
        user_id: UserId,
        status: serde_json::Value,
    },
    #[serde(rename = "video-room-error")]
    VideoRoomError { message: String },
    #[serde(rename = "pong")]
    Pong,
}
