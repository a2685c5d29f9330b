//! Wire protocol for the signaling channel.
//!
//! Every frame on the WebSocket is one JSON-encoded [`ClientEvent`] or
//! [`ServerEvent`], tagged by a `type` field. Offer/answer/candidate payloads
//! travel as opaque [`serde_json::Value`]s: the server relays them verbatim
//! and only the two endpoints interpret them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Identifier of one transport connection (one WebSocket).
///
/// Distinct from [`UserId`] on purpose: relay targeting is per-connection,
/// while identity is per-user, and the two must not be interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a user as known by the external user store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Room identifier, caller-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// One member of a room as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub user_name: String,
    pub connection_id: ConnectionId,
}

/// Read-only room lookup result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub participant_count: usize,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Client-to-server signaling events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        room_id: RoomId,
        user_id: UserId,
        user_name: String,
        auth_token: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        user_id: UserId,
        auth_token: String,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        target: ConnectionId,
        payload: Value,
        user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        target: ConnectionId,
        payload: Value,
        user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target: ConnectionId,
        payload: Value,
        user_id: UserId,
    },
    ToggleVideo { enabled: bool },
    ToggleAudio { enabled: bool },
    ToggleScreenShare { enabled: bool },
    ChatMessage { message: String },
    #[serde(rename_all = "camelCase")]
    GetRoomInfo { room_id: RoomId },
}

/// Server-to-client signaling events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_id: RoomId,
        is_host: bool,
        participants: Vec<ParticipantSummary>,
        host_name: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: RoomId,
        is_host: bool,
        participants: Vec<ParticipantSummary>,
        host_name: String,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: UserId,
        user_name: String,
        connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_id: UserId,
        user_name: String,
        connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    HostChanged { new_host_id: UserId },
    #[serde(rename_all = "camelCase")]
    Offer {
        payload: Value,
        from_connection_id: ConnectionId,
        from_user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        payload: Value,
        from_connection_id: ConnectionId,
        from_user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        payload: Value,
        from_connection_id: ConnectionId,
        from_user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    VideoToggled { user_id: UserId, enabled: bool },
    #[serde(rename_all = "camelCase")]
    AudioToggled { user_id: UserId, enabled: bool },
    #[serde(rename_all = "camelCase")]
    ScreenShareToggled { user_id: UserId, enabled: bool },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        id: Uuid,
        user_id: UserId,
        user_name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    RoomInfo { info: Option<RoomSnapshot> },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_kebab_tags_and_camel_fields() {
        let ev = ClientEvent::JoinRoom {
            room_id: "interview-42".into(),
            user_id: "u1".into(),
            auth_token: "tok".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "join-room");
        assert_eq!(json["roomId"], "interview-42");
        assert_eq!(json["authToken"], "tok");

        let ev = ClientEvent::IceCandidate {
            target: ConnectionId::new(),
            payload: serde_json::json!({"candidate": "candidate:0 1 udp ..."}),
            user_id: "u1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert!(json.get("target").is_some());
    }

    #[test]
    fn server_events_round_trip() {
        let ev = ServerEvent::RoomInfo { info: None };
        let json = serde_json::to_string(&ev).unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ServerEvent::RoomInfo { info: None }));
    }

    #[test]
    fn connection_id_is_not_a_user_id() {
        // Compile-time property, but the wire forms differ too: one is a
        // uuid, the other free text.
        let conn = ConnectionId::new();
        let user = UserId::from("alice");
        assert_ne!(
            serde_json::to_string(&conn).unwrap(),
            serde_json::to_string(&user).unwrap()
        );
    }
}
