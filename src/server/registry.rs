//! In-memory room and participant registries.
//!
//! Plain maps owned by the signaling server task; no persistence, no
//! replication. A server restart loses all room state and clients rebuild
//! it by rejoining.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::protocol::{ConnectionId, ParticipantSummary, RoomId, RoomSnapshot, UserId};

#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub name: Option<String>,
    pub host: ConnectionId,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    /// Connection ids in join order; the head is the host-failover candidate.
    pub members: Vec<ConnectionId>,
}

impl Room {
    pub fn new(id: RoomId, host: ConnectionId) -> Self {
        Self {
            id,
            name: None,
            host,
            created_at: Utc::now(),
            is_active: true,
            members: vec![host],
        }
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            participant_count: self.members.len(),
            is_active: self.is_active,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub user_name: String,
    pub user_email: Option<String>,
    pub room_id: RoomId,
    pub is_host: bool,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            connection_id: self.connection_id,
        }
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

impl RoomRegistry {
    pub fn get(&self, id: &RoomId) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn get_mut(&mut self, id: &RoomId) -> Option<&mut Room> {
        self.rooms.get_mut(id)
    }

    pub fn insert(&mut self, room: Room) {
        self.rooms.insert(room.id.clone(), room);
    }

    pub fn remove(&mut self, id: &RoomId) -> Option<Room> {
        self.rooms.remove(id)
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[derive(Default)]
pub struct ParticipantRegistry {
    by_connection: HashMap<ConnectionId, Participant>,
}

impl ParticipantRegistry {
    pub fn get(&self, id: &ConnectionId) -> Option<&Participant> {
        self.by_connection.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Participant> {
        self.by_connection.get_mut(id)
    }

    pub fn insert(&mut self, participant: Participant) {
        self.by_connection
            .insert(participant.connection_id, participant);
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<Participant> {
        self.by_connection.remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.by_connection.contains_key(id)
    }

    /// The live connection a user already holds inside one room, if any.
    /// Used by the join handlers to evict stale entries on rejoin.
    pub fn find_in_room(&self, user: &UserId, room: &RoomId) -> Option<ConnectionId> {
        self.by_connection
            .values()
            .find(|p| &p.user_id == user && &p.room_id == room)
            .map(|p| p.connection_id)
    }

    pub fn len(&self) -> usize {
        self.by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(conn: ConnectionId, user: &str, room: &str) -> Participant {
        Participant {
            connection_id: conn,
            user_id: user.into(),
            user_name: user.to_owned(),
            user_email: None,
            room_id: room.into(),
            is_host: false,
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn room_starts_active_with_its_host_as_sole_member() {
        let host = ConnectionId::new();
        let room = Room::new("r1".into(), host);
        assert!(room.is_active);
        assert_eq!(room.members, vec![host]);
        assert_eq!(room.snapshot().participant_count, 1);
    }

    #[test]
    fn find_in_room_only_matches_the_same_room() {
        let mut registry = ParticipantRegistry::default();
        let conn_a = ConnectionId::new();
        let conn_b = ConnectionId::new();
        registry.insert(participant(conn_a, "alice", "r1"));
        registry.insert(participant(conn_b, "alice", "r2"));

        assert_eq!(registry.find_in_room(&"alice".into(), &"r1".into()), Some(conn_a));
        assert_eq!(registry.find_in_room(&"alice".into(), &"r2".into()), Some(conn_b));
        assert_eq!(registry.find_in_room(&"bob".into(), &"r1".into()), None);
    }

    #[test]
    fn remove_returns_the_evicted_participant() {
        let mut registry = ParticipantRegistry::default();
        let conn = ConnectionId::new();
        registry.insert(participant(conn, "alice", "r1"));
        let removed = registry.remove(&conn).unwrap();
        assert_eq!(removed.user_id, UserId::from("alice"));
        assert!(registry.is_empty());
        assert!(registry.remove(&conn).is_none());
    }
}
