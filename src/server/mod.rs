//! Signaling server: the authoritative relay and state keeper for room
//! membership and WebRTC handshake forwarding.
//!
//! The server is an actor. One task owns the registries and drains a
//! [`ServerCommand`] channel; every command runs to completion before the
//! next is processed, so registry mutation needs no locks and every handler
//! is atomic with respect to the others. Transport code (see [`ws`]) only
//! translates sockets into commands and outbound events.

pub mod registry;
pub mod ws;

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditLogger};
use crate::auth::{Identity, IdentityProvider};
use crate::error::GreenroomError;
use crate::protocol::{ClientEvent, ConnectionId, RoomId, ServerEvent, UserId};
use registry::{Participant, ParticipantRegistry, Room, RoomRegistry};

/// Everything that can happen to the server, in processing order.
pub enum ServerCommand {
    /// A transport connection opened; `sender` is its outbound event queue.
    Open {
        connection: ConnectionId,
        sender: mpsc::UnboundedSender<ServerEvent>,
    },
    /// A signaling event arrived on an open connection.
    Event {
        connection: ConnectionId,
        event: ClientEvent,
    },
    /// The transport connection closed (implicit disconnect).
    Closed { connection: ConnectionId },
}

pub struct SignalingServer {
    rooms: RoomRegistry,
    participants: ParticipantRegistry,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
    identity: Arc<dyn IdentityProvider>,
    audit: AuditLogger,
}

impl SignalingServer {
    pub fn new(identity: Arc<dyn IdentityProvider>, audit: AuditLogger) -> Self {
        Self {
            rooms: RoomRegistry::default(),
            participants: ParticipantRegistry::default(),
            connections: HashMap::new(),
            identity,
            audit,
        }
    }

    pub fn command_channel() -> (
        mpsc::UnboundedSender<ServerCommand>,
        mpsc::UnboundedReceiver<ServerCommand>,
    ) {
        mpsc::unbounded_channel()
    }

    /// Drain commands until every sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ServerCommand>) {
        while let Some(cmd) = commands.recv().await {
            self.handle(cmd).await;
        }
        info!("signaling server stopped");
    }

    pub async fn handle(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Open { connection, sender } => {
                self.connections.insert(connection, sender);
            }
            ServerCommand::Closed { connection } => self.connection_closed(connection),
            ServerCommand::Event { connection, event } => match event {
                ClientEvent::CreateRoom { room_id, user_id, user_name, auth_token } => {
                    self.create_room(connection, room_id, user_id, user_name, auth_token)
                        .await
                }
                ClientEvent::JoinRoom { room_id, user_id, auth_token } => {
                    self.join_room(connection, room_id, user_id, auth_token).await
                }
                ClientEvent::Offer { target, payload, user_id } => self.relay(
                    target,
                    ServerEvent::Offer {
                        payload,
                        from_connection_id: connection,
                        from_user_id: user_id,
                    },
                ),
                ClientEvent::Answer { target, payload, user_id } => self.relay(
                    target,
                    ServerEvent::Answer {
                        payload,
                        from_connection_id: connection,
                        from_user_id: user_id,
                    },
                ),
                ClientEvent::IceCandidate { target, payload, user_id } => self.relay(
                    target,
                    ServerEvent::IceCandidate {
                        payload,
                        from_connection_id: connection,
                        from_user_id: user_id,
                    },
                ),
                ClientEvent::ToggleVideo { enabled } => self.media_toggled(connection, enabled, |user_id, enabled| {
                    ServerEvent::VideoToggled { user_id, enabled }
                }),
                ClientEvent::ToggleAudio { enabled } => self.media_toggled(connection, enabled, |user_id, enabled| {
                    ServerEvent::AudioToggled { user_id, enabled }
                }),
                ClientEvent::ToggleScreenShare { enabled } => {
                    self.media_toggled(connection, enabled, |user_id, enabled| {
                        ServerEvent::ScreenShareToggled { user_id, enabled }
                    })
                }
                ClientEvent::ChatMessage { message } => self.chat(connection, message),
                ClientEvent::GetRoomInfo { room_id } => self.room_info(connection, room_id),
            },
        }
    }

    async fn authenticate(
        &self,
        user_id: &UserId,
        auth_token: &str,
    ) -> Result<Identity, GreenroomError> {
        let identity = self
            .identity
            .validate(user_id, auth_token)
            .await
            .map_err(|e| GreenroomError::Unauthorized(format!("identity lookup failed: {e}")))?
            .ok_or_else(|| GreenroomError::Unauthorized(format!("unknown user {user_id}")))?;
        if identity.is_blocked {
            return Err(GreenroomError::Unauthorized(format!("user {user_id} is blocked")));
        }
        Ok(identity)
    }

    async fn create_room(
        &mut self,
        connection: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
        user_name: String,
        auth_token: String,
    ) {
        let identity = match self.authenticate(&user_id, &auth_token).await {
            Ok(identity) => identity,
            Err(err) => return self.reject(connection, err),
        };

        let evicted = self.evict_stale_entry(&user_id, &room_id, connection);
        let created = !self.rooms.contains(&room_id);

        let is_host;
        let others;
        if created {
            self.rooms.insert(Room::new(room_id.clone(), connection));
            is_host = true;
            others = Vec::new();
        } else {
            // The room id is taken: the caller joins it instead. If the
            // evicted stale connection was the host, the fresh one inherits.
            let Some(room) = self.rooms.get_mut(&room_id) else { return };
            room.members.push(connection);
            if evicted.as_ref().map_or(false, |p| p.is_host) {
                room.host = connection;
            }
            is_host = room.host == connection;
            let members = room.members.clone();
            others = members
                .iter()
                .filter(|c| **c != connection)
                .filter_map(|c| self.participants.get(c))
                .map(|p| p.summary())
                .collect();
        }

        self.participants.insert(Participant {
            connection_id: connection,
            user_id: user_id.clone(),
            user_name: user_name.clone(),
            user_email: identity.email.clone(),
            room_id: room_id.clone(),
            is_host,
            joined_at: chrono::Utc::now(),
        });

        let host_name = self
            .rooms
            .get(&room_id)
            .and_then(|room| self.participants.get(&room.host))
            .map(|p| p.user_name.clone())
            .unwrap_or_else(|| user_name.clone());

        if !created {
            let members = self.room_members(&room_id);
            self.broadcast(
                &members,
                &ServerEvent::UserJoined {
                    user_id: user_id.clone(),
                    user_name: user_name.clone(),
                    connection_id: connection,
                },
                Some(connection),
            );
        }

        self.send(
            connection,
            ServerEvent::RoomCreated {
                room_id: room_id.clone(),
                is_host,
                participants: others,
                host_name,
            },
        );

        let action = if created { AuditAction::RoomCreated } else { AuditAction::UserJoined };
        self.audit.record(AuditEntry::new(
            user_id,
            room_id,
            action,
            json!({ "userName": user_name }),
        ));
    }

    async fn join_room(
        &mut self,
        connection: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
        auth_token: String,
    ) {
        let identity = match self.authenticate(&user_id, &auth_token).await {
            Ok(identity) => identity,
            Err(err) => return self.reject(connection, err),
        };

        match self.rooms.get(&room_id) {
            None => {
                return self.reject(connection, GreenroomError::RoomNotFound(room_id.0));
            }
            Some(room) if !room.is_active => {
                return self.reject(connection, GreenroomError::RoomInactive(room_id.0));
            }
            Some(_) => {}
        }

        let user_name = identity.name.clone().unwrap_or_else(|| user_id.0.clone());
        let evicted = self.evict_stale_entry(&user_id, &room_id, connection);

        let Some(room) = self.rooms.get_mut(&room_id) else { return };
        room.members.push(connection);
        if evicted.as_ref().map_or(false, |p| p.is_host) {
            room.host = connection;
        }
        let is_host = room.host == connection;
        let host_conn = room.host;
        let members = room.members.clone();

        let others = members
            .iter()
            .filter(|c| **c != connection)
            .filter_map(|c| self.participants.get(c))
            .map(|p| p.summary())
            .collect();
        let host_name = self
            .participants
            .get(&host_conn)
            .map(|p| p.user_name.clone())
            .unwrap_or_else(|| user_name.clone());

        self.participants.insert(Participant {
            connection_id: connection,
            user_id: user_id.clone(),
            user_name: user_name.clone(),
            user_email: identity.email.clone(),
            room_id: room_id.clone(),
            is_host,
            joined_at: chrono::Utc::now(),
        });

        self.broadcast(
            &members,
            &ServerEvent::UserJoined {
                user_id: user_id.clone(),
                user_name: user_name.clone(),
                connection_id: connection,
            },
            Some(connection),
        );
        self.send(
            connection,
            ServerEvent::RoomJoined {
                room_id: room_id.clone(),
                is_host,
                participants: others,
                host_name,
            },
        );

        self.audit.record(AuditEntry::new(
            user_id,
            room_id,
            AuditAction::UserJoined,
            json!({ "userName": user_name }),
        ));
    }

    /// Verbatim handshake relay. A missing target means the counterpart
    /// already disconnected; that is expected, not an error.
    fn relay(&self, target: ConnectionId, event: ServerEvent) {
        if !self.connections.contains_key(&target) {
            debug!(%target, "relay target gone, dropping handshake message");
            return;
        }
        self.send(target, event);
    }

    fn media_toggled(
        &mut self,
        connection: ConnectionId,
        enabled: bool,
        make: fn(UserId, bool) -> ServerEvent,
    ) {
        // No-op when the caller is not a recognized participant.
        let Some(participant) = self.participants.get(&connection) else { return };
        let user_id = participant.user_id.clone();
        let room_id = participant.room_id.clone();
        let members = self.room_members(&room_id);
        self.broadcast(&members, &make(user_id, enabled), Some(connection));
    }

    fn chat(&mut self, connection: ConnectionId, message: String) {
        let Some(participant) = self.participants.get(&connection) else { return };
        // Single id and timestamp, so every client renders identical ordering.
        let event = ServerEvent::ChatMessage {
            id: Uuid::new_v4(),
            user_id: participant.user_id.clone(),
            user_name: participant.user_name.clone(),
            message,
            timestamp: chrono::Utc::now(),
        };
        let members = self.room_members(&participant.room_id.clone());
        self.broadcast(&members, &event, None);
    }

    fn room_info(&self, connection: ConnectionId, room_id: RoomId) {
        let info = self.rooms.get(&room_id).map(|room| room.snapshot());
        self.send(connection, ServerEvent::RoomInfo { info });
    }

    fn connection_closed(&mut self, connection: ConnectionId) {
        self.connections.remove(&connection);
        let Some(participant) = self.participants.remove(&connection) else {
            return;
        };

        self.audit.record(AuditEntry::new(
            participant.user_id.clone(),
            participant.room_id.clone(),
            AuditAction::UserDisconnected,
            json!({ "userName": participant.user_name }),
        ));

        let mut remaining = Vec::new();
        let mut room_closed = false;
        let mut new_host_conn = None;
        if let Some(room) = self.rooms.get_mut(&participant.room_id) {
            room.members.retain(|c| *c != connection);
            if room.members.is_empty() {
                room_closed = true;
            } else {
                if room.host == connection {
                    // Earliest remaining member in join order takes over.
                    let next = room.members[0];
                    room.host = next;
                    new_host_conn = Some(next);
                }
                remaining = room.members.clone();
            }
        }

        if room_closed {
            self.rooms.remove(&participant.room_id);
            self.audit.record(AuditEntry::new(
                participant.user_id.clone(),
                participant.room_id.clone(),
                AuditAction::RoomClosed,
                json!({}),
            ));
            return;
        }

        if let Some(host_conn) = new_host_conn {
            let new_host_id = match self.participants.get_mut(&host_conn) {
                Some(host) => {
                    host.is_host = true;
                    host.user_id.clone()
                }
                None => return,
            };
            self.broadcast(
                &remaining,
                &ServerEvent::HostChanged { new_host_id: new_host_id.clone() },
                None,
            );
            self.audit.record(AuditEntry::new(
                new_host_id,
                participant.room_id.clone(),
                AuditAction::HostChanged,
                json!({ "previousHost": participant.user_id }),
            ));
        }

        self.broadcast(
            &remaining,
            &ServerEvent::UserLeft {
                user_id: participant.user_id,
                user_name: participant.user_name,
                connection_id: connection,
            },
            None,
        );
    }

    /// Rejoin dedup: a user refreshing into a room they already occupy on a
    /// live connection replaces the stale entry instead of duplicating it.
    /// No `user-left` is broadcast, the user never left. The stale socket's
    /// eventual close finds no record and is a no-op.
    fn evict_stale_entry(
        &mut self,
        user_id: &UserId,
        room_id: &RoomId,
        incoming: ConnectionId,
    ) -> Option<Participant> {
        let stale = self.participants.find_in_room(user_id, room_id)?;
        if stale == incoming {
            return None;
        }
        debug!(%user_id, %room_id, %stale, "evicting stale connection on rejoin");
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.retain(|c| *c != stale);
        }
        self.participants.remove(&stale)
    }

    fn room_members(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    fn broadcast(
        &self,
        members: &[ConnectionId],
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) {
        for member in members {
            if Some(*member) == except {
                continue;
            }
            self.send(*member, event.clone());
        }
    }

    fn reject(&self, connection: ConnectionId, err: GreenroomError) {
        self.send(connection, ServerEvent::Error { message: err.client_message() });
    }

    fn send(&self, connection: ConnectionId, event: ServerEvent) {
        if let Some(tx) = self.connections.get(&connection) {
            if tx.send(event).is_err() {
                debug!(%connection, "outbound queue closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::test_support::RecordingSink;
    use crate::auth::StaticIdentityProvider;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn identity(user: &str, blocked: bool) -> Identity {
        Identity {
            id: user.into(),
            role: "user".into(),
            is_blocked: blocked,
            name: Some(user.to_owned()),
            email: Some(format!("{user}@example.org")),
        }
    }

    fn test_server() -> (SignalingServer, Arc<Mutex<Vec<AuditEntry>>>) {
        let mut tokens = HashMap::new();
        for user in ["alice", "bob", "carol"] {
            tokens.insert(format!("tok-{user}"), identity(user, false));
        }
        tokens.insert("tok-dave".to_owned(), identity("dave", true));
        let (sink, entries) = RecordingSink::new();
        let server = SignalingServer::new(
            Arc::new(StaticIdentityProvider::new(tokens)),
            AuditLogger::spawn(Arc::new(sink)),
        );
        (server, entries)
    }

    async fn open(server: &mut SignalingServer) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        server
            .handle(ServerCommand::Open { connection, sender: tx })
            .await;
        (connection, rx)
    }

    async fn create(server: &mut SignalingServer, conn: ConnectionId, room: &str, user: &str) {
        server
            .handle(ServerCommand::Event {
                connection: conn,
                event: ClientEvent::CreateRoom {
                    room_id: room.into(),
                    user_id: user.into(),
                    user_name: user.to_owned(),
                    auth_token: format!("tok-{user}"),
                },
            })
            .await;
    }

    async fn join(server: &mut SignalingServer, conn: ConnectionId, room: &str, user: &str) {
        server
            .handle(ServerCommand::Event {
                connection: conn,
                event: ClientEvent::JoinRoom {
                    room_id: room.into(),
                    user_id: user.into(),
                    auth_token: format!("tok-{user}"),
                },
            })
            .await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn create_then_join_notifies_both_sides() {
        let (mut server, _) = test_server();
        let (a, mut a_rx) = open(&mut server).await;
        let (b, mut b_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;

        let a_events = drain(&mut a_rx);
        assert!(matches!(
            &a_events[0],
            ServerEvent::RoomCreated { is_host: true, participants, .. } if participants.is_empty()
        ));
        assert!(a_events.iter().any(|ev| matches!(
            ev,
            ServerEvent::UserJoined { user_id, connection_id, .. }
                if user_id == &UserId::from("bob") && *connection_id == b
        )));

        let b_events = drain(&mut b_rx);
        match &b_events[0] {
            ServerEvent::RoomJoined { is_host, participants, host_name, .. } => {
                assert!(!is_host);
                assert_eq!(host_name, "alice");
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].user_id, UserId::from("alice"));
                assert_eq!(participants[0].connection_id, a);
            }
            other => panic!("expected room-joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_and_blocked_users_mutate_nothing() {
        let (mut server, _) = test_server();
        let (a, mut a_rx) = open(&mut server).await;

        server
            .handle(ServerCommand::Event {
                connection: a,
                event: ClientEvent::CreateRoom {
                    room_id: "R1".into(),
                    user_id: "alice".into(),
                    user_name: "alice".into(),
                    auth_token: "wrong".into(),
                },
            })
            .await;
        assert!(matches!(drain(&mut a_rx)[0], ServerEvent::Error { .. }));
        assert!(server.rooms.is_empty());
        assert!(server.participants.is_empty());

        create(&mut server, a, "R1", "dave").await;
        assert!(matches!(drain(&mut a_rx)[0], ServerEvent::Error { .. }));
        assert!(server.rooms.is_empty());
    }

    #[tokio::test]
    async fn joining_an_unknown_room_is_an_error_but_room_info_is_not() {
        let (mut server, _) = test_server();
        let (a, mut a_rx) = open(&mut server).await;

        join(&mut server, a, "nope", "alice").await;
        assert!(matches!(drain(&mut a_rx)[0], ServerEvent::Error { .. }));

        server
            .handle(ServerCommand::Event {
                connection: a,
                event: ClientEvent::GetRoomInfo { room_id: "nope".into() },
            })
            .await;
        assert!(matches!(drain(&mut a_rx)[0], ServerEvent::RoomInfo { info: None }));
    }

    #[tokio::test]
    async fn membership_is_joins_minus_disconnects() {
        let (mut server, _) = test_server();
        let (a, _a_rx) = open(&mut server).await;
        let (b, _b_rx) = open(&mut server).await;
        let (c, _c_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;
        join(&mut server, c, "R1", "carol").await;
        server.handle(ServerCommand::Closed { connection: b }).await;

        let room = server.rooms.get(&"R1".into()).unwrap();
        assert_eq!(room.members, vec![a, c]);
        assert_eq!(room.snapshot().participant_count, 2);
        assert!(server.participants.get(&b).is_none());
    }

    #[tokio::test]
    async fn host_disconnect_broadcasts_exactly_one_host_change() {
        let (mut server, _) = test_server();
        let (a, _a_rx) = open(&mut server).await;
        let (b, mut b_rx) = open(&mut server).await;
        let (c, mut c_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;
        join(&mut server, c, "R1", "carol").await;
        drain(&mut b_rx);
        drain(&mut c_rx);

        server.handle(ServerCommand::Closed { connection: a }).await;

        for rx in [&mut b_rx, &mut c_rx] {
            let events = drain(rx);
            let host_changes: Vec<_> = events
                .iter()
                .filter(|ev| matches!(ev, ServerEvent::HostChanged { .. }))
                .collect();
            assert_eq!(host_changes.len(), 1);
            assert!(matches!(
                host_changes[0],
                ServerEvent::HostChanged { new_host_id } if new_host_id == &UserId::from("bob")
            ));
            assert!(events.iter().any(|ev| matches!(
                ev,
                ServerEvent::UserLeft { user_id, .. } if user_id == &UserId::from("alice")
            )));
        }

        // Earliest remaining member in join order is the new host.
        let room = server.rooms.get(&"R1".into()).unwrap();
        assert_eq!(room.host, b);
        assert!(server.participants.get(&b).unwrap().is_host);
        assert!(!server.participants.get(&c).unwrap().is_host);
    }

    #[tokio::test]
    async fn room_entry_exists_iff_participant_set_nonempty() {
        let (mut server, _) = test_server();
        let (a, _a_rx) = open(&mut server).await;
        let (b, _b_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;

        server.handle(ServerCommand::Closed { connection: a }).await;
        assert!(server.rooms.contains(&"R1".into()));

        server.handle(ServerCommand::Closed { connection: b }).await;
        assert!(!server.rooms.contains(&"R1".into()));
        assert!(server.participants.is_empty());
    }

    #[tokio::test]
    async fn relay_to_departed_connection_is_silent() {
        let (mut server, _) = test_server();
        let (a, _a_rx) = open(&mut server).await;
        let (b, mut b_rx) = open(&mut server).await;
        let (ghost, ghost_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;
        drop(ghost_rx);
        server.handle(ServerCommand::Closed { connection: ghost }).await;
        drain(&mut b_rx);

        server
            .handle(ServerCommand::Event {
                connection: b,
                event: ClientEvent::IceCandidate {
                    target: ghost,
                    payload: serde_json::json!({"candidate": "x"}),
                    user_id: "bob".into(),
                },
            })
            .await;

        // Nothing delivered to anyone, and no error raised to the sender.
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn relay_tags_sender_connection_and_user() {
        let (mut server, _) = test_server();
        let (a, mut a_rx) = open(&mut server).await;
        let (b, mut b_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let sdp = serde_json::json!({"type": "offer", "sdp": "v=0..."});
        server
            .handle(ServerCommand::Event {
                connection: a,
                event: ClientEvent::Offer {
                    target: b,
                    payload: sdp.clone(),
                    user_id: "alice".into(),
                },
            })
            .await;

        match &drain(&mut b_rx)[0] {
            ServerEvent::Offer { payload, from_connection_id, from_user_id } => {
                assert_eq!(payload, &sdp);
                assert_eq!(*from_connection_id, a);
                assert_eq!(from_user_id, &UserId::from("alice"));
            }
            other => panic!("expected relayed offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_reaches_all_members_with_one_id_and_timestamp() {
        let (mut server, _) = test_server();
        let (a, mut a_rx) = open(&mut server).await;
        let (b, mut b_rx) = open(&mut server).await;
        let (c, mut c_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;
        join(&mut server, c, "R1", "carol").await;
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        server
            .handle(ServerCommand::Event {
                connection: b,
                event: ClientEvent::ChatMessage { message: "hello".into() },
            })
            .await;

        let mut seen = Vec::new();
        for rx in [&mut a_rx, &mut b_rx, &mut c_rx] {
            match drain(rx).pop() {
                Some(ServerEvent::ChatMessage { id, user_id, message, timestamp, .. }) => {
                    assert_eq!(user_id, UserId::from("bob"));
                    assert_eq!(message, "hello");
                    seen.push((id, timestamp));
                }
                other => panic!("expected chat message, got {other:?}"),
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|s| s == &seen[0]));
    }

    #[tokio::test]
    async fn toggles_broadcast_to_everyone_but_the_caller() {
        let (mut server, _) = test_server();
        let (a, mut a_rx) = open(&mut server).await;
        let (b, mut b_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        server
            .handle(ServerCommand::Event {
                connection: a,
                event: ClientEvent::ToggleVideo { enabled: false },
            })
            .await;

        assert!(drain(&mut a_rx).is_empty());
        assert!(matches!(
            drain(&mut b_rx)[0],
            ServerEvent::VideoToggled { enabled: false, .. }
        ));

        // Unknown caller: silently ignored.
        let (stranger, mut stranger_rx) = open(&mut server).await;
        server
            .handle(ServerCommand::Event {
                connection: stranger,
                event: ClientEvent::ToggleAudio { enabled: true },
            })
            .await;
        assert!(drain(&mut stranger_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn rejoining_a_room_replaces_the_stale_connection() {
        let (mut server, _) = test_server();
        let (old, _old_rx) = open(&mut server).await;
        create(&mut server, old, "R1", "alice").await;

        // Tab refresh: new connection joins before the old one disconnects.
        let (fresh, mut fresh_rx) = open(&mut server).await;
        join(&mut server, fresh, "R1", "alice").await;

        let room = server.rooms.get(&"R1".into()).unwrap();
        assert_eq!(room.members, vec![fresh]);
        assert_eq!(room.host, fresh);
        assert!(server.participants.get(&old).is_none());
        assert!(matches!(
            drain(&mut fresh_rx)[0],
            ServerEvent::RoomJoined { is_host: true, .. }
        ));

        // The stale socket's eventual close must not tear the room down.
        server.handle(ServerCommand::Closed { connection: old }).await;
        assert!(server.rooms.contains(&"R1".into()));
        assert!(server.participants.get(&fresh).is_some());
    }

    #[tokio::test]
    async fn lifecycle_is_audited() {
        let (mut server, entries) = test_server();
        let (a, _a_rx) = open(&mut server).await;
        let (b, _b_rx) = open(&mut server).await;

        create(&mut server, a, "R1", "alice").await;
        join(&mut server, b, "R1", "bob").await;
        server.handle(ServerCommand::Closed { connection: a }).await;
        server.handle(ServerCommand::Closed { connection: b }).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let actions: Vec<AuditAction> = entries.lock().await.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::RoomCreated,
                AuditAction::UserJoined,
                AuditAction::UserDisconnected,
                AuditAction::HostChanged,
                AuditAction::UserDisconnected,
                AuditAction::RoomClosed,
            ]
        );
    }
}
