//! Client-side peer connection manager.
//!
//! Maintains one [`PeerSession`] per remote participant in the current room
//! and keeps it synchronized with local media state. The manager is an
//! actor: [`PeerConnectionManager::run`] owns all sessions and reacts to
//! server events, per-session callbacks and UI commands; the UI drives it
//! through a [`ManagerHandle`] and observes it through [`RoomUpdate`]s.

pub mod media;
pub mod peer;
pub mod signaling;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{build_api, RtcConfig};
use crate::connection::PeerPhase;
use crate::error::Result;
use crate::metrics::LinkQuality;
use crate::protocol::{
    ClientEvent, ConnectionId, ParticipantSummary, RoomId, RoomSnapshot, ServerEvent, UserId,
};
use media::{FeedEvent, LocalMedia, MediaDevices};
use peer::{PeerEvent, PeerSession};
use signaling::SignalingClient;

/// Commands the UI can issue while in a room.
#[derive(Debug, Clone)]
pub enum ManagerCommand {
    ToggleVideo,
    ToggleAudio,
    StartScreenShare,
    StopScreenShare,
    SendChat(String),
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaToggle {
    Video,
    Audio,
    ScreenShare,
}

#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub user_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// State changes the UI renders.
pub enum RoomUpdate {
    Joined {
        room_id: RoomId,
        is_host: bool,
        host_name: String,
        participants: Vec<ParticipantSummary>,
        /// Camera acquisition failed; the session runs audio-only.
        audio_only: bool,
    },
    MemberJoined(ParticipantSummary),
    MemberLeft { user_id: UserId },
    HostChanged { new_host_id: UserId, we_are_host: bool },
    RemoteTrack { user_id: UserId, track: Arc<TrackRemote> },
    PeerPhase { user_id: UserId, phase: PeerPhase },
    Quality { user_id: UserId, quality: LinkQuality },
    MediaToggled { user_id: UserId, kind: MediaToggle, enabled: bool },
    Chat(ChatEntry),
    RoomInfo { info: Option<RoomSnapshot> },
    Error { message: String },
}

/// How to enter a room.
pub struct JoinRequest {
    pub server_url: String,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub user_name: String,
    pub auth_token: String,
    /// Emit `create-room` instead of `join-room`.
    pub create: bool,
}

/// Cloneable control surface for a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl ManagerHandle {
    pub fn toggle_video(&self) {
        let _ = self.tx.send(ManagerCommand::ToggleVideo);
    }

    pub fn toggle_audio(&self) {
        let _ = self.tx.send(ManagerCommand::ToggleAudio);
    }

    pub fn start_screen_share(&self) {
        let _ = self.tx.send(ManagerCommand::StartScreenShare);
    }

    pub fn stop_screen_share(&self) {
        let _ = self.tx.send(ManagerCommand::StopScreenShare);
    }

    pub fn send_chat(&self, message: impl Into<String>) {
        let _ = self.tx.send(ManagerCommand::SendChat(message.into()));
    }

    pub fn leave(&self) {
        let _ = self.tx.send(ManagerCommand::Leave);
    }
}

pub struct PeerConnectionManager {
    config: RtcConfig,
    api: Arc<API>,
    user_id: UserId,
    signaling: SignalingClient,
    sessions: HashMap<UserId, PeerSession>,
    local: LocalMedia,
    audio_only: bool,
    is_host: bool,
    screen_sharing: bool,
    updates: mpsc::UnboundedSender<RoomUpdate>,
    commands_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    quality_tx: mpsc::UnboundedSender<(UserId, LinkQuality)>,
    quality_rx: mpsc::UnboundedReceiver<(UserId, LinkQuality)>,
    feed_events_rx: mpsc::UnboundedReceiver<FeedEvent>,
}

impl PeerConnectionManager {
    /// Acquire local media (audio-only fallback on camera failure), open the
    /// signaling transport and emit the join/create event. The returned
    /// manager must then be driven with [`run`](Self::run).
    pub async fn join_room(
        config: RtcConfig,
        devices: Arc<dyn MediaDevices>,
        request: JoinRequest,
        updates: mpsc::UnboundedSender<RoomUpdate>,
    ) -> Result<(Self, ManagerHandle)> {
        let api = Arc::new(build_api()?);

        let (feed_tx, feed_events_rx) = mpsc::unbounded_channel();
        let (local, audio_only) =
            LocalMedia::acquire(devices, config.preset, feed_tx).await?;
        if audio_only {
            info!("joining in audio-only mode");
        }

        let signaling = SignalingClient::connect(&request.server_url).await?;
        let join_event = if request.create {
            ClientEvent::CreateRoom {
                room_id: request.room_id.clone(),
                user_id: request.user_id.clone(),
                user_name: request.user_name.clone(),
                auth_token: request.auth_token.clone(),
            }
        } else {
            ClientEvent::JoinRoom {
                room_id: request.room_id.clone(),
                user_id: request.user_id.clone(),
                auth_token: request.auth_token.clone(),
            }
        };
        signaling.send(join_event).await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (quality_tx, quality_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                config,
                api,
                user_id: request.user_id,
                signaling,
                sessions: HashMap::new(),
                local,
                audio_only,
                is_host: false,
                screen_sharing: false,
                updates,
                commands_rx,
                peer_events_tx,
                peer_events_rx,
                quality_tx,
                quality_rx,
                feed_events_rx,
            },
            ManagerHandle { tx: commands_tx },
        ))
    }

    /// Drive the room until the user leaves or the transport drops.
    pub async fn run(mut self) -> Result<()> {
        // Select produces a value first so the handlers below get the
        // manager back exclusively.
        enum Input {
            Server(Option<ServerEvent>),
            Peer(PeerEvent),
            Quality(UserId, LinkQuality),
            Feed(FeedEvent),
            Command(Option<ManagerCommand>),
        }

        loop {
            let input = tokio::select! {
                maybe = self.signaling.recv() => Input::Server(maybe),
                Some(event) = self.peer_events_rx.recv() => Input::Peer(event),
                Some((user_id, quality)) = self.quality_rx.recv() => {
                    Input::Quality(user_id, quality)
                }
                Some(event) = self.feed_events_rx.recv() => Input::Feed(event),
                cmd = self.commands_rx.recv() => Input::Command(cmd),
            };
            match input {
                Input::Server(Some(event)) => self.handle_server_event(event).await,
                Input::Server(None) => {
                    debug!("signaling transport closed");
                    break;
                }
                Input::Peer(event) => self.handle_peer_event(event).await,
                Input::Quality(user_id, quality) => {
                    self.publish(RoomUpdate::Quality { user_id, quality });
                }
                Input::Feed(event) => self.handle_feed_event(event).await,
                Input::Command(Some(ManagerCommand::Leave)) | Input::Command(None) => break,
                Input::Command(Some(cmd)) => self.handle_command(cmd).await,
            }
        }
        self.leave().await;
        Ok(())
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::RoomCreated { room_id, is_host, participants, host_name }
            | ServerEvent::RoomJoined { room_id, is_host, participants, host_name } => {
                self.is_host = is_host;
                self.publish(RoomUpdate::Joined {
                    room_id,
                    is_host,
                    host_name,
                    participants: participants.clone(),
                    audio_only: self.audio_only,
                });
                // We call every existing member; later arrivals call us.
                for member in participants {
                    self.open_session_and_offer(member).await;
                }
            }
            ServerEvent::UserJoined { user_id, user_name, connection_id } => {
                // The newcomer initiates; we just get the session ready.
                if let Err(err) = self.open_session(user_id.clone(), connection_id, false).await {
                    warn!(%user_id, error = %err, "failed to prepare peer session");
                    return;
                }
                self.publish(RoomUpdate::MemberJoined(ParticipantSummary {
                    user_id,
                    user_name,
                    connection_id,
                }));
            }
            ServerEvent::UserLeft { user_id, .. } => {
                if let Some(session) = self.sessions.remove(&user_id) {
                    session.close().await;
                }
                self.publish(RoomUpdate::MemberLeft { user_id });
            }
            ServerEvent::HostChanged { new_host_id } => {
                self.is_host = new_host_id == self.user_id;
                self.publish(RoomUpdate::HostChanged {
                    new_host_id,
                    we_are_host: self.is_host,
                });
            }
            ServerEvent::Offer { payload, from_connection_id, from_user_id } => {
                if !self.sessions.contains_key(&from_user_id) {
                    if let Err(err) = self
                        .open_session(from_user_id.clone(), from_connection_id, false)
                        .await
                    {
                        warn!(user = %from_user_id, error = %err, "failed to open session for offer");
                        return;
                    }
                }
                let Some(session) = self.sessions.get(&from_user_id) else { return };
                match session.accept_offer(payload).await {
                    Ok(answer) => {
                        let _ = self
                            .signaling
                            .send(ClientEvent::Answer {
                                target: from_connection_id,
                                payload: answer,
                                user_id: self.user_id.clone(),
                            })
                            .await;
                    }
                    Err(err) => self.fail_session(&from_user_id, err).await,
                }
            }
            ServerEvent::Answer { payload, from_user_id, .. } => {
                match self.sessions.get(&from_user_id) {
                    Some(session) => {
                        if let Err(err) = session.accept_answer(payload).await {
                            self.fail_session(&from_user_id, err).await;
                        }
                    }
                    // Late answer for a session already torn down.
                    None => debug!(user = %from_user_id, "dropping answer for unknown session"),
                }
            }
            ServerEvent::IceCandidate { payload, from_user_id, .. } => {
                match self.sessions.get(&from_user_id) {
                    Some(session) => {
                        if let Err(err) = session.add_remote_candidate(payload).await {
                            debug!(user = %from_user_id, error = %err, "rejected remote candidate");
                        }
                    }
                    None => debug!(user = %from_user_id, "dropping candidate for unknown session"),
                }
            }
            ServerEvent::VideoToggled { user_id, enabled } => {
                self.publish(RoomUpdate::MediaToggled {
                    user_id,
                    kind: MediaToggle::Video,
                    enabled,
                });
            }
            ServerEvent::AudioToggled { user_id, enabled } => {
                self.publish(RoomUpdate::MediaToggled {
                    user_id,
                    kind: MediaToggle::Audio,
                    enabled,
                });
            }
            ServerEvent::ScreenShareToggled { user_id, enabled } => {
                self.publish(RoomUpdate::MediaToggled {
                    user_id,
                    kind: MediaToggle::ScreenShare,
                    enabled,
                });
            }
            ServerEvent::ChatMessage { id, user_id, user_name, message, timestamp } => {
                self.publish(RoomUpdate::Chat(ChatEntry {
                    id,
                    user_id,
                    user_name,
                    message,
                    timestamp,
                }));
            }
            ServerEvent::RoomInfo { info } => self.publish(RoomUpdate::RoomInfo { info }),
            ServerEvent::Error { message } => self.publish(RoomUpdate::Error { message }),
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate { target, payload } => {
                let _ = self
                    .signaling
                    .send(ClientEvent::IceCandidate {
                        target,
                        payload,
                        user_id: self.user_id.clone(),
                    })
                    .await;
            }
            PeerEvent::RemoteTrack { user_id, track } => {
                self.publish(RoomUpdate::RemoteTrack { user_id, track });
            }
            PeerEvent::PhaseChanged { user_id, phase } => {
                // A failed pair stays closed until the remote leaves; the
                // rest of the call is unaffected.
                self.publish(RoomUpdate::PeerPhase { user_id, phase });
            }
        }
    }

    async fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::ScreenShareEnded => {
                self.screen_sharing = false;
                let _ = self
                    .signaling
                    .send(ClientEvent::ToggleScreenShare { enabled: false })
                    .await;
                self.publish(RoomUpdate::MediaToggled {
                    user_id: self.user_id.clone(),
                    kind: MediaToggle::ScreenShare,
                    enabled: false,
                });
            }
        }
    }

    async fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::ToggleVideo => {
                let enabled = !self.local.video_enabled();
                self.local.set_video_enabled(enabled);
                let _ = self
                    .signaling
                    .send(ClientEvent::ToggleVideo { enabled })
                    .await;
            }
            ManagerCommand::ToggleAudio => {
                let enabled = !self.local.audio_enabled();
                self.local.set_audio_enabled(enabled);
                let _ = self
                    .signaling
                    .send(ClientEvent::ToggleAudio { enabled })
                    .await;
            }
            ManagerCommand::StartScreenShare if self.screen_sharing => {}
            ManagerCommand::StartScreenShare => match self.local.start_screen_share().await {
                Ok(()) => {
                    self.screen_sharing = true;
                    let _ = self
                        .signaling
                        .send(ClientEvent::ToggleScreenShare { enabled: true })
                        .await;
                }
                Err(err) => self.publish(RoomUpdate::Error { message: err.to_string() }),
            },
            ManagerCommand::StopScreenShare if !self.screen_sharing => {}
            ManagerCommand::StopScreenShare => match self.local.stop_screen_share().await {
                Ok(()) => {
                    self.screen_sharing = false;
                    let _ = self
                        .signaling
                        .send(ClientEvent::ToggleScreenShare { enabled: false })
                        .await;
                }
                Err(err) => self.publish(RoomUpdate::Error { message: err.to_string() }),
            },
            ManagerCommand::SendChat(message) => {
                let _ = self.signaling.send(ClientEvent::ChatMessage { message }).await;
            }
            // Handled by the run loop.
            ManagerCommand::Leave => {}
        }
    }

    async fn open_session_and_offer(&mut self, member: ParticipantSummary) {
        let user_id = member.user_id.clone();
        if let Err(err) = self
            .open_session(user_id.clone(), member.connection_id, true)
            .await
        {
            warn!(%user_id, error = %err, "failed to open initiator session");
            return;
        }
        let Some(session) = self.sessions.get(&user_id) else { return };
        match session.create_offer().await {
            Ok(offer) => {
                let _ = self
                    .signaling
                    .send(ClientEvent::Offer {
                        target: member.connection_id,
                        payload: offer,
                        user_id: self.user_id.clone(),
                    })
                    .await;
            }
            Err(err) => self.fail_session(&user_id, err).await,
        }
    }

    async fn open_session(
        &mut self,
        user_id: UserId,
        connection_id: ConnectionId,
        initiator: bool,
    ) -> Result<()> {
        // A session may already exist when a member rejoins on a fresh
        // connection before its old one closed; replace it.
        if let Some(old) = self.sessions.remove(&user_id) {
            old.close().await;
        }
        let session = PeerSession::new(
            &self.api,
            self.config.ice.rtc_configuration(),
            user_id.clone(),
            connection_id,
            initiator,
            &self.local.tracks(),
            self.peer_events_tx.clone(),
            self.quality_tx.clone(),
        )
        .await?;
        self.sessions.insert(user_id, session);
        Ok(())
    }

    /// Negotiation failure is contained to one pair: close that session,
    /// tell the UI, leave everything else running.
    async fn fail_session(&mut self, user_id: &UserId, err: crate::error::GreenroomError) {
        warn!(user = %user_id, error = %err, "peer negotiation failed");
        if let Some(session) = self.sessions.remove(user_id) {
            session.close().await;
        }
        self.publish(RoomUpdate::PeerPhase {
            user_id: user_id.clone(),
            phase: PeerPhase::Closed,
        });
    }

    /// Deterministic unwind: close every session, stop local capture. The
    /// transport closes when the manager drops, which the server treats as
    /// the disconnect.
    async fn leave(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close().await;
        }
        self.local.close();
    }

    fn publish(&self, update: RoomUpdate) {
        if self.updates.send(update).is_err() {
            debug!("updates receiver dropped");
        }
    }
}
