//! One peer connection per remote participant.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::{ConnectionMonitor, PeerPhase};
use crate::error::Result;
use crate::metrics::{self, LinkQuality};
use crate::protocol::{ConnectionId, UserId};

/// Notifications a session pushes back to the manager.
pub enum PeerEvent {
    /// A locally gathered ICE candidate to relay to the remote side.
    LocalCandidate {
        target: ConnectionId,
        payload: Value,
    },
    /// Remote media arrived.
    RemoteTrack {
        user_id: UserId,
        track: Arc<TrackRemote>,
    },
    PhaseChanged { user_id: UserId, phase: PeerPhase },
}

/// Wraps one [`RTCPeerConnection`] and its monitors. Owned exclusively by
/// the manager; destroyed when either side leaves the room.
pub struct PeerSession {
    remote_user: UserId,
    remote_connection: ConnectionId,
    initiator: bool,
    pc: Arc<RTCPeerConnection>,
    monitor: ConnectionMonitor,
    quality_task: JoinHandle<()>,
}

impl PeerSession {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        api: &API,
        config: RTCConfiguration,
        remote_user: UserId,
        remote_connection: ConnectionId,
        initiator: bool,
        local_tracks: &[Arc<TrackLocalStaticSample>],
        events: mpsc::UnboundedSender<PeerEvent>,
        quality: mpsc::UnboundedSender<(UserId, LinkQuality)>,
    ) -> Result<Self> {
        let pc = Arc::new(api.new_peer_connection(config).await?);

        for track in local_tracks {
            pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }

        let monitor = ConnectionMonitor::new();

        let cb_monitor = monitor.clone();
        let cb_events = events.clone();
        let cb_user = remote_user.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            cb_monitor.update_from_peer_state(state);
            let _ = cb_events.send(PeerEvent::PhaseChanged {
                user_id: cb_user.clone(),
                phase: cb_monitor.phase(),
            });
            Box::pin(async {})
        }));

        let cb_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let cb_events = cb_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        if let Ok(payload) = serde_json::to_value(init) {
                            let _ = cb_events.send(PeerEvent::LocalCandidate {
                                target: remote_connection,
                                payload,
                            });
                        }
                    }
                    Err(err) => debug!(error = %err, "unserializable ice candidate"),
                }
            })
        }));

        let cb_events = events;
        let cb_user = remote_user.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = cb_events.send(PeerEvent::RemoteTrack {
                user_id: cb_user.clone(),
                track,
            });
            Box::pin(async {})
        }));

        let quality_task = metrics::spawn_monitor(pc.clone(), remote_user.clone(), quality);

        Ok(Self {
            remote_user,
            remote_connection,
            initiator,
            pc,
            monitor,
            quality_task,
        })
    }

    pub fn remote_user(&self) -> &UserId {
        &self.remote_user
    }

    pub fn remote_connection(&self) -> ConnectionId {
        self.remote_connection
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn phase(&self) -> PeerPhase {
        self.monitor.phase()
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// Initiator side: produce the offer to relay.
    pub async fn create_offer(&self) -> Result<Value> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(offer)?)
    }

    /// Non-initiator side: take the remote offer, produce the answer.
    pub async fn accept_offer(&self, payload: Value) -> Result<Value> {
        let offer: RTCSessionDescription = serde_json::from_value(payload)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_value(answer)?)
    }

    pub async fn accept_answer(&self, payload: Value) -> Result<()> {
        let answer: RTCSessionDescription = serde_json::from_value(payload)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    pub async fn add_remote_candidate(&self, payload: Value) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(payload)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.monitor.set(PeerPhase::Closed);
        self.quality_task.abort();
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build_api, IceConfig};
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn audio_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "test".to_owned(),
        ))
    }

    async fn session(initiator: bool, events: mpsc::UnboundedSender<PeerEvent>) -> PeerSession {
        let api = build_api().unwrap();
        PeerSession::new(
            &api,
            IceConfig::default().rtc_configuration(),
            "remote".into(),
            ConnectionId::new(),
            initiator,
            &[audio_track()],
            events,
            mpsc::unbounded_channel().0,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn offer_answer_exchange_produces_valid_descriptions() {
        let (events, _rx) = mpsc::unbounded_channel();
        let caller = session(true, events.clone()).await;
        let callee = session(false, events).await;

        assert!(caller.is_initiator());
        assert_eq!(caller.phase(), PeerPhase::Signaling);

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer["type"], "offer");
        assert!(offer["sdp"].as_str().unwrap().contains("v=0"));

        let answer = callee.accept_offer(offer).await.unwrap();
        assert_eq!(answer["type"], "answer");
        caller.accept_answer(answer).await.unwrap();

        caller.close().await;
        callee.close().await;
        assert_eq!(caller.phase(), PeerPhase::Closed);
    }

    #[tokio::test]
    async fn malformed_remote_descriptions_are_rejected() {
        let (events, _rx) = mpsc::unbounded_channel();
        let callee = session(false, events).await;
        // Rejected either at decode time or by the sdp parser; never a panic.
        assert!(callee
            .accept_offer(serde_json::json!({"bogus": true}))
            .await
            .is_err());
        callee.close().await;
    }
}
