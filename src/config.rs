//! ICE and media configuration.
//!
//! Pure configuration, no state: STUN/TURN server lists, codec preferences
//! and the quality-tiered media constraints used when acquiring local media.

use serde::Deserialize;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use crate::error::Result;

/// TURN relay credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// STUN/TURN server selection.
#[derive(Debug, Clone, Deserialize)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn: Option<TurnConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
            turn: None,
        }
    }
}

impl IceConfig {
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let mut ice_servers = Vec::new();
        if !self.stun_servers.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = &self.turn {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

/// Quality tier for local media acquisition. Medium is the join default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub sample_rate: u32,
    pub channels: u16,
}

impl QualityPreset {
    pub fn video(&self) -> VideoConstraints {
        match self {
            QualityPreset::Low => VideoConstraints { width: 640, height: 360, frame_rate: 15 },
            QualityPreset::Medium => VideoConstraints { width: 1280, height: 720, frame_rate: 30 },
            QualityPreset::High => VideoConstraints { width: 1920, height: 1080, frame_rate: 30 },
        }
    }

    pub fn audio(&self) -> AudioConstraints {
        AudioConstraints { sample_rate: 48_000, channels: 2 }
    }
}

/// Everything the client side needs to build peer connections.
#[derive(Debug, Clone, Default)]
pub struct RtcConfig {
    pub ice: IceConfig,
    pub preset: QualityPreset,
}

/// Media engine with the preferred codecs: Opus for audio, VP8 for video.
pub fn media_engine() -> Result<MediaEngine> {
    let mut m = MediaEngine::default();
    m.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    m.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    Ok(m)
}

/// Shared API object for all peer connections of one client.
///
/// Default interceptors are required for the RTCP feedback the quality
/// sampler reads (remote-inbound loss reports).
pub fn build_api() -> Result<API> {
    let mut m = media_engine()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut m)?;
    Ok(APIBuilder::new()
        .with_media_engine(m)
        .with_interceptor_registry(registry)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ice_has_a_stun_server_and_no_turn() {
        let cfg = IceConfig::default().rtc_configuration();
        assert_eq!(cfg.ice_servers.len(), 1);
        assert!(cfg.ice_servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn turn_credentials_are_carried_through() {
        let ice = IceConfig {
            stun_servers: vec!["stun:stun.example.org:3478".into()],
            turn: Some(TurnConfig {
                urls: vec!["turn:turn.example.org:3478".into()],
                username: "gr".into(),
                credential: "secret".into(),
            }),
        };
        let cfg = ice.rtc_configuration();
        assert_eq!(cfg.ice_servers.len(), 2);
        assert_eq!(cfg.ice_servers[1].username, "gr");
        assert_eq!(cfg.ice_servers[1].credential, "secret");
    }

    #[test]
    fn presets_scale_video_constraints() {
        assert!(QualityPreset::Low.video().height < QualityPreset::Medium.video().height);
        assert!(QualityPreset::Medium.video().height < QualityPreset::High.video().height);
        assert_eq!(QualityPreset::default(), QualityPreset::Medium);
    }
}
