//! Greenroom: WebRTC signaling and peer connection management for
//! multi-party interview rooms.
//!
//! The crate has two halves sharing one wire protocol:
//!
//! * [`server`] — a WebSocket signaling server that tracks rooms and
//!   participants, relays SDP/ICE between peers and broadcasts room
//!   lifecycle events.
//! * [`client`] — a peer connection manager that joins a room through the
//!   signaling server and maintains one `RTCPeerConnection` per remote
//!   participant in a full mesh.

pub mod audit;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;

pub use client::{
    ChatEntry, JoinRequest, ManagerCommand, ManagerHandle, MediaToggle, PeerConnectionManager,
    RoomUpdate,
};
pub use config::{IceConfig, QualityPreset, RtcConfig, TurnConfig};
pub use error::{GreenroomError, Result};
pub use protocol::{ClientEvent, ConnectionId, RoomId, ServerEvent, UserId};
pub use server::SignalingServer;
