//! Per-peer-connection lifecycle tracking.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Lifecycle of one peer connection. Strictly forward:
/// `Signaling -> Connected -> Closed`, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Signaling,
    Connected,
    Closed,
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerPhase::Signaling => write!(f, "signaling"),
            PeerPhase::Connected => write!(f, "connected"),
            PeerPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Watch-channel wrapper the UI and the manager subscribe to.
#[derive(Clone)]
pub struct ConnectionMonitor {
    tx: Arc<watch::Sender<PeerPhase>>,
    rx: watch::Receiver<PeerPhase>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(PeerPhase::Signaling);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn phase(&self) -> PeerPhase {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerPhase> {
        self.rx.clone()
    }

    /// Closed is sticky: a late `Connected` callback from the ICE stack
    /// must not resurrect a torn-down session.
    pub fn set(&self, phase: PeerPhase) {
        self.tx.send_if_modified(|current| {
            if *current == PeerPhase::Closed || *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    pub fn update_from_peer_state(&self, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Connected => self.set(PeerPhase::Connected),
            RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Closed => self.set(PeerPhase::Closed),
            // New / Connecting stay in the signaling phase.
            _ => {}
        }
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
