use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// `Unauthorized`, `RoomNotFound` and `RoomInactive` surface to the remote
/// client as an `error` signaling event; the rest stay on the local side.
#[derive(Debug, Error)]
pub enum GreenroomError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("room is no longer active: {0}")]
    RoomInactive(String),

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("audit sink: {0}")]
    Audit(String),

    #[error("signaling channel closed")]
    SignalingClosed,

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GreenroomError {
    /// Message suitable for an `error` event sent back to a client.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, GreenroomError>;
