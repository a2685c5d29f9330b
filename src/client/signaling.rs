//! Client side of the signaling channel.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{ClientEvent, ServerEvent};

/// WebSocket connection to the signaling server: one pump writing queued
/// [`ClientEvent`]s, one pump decoding inbound [`ServerEvent`]s.
pub struct SignalingClient {
    tx: mpsc::Sender<ClientEvent>,
    rx: mpsc::Receiver<ServerEvent>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientEvent>(100);

        tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, "failed to encode signaling event");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            // Queue dropped: the client is leaving. Start the close
            // handshake so the server sees a disconnect promptly.
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(error = %err, "signaling read failed");
                        break;
                    }
                };
                let Message::Text(text) = msg else { continue };
                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "unrecognized signaling event"),
                }
            }
        });

        Ok(Self { tx: outgoing_tx, rx: inbound_rx })
    }

    /// Queue an event for the server. Fails only once the transport is gone.
    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| crate::error::GreenroomError::SignalingClosed)
    }

    /// Next server event; `None` once the transport closed.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}
