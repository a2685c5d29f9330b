//! WebSocket transport for the signaling server.
//!
//! Each accepted socket gets a fresh [`ConnectionId`] and two pumps: reads
//! are parsed into [`ServerCommand::Event`]s for the actor, writes drain the
//! connection's outbound event queue. Transport code holds no room state.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{ClientEvent, ConnectionId, ServerEvent};
use crate::server::ServerCommand;

/// Accept connections until the listener or the command channel dies.
pub async fn serve(
    listener: TcpListener,
    commands: mpsc::UnboundedSender<ServerCommand>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "signaling transport listening");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!(%peer_addr, "inbound connection");
        tokio::spawn(handle_socket(stream, commands.clone()));
    }
}

async fn handle_socket(stream: TcpStream, commands: mpsc::UnboundedSender<ServerCommand>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    let connection = ConnectionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    // Kept for replying to malformed frames without a round trip through
    // the actor.
    let direct = tx.clone();
    if commands
        .send(ServerCommand::Open { connection, sender: tx })
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to encode outbound event");
                    continue;
                }
            };
            if write.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%connection, error = %err, "read error, closing");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    if commands
                        .send(ServerCommand::Event { connection, event })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%connection, error = %err, "malformed signaling payload");
                    let _ = direct.send(ServerEvent::Error {
                        message: format!("malformed payload: {err}"),
                    });
                }
            },
            Message::Close(_) => break,
            // Pings are answered by tungstenite itself; binary frames are
            // not part of the protocol.
            _ => {}
        }
    }

    let _ = commands.send(ServerCommand::Closed { connection });
    writer.abort();
    debug!(%connection, "connection closed");
}
