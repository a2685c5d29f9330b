//! Standalone signaling server.
//!
//! Configuration comes from the environment:
//! * `GREENROOM_ADDR` — listen address, default `0.0.0.0:9090`
//! * `GREENROOM_USERS` — path to a token-to-identity JSON map; when unset
//!   any non-empty token is accepted
//! * `GREENROOM_AUDIT_LOG` — JSON-lines audit file; when unset audit
//!   entries go to the log stream

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use greenroom::audit::{AuditLogger, AuditSink, JsonLineSink, TracingSink};
use greenroom::auth::{IdentityProvider, PermissiveIdentityProvider, StaticIdentityProvider};
use greenroom::server::{ws, SignalingServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("greenroom=info")),
        )
        .init();

    let addr = std::env::var("GREENROOM_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_owned());

    let identity: Arc<dyn IdentityProvider> = match std::env::var("GREENROOM_USERS") {
        Ok(path) => {
            info!(%path, "loading identities");
            Arc::new(
                StaticIdentityProvider::from_json_file(Path::new(&path))
                    .with_context(|| format!("loading identities from {path}"))?,
            )
        }
        Err(_) => {
            warn!("GREENROOM_USERS not set; accepting any non-empty token");
            Arc::new(PermissiveIdentityProvider)
        }
    };

    let sink: Arc<dyn AuditSink> = match std::env::var("GREENROOM_AUDIT_LOG") {
        Ok(path) => Arc::new(JsonLineSink::new(path.into())),
        Err(_) => Arc::new(TracingSink),
    };
    let audit = AuditLogger::spawn(sink);

    let (commands_tx, commands_rx) = SignalingServer::command_channel();
    let server = SignalingServer::new(identity, audit);
    tokio::spawn(server.run(commands_rx));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tokio::select! {
        result = ws::serve(listener, commands_tx) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
