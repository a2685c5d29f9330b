//! Fire-and-forget activity audit trail.
//!
//! Room lifecycle and participant events are queued onto an unbounded
//! channel and written by a background task. [`AuditLogger::record`] never
//! blocks and never fails the signaling operation it accompanies; a sink
//! failure is reported to the operator log and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{GreenroomError, Result};
use crate::protocol::{RoomId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RoomCreated,
    UserJoined,
    UserDisconnected,
    RoomClosed,
    HostChanged,
}

/// Write-once, append-only entry. Never read back by the signaling path.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub action: AuditAction,
    pub details: Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(user_id: UserId, room_id: RoomId, action: AuditAction, details: Value) -> Self {
        Self { user_id, room_id, action, details, at: Utc::now() }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<()>;
}

/// Handle held by the signaling server. Cheap to clone; dropping every clone
/// shuts the background writer down.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl AuditLogger {
    pub fn spawn(sink: Arc<dyn AuditSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(err) = sink.append(entry).await {
                    warn!(error = %err, "audit write failed, entry dropped");
                }
            }
        });
        Self { tx }
    }

    /// Queue an entry. Send failure means the writer task is gone, which is
    /// only possible during shutdown; either way the caller proceeds.
    pub fn record(&self, entry: AuditEntry) {
        let _ = self.tx.send(entry);
    }
}

/// Sink that emits entries to the operator log. Default for the binary when
/// no audit file is configured.
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        tracing::info!(
            user = %entry.user_id,
            room = %entry.room_id,
            action = ?entry.action,
            details = %entry.details,
            "audit"
        );
        Ok(())
    }
}

/// Append-only JSON-lines file sink.
pub struct JsonLineSink {
    path: PathBuf,
}

impl JsonLineSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl AuditSink for JsonLineSink {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| GreenroomError::Audit(format!("open {}: {e}", self.path.display())))?;
        file.write_all(&line)
            .await
            .map_err(|e| GreenroomError::Audit(format!("write {}: {e}", self.path.display())))?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{FailingSink, RecordingSink};
    use super::*;
    use std::time::Duration;

    fn entry(action: AuditAction) -> AuditEntry {
        AuditEntry::new("u1".into(), "r1".into(), action, Value::Null)
    }

    #[tokio::test]
    async fn entries_reach_the_sink_in_order() {
        let (sink, entries) = RecordingSink::new();
        let logger = AuditLogger::spawn(Arc::new(sink));
        logger.record(entry(AuditAction::RoomCreated));
        logger.record(entry(AuditAction::UserJoined));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = entries.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].action, AuditAction::RoomCreated);
        assert_eq!(seen[1].action, AuditAction::UserJoined);
    }

    #[tokio::test]
    async fn sink_failure_never_reaches_the_caller() {
        let logger = AuditLogger::spawn(Arc::new(FailingSink));
        // Both calls return immediately; the failure is logged and dropped.
        logger.record(entry(AuditAction::UserDisconnected));
        logger.record(entry(AuditAction::RoomClosed));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
