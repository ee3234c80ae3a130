use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Kind of security event recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// Password accepted, session issued.
    LoginSuccess,
    /// Password rejected.
    LoginFailure,
    /// Session ended by its owner.
    Logout,
    /// Session removed by id from the session list.
    SessionRevoked,
    /// First-time password setup.
    PasswordConfigured,
    /// Password rotated; all other sessions dropped.
    PasswordChanged,
    /// Failure threshold reached for an actor.
    LockoutTriggered,
}

/// A single immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event: AuditEvent,
    /// Session the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Client device id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Client IP of the caller.
    pub actor: String,
    /// Event-specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEntry {
    /// Start an entry stamped with the current time.
    pub fn new(event: AuditEvent, actor: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            session_id: None,
            device_id: None,
            actor: actor.into(),
            metadata: None,
        }
    }

    /// Attach the session the event concerns.
    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Attach the client device id.
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Attach free-form metadata. Never put secrets here.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Batching parameters for the audit writer.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Entries buffered before a write is forced.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time an entry waits in the buffer.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Entries kept in memory for `GET /api/auth/log`.
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            recent_capacity: default_recent_capacity(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_flush_interval_ms() -> u64 {
    1_000
}
fn default_recent_capacity() -> usize {
    500
}

enum Command {
    Record(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only audit log. Entries are buffered and written to
/// `<log_dir>/audit.jsonl` in batches by a background task.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<Command>,
    recent: Mutex<VecDeque<AuditEntry>>,
    recent_capacity: usize,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns the batch writer, so this must be called
    /// from within a Tokio runtime.
    pub fn new(log_dir: PathBuf, config: AuditConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let path = log_dir.join("audit.jsonl");

        tokio::spawn(run_writer(path.clone(), config.clone(), rx));

        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(config.recent_capacity)),
            recent_capacity: config.recent_capacity,
            path,
        }
    }

    /// Queue `entry`. Never blocks; the batch is written on the next flush.
    pub fn log(&self, entry: AuditEntry) {
        info!(
            event = ?entry.event,
            actor = %entry.actor,
            session_id = ?entry.session_id,
            device_id = ?entry.device_id,
            "audit"
        );

        if self.recent_capacity > 0 {
            let mut recent = self.recent.lock();
            if recent.len() == self.recent_capacity {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }

        if self.tx.send(Command::Record(entry)).is_err() {
            warn!("Audit writer is gone, entry kept in memory only");
        }
    }

    /// Shorthand for the common case of an event with an actor and an
    /// optional session.
    pub fn log_event(
        &self,
        event: AuditEvent,
        actor: &str,
        session_id: Option<Uuid>,
        device_id: Option<&str>,
    ) {
        let mut entry = AuditEntry::new(event, actor);
        entry.session_id = session_id;
        entry.device_id = device_id.map(str::to_string);
        self.log(entry);
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Write out everything buffered so far and wait for the write to finish.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Path of the JSONL file entries are appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn run_writer(path: PathBuf, config: AuditConfig, mut rx: mpsc::UnboundedReceiver<Command>) {
    if let Some(dir) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            error!(error = %e, dir = %dir.display(), "Failed to create audit directory");
        }
    }

    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<AuditEntry> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Record(entry)) => {
                    batch.push(entry);
                    if batch.len() >= batch_size {
                        write_batch(&path, &mut batch).await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    write_batch(&path, &mut batch).await;
                    let _ = ack.send(());
                }
                None => {
                    write_batch(&path, &mut batch).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                write_batch(&path, &mut batch).await;
            }
        }
    }
}

async fn write_batch(path: &Path, batch: &mut Vec<AuditEntry>) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len();
    let mut buf = String::new();
    for entry in batch.drain(..) {
        match serde_json::to_string(&entry) {
            Ok(line) => {
                buf.push_str(&line);
                buf.push('\n');
            }
            Err(e) => warn!(error = %e, "Dropping unserializable audit entry"),
        }
    }

    let result: std::io::Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_data().await
    }
    .await;

    if let Err(e) = result {
        error!(error = %e, path = %path.display(), count, "Failed to write audit batch");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recent_is_newest_first_and_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(
            tmp.path().to_path_buf(),
            AuditConfig {
                recent_capacity: 3,
                ..AuditConfig::default()
            },
        );

        for i in 0..5 {
            audit.log(
                AuditEntry::new(AuditEvent::LoginFailure, "10.0.0.1")
                    .with_metadata(serde_json::json!({ "attempt": i })),
            );
        }

        let recent = audit.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].metadata.as_ref().unwrap()["attempt"], 4);
        assert_eq!(recent[2].metadata.as_ref().unwrap()["attempt"], 2);
        assert_eq!(audit.recent(1).len(), 1);
    }

    #[test]
    fn test_entry_serializes_camel_case_and_skips_empty() {
        let entry = AuditEntry::new(AuditEvent::SessionRevoked, "127.0.0.1")
            .with_session(Uuid::nil())
            .with_device("laptop");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event"], "session_revoked");
        assert_eq!(json["deviceId"], "laptop");
        assert!(json.get("sessionId").is_some());
        assert!(json.get("metadata").is_none());
    }
}
