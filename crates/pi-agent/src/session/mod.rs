pub mod compact;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use tokio::io::AsyncWriteExt;
use tracing::{
    debug,
    warn,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionRecordKind {
    UserMessage,
    AssistantMessage,
    ToolResult,
    UsageUpdate,
    ModeChange,
}

/// One append-only entry in a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub kind: SessionRecordKind,
    pub payload: serde_json::Value,
}

/// Summary row returned by [SessionStore::list_sessions].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub record_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session '{}' does not exist", .0)]
    NotFound(String),
    #[error("Failed to access session storage: {}", .0)]
    Io(#[from] std::io::Error),
    #[error("Failed to encode or decode a record: {}", .0)]
    Serialization(#[from] serde_json::Error),
}

/// Appends conversation records to durable, per-session JSONL files.
///
/// Records are one per line, timestamp-ordered by append time; there is no
/// in-place mutation.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn sessions_dir(&self) -> &PathBuf {
        &self.sessions_dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", session_id))
    }

    pub async fn append(&self, record: &SessionRecord) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(&record.session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn read_records(&self, session_id: &str) -> Result<Vec<SessionRecord>, SessionError> {
        let path = self.session_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(session_id.to_string()));
            },
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(?err, session_id, "skipping malformed session record"),
            }
        }
        Ok(records)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let mut summaries = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let records = match self.read_records(&id).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(?err, id, "skipping unreadable session");
                    continue;
                },
            };
            let first = records.first();
            summaries.push(SessionSummary {
                created_at: first.map(|r| r.timestamp),
                model: first
                    .and_then(|r| r.payload.get("model"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                cwd: first
                    .and_then(|r| r.payload.get("cwd"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                record_count: records.len(),
                id,
            });
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Copies the first `up_to` records (all of them when [None]) into a new
    /// session with a fresh random id, returning the new id.
    pub async fn fork(&self, session_id: &str, up_to: Option<usize>) -> Result<String, SessionError> {
        let records = self.read_records(session_id).await?;
        let new_id = Uuid::new_v4().to_string();
        let take = up_to.unwrap_or(records.len());
        for record in records.into_iter().take(take) {
            let forked = SessionRecord {
                session_id: new_id.clone(),
                ..record
            };
            self.append(&forked).await?;
        }
        debug!(from = session_id, to = %new_id, "forked session");
        Ok(new_id)
    }
}

/// Binds a store to one session id for use inside the agent loop.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    store: Arc<SessionStore>,
    session_id: String,
}

impl SessionRecorder {
    pub fn new(store: Arc<SessionStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Appends a record, logging rather than failing the caller: persistence
    /// problems must not take down a running turn.
    pub async fn record<T: Serialize>(&self, kind: SessionRecordKind, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(?err, "failed to serialize session payload");
                return;
            },
        };
        let record = SessionRecord {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            kind,
            payload,
        };
        if let Err(err) = self.store.append(&record).await {
            warn!(?err, "failed to append session record");
        }
    }
}
