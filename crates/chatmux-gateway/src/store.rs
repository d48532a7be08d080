//! File-backed session persistence.
//!
//! One JSON object per file, keyed by session id. Records are read once at
//! startup and written on every mutation.

use crate::Result;
use chatmux_core::types::{Session, SessionId, TurnStatus};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A persisted session with its accumulated transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The session itself.
    pub session: Session,

    /// Completed turns, oldest first.
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
}

impl SessionRecord {
    /// Record for a session with no completed turns yet.
    pub fn new(session: Session) -> Self {
        Self {
            session,
            transcript: Vec::new(),
        }
    }
}

/// One completed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Inbound message text.
    pub prompt: String,

    /// Accumulated assistant reply.
    pub reply: String,

    /// How the turn ended.
    pub status: TurnStatus,

    /// Completion timestamp.
    pub at: chrono::DateTime<chrono::Utc>,
}

impl TranscriptEntry {
    /// Entry for a turn that just finished.
    pub fn new(prompt: impl Into<String>, reply: impl Into<String>, status: TurnStatus) -> Self {
        Self {
            prompt: prompt.into(),
            reply: reply.into(),
            status,
            at: chrono::Utc::now(),
        }
    }
}

/// Directory of session record files.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the session directory under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("sessions");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Load every record in the store.
    ///
    /// Runtime-only session fields are cleared: a restart never resurrects
    /// an in-flight turn or a worker assignment. Unreadable files are
    /// skipped with a warning rather than failing startup.
    pub fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_file(&path) {
                Ok(mut record) => {
                    record.session.reset_runtime_state();
                    records.push(record);
                }
                Err(e) => warn!("skipping unreadable session file {:?}: {}", path, e),
            }
        }
        Ok(records)
    }

    fn load_file(&self, path: &Path) -> Result<SessionRecord> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?)
    }

    /// Write a record atomically (temp file + rename).
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.record_path(&record.session.id);
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Remove a record. Missing files are not an error.
    pub fn delete(&self, id: &SessionId) -> Result<()> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn record_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}
