//! Session persistence layer
//!
//! Durable mapping from session id to transcript. A missing session is an
//! empty transcript, and an unreadable one is too (with a warning). Writes go
//! through a temp file and rename so a crash never leaves a partial record.

use crate::error::ChatbotError;
use crate::memory::store::{Message, Transcript};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const RECORD_VERSION: u32 = 1;

/// Trait for transcript persistence
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Stored transcript, or a fresh empty one. Never fails on absence or corruption.
    async fn load(&self, session_id: &str) -> Transcript;

    /// Durably replace the stored transcript.
    async fn save(&self, session_id: &str, transcript: &Transcript) -> Result<()>;
}

/// On-disk record for one session
#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    version: u32,
    session_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

impl SessionRecord {
    fn from_transcript(session_id: &str, transcript: &Transcript) -> Self {
        Self {
            version: RECORD_VERSION,
            session_id: session_id.to_string(),
            created_at: transcript.created_at,
            updated_at: transcript.updated_at,
            messages: transcript.messages().to_vec(),
        }
    }

    /// Reject anything that could not have been written by `save`.
    fn into_transcript(self, expected_id: &str) -> Result<Transcript> {
        if self.version != RECORD_VERSION {
            return Err(ChatbotError::StorageRead(format!(
                "unsupported record version {}",
                self.version
            )));
        }
        if self.session_id != expected_id {
            return Err(ChatbotError::StorageRead(format!(
                "record belongs to session '{}'",
                self.session_id
            )));
        }
        if self.messages.iter().any(|m| m.content.is_empty()) {
            return Err(ChatbotError::StorageRead("record contains an empty message".into()));
        }

        Ok(Transcript::from_parts(
            self.session_id,
            self.created_at,
            self.updated_at,
            self.messages,
        ))
    }
}

/// One JSON file per session under a history directory
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Open (creating if needed) the history directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ChatbotError::StorageWrite(format!(
                "cannot create history directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Session ids are caller-supplied, so the file name is derived from a hash.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let digest = Sha256::digest(session_id.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    async fn read_record(&self, session_id: &str) -> Result<Option<Transcript>> {
        let path = self.path_for(session_id);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ChatbotError::StorageRead(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let record: SessionRecord = serde_json::from_slice(&bytes).map_err(|e| {
            ChatbotError::StorageRead(format!("cannot parse {}: {}", path.display(), e))
        })?;

        record.into_transcript(session_id).map(Some)
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, session_id: &str) -> Transcript {
        match self.read_record(session_id).await {
            Ok(Some(transcript)) => {
                debug!(session_id, messages = transcript.len(), "Loaded transcript");
                transcript
            }
            Ok(None) => Transcript::new(session_id),
            Err(error) => {
                warn!(
                    session_id,
                    "Session history unreadable, starting from an empty transcript: {}", error
                );
                Transcript::new(session_id)
            }
        }
    }

    async fn save(&self, session_id: &str, transcript: &Transcript) -> Result<()> {
        let record = SessionRecord::from_transcript(session_id, transcript);
        let bytes = serde_json::to_vec_pretty(&record)?;

        write_atomic(&self.path_for(session_id), &bytes)
            .await
            .map_err(|e| ChatbotError::StorageWrite(format!("session '{}': {}", session_id, e)))
    }
}

/// Write `bytes` to `path` via a sibling temp file, fsync, and rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }

    result
}

/// In-memory session store for development and tests
pub struct InMemorySessionStore {
    transcripts: Arc<RwLock<HashMap<String, Transcript>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            transcripts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.transcripts.read().await.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Transcript {
        let transcripts = self.transcripts.read().await;
        transcripts
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| Transcript::new(session_id))
    }

    async fn save(&self, session_id: &str, transcript: &Transcript) -> Result<()> {
        let mut transcripts = self.transcripts.write().await;
        transcripts.insert(session_id.to_string(), transcript.clone());
        Ok(())
    }
}
