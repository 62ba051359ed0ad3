//! Persistence of session records and conflict notices.

use super::types::SessionRecord;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bandstand_crdt::DocName;
use bandstand_types::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// An update that could not be applied, surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub session_id: Option<SessionId>,
    pub document: Option<DocName>,
    pub peer_id: Option<String>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl ConflictInfo {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            session_id: None,
            document: None,
            peer_id: None,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Durable store for session records.
///
/// Only what is needed to reconnect lives here; rosters and presence stay
/// in the session replica.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, record: &SessionRecord) -> SyncResult<()>;

    async fn load_sessions(&self) -> SyncResult<Vec<SessionRecord>>;

    /// Returns whether a record was removed.
    async fn remove_session(&self, id: &SessionId) -> SyncResult<bool>;

    async fn record_conflict(&self, conflict: ConflictInfo) -> SyncResult<()>;

    async fn conflicts(&self) -> SyncResult<Vec<ConflictInfo>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreContents {
    #[serde(default)]
    sessions: BTreeMap<SessionId, SessionRecord>,
    #[serde(default)]
    conflicts: Vec<ConflictInfo>,
}

impl StoreContents {
    fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.values().cloned().collect()
    }
}

/// Conflicts kept per store; older ones are dropped first.
const MAX_CONFLICTS: usize = 256;

fn push_conflict(conflicts: &mut Vec<ConflictInfo>, conflict: ConflictInfo) {
    conflicts.push(conflict);
    if conflicts.len() > MAX_CONFLICTS {
        let excess = conflicts.len() - MAX_CONFLICTS;
        conflicts.drain(..excess);
    }
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    contents: RwLock<StoreContents>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save_session(&self, record: &SessionRecord) -> SyncResult<()> {
        self.contents
            .write()
            .await
            .sessions
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_sessions(&self) -> SyncResult<Vec<SessionRecord>> {
        Ok(self.contents.read().await.sessions())
    }

    async fn remove_session(&self, id: &SessionId) -> SyncResult<bool> {
        Ok(self.contents.write().await.sessions.remove(id).is_some())
    }

    async fn record_conflict(&self, conflict: ConflictInfo) -> SyncResult<()> {
        push_conflict(&mut self.contents.write().await.conflicts, conflict);
        Ok(())
    }

    async fn conflicts(&self) -> SyncResult<Vec<ConflictInfo>> {
        Ok(self.contents.read().await.conflicts.clone())
    }
}

/// Session store in a single JSON file.
///
/// Every mutation rewrites the file through a temporary sibling.
pub struct JsonSessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> SyncResult<StoreContents> {
        match fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(contents) => Ok(contents),
                Err(e) => {
                    warn!("Session store {:?} is unreadable, starting empty: {}", self.path, e);
                    Ok(StoreContents::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreContents::default()),
            Err(e) => Err(SyncError::Storage(format!("failed to read session store: {e}"))),
        }
    }

    async fn write(&self, contents: &StoreContents) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Storage(format!("failed to create store folder: {e}")))?;
        }
        let json = serde_json::to_vec_pretty(contents)?;
        let temp = self.path.with_extension("tmp");
        fs::write(&temp, &json)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to write session store: {e}")))?;
        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to replace session store: {e}")))?;
        debug!("Wrote session store {:?} ({} bytes)", self.path, json.len());
        Ok(())
    }

    async fn update<F>(&self, mutate: F) -> SyncResult<StoreContents>
    where
        F: FnOnce(&mut StoreContents) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut contents = self.read().await?;
        mutate(&mut contents);
        self.write(&contents).await?;
        Ok(contents)
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn save_session(&self, record: &SessionRecord) -> SyncResult<()> {
        let record = record.clone();
        self.update(move |c| {
            c.sessions.insert(record.id.clone(), record);
        })
        .await?;
        Ok(())
    }

    async fn load_sessions(&self) -> SyncResult<Vec<SessionRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.sessions())
    }

    async fn remove_session(&self, id: &SessionId) -> SyncResult<bool> {
        let mut removed = false;
        self.update(|c| removed = c.sessions.remove(id).is_some())
            .await?;
        Ok(removed)
    }

    async fn record_conflict(&self, conflict: ConflictInfo) -> SyncResult<()> {
        self.update(move |c| push_conflict(&mut c.conflicts, conflict))
            .await?;
        Ok(())
    }

    async fn conflicts(&self) -> SyncResult<Vec<ConflictInfo>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.conflicts)
    }
}
