//! Snapshot blob storage.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Path-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `content` at `path`. Without `overwrite`, an existing blob is an error.
    async fn upload(&self, path: &str, content: &[u8], overwrite: bool) -> SyncResult<()>;

    /// Reads the blob at `path`. A missing blob is `Ok(None)`.
    async fn download(&self, path: &str) -> SyncResult<Option<Vec<u8>>>;
}

/// In-memory blob store. Clones share contents.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    failing: Arc<AtomicBool>,
    uploads: Arc<AtomicU64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a storage error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful uploads so far.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("blob store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, content: &[u8], overwrite: bool) -> SyncResult<()> {
        self.check()?;
        let mut blobs = self.blobs.write().await;
        if !overwrite && blobs.contains_key(path) {
            return Err(SyncError::Storage(format!("blob already exists: {path}")));
        }
        blobs.insert(path.to_string(), content.to_vec());
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.blobs.read().await.get(path).cloned())
    }
}

/// Blob store over a local folder, e.g. a cloud-drive mount.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a half-written snapshot.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a blob path below the root, rejecting anything that escapes it.
    fn resolve(&self, path: &str) -> SyncResult<PathBuf> {
        let relative = Path::new(path);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !clean {
            return Err(SyncError::Storage(format!("invalid blob path: {path}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, path: &str, content: &[u8], overwrite: bool) -> SyncResult<()> {
        let target = self.resolve(path)?;
        if !overwrite && fs::try_exists(&target).await.unwrap_or(false) {
            return Err(SyncError::Storage(format!("blob already exists: {path}")));
        }
        if let Some(parent) = target.parent() {
            if !fs::try_exists(parent).await.unwrap_or(false) {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::Storage(format!("failed to create folder: {e}")))?;
                info!("Created blob folder: {:?}", parent);
            }
        }

        debug!("Writing blob {:?} ({} bytes)", target, content.len());
        let temp = target.with_extension("tmp");
        fs::write(&temp, content)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to write blob: {e}")))?;
        fs::rename(&temp, &target)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to move blob into place: {e}")))?;
        Ok(())
    }

    async fn download(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(content) => {
                debug!("Read blob {:?} ({} bytes)", target, content.len());
                Ok(Some(content))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Storage(format!("failed to read blob: {e}"))),
        }
    }
}
