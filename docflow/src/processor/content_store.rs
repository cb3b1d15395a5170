//! Content-addressed storage for large stage outputs.
//!
//! Outputs above the inline payload limit are written here and the pipeline
//! context keeps only a [`ContentId`]. Identifiers are the SHA-256 of the
//! content, so writing the same bytes twice stores them once.

use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// SHA-256 address of stored content (lowercase hex).
#[derive(Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Computes the address of `data`.
    pub fn for_content(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let hex = digest.iter().fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{:02x}", b);
            out
        });
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", &self.0[..self.0.len().min(12)])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content store errors.
#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("content store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Storage backend for offloaded payloads.
pub trait ContentStore: Send + Sync {
    /// Stores `data` and returns its address.
    fn put(&self, data: Bytes) -> BoxFuture<'_, Result<ContentId, ContentStoreError>>;

    /// Fetches content by address. `Ok(None)` if absent.
    fn get<'a>(&'a self, id: &'a ContentId)
        -> BoxFuture<'a, Result<Option<Bytes>, ContentStoreError>>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Content store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    entries: DashMap<ContentId, Bytes>,
    total_bytes: AtomicU64,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held across all entries.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, data: Bytes) -> BoxFuture<'_, Result<ContentId, ContentStoreError>> {
        Box::pin(async move {
            let id = ContentId::for_content(&data);
            let len = data.len() as u64;
            if self.entries.insert(id.clone(), data).is_none() {
                self.total_bytes.fetch_add(len, Ordering::Relaxed);
            }
            Ok(id)
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a ContentId,
    ) -> BoxFuture<'a, Result<Option<Bytes>, ContentStoreError>> {
        Box::pin(async move { Ok(self.entries.get(id).map(|e| e.value().clone())) })
    }
}

// =============================================================================
// File store
// =============================================================================

/// Content store writing one file per address under a root directory.
#[derive(Debug, Clone)]
pub struct FileContentStore {
    root: PathBuf,
}

impl FileContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &ContentId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

impl ContentStore for FileContentStore {
    fn put(&self, data: Bytes) -> BoxFuture<'_, Result<ContentId, ContentStoreError>> {
        Box::pin(async move {
            let id = ContentId::for_content(&data);
            let path = self.path_for(&id);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(id);
            }

            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|source| ContentStoreError::Io {
                    path: self.root.clone(),
                    source,
                })?;

            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &data)
                .await
                .map_err(|source| ContentStoreError::Io {
                    path: tmp.clone(),
                    source,
                })?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|source| ContentStoreError::Io {
                    path: path.clone(),
                    source,
                })?;
            Ok(id)
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a ContentId,
    ) -> BoxFuture<'a, Result<Option<Bytes>, ContentStoreError>> {
        Box::pin(async move {
            let path = self.path_for(id);
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(ContentStoreError::Io { path, source }),
            }
        })
    }
}
