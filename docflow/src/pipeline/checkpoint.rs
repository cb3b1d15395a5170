//! Checkpoint persistence for crash-resumable runs.
//!
//! A checkpoint is written after every completed wave. It records the
//! document, the stage results so far, and the content hash of the pipeline
//! configuration that produced them; a checkpoint whose hash no longer
//! matches is stale and discarded on resume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::document::{Document, DocumentId};
use super::error::CheckpointError;
use super::result::StageResult;

/// Persisted state of a partially processed document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub document: Document,
    pub config_hash: String,
    pub results: BTreeMap<String, StageResult>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn document_id(&self) -> &DocumentId {
        &self.document.id
    }
}

/// Pluggable checkpoint backend.
pub trait CheckpointStore: Send + Sync {
    /// Writes (or replaces) the checkpoint for its document.
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<(), CheckpointError>>;

    /// Reads the checkpoint for a document. `Ok(None)` if there is none.
    fn load<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, CheckpointError>>;

    /// Removes the checkpoint for a document. Removing nothing is not an error.
    fn delete<'a>(&'a self, document_id: &'a DocumentId) -> BoxFuture<'a, Result<(), CheckpointError>>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Checkpoints kept in process memory. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<DocumentId, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, document_id: &DocumentId) -> bool {
        self.entries.contains_key(document_id)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(async move {
            self.entries
                .insert(checkpoint.document.id.clone(), checkpoint.clone());
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, CheckpointError>> {
        Box::pin(async move { Ok(self.entries.get(document_id).map(|e| e.value().clone())) })
    }

    fn delete<'a>(&'a self, document_id: &'a DocumentId) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(async move {
            self.entries.remove(document_id);
            Ok(())
        })
    }
}

// =============================================================================
// File store
// =============================================================================

/// Checkpoints stored as `<root>/<document id>.json`.
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the checkpoint file for a document.
    pub fn path_for(&self, document_id: &DocumentId) -> PathBuf {
        self.root
            .join(format!("{}.json", sanitize_file_stem(document_id.as_str())))
    }
}

/// Replaces characters that are unsafe in file names.
fn sanitize_file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // Never produce "." or ".." or a hidden file.
    if stem.starts_with('.') {
        format!("_{}", stem)
    } else if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(async move {
            let path = self.path_for(&checkpoint.document.id);
            let json = serde_json::to_vec_pretty(checkpoint)?;

            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|source| CheckpointError::Io {
                    path: self.root.clone(),
                    source,
                })?;

            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &json)
                .await
                .map_err(|source| CheckpointError::Io {
                    path: tmp.clone(),
                    source,
                })?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|source| CheckpointError::Io {
                    path: path.clone(),
                    source,
                })?;

            debug!(
                document_id = %checkpoint.document.id,
                path = %path.display(),
                stages = checkpoint.results.len(),
                "Checkpoint written"
            );
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, CheckpointError>> {
        Box::pin(async move {
            let path = self.path_for(document_id);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(CheckpointError::Io { path, source }),
            };

            let checkpoint: Checkpoint =
                serde_json::from_slice(&data).map_err(|source| CheckpointError::Corrupt {
                    document: document_id.to_string(),
                    source,
                })?;

            // Two ids can sanitize to the same file name.
            if &checkpoint.document.id != document_id {
                return Ok(None);
            }
            Ok(Some(checkpoint))
        })
    }

    fn delete<'a>(&'a self, document_id: &'a DocumentId) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(async move {
            let path = self.path_for(document_id);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(CheckpointError::Io { path, source }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ErrorDetail, ErrorKind};
    use crate::processor::StageOutput;
    use std::time::Duration;

    fn checkpoint(id: &str) -> Checkpoint {
        let mut results = BTreeMap::new();
        results.insert(
            "parse".to_string(),
            StageResult::success(StageOutput::text("hello"), Duration::from_millis(5), 1),
        );
        results.insert(
            "ocr".to_string(),
            StageResult::failed(
                ErrorDetail::new(ErrorKind::Unrecoverable, "bad scan"),
                Duration::from_millis(7),
                1,
            ),
        );
        let now = Utc::now();
        Checkpoint {
            document: Document::from_id(&DocumentId::new(id)),
            config_hash: "abc".to_string(),
            results,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCheckpointStore::new();
        let cp = checkpoint("doc-1");
        let id = cp.document_id().clone();

        assert!(store.load(&id).await.unwrap().is_none());
        store.save(&cp).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), Some(cp));

        store.delete(&id).await.unwrap();
        assert!(store.is_empty());
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let cp = checkpoint("doc-1");
        let id = cp.document_id().clone();

        store.save(&cp).await.unwrap();
        assert!(store.path_for(&id).exists());
        assert_eq!(store.load(&id).await.unwrap(), Some(cp.clone()));

        let mut updated = cp;
        updated.errors.push("retry later".to_string());
        store.save(&updated).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap().unwrap().errors.len(), 1);

        store.delete(&id).await.unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load(&DocumentId::new("nope")).await.unwrap().is_none());
        store.delete(&DocumentId::new("nope")).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let id = DocumentId::new("broken");
        std::fs::write(store.path_for(&id), b"{not json").unwrap();

        let err = store.load(&id).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_file_store_colliding_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint("a/b")).await.unwrap();

        let other = DocumentId::new("a:b");
        assert_eq!(store.path_for(&other), store.path_for(&DocumentId::new("a/b")));
        assert!(store.load(&other).await.unwrap().is_none());
    }

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(sanitize_file_stem("report-2024.pdf"), "report-2024.pdf");
        assert_eq!(sanitize_file_stem("../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_stem(""), "_");
    }
}
