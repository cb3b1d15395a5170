//! Pipeline manager.
//!
//! The [`PipelineManager`] drives one document at a time through a validated
//! [`PipelineGraph`]:
//!
//! 1. Stages whose dependencies all succeeded form the next wave
//! 2. Each wave stage is resolved in the registry and submitted to the
//!    worker pool, retrying failed attempts with backoff
//! 3. Results are written back into the [`PipelineContext`] by this loop
//!    only, and a checkpoint is saved after every wave
//! 4. Dependents of failed or skipped stages are skipped
//!
//! A run can be cancelled through its token, or by the optional
//! pipeline-wide timeout. Already-written checkpoints stay valid, so a
//! cancelled run can later be resumed.
//!
//! # Example
//!
//! ```ignore
//! let graph = Arc::new(PipelineGraph::build(config)?);
//! let manager = PipelineManager::new(graph, registry, pool)
//!     .with_progress(tracker)
//!     .with_checkpoint_store(Arc::new(FileCheckpointStore::new("/var/lib/docflow")));
//!
//! let result = manager.execute(Document::new("doc-1", "/data/doc-1.pdf")).await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use super::context::PipelineContext;
use super::document::{Document, DocumentId};
use super::error::CheckpointError;
use super::graph::PipelineGraph;
use super::result::PipelineResult;
use crate::executor::WorkerPool;
use crate::metrics::MetricsClient;
use crate::processor::{ContentStore, MemoryContentStore, ProcessorRegistry};
use crate::progress::ProgressTracker;

/// Delay before resubmitting a task to a full lane.
pub const DEFAULT_SUBMIT_RETRY_DELAY_MS: u64 = 10;

/// Orchestrates pipeline runs over a shared registry and worker pool.
pub struct PipelineManager {
    pub(super) graph: Arc<PipelineGraph>,
    pub(super) registry: Arc<ProcessorRegistry>,
    pub(super) pool: Arc<WorkerPool>,
    pub(super) progress: Option<Arc<ProgressTracker>>,
    pub(super) checkpoints: Arc<dyn CheckpointStore>,
    pub(super) content_store: Arc<dyn ContentStore>,
    pub(super) metrics: Option<MetricsClient>,
    pub(super) submit_retry_delay: Duration,
}

impl PipelineManager {
    /// Creates a manager with in-memory checkpoint and content stores.
    pub fn new(
        graph: Arc<PipelineGraph>,
        registry: Arc<ProcessorRegistry>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            graph,
            registry,
            pool,
            progress: None,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            content_store: Arc::new(MemoryContentStore::new()),
            metrics: None,
            submit_retry_delay: Duration::from_millis(DEFAULT_SUBMIT_RETRY_DELAY_MS),
        }
    }

    pub fn with_progress(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.progress = Some(tracker);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn with_content_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.content_store = store;
        self
    }

    pub fn with_metrics(mut self, client: MetricsClient) -> Self {
        self.metrics = Some(client);
        self
    }

    pub fn with_submit_retry_delay(mut self, delay: Duration) -> Self {
        self.submit_retry_delay = delay;
        self
    }

    pub fn graph(&self) -> &Arc<PipelineGraph> {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.content_store
    }

    /// Runs every stage of the pipeline on a document.
    pub async fn execute(&self, document: Document) -> PipelineResult {
        self.execute_with_cancel(document, CancellationToken::new())
            .await
    }

    /// Runs the pipeline until it finishes or `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        document: Document,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let ctx = PipelineContext::new(document, self.graph.config_hash());
        self.run(ctx, false, cancel).await
    }

    /// Continues a document from its last checkpoint.
    ///
    /// Successful stages are restored and everything else runs again. With
    /// no checkpoint, or a stale one written under a different
    /// configuration, the document is processed from the start.
    ///
    /// Without a checkpoint only the id is known, so the fresh run sees a
    /// document whose source is its id and which has no attributes. Use
    /// [`resume_or_execute`](Self::resume_or_execute) when the document
    /// itself is at hand.
    pub async fn resume(&self, document_id: &DocumentId) -> PipelineResult {
        self.resume_with_cancel(document_id, CancellationToken::new())
            .await
    }

    pub async fn resume_with_cancel(
        &self,
        document_id: &DocumentId,
        cancel: CancellationToken,
    ) -> PipelineResult {
        self.resume_from(document_id, None, cancel).await
    }

    /// Continues `document` from its checkpoint, or runs it from the start
    /// when there is no usable checkpoint.
    ///
    /// A usable checkpoint keeps the document it was written with.
    pub async fn resume_or_execute(&self, document: Document) -> PipelineResult {
        self.resume_or_execute_with_cancel(document, CancellationToken::new())
            .await
    }

    pub async fn resume_or_execute_with_cancel(
        &self,
        document: Document,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let document_id = document.id.clone();
        self.resume_from(&document_id, Some(document), cancel).await
    }

    async fn resume_from(
        &self,
        document_id: &DocumentId,
        document: Option<Document>,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let config_hash = self.graph.config_hash();
        let fresh = |stale: Option<Document>| {
            document
                .or(stale)
                .unwrap_or_else(|| Document::from_id(document_id))
        };

        match self.checkpoints.load(document_id).await {
            Ok(Some(checkpoint)) if checkpoint.config_hash == config_hash => {
                let ctx = PipelineContext::from_checkpoint(checkpoint);
                info!(
                    document_id = %document_id,
                    restored = ctx.restored(),
                    "Resuming pipeline from checkpoint"
                );
                self.run(ctx, true, cancel).await
            }
            Ok(Some(stale)) => {
                warn!(
                    document_id = %document_id,
                    checkpoint_hash = %stale.config_hash,
                    config_hash = %config_hash,
                    "Discarding checkpoint written under a different configuration"
                );
                if let Err(e) = self.checkpoints.delete(document_id).await {
                    warn!(document_id = %document_id, error = %e, "Failed to delete stale checkpoint");
                }
                let ctx = PipelineContext::new(fresh(Some(stale.document)), config_hash);
                self.run(ctx, false, cancel).await
            }
            Ok(None) => {
                debug!(document_id = %document_id, "No checkpoint, starting fresh");
                let ctx = PipelineContext::new(fresh(None), config_hash);
                self.run(ctx, false, cancel).await
            }
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "Checkpoint unreadable, starting fresh");
                let mut ctx = PipelineContext::new(fresh(None), config_hash);
                ctx.push_error(format!("checkpoint unreadable: {}", e));
                self.run(ctx, false, cancel).await
            }
        }
    }

    /// Saves the context as the document's checkpoint.
    pub async fn checkpoint(&self, ctx: &PipelineContext) -> Result<(), CheckpointError> {
        self.checkpoints.save(&ctx.to_checkpoint()).await
    }
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("stages", &self.graph.len())
            .field("config_hash", &self.graph.config_hash())
            .field("progress", &self.progress.is_some())
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
