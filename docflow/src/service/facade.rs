//! Docflow service facade implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ServiceError;
use crate::executor::{ShutdownReport, WorkerPool};
use crate::health::{AlertManager, HealthInputs, HealthMonitor, HealthReport, ReadinessReport};
use crate::metrics::{MetricsStateSnapshot, MetricsSystem, PrometheusReporter};
use crate::pipeline::{Document, DocumentId, PipelineManager, PipelineResult};
use crate::progress::{ProgressSubscription, ProgressTracker};
use crate::resource::{AdmissionRequest, AdmissionState, Decision, ResourceMonitor, ResourceSnapshot};

/// Components assembled by the builder.
pub(super) struct ServiceParts {
    pub manager: Arc<PipelineManager>,
    pub pool: Arc<WorkerPool>,
    pub tracker: Arc<ProgressTracker>,
    pub monitor: Arc<ResourceMonitor>,
    pub metrics: MetricsSystem,
    pub health: HealthMonitor,
    pub alerts: Arc<AlertManager>,
    pub shutdown: CancellationToken,
    pub background: Vec<JoinHandle<()>>,
}

/// High-level facade for document processing.
///
/// Owns the pipeline manager, worker pool, progress tracker, resource
/// monitor, metrics system, health monitor and alert manager, and gates
/// new documents through admission control.
///
/// # Example
///
/// ```ignore
/// let service = ServiceBuilder::new(config).with_registry(registry).build()?;
///
/// let mut progress = service.subscribe(&DocumentId::new("doc-1"));
/// let result = service.process(Document::new("doc-1", "/data/doc-1.pdf")).await?;
///
/// println!("{}", service.get_metrics());
/// service.shutdown(true).await;
/// ```
pub struct DocflowService {
    manager: Arc<PipelineManager>,
    pool: Arc<WorkerPool>,
    tracker: Arc<ProgressTracker>,
    monitor: Arc<ResourceMonitor>,
    metrics: MetricsSystem,
    health: HealthMonitor,
    alerts: Arc<AlertManager>,
    /// One token per document being processed.
    active: DashMap<DocumentId, CancellationToken>,
    /// Parent of every document token.
    documents: CancellationToken,
    /// Stops the background loops.
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl DocflowService {
    pub(super) fn from_parts(parts: ServiceParts) -> Self {
        Self {
            manager: parts.manager,
            pool: parts.pool,
            tracker: parts.tracker,
            monitor: parts.monitor,
            metrics: parts.metrics,
            health: parts.health,
            alerts: parts.alerts,
            active: DashMap::new(),
            documents: CancellationToken::new(),
            shutdown: parts.shutdown,
            background: Mutex::new(parts.background),
            closing: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Runs a document through the pipeline, subject to admission control.
    ///
    /// A throttled service delays the start by the advised interval; a
    /// closed one rejects the document with
    /// [`ServiceError::AdmissionClosed`] without starting it. A document id
    /// already being processed or resumed is rejected with
    /// [`ServiceError::AlreadyRunning`].
    pub async fn process(&self, document: Document) -> Result<PipelineResult, ServiceError> {
        let guard = self.track(&document.id)?;
        self.admit(&document.id).await?;
        let result = self
            .manager
            .execute_with_cancel(document, guard.token.clone())
            .await;
        Ok(result)
    }

    /// Continues a document from its last checkpoint, subject to admission
    /// control.
    pub async fn resume(&self, document_id: &DocumentId) -> Result<PipelineResult, ServiceError> {
        let guard = self.track(document_id)?;
        self.admit(document_id).await?;
        let result = self
            .manager
            .resume_with_cancel(document_id, guard.token.clone())
            .await;
        Ok(result)
    }

    /// Cancels a document being processed. Returns false if it isn't.
    pub fn cancel(&self, document_id: &DocumentId) -> bool {
        match self.active.get(document_id) {
            Some(token) => {
                info!(document_id = %document_id, "Cancelling document");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Documents currently being processed.
    pub fn active_documents(&self) -> Vec<DocumentId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    async fn admit(&self, document_id: &DocumentId) -> Result<(), ServiceError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ServiceError::ShuttingDown);
        }

        match self.monitor.admit(&AdmissionRequest::new(document_id.clone())) {
            Decision::Open => Ok(()),
            Decision::Throttled { delay } => {
                debug!(
                    document_id = %document_id,
                    delay_ms = delay.as_millis() as u64,
                    "Admission throttled, delaying start"
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Decision::Closed => {
                self.metrics.client().admission_rejected();
                warn!(document_id = %document_id, "Admission closed, document rejected");
                Err(ServiceError::AdmissionClosed {
                    document_id: document_id.clone(),
                })
            }
        }
    }

    /// Claims the document id for one run.
    fn track(&self, document_id: &DocumentId) -> Result<ActiveGuard<'_>, ServiceError> {
        let token = match self.active.entry(document_id.clone()) {
            Entry::Occupied(_) => {
                warn!(document_id = %document_id, "Document is already being processed");
                return Err(ServiceError::AlreadyRunning {
                    document_id: document_id.clone(),
                });
            }
            Entry::Vacant(slot) => slot.insert(self.documents.child_token()).clone(),
        };
        Ok(ActiveGuard {
            active: &self.active,
            document_id: document_id.clone(),
            token,
        })
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Subscribes to a document's progress events from now on.
    pub fn subscribe(&self, document_id: &DocumentId) -> ProgressSubscription {
        self.tracker.subscribe(document_id)
    }

    /// Current weighted percent complete of a document.
    pub fn progress(&self, document_id: &DocumentId) -> Option<f64> {
        self.tracker.aggregate(document_id)
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    /// Metrics in the Prometheus text exposition format.
    pub fn get_metrics(&self) -> String {
        let reporter = PrometheusReporter::new(self.pool.snapshot())
            .with_dropped_progress_events(self.tracker.dropped_events())
            .with_admission_state(self.monitor.admission_state());
        self.metrics.report(&reporter)
    }

    pub fn metrics_snapshot(&self) -> MetricsStateSnapshot {
        self.metrics.snapshot()
    }

    /// Waits until every metric event emitted so far is published.
    pub async fn flush_metrics(&self) {
        self.metrics.flush().await;
    }

    /// Body of the `/health` endpoint.
    pub fn health_check(&self) -> HealthReport {
        let lanes = self.pool.snapshot();
        let metrics = self.metrics.snapshot();
        self.health.check(HealthInputs {
            lanes: &lanes,
            pool_accepting: self.pool.is_accepting(),
            metrics: &metrics,
            admission: self.monitor.admission_state(),
            dropped_progress_events: self.tracker.dropped_events(),
        })
    }

    /// Body of the `/ready` endpoint.
    pub fn readiness(&self) -> ReadinessReport {
        let accepting = self.pool.is_accepting() && !self.closing.load(Ordering::Acquire);
        self.health
            .readiness(accepting, self.monitor.admission_state())
    }

    pub fn admission_state(&self) -> AdmissionState {
        self.monitor.admission_state()
    }

    /// Most recent resource sample taken by the monitor loop.
    pub fn resource_snapshot(&self) -> Option<ResourceSnapshot> {
        self.monitor.latest()
    }

    /// Samples resources now and updates admission.
    pub fn refresh_resources(&self) -> ResourceSnapshot {
        self.monitor.sample()
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn manager(&self) -> &Arc<PipelineManager> {
        &self.manager
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops accepting documents and winds everything down.
    ///
    /// With `graceful`, running stages get the pool's grace period to
    /// finish; otherwise every active document is cancelled first.
    pub async fn shutdown(&self, graceful: bool) -> ShutdownReport {
        self.closing.store(true, Ordering::Release);
        info!(graceful, active = self.active.len(), "Docflow service shutting down");

        if !graceful {
            self.documents.cancel();
        }
        let report = self.pool.shutdown(graceful).await;

        self.shutdown.cancel();
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.metrics.shutdown().await;

        info!(
            drained = report.drained,
            cancelled = report.cancelled,
            "Docflow service stopped"
        );
        report
    }
}

impl std::fmt::Debug for DocflowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocflowService")
            .field("manager", &self.manager)
            .field("active", &self.active.len())
            .field("admission", &self.monitor.admission_state())
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .finish()
    }
}

/// Removes a document's token when its run ends or is dropped.
struct ActiveGuard<'a> {
    active: &'a DashMap<DocumentId, CancellationToken>,
    document_id: DocumentId,
    token: CancellationToken,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.document_id);
    }
}
