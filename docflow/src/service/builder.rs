//! Service builder.
//!
//! Wires the engine's components into a [`DocflowService`]. Component
//! creation is split into small functions so each piece can be built (and
//! tested) on its own.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::ServiceError;
use super::facade::{DocflowService, ServiceParts};
use crate::config::PipelineConfig;
use crate::executor::{
    MultiplexTelemetrySink, TelemetrySink, TracingTelemetrySink, WorkerPool, WorkerPoolConfig,
};
use crate::health::{AlertManager, AlertRule, HealthMonitor, HealthThresholds};
use crate::metrics::{MetricsClient, MetricsSystem, MetricsTelemetrySink, SharedMetricsState};
use crate::pipeline::{CheckpointStore, PipelineGraph, PipelineManager};
use crate::processor::{ContentStore, ProcessorRegistry};
use crate::progress::{ProgressTracker, DEFAULT_PROGRESS_BUFFER};
use crate::resource::{
    AdmissionConfig, AdmissionController, ProcSampler, ResourceMonitor, SystemSampler,
    DEFAULT_SAMPLE_INTERVAL_SECS,
};

/// Interval between alert rule evaluations.
pub const DEFAULT_ALERT_INTERVAL_SECS: u64 = 10;

/// Builder for [`DocflowService`].
///
/// # Example
///
/// ```ignore
/// let registry = Arc::new(ProcessorRegistry::new());
/// registry.register("pdf-parse", factory(|| PdfParser::default()))?;
///
/// let service = ServiceBuilder::from_file(Path::new("docflow.ini"))?
///     .with_registry(registry)
///     .with_checkpoint_store(Arc::new(FileCheckpointStore::new("/var/lib/docflow")))
///     .build()?;
/// ```
pub struct ServiceBuilder {
    config: PipelineConfig,
    registry: Arc<ProcessorRegistry>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    content_store: Option<Arc<dyn ContentStore>>,
    sampler: Box<dyn SystemSampler>,
    admission: AdmissionConfig,
    thresholds: HealthThresholds,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    alert_rules: Vec<AlertRule>,
    progress_buffer: usize,
    sample_interval: Duration,
    alert_interval: Duration,
}

impl ServiceBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ProcessorRegistry::new()),
            checkpoint_store: None,
            content_store: None,
            sampler: Box::new(ProcSampler::new()),
            admission: AdmissionConfig::default(),
            thresholds: HealthThresholds::default(),
            telemetry: None,
            alert_rules: Vec::new(),
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
            sample_interval: Duration::from_secs(DEFAULT_SAMPLE_INTERVAL_SECS),
            alert_interval: Duration::from_secs(DEFAULT_ALERT_INTERVAL_SECS),
        }
    }

    /// Starts from a pipeline configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        Ok(Self::new(PipelineConfig::load_from(path)?))
    }

    pub fn with_registry(mut self, registry: Arc<ProcessorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_content_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.content_store = Some(store);
        self
    }

    /// Replaces the `/proc` sampler, e.g. with a host-provided one.
    pub fn with_sampler<S>(mut self, sampler: S) -> Self
    where
        S: SystemSampler + 'static,
    {
        self.sampler = Box::new(sampler);
        self
    }

    pub fn with_admission(mut self, config: AdmissionConfig) -> Self {
        self.admission = config;
        self
    }

    pub fn with_health_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Adds a telemetry sink next to the built-in tracing and metrics sinks.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn with_alert_rule(mut self, rule: AlertRule) -> Self {
        self.alert_rules.push(rule);
        self
    }

    pub fn with_progress_buffer(mut self, capacity: usize) -> Self {
        self.progress_buffer = capacity;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_alert_interval(mut self, interval: Duration) -> Self {
        self.alert_interval = interval;
        self
    }

    /// Validates the pipeline and starts the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<DocflowService, ServiceError> {
        let runtime = Handle::try_current().map_err(|_| ServiceError::NoRuntime)?;
        let graph = Arc::new(PipelineGraph::build(self.config)?);

        let metrics = MetricsSystem::new(&runtime);
        let pool = create_pool(&graph, metrics.client(), self.telemetry);
        let tracker = Arc::new(ProgressTracker::new(self.progress_buffer));
        let shutdown = CancellationToken::new();

        let monitor = Arc::new(
            ResourceMonitor::new(
                self.sampler,
                Arc::clone(&pool),
                AdmissionController::new(self.admission),
            )
            .with_interval(self.sample_interval),
        );
        let monitor_handle = monitor.spawn(shutdown.child_token());

        let alerts = Arc::new(AlertManager::new());
        for rule in self.alert_rules {
            alerts.add_rule(rule);
        }
        let alert_handle = spawn_alert_loop(
            &runtime,
            Arc::clone(&alerts),
            metrics.state_handle(),
            self.alert_interval,
            shutdown.child_token(),
        );

        let mut manager = PipelineManager::new(Arc::clone(&graph), self.registry, Arc::clone(&pool))
            .with_progress(Arc::clone(&tracker))
            .with_metrics(metrics.client());
        if let Some(store) = self.checkpoint_store {
            manager = manager.with_checkpoint_store(store);
        }
        if let Some(store) = self.content_store {
            manager = manager.with_content_store(store);
        }

        info!(
            stages = graph.len(),
            config_hash = %graph.config_hash(),
            "Docflow service started"
        );

        Ok(DocflowService::from_parts(ServiceParts {
            manager: Arc::new(manager),
            pool,
            tracker,
            monitor,
            metrics,
            health: HealthMonitor::new(self.thresholds),
            alerts,
            shutdown,
            background: vec![monitor_handle, alert_handle],
        }))
    }
}

/// Creates the worker pool with tracing and metrics telemetry.
pub fn create_pool(
    graph: &PipelineGraph,
    metrics: MetricsClient,
    extra: Option<Arc<dyn TelemetrySink>>,
) -> Arc<WorkerPool> {
    let mut sinks: Vec<Arc<dyn TelemetrySink>> = vec![
        Arc::new(TracingTelemetrySink),
        Arc::new(MetricsTelemetrySink::new(metrics)),
    ];
    sinks.extend(extra);

    let config = WorkerPoolConfig::new(graph.config().resource_limits);
    Arc::new(WorkerPool::with_telemetry(
        config,
        Arc::new(MultiplexTelemetrySink::new(sinks)),
    ))
}

/// Evaluates alert rules on an interval until cancelled.
pub fn spawn_alert_loop(
    runtime: &Handle,
    alerts: Arc<AlertManager>,
    state: SharedMetricsState,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = state.read().clone();
                    alerts.evaluate(&snapshot);
                }
            }
        }
        debug!("Alert loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .stage(StageConfig::new("parse", "parse"))
            .build()
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = ServiceBuilder::new(config()).build();
        assert!(matches!(result, Err(ServiceError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_graph() {
        let config = PipelineConfig::builder()
            .stage(StageConfig::new("a", "x").depends_on(["b"]))
            .stage(StageConfig::new("b", "x").depends_on(["a"]))
            .build();
        let result = ServiceBuilder::new(config).build();
        assert!(matches!(result, Err(ServiceError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_create_pool_uses_configured_lanes() {
        let graph = PipelineGraph::build(config()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = create_pool(&graph, MetricsClient::new(tx), None);
        assert_eq!(pool.snapshot().len(), 3);
        assert!(pool.is_accepting());
    }
}
