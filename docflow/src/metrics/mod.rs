//! Metrics collection and reporting system.
//!
//! This module provides a 3-layer architecture for metrics:
//!
//! 1. **Emission Layer** ([`MetricsClient`]) - Fire-and-forget event emission
//! 2. **Aggregation Layer** ([`MetricsDaemon`]) - Independent event processing
//! 3. **Reporting Layer** ([`MetricsReporter`]) - Transform data for presentation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  EMISSION LAYER                                                      │
//! │  MetricsClient (cloneable, cheap, fire-and-forget)                  │
//! │  - Used by: PipelineManager, MetricsTelemetrySink, DocflowService   │
//! └──────────────────────────────┬──────────────────────────────────────┘
//!                                │ MetricEvent (mpsc channel)
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  AGGREGATION LAYER                                                   │
//! │  MetricsDaemon (independent async task)                              │
//! │  - Receives events from channel                                      │
//! │  - Updates counters and latency windows in AggregatedState          │
//! │  - Samples document throughput once per second                      │
//! └──────────────────────────────┬──────────────────────────────────────┘
//!                                │ read-only access to state
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  REPORTING LAYER                                                     │
//! │  MetricsReporter trait + PrometheusReporter                          │
//! │  - Reads AggregatedState + ThroughputHistory                        │
//! │  - Renders the text exposition format                               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use docflow::metrics::{MetricsSystem, PrometheusReporter};
//!
//! let system = MetricsSystem::new(&tokio::runtime::Handle::current());
//! let client = system.client();
//! client.document_started(false);
//!
//! let text = system.report(&PrometheusReporter::default());
//! system.shutdown().await;
//! ```

mod client;
mod daemon;
mod event;
mod reporter;
mod sink;
mod state;

pub use client::MetricsClient;
pub use daemon::{MetricsDaemon, MetricsStateSnapshot, SharedMetricsState};
pub use event::MetricEvent;
pub use reporter::{
    MetricsReporter, PrometheusReporter, DEFAULT_ERROR_RATE_WINDOW_SECS, STAGE_DURATION_QUANTILES,
};
pub use sink::MetricsTelemetrySink;
pub use state::{
    AggregatedState, RingBuffer, StageOutcome, StageStats, ThroughputHistory,
    DEFAULT_HISTORY_CAPACITY, DEFAULT_LATENCY_SAMPLES,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::executor::LaneKind;
use crate::pipeline::{PipelineStatus, StageStatus};

// =============================================================================
// Metrics System
// =============================================================================

/// The complete metrics system.
///
/// Creates the client and daemon, exposes state snapshots for reporting,
/// and coordinates shutdown.
pub struct MetricsSystem {
    client: MetricsClient,
    state_handle: SharedMetricsState,
    daemon_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl MetricsSystem {
    /// Creates a new metrics system and starts the daemon on the given
    /// runtime.
    pub fn new(runtime_handle: &tokio::runtime::Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = MetricsClient::new(tx);

        let daemon = MetricsDaemon::new(rx);
        let state_handle = daemon.state_handle();
        let shutdown = CancellationToken::new();

        let daemon_handle = runtime_handle.spawn(daemon.run(shutdown.clone()));

        Self {
            client,
            state_handle,
            daemon_handle: Mutex::new(Some(daemon_handle)),
            shutdown,
        }
    }

    /// Returns a clone of the metrics client.
    pub fn client(&self) -> MetricsClient {
        self.client.clone()
    }

    pub fn state_handle(&self) -> SharedMetricsState {
        Arc::clone(&self.state_handle)
    }

    /// Generates output using the provided reporter.
    pub fn report<R, O>(&self, reporter: &R) -> O
    where
        R: MetricsReporter<Output = O>,
    {
        let guard = self.state_handle.read();
        reporter.report(&guard.state, &guard.history)
    }

    /// Returns a copy of the published state.
    pub fn snapshot(&self) -> MetricsStateSnapshot {
        self.state_handle.read().clone()
    }

    /// Waits until all events emitted so far are in the published state.
    pub async fn flush(&self) {
        self.client.flush().await;
    }

    /// Stops the daemon and waits for it to finish. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.daemon_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.daemon_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl std::fmt::Debug for MetricsSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSystem")
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Optional Metrics Client
// =============================================================================

/// Extension trait for optional metrics client usage.
///
/// Lets components hold an `Option<MetricsClient>` without match
/// statements at every call site.
pub trait OptionalMetrics {
    fn document_started(&self, resumed: bool);
    fn document_finished(&self, status: PipelineStatus, duration: Duration);
    fn stage_finished(&self, stage: &str, status: StageStatus, duration: Duration, attempts: u32);
    fn stage_retried(&self, stage: &str);
    fn task_rejected(&self, lane: LaneKind);
    fn admission_rejected(&self);
}

impl OptionalMetrics for Option<MetricsClient> {
    #[inline]
    fn document_started(&self, resumed: bool) {
        if let Some(client) = self {
            client.document_started(resumed);
        }
    }

    #[inline]
    fn document_finished(&self, status: PipelineStatus, duration: Duration) {
        if let Some(client) = self {
            client.document_finished(status, duration);
        }
    }

    #[inline]
    fn stage_finished(&self, stage: &str, status: StageStatus, duration: Duration, attempts: u32) {
        if let Some(client) = self {
            client.stage_finished(stage, status, duration, attempts);
        }
    }

    #[inline]
    fn stage_retried(&self, stage: &str) {
        if let Some(client) = self {
            client.stage_retried(stage);
        }
    }

    #[inline]
    fn task_rejected(&self, lane: LaneKind) {
        if let Some(client) = self {
            client.task_rejected(lane);
        }
    }

    #[inline]
    fn admission_rejected(&self) {
        if let Some(client) = self {
            client.admission_rejected();
        }
    }
}
