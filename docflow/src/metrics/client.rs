//! Metrics emission layer.
//!
//! The [`MetricsClient`] provides a fire-and-forget interface for emitting
//! metric events. It's designed to be:
//!
//! - **Cheap to clone**: Backed by a channel sender
//! - **Fire-and-forget**: Never blocks, silently drops if the daemon is gone
//! - **Type-safe**: Convenience methods for each event type

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::event::MetricEvent;
use crate::executor::LaneKind;
use crate::pipeline::{PipelineStatus, StageStatus};

/// Client for emitting metric events to the metrics daemon.
///
/// # Fire-and-Forget Semantics
///
/// All recording methods never block and silently ignore failures (e.g.,
/// if the daemon has shut down), so metrics never slow a pipeline down.
#[derive(Clone, Debug)]
pub struct MetricsClient {
    tx: mpsc::UnboundedSender<MetricEvent>,
}

impl MetricsClient {
    pub fn new(tx: mpsc::UnboundedSender<MetricEvent>) -> Self {
        Self { tx }
    }

    #[inline]
    fn send(&self, event: MetricEvent) {
        // Daemon may have shut down
        let _ = self.tx.send(event);
    }

    // =========================================================================
    // Document Events
    // =========================================================================

    #[inline]
    pub fn document_started(&self, resumed: bool) {
        self.send(MetricEvent::DocumentStarted { resumed });
    }

    #[inline]
    pub fn document_finished(&self, status: PipelineStatus, duration: Duration) {
        self.send(MetricEvent::DocumentFinished { status, duration });
    }

    // =========================================================================
    // Stage Events
    // =========================================================================

    #[inline]
    pub fn stage_finished(
        &self,
        stage: impl Into<String>,
        status: StageStatus,
        duration: Duration,
        attempts: u32,
    ) {
        self.send(MetricEvent::StageFinished {
            stage: stage.into(),
            status,
            duration,
            attempts,
        });
    }

    #[inline]
    pub fn stage_retried(&self, stage: impl Into<String>) {
        self.send(MetricEvent::StageRetried {
            stage: stage.into(),
        });
    }

    // =========================================================================
    // Admission Events
    // =========================================================================

    #[inline]
    pub fn task_rejected(&self, lane: LaneKind) {
        self.send(MetricEvent::TaskRejected { lane });
    }

    #[inline]
    pub fn admission_rejected(&self) {
        self.send(MetricEvent::AdmissionRejected);
    }

    /// Waits until every event sent before this call is reflected in the
    /// published state. Returns immediately if the daemon is gone.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(MetricEvent::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}
