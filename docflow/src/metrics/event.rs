//! Metric events for the emission layer.
//!
//! Events are fire-and-forget: producers send them to the daemon without
//! waiting for acknowledgment.
//!
//! # Event Granularity
//!
//! - Document events: one start and one finish per run
//! - Stage events: one per stage result, plus one per retry
//! - Lane events: per rejected submission
//! - Admission events: per refused document

use std::time::Duration;

use tokio::sync::oneshot;

use crate::executor::LaneKind;
use crate::pipeline::{PipelineStatus, StageStatus};

/// Events emitted by pipeline components to the metrics daemon.
///
/// Events are processed sequentially by the daemon in emission order.
#[derive(Debug)]
pub enum MetricEvent {
    // =========================================================================
    // Document Events
    // =========================================================================
    /// A pipeline run started.
    DocumentStarted {
        /// True when the run resumes from a checkpoint.
        resumed: bool,
    },

    /// A pipeline run finished.
    DocumentFinished {
        status: PipelineStatus,
        duration: Duration,
    },

    // =========================================================================
    // Stage Events
    // =========================================================================
    /// A stage reached a terminal status.
    StageFinished {
        stage: String,
        status: StageStatus,
        duration: Duration,
        attempts: u32,
    },

    /// A stage attempt failed and will be retried.
    StageRetried { stage: String },

    // =========================================================================
    // Admission Events
    // =========================================================================
    /// A lane refused a task because it was full.
    TaskRejected { lane: LaneKind },

    /// Admission control refused a new document.
    AdmissionRejected,

    // =========================================================================
    // Control
    // =========================================================================
    /// Publish state, then acknowledge. Everything sent before it has been
    /// applied when the acknowledgment arrives.
    Flush(oneshot::Sender<()>),
}
