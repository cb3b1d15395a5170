//! Telemetry for worker pool observability.
//!
//! The pool emits telemetry events via a sink abstraction. It doesn't know
//! how events are consumed; this follows the "emit, don't present" pattern.
//!
//! # Example
//!
//! ```ignore
//! use docflow::executor::{TelemetryEvent, TelemetrySink};
//!
//! struct LoggingSink;
//!
//! impl TelemetrySink for LoggingSink {
//!     fn emit(&self, event: TelemetryEvent) {
//!         tracing::info!(?event, "Pool event");
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use super::lane::LaneKind;
use crate::pipeline::DocumentId;

// =============================================================================
// Telemetry Events
// =============================================================================

/// Events emitted by the worker pool.
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    /// A task was admitted to a lane.
    TaskAdmitted {
        document_id: DocumentId,
        stage: String,
        lane: LaneKind,
        in_flight: usize,
    },

    /// A lane was full and refused a task.
    TaskRejected {
        document_id: DocumentId,
        stage: String,
        lane: LaneKind,
    },

    /// A task obtained a running slot.
    TaskStarted {
        document_id: DocumentId,
        stage: String,
        lane: LaneKind,
        attempt: u32,
        queue_wait: Duration,
    },

    /// A task finished, successfully or not.
    TaskCompleted {
        document_id: DocumentId,
        stage: String,
        lane: LaneKind,
        attempt: u32,
        outcome: &'static str,
        run_time: Duration,
    },

    /// The pool stopped accepting work.
    PoolShutdown {
        graceful: bool,
        drained: usize,
        cancelled: usize,
    },
}

impl TelemetryEvent {
    /// Returns the document ID associated with this event, if any.
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            Self::TaskAdmitted { document_id, .. }
            | Self::TaskRejected { document_id, .. }
            | Self::TaskStarted { document_id, .. }
            | Self::TaskCompleted { document_id, .. } => Some(document_id),
            Self::PoolShutdown { .. } => None,
        }
    }

    /// Returns a short name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskAdmitted { .. } => "task_admitted",
            Self::TaskRejected { .. } => "task_rejected",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::PoolShutdown { .. } => "pool_shutdown",
        }
    }
}

// =============================================================================
// Telemetry Sink Trait
// =============================================================================

/// Sink for telemetry events.
///
/// Implementations must be thread-safe (`Send + Sync`) as events are emitted
/// from many tasks concurrently, and `emit` should be fast and non-blocking.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

// =============================================================================
// Built-in Sink Implementations
// =============================================================================

/// No-op sink for when telemetry is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn emit(&self, _event: TelemetryEvent) {
        // Intentionally empty
    }
}

/// Sink that logs events using the `tracing` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::TaskAdmitted {
                document_id,
                stage,
                lane,
                in_flight,
            } => {
                tracing::trace!(
                    document_id = %document_id,
                    stage = %stage,
                    lane = %lane,
                    in_flight = in_flight,
                    "Task admitted"
                );
            }
            TelemetryEvent::TaskRejected {
                document_id,
                stage,
                lane,
            } => {
                tracing::warn!(
                    document_id = %document_id,
                    stage = %stage,
                    lane = %lane,
                    "Lane full, task rejected"
                );
            }
            TelemetryEvent::TaskStarted {
                document_id,
                stage,
                lane,
                attempt,
                queue_wait,
            } => {
                tracing::debug!(
                    document_id = %document_id,
                    stage = %stage,
                    lane = %lane,
                    attempt = attempt,
                    queue_wait_ms = queue_wait.as_millis(),
                    "Task started"
                );
            }
            TelemetryEvent::TaskCompleted {
                document_id,
                stage,
                lane,
                attempt,
                outcome,
                run_time,
            } => {
                tracing::debug!(
                    document_id = %document_id,
                    stage = %stage,
                    lane = %lane,
                    attempt = attempt,
                    outcome = outcome,
                    run_time_ms = run_time.as_millis(),
                    "Task completed"
                );
            }
            TelemetryEvent::PoolShutdown {
                graceful,
                drained,
                cancelled,
            } => {
                tracing::info!(
                    graceful = graceful,
                    drained = drained,
                    cancelled = cancelled,
                    "Worker pool shut down"
                );
            }
        }
    }
}

/// Sink that forwards events to multiple sinks.
pub struct MultiplexTelemetrySink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl MultiplexTelemetrySink {
    /// Creates a new multiplex sink with the given sinks.
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    /// Adds a sink to the multiplex.
    pub fn add_sink(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }
}

impl TelemetrySink for MultiplexTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

impl std::fmt::Debug for MultiplexTelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexTelemetrySink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}
