//! Tasks submitted to the worker pool.
//!
//! A [`Task`] is one attempt at one stage for one document. The pool runs it
//! on the lane chosen by the processor's resource profile and reports a
//! [`TaskReport`] through the task's handle.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::lane::LaneKind;
use crate::pipeline::{DocumentId, ErrorDetail, ErrorKind, Stage};
use crate::processor::{ContextView, ProcessorError, ResolvedProcessor, StageOutput};

/// One attempt at running a stage.
#[derive(Debug)]
pub struct Task {
    pub document_id: DocumentId,
    pub stage: Arc<Stage>,
    pub attempt: u32,
    pub processor: ResolvedProcessor,
    pub view: ContextView,
}

impl Task {
    pub fn new(
        document_id: DocumentId,
        stage: Arc<Stage>,
        attempt: u32,
        processor: ResolvedProcessor,
        view: ContextView,
    ) -> Self {
        Self {
            document_id,
            stage,
            attempt,
            processor,
            view,
        }
    }

    /// Lane selected by the processor's resource profile.
    pub fn lane(&self) -> LaneKind {
        self.processor.metadata.resource_profile.lane()
    }

    /// The attempt's cancellation token.
    pub fn cancellation(&self) -> CancellationToken {
        self.view.cancellation_token()
    }
}

/// Why an attempt did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Processor(ProcessorError),

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("processor panicked: {0}")]
    Panicked(String),

    #[error("attempt cancelled")]
    Cancelled,
}

impl AttemptFailure {
    /// Recoverable processor errors and timeouts may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Processor(e) => e.is_recoverable(),
            Self::Timeout(_) => true,
            Self::Panicked(_) | Self::Cancelled => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Processor(ProcessorError::Recoverable(_)) => ErrorKind::Recoverable,
            Self::Processor(ProcessorError::Unrecoverable(_)) => ErrorKind::Unrecoverable,
            Self::Processor(ProcessorError::Cancelled) | Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Panicked(_) => ErrorKind::Panicked,
        }
    }

    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded(StageOutput),
    Failed(AttemptFailure),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Short label for telemetry.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "success",
            Self::Failed(f) => f.kind().as_str(),
        }
    }
}

/// Report delivered through a [`TaskHandle`](super::TaskHandle).
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub document_id: DocumentId,
    pub stage: String,
    pub lane: LaneKind,
    pub attempt: u32,
    /// Time spent waiting for a running slot.
    pub queue_wait: Duration,
    /// Time spent running.
    pub run_time: Duration,
    pub outcome: AttemptOutcome,
}
