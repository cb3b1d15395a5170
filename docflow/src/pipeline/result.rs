//! Stage and pipeline outcomes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::document::DocumentId;
use crate::processor::StageOutput;

// =============================================================================
// Stage outcomes
// =============================================================================

/// Terminal status of a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub const ALL: [StageStatus; 4] = [
        StageStatus::Success,
        StageStatus::Failed,
        StageStatus::Skipped,
        StageStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Failed or skipped: dependents of such a stage can never run.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a stage error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Recoverable,
    Unrecoverable,
    Timeout,
    Panicked,
    Cancelled,
    ProcessorNotFound,
    DependencyFailed,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recoverable => "recoverable",
            Self::Unrecoverable => "unrecoverable",
            Self::Timeout => "timeout",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
            Self::ProcessorNotFound => "processor_not_found",
            Self::DependencyFailed => "dependency_failed",
            Self::Storage => "storage",
        }
    }
}

/// Why a stage did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Outcome of one stage for one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    pub output: Option<StageOutput>,
    /// Wall time across all attempts, including backoff.
    pub duration: Duration,
    /// Attempts dispatched to the worker pool. Zero for skipped stages.
    pub attempts: u32,
    pub error: Option<ErrorDetail>,
}

impl StageResult {
    pub fn success(output: StageOutput, duration: Duration, attempts: u32) -> Self {
        Self {
            status: StageStatus::Success,
            output: Some(output),
            duration,
            attempts,
            error: None,
        }
    }

    pub fn failed(error: ErrorDetail, duration: Duration, attempts: u32) -> Self {
        Self {
            status: StageStatus::Failed,
            output: None,
            duration,
            attempts,
            error: Some(error),
        }
    }

    pub fn skipped(error: ErrorDetail) -> Self {
        Self {
            status: StageStatus::Skipped,
            output: None,
            duration: Duration::ZERO,
            attempts: 0,
            error: Some(error),
        }
    }

    pub fn cancelled(message: impl Into<String>, duration: Duration, attempts: u32) -> Self {
        Self {
            status: StageStatus::Cancelled,
            output: None,
            duration,
            attempts,
            error: Some(ErrorDetail::new(ErrorKind::Cancelled, message)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}

// =============================================================================
// Pipeline outcomes
// =============================================================================

/// Overall status of a pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    PartialFailure,
    TotalFailure,
    Cancelled,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 4] = [
        PipelineStatus::Success,
        PipelineStatus::PartialFailure,
        PipelineStatus::TotalFailure,
        PipelineStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::TotalFailure => "total_failure",
            Self::Cancelled => "cancelled",
        }
    }

    /// Derives the pipeline status from terminal stage statuses.
    ///
    /// All successful (or no stages at all) is `Success` even if a cancel
    /// arrived after the last stage finished.
    pub fn from_stages<I>(statuses: I, cancelled: bool) -> Self
    where
        I: IntoIterator<Item = StageStatus>,
    {
        let mut any_success = false;
        let mut all_success = true;
        for status in statuses {
            if status == StageStatus::Success {
                any_success = true;
            } else {
                all_success = false;
            }
        }

        if all_success {
            Self::Success
        } else if cancelled {
            Self::Cancelled
        } else if any_success {
            Self::PartialFailure
        } else {
            Self::TotalFailure
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running (or resuming) a pipeline on one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub document_id: DocumentId,
    pub status: PipelineStatus,
    /// Every stage with its terminal result, in configuration order.
    pub stages: Vec<(String, StageResult)>,
    /// Pipeline-level errors (checkpoint failures, timeouts).
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    /// True if completed stages were restored from a checkpoint.
    pub resumed: bool,
}

impl PipelineResult {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|(stage, _)| stage == name)
            .map(|(_, result)| result)
    }

    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.stage(name).map(|r| r.status)
    }

    /// Number of stages with the given status.
    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|(_, r)| r.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }
}
