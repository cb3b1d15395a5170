//! Progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::DocumentId;

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    PipelineStarted,
    StageStarted,
    StageProgress,
    StageRetrying,
    StageSucceeded,
    StageFailed,
    StageSkipped,
    StageCancelled,
    PipelineFinished,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline_started",
            Self::StageStarted => "stage_started",
            Self::StageProgress => "stage_progress",
            Self::StageRetrying => "stage_retrying",
            Self::StageSucceeded => "stage_succeeded",
            Self::StageFailed => "stage_failed",
            Self::StageSkipped => "stage_skipped",
            Self::StageCancelled => "stage_cancelled",
            Self::PipelineFinished => "pipeline_finished",
        }
    }

    /// Stage reached a terminal state that counts as done for progress.
    pub fn completes_stage(&self) -> bool {
        matches!(
            self,
            Self::StageSucceeded | Self::StageFailed | Self::StageSkipped
        )
    }
}

/// A progress update for one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub document_id: DocumentId,
    pub stage: Option<String>,
    pub status: ProgressStatus,
    /// Progress of the stage itself, when the producer knows it.
    pub stage_percent: Option<f64>,
    /// Weighted progress of the whole document. Filled in by the tracker;
    /// never decreases for a document.
    pub percent: f64,
    pub timestamp: DateTime<Utc>,
    /// Position in the document's event stream. Filled in by the tracker.
    pub sequence: u64,
}

impl ProgressEvent {
    pub fn new(document_id: DocumentId, stage: Option<String>, status: ProgressStatus) -> Self {
        Self {
            document_id,
            stage,
            status,
            stage_percent: None,
            percent: 0.0,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    pub fn pipeline(document_id: DocumentId, status: ProgressStatus) -> Self {
        Self::new(document_id, None, status)
    }

    pub fn stage(document_id: DocumentId, stage: impl Into<String>, status: ProgressStatus) -> Self {
        Self::new(document_id, Some(stage.into()), status)
    }

    pub fn with_stage_percent(mut self, percent: f64) -> Self {
        self.stage_percent = Some(percent);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_stage() {
        assert!(ProgressStatus::StageSucceeded.completes_stage());
        assert!(ProgressStatus::StageSkipped.completes_stage());
        assert!(!ProgressStatus::StageRetrying.completes_stage());
        assert!(!ProgressStatus::StageCancelled.completes_stage());
    }

    #[test]
    fn test_event_builders() {
        let event = ProgressEvent::stage(DocumentId::new("d"), "parse", ProgressStatus::StageProgress)
            .with_stage_percent(40.0);
        assert_eq!(event.stage.as_deref(), Some("parse"));
        assert_eq!(event.stage_percent, Some(40.0));
        assert_eq!(event.sequence, 0);
    }
}
