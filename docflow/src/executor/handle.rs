//! Handles for submitted tasks.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::lane::LaneKind;
use super::task::{AttemptFailure, AttemptOutcome, TaskReport};
use crate::pipeline::DocumentId;

/// Handle to a task admitted by the worker pool.
///
/// Every admitted task produces exactly one [`TaskReport`].
pub struct TaskHandle {
    document_id: DocumentId,
    stage: String,
    lane: LaneKind,
    attempt: u32,
    cancellation: CancellationToken,
    receiver: oneshot::Receiver<TaskReport>,
}

impl TaskHandle {
    pub(crate) fn new(
        document_id: DocumentId,
        stage: String,
        lane: LaneKind,
        attempt: u32,
        cancellation: CancellationToken,
        receiver: oneshot::Receiver<TaskReport>,
    ) -> Self {
        Self {
            document_id,
            stage,
            lane,
            attempt,
            cancellation,
            receiver,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn lane(&self) -> LaneKind {
        self.lane
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Requests cancellation of this task.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Waits for the task's report.
    ///
    /// If the worker was torn down before reporting, the attempt is reported
    /// as cancelled.
    pub async fn wait(self) -> TaskReport {
        match self.receiver.await {
            Ok(report) => report,
            Err(_) => TaskReport {
                document_id: self.document_id,
                stage: self.stage,
                lane: self.lane,
                attempt: self.attempt,
                queue_wait: Duration::ZERO,
                run_time: Duration::ZERO,
                outcome: AttemptOutcome::Failed(AttemptFailure::Cancelled),
            },
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("document_id", &self.document_id)
            .field("stage", &self.stage)
            .field("lane", &self.lane)
            .field("attempt", &self.attempt)
            .finish()
    }
}
