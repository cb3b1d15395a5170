//! Stage dispatching.
//!
//! Runs one stage to a terminal result: submits attempts to the worker
//! pool, waits out full lanes, retries retryable failures with backoff, and
//! offloads large outputs to the content store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::document::Document;
use super::manager::PipelineManager;
use super::result::{ErrorDetail, ErrorKind, StageResult};
use super::stage::Stage;
use crate::executor::{AttemptOutcome, SubmitError, Task, TaskHandle};
use crate::metrics::OptionalMetrics;
use crate::processor::{ContextView, ResolvedProcessor, StageOutput};
use crate::progress::{ProgressEvent, ProgressReporter, ProgressStatus};

/// Everything needed to run one stage of one document.
pub(super) struct StageRun {
    pub stage: Arc<Stage>,
    pub processor: ResolvedProcessor,
    pub document: Arc<Document>,
    pub inputs: Arc<HashMap<String, StageOutput>>,
    /// The run's token. Each attempt gets a child of it.
    pub token: CancellationToken,
}

/// Outcome of trying to place a task in its lane.
enum Submission {
    Submitted(TaskHandle),
    Cancelled,
    ShuttingDown,
}

impl PipelineManager {
    /// Runs a stage until it succeeds, exhausts its attempts, or is
    /// cancelled.
    pub(super) async fn run_stage(&self, run: StageRun) -> (Arc<Stage>, StageResult) {
        let start = Instant::now();
        let stage = Arc::clone(&run.stage);
        let max_attempts = stage.max_attempts();
        let retry = self.graph.config().retry;

        let mut attempt = 1;
        let result = loop {
            if run.token.is_cancelled() {
                break StageResult::cancelled(
                    "cancelled before dispatch",
                    start.elapsed(),
                    attempt - 1,
                );
            }

            let attempt_token = run.token.child_token();
            let handle = match self.submit(&run, attempt, &attempt_token).await {
                Submission::Submitted(handle) => handle,
                Submission::Cancelled => {
                    break StageResult::cancelled(
                        "cancelled while waiting for a lane",
                        start.elapsed(),
                        attempt - 1,
                    )
                }
                Submission::ShuttingDown => {
                    break StageResult::cancelled(
                        "worker pool is shutting down",
                        start.elapsed(),
                        attempt - 1,
                    )
                }
            };

            if attempt == 1 {
                self.emit_stage_event(&run, ProgressStatus::StageStarted);
            }

            let report = handle.wait().await;
            let failure = match report.outcome {
                AttemptOutcome::Succeeded(output) => {
                    break match self.offload(output).await {
                        Ok(output) => StageResult::success(output, start.elapsed(), attempt),
                        Err(detail) => StageResult::failed(detail, start.elapsed(), attempt),
                    };
                }
                AttemptOutcome::Failed(failure) => failure,
            };

            if failure.kind() == ErrorKind::Cancelled {
                break StageResult::cancelled(failure.to_string(), start.elapsed(), attempt);
            }

            if !failure.is_retryable() || attempt >= max_attempts {
                break StageResult::failed(failure.to_detail(), start.elapsed(), attempt);
            }

            let delay = retry.delay_for(attempt);
            info!(
                document_id = %run.document.id,
                stage = %stage.name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Stage attempt failed, retrying"
            );
            self.metrics.stage_retried(&stage.name);
            self.emit_stage_event(&run, ProgressStatus::StageRetrying);

            tokio::select! {
                _ = run.token.cancelled() => {
                    break StageResult::cancelled(
                        "cancelled during retry backoff",
                        start.elapsed(),
                        attempt,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        };

        (stage, result)
    }

    /// Submits an attempt, waiting while its lane is full.
    async fn submit(
        &self,
        run: &StageRun,
        attempt: u32,
        attempt_token: &CancellationToken,
    ) -> Submission {
        loop {
            let task = self.build_task(run, attempt, attempt_token.clone());
            match self.pool.submit(task) {
                Ok(handle) => return Submission::Submitted(handle),
                Err(SubmitError::ShuttingDown) => return Submission::ShuttingDown,
                Err(SubmitError::QueueFull { lane, capacity }) => {
                    debug!(
                        document_id = %run.document.id,
                        stage = %run.stage.name,
                        lane = %lane,
                        capacity,
                        "Lane full, waiting to resubmit"
                    );
                    tokio::select! {
                        _ = attempt_token.cancelled() => return Submission::Cancelled,
                        _ = tokio::time::sleep(self.submit_retry_delay) => {}
                    }
                }
            }
        }
    }

    fn build_task(&self, run: &StageRun, attempt: u32, token: CancellationToken) -> Task {
        let mut view = ContextView::new(
            Arc::clone(&run.document),
            run.stage.name.clone(),
            Arc::clone(&run.inputs),
            token,
            Arc::clone(&self.content_store),
        )
        .with_attempt(attempt);

        if let Some(tracker) = &self.progress {
            view = view.with_progress(ProgressReporter::new(
                Arc::clone(tracker),
                run.document.id.clone(),
                run.stage.name.clone(),
            ));
        }

        Task::new(
            run.document.id.clone(),
            Arc::clone(&run.stage),
            attempt,
            run.processor.clone(),
            view,
        )
    }

    /// Moves byte outputs above the inline limit into the content store.
    async fn offload(&self, output: StageOutput) -> Result<StageOutput, ErrorDetail> {
        let limit = self.graph.config().inline_payload_limit;
        match output {
            StageOutput::Bytes(bytes) if bytes.len() > limit => {
                let size = bytes.len();
                let id = self
                    .content_store
                    .put(bytes)
                    .await
                    .map_err(|e| ErrorDetail::new(ErrorKind::Storage, e.to_string()))?;
                debug!(content_id = %id, size, "Offloaded stage output");
                Ok(StageOutput::Reference(id))
            }
            other => Ok(other),
        }
    }

    fn emit_stage_event(&self, run: &StageRun, status: ProgressStatus) {
        if let Some(tracker) = &self.progress {
            tracker.record(ProgressEvent::stage(
                run.document.id.clone(),
                run.stage.name.clone(),
                status,
            ));
        }
    }
}

/// Completes when the deadline passes; never completes without one.
pub(super) async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

