//! Pipeline run lifecycle.
//!
//! The wave loop that owns a [`PipelineContext`] for the duration of a run:
//! it propagates skips, dispatches ready stages, records their results,
//! saves checkpoints, and finally assembles the [`PipelineResult`].

use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::PipelineContext;
use super::dispatch::{deadline_elapsed, StageRun};
use super::manager::PipelineManager;
use super::result::{ErrorDetail, ErrorKind, PipelineResult, PipelineStatus, StageResult, StageStatus};
use super::stage::Stage;
use crate::metrics::OptionalMetrics;
use crate::progress::{ProgressEvent, ProgressStatus};

impl PipelineManager {
    /// Drives a context to completion.
    pub(super) async fn run(
        &self,
        mut ctx: PipelineContext,
        resumed: bool,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let document_id = ctx.document_id().clone();

        info!(
            document_id = %document_id,
            stages = self.graph.len(),
            restored = ctx.restored(),
            resumed,
            "Pipeline started"
        );
        self.metrics.document_started(resumed);

        if let Some(tracker) = &self.progress {
            tracker.register(
                &document_id,
                self.graph.stages().map(|s| (s.name.clone(), s.cost_hint)),
            );
            tracker.record(ProgressEvent::pipeline(
                document_id.clone(),
                ProgressStatus::PipelineStarted,
            ));
            for (stage, _) in ctx.results().iter().filter(|(_, r)| r.is_success()) {
                tracker.record(ProgressEvent::stage(
                    document_id.clone(),
                    stage.clone(),
                    ProgressStatus::StageSucceeded,
                ));
            }
        }

        let run_token = cancel.child_token();
        let deadline = self
            .graph
            .config()
            .pipeline_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut timed_out = false;

        loop {
            self.propagate_skips(&mut ctx);

            if !timed_out && deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                timed_out = true;
                self.expire(&mut ctx, &run_token);
            }
            if run_token.is_cancelled() {
                break;
            }

            let ready = self.graph.ready_stages(|name| ctx.status(name));
            if ready.is_empty() {
                break;
            }

            let mut wave = FuturesUnordered::new();
            for position in ready {
                let stage = self.graph.stage_at(position);
                match self.registry.resolve(stage) {
                    Ok(processor) => {
                        wave.push(self.run_stage(StageRun {
                            stage: stage.clone(),
                            processor,
                            document: ctx.document().clone(),
                            inputs: ctx.inputs_for(stage),
                            token: run_token.clone(),
                        }));
                    }
                    Err(e) => {
                        let result =
                            StageResult::skipped(ErrorDetail::new(ErrorKind::ProcessorNotFound, e.to_string()));
                        self.record_result(&mut ctx, stage, result);
                    }
                }
            }
            debug!(document_id = %document_id, stages = wave.len(), "Dispatching wave");

            while !wave.is_empty() {
                let next = tokio::select! {
                    next = wave.next() => next,
                    _ = deadline_elapsed(deadline), if !timed_out => {
                        timed_out = true;
                        self.expire(&mut ctx, &run_token);
                        continue;
                    }
                };
                let Some((stage, result)) = next else {
                    break;
                };
                self.record_result(&mut ctx, &stage, result);
            }
            drop(wave);

            if let Err(e) = self.checkpoint(&ctx).await {
                warn!(document_id = %document_id, error = %e, "Failed to save checkpoint");
                ctx.push_error(format!("checkpoint save failed: {}", e));
            }
        }

        self.finish(ctx, run_token.is_cancelled(), resumed, started_at, start.elapsed())
            .await
    }

    /// Marks stages behind a failed or skipped dependency as skipped.
    fn propagate_skips(&self, ctx: &mut PipelineContext) {
        for &position in self.graph.topological_positions() {
            let stage = self.graph.stage_at(position);
            if ctx.status(&stage.name).is_some() {
                continue;
            }
            let blocked = self
                .graph
                .blocking_dependency(position, |name| ctx.status(name))
                .map(str::to_owned);
            if let Some(dependency) = blocked {
                let result = StageResult::skipped(ErrorDetail::new(
                    ErrorKind::DependencyFailed,
                    format!("dependency '{}' did not succeed", dependency),
                ));
                self.record_result(ctx, stage, result);
            }
        }
    }

    fn expire(&self, ctx: &mut PipelineContext, run_token: &CancellationToken) {
        warn!(
            document_id = %ctx.document_id(),
            timeout_ms = self.graph.config().pipeline_timeout.map_or(0, |t| t.as_millis() as u64),
            "Pipeline timed out, cancelling outstanding stages"
        );
        ctx.push_error("pipeline timed out");
        run_token.cancel();
    }

    /// Writes a terminal stage result into the context and reports it.
    fn record_result(&self, ctx: &mut PipelineContext, stage: &Stage, result: StageResult) {
        let document_id = ctx.document_id().clone();

        match result.status {
            StageStatus::Success => debug!(
                document_id = %document_id,
                stage = %stage.name,
                attempts = result.attempts,
                duration_ms = result.duration.as_millis() as u64,
                "Stage succeeded"
            ),
            StageStatus::Failed => warn!(
                document_id = %document_id,
                stage = %stage.name,
                attempts = result.attempts,
                error = ?result.error,
                "Stage failed"
            ),
            StageStatus::Skipped | StageStatus::Cancelled => debug!(
                document_id = %document_id,
                stage = %stage.name,
                status = %result.status,
                error = ?result.error,
                "Stage did not run to completion"
            ),
        }

        if let Some(tracker) = &self.progress {
            let status = match result.status {
                StageStatus::Success => ProgressStatus::StageSucceeded,
                StageStatus::Failed => ProgressStatus::StageFailed,
                StageStatus::Skipped => ProgressStatus::StageSkipped,
                StageStatus::Cancelled => ProgressStatus::StageCancelled,
            };
            tracker.record(ProgressEvent::stage(document_id, stage.name.clone(), status));
        }
        self.metrics
            .stage_finished(&stage.name, result.status, result.duration, result.attempts);

        ctx.record(stage.name.clone(), result);
    }

    /// Fills in unrun stages, persists the final checkpoint state and
    /// builds the result.
    async fn finish(
        &self,
        mut ctx: PipelineContext,
        cancelled: bool,
        resumed: bool,
        started_at: chrono::DateTime<Utc>,
        elapsed: Duration,
    ) -> PipelineResult {
        let unrun: Vec<_> = self
            .graph
            .stages()
            .filter(|s| ctx.status(&s.name).is_none())
            .cloned()
            .collect();
        for stage in unrun {
            let result = if cancelled {
                StageResult::cancelled("pipeline cancelled", Duration::ZERO, 0)
            } else {
                StageResult::skipped(ErrorDetail::new(
                    ErrorKind::DependencyFailed,
                    "stage was never dispatched",
                ))
            };
            self.record_result(&mut ctx, &stage, result);
        }

        let status = PipelineStatus::from_stages(
            self.graph
                .stages()
                .filter_map(|s| ctx.status(&s.name)),
            cancelled,
        );
        let document_id = ctx.document_id().clone();

        let persisted = if status == PipelineStatus::Success {
            self.checkpoints.delete(&document_id).await
        } else {
            self.checkpoint(&ctx).await
        };
        if let Err(e) = persisted {
            warn!(document_id = %document_id, error = %e, "Failed to update checkpoint");
            ctx.push_error(format!("checkpoint update failed: {}", e));
        }

        let stages = self
            .graph
            .stages()
            .filter_map(|s| ctx.result(&s.name).map(|r| (s.name.clone(), r.clone())))
            .collect();

        let result = PipelineResult {
            document_id: document_id.clone(),
            status,
            stages,
            errors: ctx.errors().to_vec(),
            started_at,
            finished_at: Utc::now(),
            duration: elapsed,
            resumed,
        };

        if let Some(tracker) = &self.progress {
            tracker.record(ProgressEvent::pipeline(
                document_id.clone(),
                ProgressStatus::PipelineFinished,
            ));
            tracker.close(&document_id);
        }
        self.metrics.document_finished(status, elapsed);

        info!(
            document_id = %document_id,
            status = %status,
            succeeded = result.count(StageStatus::Success),
            failed = result.count(StageStatus::Failed),
            skipped = result.count(StageStatus::Skipped),
            cancelled = result.count(StageStatus::Cancelled),
            duration_ms = elapsed.as_millis() as u64,
            "Pipeline finished"
        );

        result
    }
}
