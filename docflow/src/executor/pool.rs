//! The worker pool.
//!
//! ```text
//!   submit(Task)
//!        │  try_admit (CAS)          QueueFull
//!        ├──────────────────────────────────────▶ caller backs off
//!        ▼
//!   ┌─────────┐  ┌───────────┐  ┌───────────┐
//!   │   io    │  │ cpu_light │  │ cpu_heavy │   semaphore per lane
//!   └─────────┘  └───────────┘  └───────────┘
//!        │ io, cpu_light: spawn(processor.process)
//!        │ cpu_heavy:     spawn_blocking(block_on(processor.process))
//!        ▼
//!   TaskReport ──oneshot──▶ TaskHandle::wait
//! ```
//!
//! Every processor future runs in its own tokio task, so a panic is caught
//! by the runtime and reported as an unrecoverable failure instead of
//! taking the pool down. `cpu_heavy` processors run on the blocking thread
//! pool so that synchronous computation never stalls the async workers.
//!
//! # Cancellation
//!
//! On the `io` and `cpu_light` lanes cancellation is cooperative: the task's
//! token fires and the processor is given `cancel_grace` to return before it
//! is aborted.
//!
//! A `cpu_heavy` computation cannot be interrupted mid-way. As soon as
//! cancellation or the stage timeout is observed the attempt is reported as
//! failed and its result is abandoned, but the lane's running slot stays
//! held until the blocking closure actually returns. The lane therefore
//! never runs more than `max_concurrency` heavy computations at once.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::WorkerPoolConfig;
use super::handle::TaskHandle;
use super::lane::{Lane, LaneAdmission, LaneKind, LaneSnapshot};
use super::task::{AttemptFailure, AttemptOutcome, Task, TaskReport};
use super::telemetry::{NullTelemetrySink, TelemetryEvent, TelemetrySink};
use crate::processor::{ProcessorError, StageOutput};

/// Errors from [`WorkerPool::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The lane already holds `max_concurrency + max_queue_depth` tasks.
    #[error("lane {lane} is full ({capacity} tasks in flight)")]
    QueueFull { lane: LaneKind, capacity: usize },

    /// The pool is shutting down.
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Summary of a pool shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished on their own during shutdown.
    pub drained: usize,
    /// Tasks that were still in flight when the pool cancelled them.
    pub cancelled: usize,
}

/// Bounded, lane-partitioned task runner.
pub struct WorkerPool {
    lanes: [Arc<Lane>; 3],
    config: WorkerPoolConfig,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    idle: Arc<Notify>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self::with_telemetry(config, Arc::new(NullTelemetrySink))
    }

    pub fn with_telemetry(config: WorkerPoolConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let lanes = LaneKind::ALL.map(|kind| Arc::new(Lane::new(kind, config.limits.lane(kind))));
        Self {
            lanes,
            config,
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            idle: Arc::new(Notify::new()),
            telemetry,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn lane(&self, kind: LaneKind) -> &Lane {
        &self.lanes[kind.index()]
    }

    /// Snapshot of every lane, in `io`, `cpu_light`, `cpu_heavy` order.
    pub fn snapshot(&self) -> Vec<LaneSnapshot> {
        self.lanes.iter().map(|lane| lane.snapshot()).collect()
    }

    /// Tasks admitted and not yet finished, across all lanes.
    pub fn in_flight(&self) -> usize {
        self.lanes.iter().map(|lane| lane.in_flight()).sum()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Submits a task without blocking.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, SubmitError> {
        if !self.is_accepting() {
            return Err(SubmitError::ShuttingDown);
        }

        let kind = task.lane();
        let lane = &self.lanes[kind.index()];
        let Some(admission) = lane.try_admit() else {
            self.telemetry.emit(TelemetryEvent::TaskRejected {
                document_id: task.document_id.clone(),
                stage: task.stage.name.clone(),
                lane: kind,
            });
            return Err(SubmitError::QueueFull {
                lane: kind,
                capacity: lane.max_concurrency() + lane.max_queue_depth(),
            });
        };

        self.telemetry.emit(TelemetryEvent::TaskAdmitted {
            document_id: task.document_id.clone(),
            stage: task.stage.name.clone(),
            lane: kind,
            in_flight: lane.in_flight(),
        });

        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::new(
            task.document_id.clone(),
            task.stage.name.clone(),
            kind,
            task.attempt,
            task.cancellation(),
            rx,
        );

        let worker = Worker {
            lane: Arc::clone(lane),
            admission,
            shutdown: self.shutdown.clone(),
            cancel_grace: self.config.cancel_grace,
            telemetry: Arc::clone(&self.telemetry),
            idle: Arc::clone(&self.idle),
        };
        tokio::spawn(worker.run(task, tx));

        Ok(handle)
    }

    /// Stops accepting work and winds down in-flight tasks.
    ///
    /// With `graceful`, in-flight tasks get the configured shutdown grace to
    /// finish. Whatever remains is cancelled and reported as cancelled.
    pub async fn shutdown(&self, graceful: bool) -> ShutdownReport {
        self.accepting.store(false, Ordering::Release);
        let at_start = self.in_flight();
        info!(graceful, in_flight = at_start, "Worker pool shutting down");

        if graceful && at_start > 0 {
            self.wait_idle(self.config.shutdown_grace).await;
        }

        let remaining = self.in_flight();
        self.shutdown.cancel();
        if remaining > 0 {
            debug!(remaining, "Cancelling in-flight tasks");
            if !self.wait_idle(self.config.cancel_grace + CANCEL_SETTLE).await {
                warn!(
                    remaining = self.in_flight(),
                    "Tasks still in flight after cancellation"
                );
            }
        }

        let report = ShutdownReport {
            drained: at_start.saturating_sub(remaining),
            cancelled: remaining,
        };
        self.telemetry.emit(TelemetryEvent::PoolShutdown {
            graceful,
            drained: report.drained,
            cancelled: report.cancelled,
        });
        report
    }

    /// Waits until no task is in flight. Returns false on timeout.
    async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("lanes", &self.snapshot())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// Extra time allowed after `cancel_grace` for aborted tasks to report.
const CANCEL_SETTLE: Duration = Duration::from_millis(250);

// =============================================================================
// Worker
// =============================================================================

/// Everything a spawned task needs from the pool.
struct Worker {
    lane: Arc<Lane>,
    admission: LaneAdmission,
    shutdown: CancellationToken,
    cancel_grace: Duration,
    telemetry: Arc<dyn TelemetrySink>,
    idle: Arc<Notify>,
}

impl Worker {
    async fn run(self, task: Task, reply: oneshot::Sender<TaskReport>) {
        let queued_at = Instant::now();
        let kind = self.lane.kind();
        let token = task.cancellation();

        let slot = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            _ = self.shutdown.cancelled() => None,
            slot = self.lane.acquire() => slot,
        };
        let queue_wait = queued_at.elapsed();

        let started = Instant::now();
        let outcome = match slot {
            None => AttemptOutcome::Failed(AttemptFailure::Cancelled),
            Some(slot) => {
                self.telemetry.emit(TelemetryEvent::TaskStarted {
                    document_id: task.document_id.clone(),
                    stage: task.stage.name.clone(),
                    lane: kind,
                    attempt: task.attempt,
                    queue_wait,
                });
                let (outcome, straggler) = self.execute(&task, &token).await;
                match straggler {
                    Some(join) => {
                        tokio::spawn(async move {
                            let _ = join.await;
                            drop(slot);
                        });
                    }
                    None => drop(slot),
                }
                outcome
            }
        };
        let run_time = started.elapsed();

        self.telemetry.emit(TelemetryEvent::TaskCompleted {
            document_id: task.document_id.clone(),
            stage: task.stage.name.clone(),
            lane: kind,
            attempt: task.attempt,
            outcome: outcome.label(),
            run_time,
        });

        let report = TaskReport {
            document_id: task.document_id,
            stage: task.stage.name.clone(),
            lane: kind,
            attempt: task.attempt,
            queue_wait,
            run_time,
            outcome,
        };

        drop(self.admission);
        // The receiver may have stopped waiting.
        let _ = reply.send(report);
        self.idle.notify_waiters();
    }

    /// Runs one attempt. A returned join handle is a `cpu_heavy`
    /// computation still running after its attempt was given up.
    async fn execute(
        &self,
        task: &Task,
        token: &CancellationToken,
    ) -> (AttemptOutcome, Option<JoinHandle<ProcessResult>>) {
        if self.lane.kind().is_cooperative() {
            (self.execute_cooperative(task, token).await, None)
        } else {
            self.execute_blocking(task, token).await
        }
    }

    async fn execute_blocking(
        &self,
        task: &Task,
        token: &CancellationToken,
    ) -> (AttemptOutcome, Option<JoinHandle<ProcessResult>>) {
        let timeout = task.stage.timeout;
        let processor = Arc::clone(&task.processor.processor);
        let view = task.view.clone();
        let runtime = Handle::current();
        let mut join =
            tokio::task::spawn_blocking(move || runtime.block_on(processor.process(&view)));

        let failure = tokio::select! {
            biased;
            result = &mut join => return (outcome_from_join(result), None),
            _ = token.cancelled() => AttemptFailure::Cancelled,
            _ = self.shutdown.cancelled() => AttemptFailure::Cancelled,
            _ = tokio::time::sleep(timeout) => AttemptFailure::Timeout(timeout),
        };

        // Lets a computation that polls its token stop early.
        token.cancel();
        debug!(
            document_id = %task.document_id,
            stage = %task.stage.name,
            error = %failure,
            "Abandoned cpu_heavy attempt, slot held until it returns"
        );
        (AttemptOutcome::Failed(failure), Some(join))
    }

    async fn execute_cooperative(&self, task: &Task, token: &CancellationToken) -> AttemptOutcome {
        let timeout = task.stage.timeout;
        let processor = Arc::clone(&task.processor.processor);
        let view = task.view.clone();
        let mut join = tokio::spawn(async move { processor.process(&view).await });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut signalled = false;
        loop {
            tokio::select! {
                biased;
                result = &mut join => return outcome_from_join(result),
                _ = &mut deadline => {
                    join.abort();
                    let failure = if signalled {
                        AttemptFailure::Cancelled
                    } else {
                        AttemptFailure::Timeout(timeout)
                    };
                    return AttemptOutcome::Failed(failure);
                }
                _ = token.cancelled(), if !signalled => {
                    signalled = true;
                    self.shorten(deadline.as_mut());
                }
                _ = self.shutdown.cancelled(), if !signalled => {
                    token.cancel();
                    signalled = true;
                    self.shorten(deadline.as_mut());
                }
            }
        }
    }

    /// Moves the deadline to at most `cancel_grace` from now.
    fn shorten(&self, deadline: std::pin::Pin<&mut tokio::time::Sleep>) {
        let grace = Instant::now() + self.cancel_grace;
        if grace < deadline.deadline() {
            deadline.reset(grace);
        }
    }
}

type ProcessResult = Result<StageOutput, ProcessorError>;

fn outcome_from_join(result: Result<ProcessResult, JoinError>) -> AttemptOutcome {
    match result {
        Ok(Ok(output)) => AttemptOutcome::Succeeded(output),
        Ok(Err(ProcessorError::Cancelled)) => AttemptOutcome::Failed(AttemptFailure::Cancelled),
        Ok(Err(e)) => AttemptOutcome::Failed(AttemptFailure::Processor(e)),
        Err(e) if e.is_panic() => {
            AttemptOutcome::Failed(AttemptFailure::Panicked(panic_message(e.into_panic())))
        }
        Err(_) => AttemptOutcome::Failed(AttemptFailure::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaneConfig, ResourceLimits, StageConfig};
    use crate::pipeline::{Document, DocumentId, Stage};
    use crate::processor::{
        ContextView, MemoryContentStore, ProcessFuture, Processor, ProcessorMetadata,
        ResolvedProcessor, ResourceProfile,
    };
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Gauge {
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    enum Behaviour {
        Succeed,
        /// Synchronous work that never yields.
        Block(Duration, Arc<Gauge>),
        Panic,
        Sleep(Duration),
        WaitForCancel,
        IgnoreCancel,
    }

    struct TestProcessor {
        profile: ResourceProfile,
        behaviour: Behaviour,
    }

    impl Processor for TestProcessor {
        fn capabilities(&self) -> ProcessorMetadata {
            ProcessorMetadata::new("test").with_profile(self.profile)
        }

        fn process<'a>(&'a self, view: &'a ContextView) -> ProcessFuture<'a> {
            Box::pin(async move {
                match self.behaviour {
                    Behaviour::Succeed => Ok(StageOutput::text(view.stage())),
                    Behaviour::Block(d, ref gauge) => {
                        let now = gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
                        gauge.peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(d);
                        gauge.running.fetch_sub(1, Ordering::SeqCst);
                        gauge.finished.fetch_add(1, Ordering::SeqCst);
                        Ok(StageOutput::text(view.stage()))
                    }
                    Behaviour::Panic => panic!("processor exploded"),
                    Behaviour::Sleep(d) => {
                        tokio::time::sleep(d).await;
                        Ok(StageOutput::Empty)
                    }
                    Behaviour::WaitForCancel => {
                        view.cancelled().await;
                        Err(ProcessorError::Cancelled)
                    }
                    Behaviour::IgnoreCancel => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(StageOutput::Empty)
                    }
                }
            })
        }
    }

    fn task(profile: ResourceProfile, behaviour: Behaviour, timeout: Duration) -> Task {
        let processor = Arc::new(TestProcessor { profile, behaviour });
        let stage = Arc::new(Stage::from_config(
            &StageConfig::new("stage", "test").with_timeout(timeout),
            0,
        ));
        let view = ContextView::new(
            Arc::new(Document::new("doc", "src")),
            "stage",
            Arc::new(HashMap::new()),
            CancellationToken::new(),
            Arc::new(MemoryContentStore::new()),
        );
        Task::new(
            DocumentId::new("doc"),
            stage,
            1,
            ResolvedProcessor {
                tag: "test".into(),
                metadata: processor.capabilities(),
                processor,
            },
            view,
        )
    }

    fn pool(io: LaneConfig) -> WorkerPool {
        let limits = ResourceLimits {
            io,
            cpu_light: LaneConfig::new(2, 2),
            cpu_heavy: LaneConfig::new(1, 1),
        };
        WorkerPool::new(
            WorkerPoolConfig::new(limits)
                .with_shutdown_grace(Duration::from_millis(200))
                .with_cancel_grace(Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn test_submit_success() {
        let pool = pool(LaneConfig::new(2, 2));
        let handle = pool
            .submit(task(ResourceProfile::Io, Behaviour::Succeed, Duration::from_secs(5)))
            .unwrap();
        assert_eq!(handle.lane(), LaneKind::Io);

        let report = handle.wait().await;
        assert_eq!(report.outcome, AttemptOutcome::Succeeded(StageOutput::text("stage")));
    }

    #[tokio::test]
    async fn test_panic_reported_as_failure() {
        let pool = pool(LaneConfig::new(2, 2));
        let report = pool
            .submit(task(ResourceProfile::CpuLight, Behaviour::Panic, Duration::from_secs(5)))
            .unwrap()
            .wait()
            .await;

        match report.outcome {
            AttemptOutcome::Failed(AttemptFailure::Panicked(msg)) => {
                assert!(msg.contains("processor exploded"))
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // The pool keeps working after a panic.
        let report = pool
            .submit(task(ResourceProfile::CpuLight, Behaviour::Succeed, Duration::from_secs(5)))
            .unwrap()
            .wait()
            .await;
        assert!(report.outcome.is_success());
    }

    #[tokio::test]
    async fn test_timeout_on_heavy_lane() {
        let pool = pool(LaneConfig::new(2, 2));
        let report = pool
            .submit(task(
                ResourceProfile::CpuHeavy,
                Behaviour::Sleep(Duration::from_millis(300)),
                Duration::from_millis(30),
            ))
            .unwrap()
            .wait()
            .await;
        assert_eq!(
            report.outcome,
            AttemptOutcome::Failed(AttemptFailure::Timeout(Duration::from_millis(30)))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_heavy_work_succeeds() {
        let pool = pool(LaneConfig::new(2, 2));
        let gauge = Arc::new(Gauge::default());
        let report = pool
            .submit(task(
                ResourceProfile::CpuHeavy,
                Behaviour::Block(Duration::from_millis(20), Arc::clone(&gauge)),
                Duration::from_secs(5),
            ))
            .unwrap()
            .wait()
            .await;

        assert_eq!(report.outcome, AttemptOutcome::Succeeded(StageOutput::text("stage")));
        assert_eq!(gauge.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_heavy_work_keeps_lane_slot() {
        let limits = ResourceLimits {
            io: LaneConfig::new(2, 2),
            cpu_light: LaneConfig::new(2, 2),
            cpu_heavy: LaneConfig::new(1, 2),
        };
        let pool = WorkerPool::new(WorkerPoolConfig::new(limits));
        let gauge = Arc::new(Gauge::default());

        let handles: Vec<_> = (0..3)
            .map(|_| {
                pool.submit(task(
                    ResourceProfile::CpuHeavy,
                    Behaviour::Block(Duration::from_millis(150), Arc::clone(&gauge)),
                    Duration::from_millis(30),
                ))
                .unwrap()
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.wait().await.outcome,
                AttemptOutcome::Failed(AttemptFailure::Timeout(Duration::from_millis(30)))
            );
        }

        // Each attempt timed out, yet the next one only started once the
        // previous computation had returned.
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert!(gauge.finished.load(Ordering::SeqCst) >= 2);

        let lane = pool.lane(LaneKind::CpuHeavy);
        tokio::time::timeout(Duration::from_secs(5), async {
            while lane.snapshot().running > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("slot released once the computation returns");
        assert_eq!(gauge.finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_queue_full_rejects() {
        let pool = pool(LaneConfig::new(1, 1));
        let long = || task(ResourceProfile::Io, Behaviour::WaitForCancel, Duration::from_secs(10));

        let a = pool.submit(long()).unwrap();
        let b = pool.submit(long()).unwrap();
        let err = pool.submit(long()).unwrap_err();
        assert_eq!(
            err,
            SubmitError::QueueFull {
                lane: LaneKind::Io,
                capacity: 2
            }
        );
        assert_eq!(pool.lane(LaneKind::Io).rejected(), 1);

        a.cancel();
        b.cancel();
        assert_eq!(a.wait().await.outcome, AttemptOutcome::Failed(AttemptFailure::Cancelled));
        assert_eq!(b.wait().await.outcome, AttemptOutcome::Failed(AttemptFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_cooperative_cancel_is_bounded() {
        let pool = pool(LaneConfig::new(1, 0));
        let handle = pool
            .submit(task(ResourceProfile::Io, Behaviour::IgnoreCancel, Duration::from_secs(60)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("cancel grace should bound the wait");
        assert_eq!(report.outcome, AttemptOutcome::Failed(AttemptFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains() {
        let pool = pool(LaneConfig::new(2, 2));
        let handle = pool
            .submit(task(
                ResourceProfile::Io,
                Behaviour::Sleep(Duration::from_millis(20)),
                Duration::from_secs(5),
            ))
            .unwrap();

        let report = pool.shutdown(true).await;
        assert_eq!(report, ShutdownReport { drained: 1, cancelled: 0 });
        assert!(handle.wait().await.outcome.is_success());

        let err = pool
            .submit(task(ResourceProfile::Io, Behaviour::Succeed, Duration::from_secs(5)))
            .unwrap_err();
        assert_eq!(err, SubmitError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stragglers() {
        let pool = pool(LaneConfig::new(1, 1));
        let running = pool
            .submit(task(ResourceProfile::Io, Behaviour::WaitForCancel, Duration::from_secs(60)))
            .unwrap();
        let queued = pool
            .submit(task(ResourceProfile::Io, Behaviour::WaitForCancel, Duration::from_secs(60)))
            .unwrap();

        let report = pool.shutdown(false).await;
        assert_eq!(report.cancelled, 2);
        assert_eq!(
            running.wait().await.outcome,
            AttemptOutcome::Failed(AttemptFailure::Cancelled)
        );
        assert_eq!(
            queued.wait().await.outcome,
            AttemptOutcome::Failed(AttemptFailure::Cancelled)
        );
        assert_eq!(pool.in_flight(), 0);
    }
}
