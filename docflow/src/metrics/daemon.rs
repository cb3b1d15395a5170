//! Metrics aggregation daemon.
//!
//! The [`MetricsDaemon`] runs as an independent async task that:
//!
//! 1. Receives events from the channel (sent by `MetricsClient`)
//! 2. Updates counters and statistics in `AggregatedState`
//! 3. Samples document throughput once per second
//! 4. Publishes state to a shared handle for reporters to read
//!
//! The daemon is the only writer. Reporters read through a shared `RwLock`
//! handle that the daemon refreshes on every publish tick, so reporters
//! never block event processing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::MetricEvent;
use super::state::{AggregatedState, ThroughputHistory};

/// Interval between publishes of the shared state.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between throughput samples.
const THROUGHPUT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state handle for read-only access by reporters.
pub type SharedMetricsState = Arc<RwLock<MetricsStateSnapshot>>;

/// A snapshot of metrics state for reporter access.
#[derive(Clone, Debug, Default)]
pub struct MetricsStateSnapshot {
    pub state: AggregatedState,
    pub history: ThroughputHistory,
}

impl MetricsStateSnapshot {
    /// Fraction of stages that failed within `window`.
    pub fn error_rate(&self, window: Duration) -> f64 {
        self.state.error_rate(window)
    }

    /// 99th percentile stage duration in seconds within `window`.
    pub fn stage_p99(&self, stage: Option<&str>, window: Duration) -> Option<f64> {
        self.state.stage_p99(stage, window)
    }

    pub fn documents_per_second(&self) -> f64 {
        self.history.current_rate()
    }

    pub fn in_flight_documents(&self) -> u64 {
        self.state.in_flight_documents()
    }
}

/// The metrics aggregation daemon.
pub struct MetricsDaemon {
    rx: mpsc::UnboundedReceiver<MetricEvent>,
    state: AggregatedState,
    history: ThroughputHistory,
    shared_state: SharedMetricsState,
    last_sample: Instant,
    last_documents_completed: u64,
}

impl MetricsDaemon {
    pub fn new(rx: mpsc::UnboundedReceiver<MetricEvent>) -> Self {
        Self {
            rx,
            state: AggregatedState::new(),
            history: ThroughputHistory::default(),
            shared_state: Arc::new(RwLock::new(MetricsStateSnapshot::default())),
            last_sample: Instant::now(),
            last_documents_completed: 0,
        }
    }

    /// Returns a handle to the shared state.
    pub fn state_handle(&self) -> SharedMetricsState {
        Arc::clone(&self.shared_state)
    }

    /// Runs the daemon until shutdown is signaled or every client is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!("Metrics daemon starting");

        let mut publish_interval = tokio::time::interval(PUBLISH_INTERVAL);
        // Don't let missed ticks pile up
        publish_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::debug!("Metrics daemon shutting down");
                    break;
                }

                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.process_event(event),
                        None => break,
                    }
                }

                _ = publish_interval.tick() => {
                    if self.last_sample.elapsed() >= THROUGHPUT_SAMPLE_INTERVAL {
                        self.sample_throughput();
                    }
                    self.update_shared_state();
                }
            }
        }

        // Apply whatever is still queued, then publish once more
        while let Ok(event) = self.rx.try_recv() {
            self.process_event(event);
        }
        self.update_shared_state();
        tracing::debug!("Metrics daemon stopped");
    }

    /// Processes a single event, updating the aggregated state.
    fn process_event(&mut self, event: MetricEvent) {
        let now = Instant::now();
        match event {
            MetricEvent::DocumentStarted { resumed } => {
                self.state.documents_started += 1;
                if resumed {
                    self.state.documents_resumed += 1;
                }
            }
            MetricEvent::DocumentFinished { status, duration: _ } => {
                self.state.record_document_finished(status, now);
            }
            MetricEvent::StageFinished {
                stage,
                status,
                duration,
                attempts,
            } => {
                self.state
                    .record_stage(stage, status, duration, attempts, now);
            }
            MetricEvent::StageRetried { stage } => {
                self.state.record_retry(stage);
            }
            MetricEvent::TaskRejected { lane } => {
                self.state.lane_rejections[lane.index()] += 1;
            }
            MetricEvent::AdmissionRejected => {
                self.state.admission_rejections += 1;
            }
            MetricEvent::Flush(ack) => {
                self.update_shared_state();
                let _ = ack.send(());
            }
        }
    }

    /// Samples the document completion rate.
    fn sample_throughput(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();

        if elapsed > 0.0 {
            let completed = self.state.documents_completed();
            let delta = completed.saturating_sub(self.last_documents_completed);
            self.history
                .documents_per_second
                .push(delta as f64 / elapsed);
            self.last_documents_completed = completed;
        }

        self.last_sample = now;
    }

    /// Updates the shared state for reporters to read.
    fn update_shared_state(&self) {
        let mut guard = self.shared_state.write();
        guard.state = self.state.clone();
        guard.history = self.history.clone();
    }
}

impl std::fmt::Debug for MetricsDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsDaemon")
            .field("documents_started", &self.state.documents_started)
            .field("documents_completed", &self.state.documents_completed())
            .field("history_samples", &self.history.documents_per_second.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LaneKind;
    use crate::metrics::MetricsClient;
    use crate::pipeline::{PipelineStatus, StageStatus};

    fn spawn_daemon() -> (MetricsClient, SharedMetricsState, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let daemon = MetricsDaemon::new(rx);
        let handle = daemon.state_handle();
        let shutdown = CancellationToken::new();
        tokio::spawn(daemon.run(shutdown.clone()));
        (MetricsClient::new(tx), handle, shutdown)
    }

    #[tokio::test]
    async fn test_flush_publishes_prior_events() {
        let (client, handle, shutdown) = spawn_daemon();

        client.document_started(false);
        client.document_started(true);
        client.stage_finished("parse", StageStatus::Success, Duration::from_millis(20), 1);
        client.stage_retried("ocr");
        client.task_rejected(LaneKind::CpuHeavy);
        client.admission_rejected();
        client.document_finished(PipelineStatus::Success, Duration::from_millis(30));
        client.flush().await;

        let snapshot = handle.read().clone();
        assert_eq!(snapshot.state.documents_started, 2);
        assert_eq!(snapshot.state.documents_resumed, 1);
        assert_eq!(snapshot.state.documents(PipelineStatus::Success), 1);
        assert_eq!(snapshot.in_flight_documents(), 1);
        assert_eq!(snapshot.state.stage_retries, 1);
        assert_eq!(snapshot.state.rejections_for(LaneKind::CpuHeavy), 1);
        assert_eq!(snapshot.state.admission_rejections, 1);
        assert_eq!(
            snapshot.state.stages["parse"].count(StageStatus::Success),
            1
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_daemon_stops_when_clients_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let daemon = MetricsDaemon::new(rx);
        let handle = daemon.state_handle();
        let task = tokio::spawn(daemon.run(CancellationToken::new()));

        let client = MetricsClient::new(tx);
        client.document_started(false);
        drop(client);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.read().state.documents_started, 1);
    }

    #[test]
    fn test_throughput_sample() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut daemon = MetricsDaemon::new(rx);
        daemon.last_sample = Instant::now() - Duration::from_secs(2);
        for _ in 0..4 {
            daemon.process_event(MetricEvent::DocumentFinished {
                status: PipelineStatus::Success,
                duration: Duration::ZERO,
            });
        }
        daemon.sample_throughput();

        let rate = daemon.history.current_rate();
        assert!(rate > 1.5 && rate <= 2.0, "rate was {}", rate);
    }
}
