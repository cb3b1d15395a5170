//! Health evaluation.
//!
//! [`HealthMonitor`] turns a [`HealthInputs`] sample (pool occupancy,
//! published metrics, admission state, progress drops) into a
//! [`HealthReport`]. It keeps just enough state to notice changes: the
//! previous overall status, for logging transitions, and the previous
//! dropped-event count.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::status::{ComponentHealth, HealthReport, HealthStatus, ReadinessReport};
use crate::executor::LaneSnapshot;
use crate::metrics::MetricsStateSnapshot;
use crate::resource::AdmissionState;

/// Error rate above which the pipeline is degraded.
pub const DEFAULT_DEGRADED_ERROR_RATE: f64 = 0.10;

/// Error rate above which the pipeline is unhealthy.
pub const DEFAULT_UNHEALTHY_ERROR_RATE: f64 = 0.50;

/// Window the error rate is computed over.
pub const DEFAULT_ERROR_RATE_WINDOW_SECS: u64 = 60;

/// Time without a completed document, while documents are in flight, after
/// which the pipeline counts as stalled.
pub const DEFAULT_STALL_THRESHOLD_SECS: u64 = 30;

/// Lane queue utilization at which the worker pool is degraded.
pub const DEFAULT_QUEUE_DEGRADED_UTILIZATION: f64 = 0.8;

pub const COMPONENT_WORKER_POOL: &str = "worker_pool";
pub const COMPONENT_PIPELINE: &str = "pipeline";
pub const COMPONENT_ADMISSION: &str = "admission";
pub const COMPONENT_PROGRESS: &str = "progress";

/// Thresholds for component health.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthThresholds {
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub error_rate_window: Duration,
    pub stall_threshold: Duration,
    pub queue_degraded_utilization: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_error_rate: DEFAULT_DEGRADED_ERROR_RATE,
            unhealthy_error_rate: DEFAULT_UNHEALTHY_ERROR_RATE,
            error_rate_window: Duration::from_secs(DEFAULT_ERROR_RATE_WINDOW_SECS),
            stall_threshold: Duration::from_secs(DEFAULT_STALL_THRESHOLD_SECS),
            queue_degraded_utilization: DEFAULT_QUEUE_DEGRADED_UTILIZATION,
        }
    }
}

/// Everything a health check looks at.
#[derive(Clone, Copy, Debug)]
pub struct HealthInputs<'a> {
    pub lanes: &'a [LaneSnapshot],
    pub pool_accepting: bool,
    pub metrics: &'a MetricsStateSnapshot,
    pub admission: AdmissionState,
    pub dropped_progress_events: u64,
}

#[derive(Debug)]
struct MonitorState {
    last_status: HealthStatus,
    last_dropped: u64,
}

/// Computes health reports and logs overall status transitions.
#[derive(Debug)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    state: Mutex<MonitorState>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            state: Mutex::new(MonitorState {
                last_status: HealthStatus::Healthy,
                last_dropped: 0,
            }),
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Evaluates every component.
    pub fn check(&self, inputs: HealthInputs<'_>) -> HealthReport {
        let mut state = self.state.lock();

        let progress = if inputs.dropped_progress_events > state.last_dropped {
            ComponentHealth::degraded(
                COMPONENT_PROGRESS,
                format!(
                    "{} progress events dropped since last check",
                    inputs.dropped_progress_events - state.last_dropped
                ),
            )
        } else {
            ComponentHealth::healthy(COMPONENT_PROGRESS)
        };
        state.last_dropped = inputs.dropped_progress_events;

        let report = HealthReport::from_components(vec![
            self.worker_pool_health(inputs.lanes, inputs.pool_accepting),
            self.pipeline_health(inputs.metrics),
            admission_health(inputs.admission),
            progress,
        ]);

        if report.status != state.last_status {
            let degraded: Vec<&str> = report
                .components
                .iter()
                .filter(|c| !c.status.is_healthy())
                .map(|c| c.name.as_str())
                .collect();
            if report.status > state.last_status {
                warn!(
                    from = %state.last_status,
                    to = %report.status,
                    components = ?degraded,
                    "Health status worsened"
                );
            } else {
                info!(from = %state.last_status, to = %report.status, "Health status improved");
            }
            state.last_status = report.status;
        }

        report
    }

    /// Ready when the pool accepts work and admission is not closed.
    pub fn readiness(&self, pool_accepting: bool, admission: AdmissionState) -> ReadinessReport {
        let mut reasons = Vec::new();
        if !pool_accepting {
            reasons.push("worker pool is not accepting tasks".to_string());
        }
        if admission == AdmissionState::Closed {
            reasons.push("admission is closed".to_string());
        }
        ReadinessReport {
            ready: reasons.is_empty(),
            reasons,
        }
    }

    fn worker_pool_health(&self, lanes: &[LaneSnapshot], accepting: bool) -> ComponentHealth {
        if !accepting {
            return ComponentHealth::unhealthy(COMPONENT_WORKER_POOL, "shutting down");
        }
        let full = lanes
            .iter()
            .filter(|l| l.queue_utilization() >= self.thresholds.queue_degraded_utilization)
            .map(|l| l.lane.as_str())
            .collect::<Vec<_>>();
        if full.is_empty() {
            ComponentHealth::healthy(COMPONENT_WORKER_POOL)
        } else {
            ComponentHealth::degraded(
                COMPONENT_WORKER_POOL,
                format!("queues near capacity: {}", full.join(", ")),
            )
        }
    }

    fn pipeline_health(&self, metrics: &MetricsStateSnapshot) -> ComponentHealth {
        let error_rate = metrics.error_rate(self.thresholds.error_rate_window);
        if error_rate > self.thresholds.unhealthy_error_rate {
            return ComponentHealth::unhealthy(
                COMPONENT_PIPELINE,
                format!("error rate {:.1}%", error_rate * 100.0),
            );
        }

        let state = &metrics.state;
        if state.in_flight_documents() > 0 {
            let since = state.last_completion.unwrap_or(state.uptime_start);
            let idle = Instant::now().saturating_duration_since(since);
            if idle >= self.thresholds.stall_threshold {
                return ComponentHealth::unhealthy(
                    COMPONENT_PIPELINE,
                    format!(
                        "{} documents in flight, none completed for {}s",
                        state.in_flight_documents(),
                        idle.as_secs()
                    ),
                );
            }
        }

        if error_rate > self.thresholds.degraded_error_rate {
            ComponentHealth::degraded(
                COMPONENT_PIPELINE,
                format!("error rate {:.1}%", error_rate * 100.0),
            )
        } else {
            ComponentHealth::healthy(COMPONENT_PIPELINE)
        }
    }
}

fn admission_health(state: AdmissionState) -> ComponentHealth {
    match state {
        AdmissionState::Open => ComponentHealth::healthy(COMPONENT_ADMISSION),
        AdmissionState::Throttled => {
            ComponentHealth::degraded(COMPONENT_ADMISSION, "throttling new documents")
        }
        AdmissionState::Closed => {
            ComponentHealth::unhealthy(COMPONENT_ADMISSION, "rejecting new documents")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LaneKind;
    use crate::pipeline::{PipelineStatus, StageStatus};

    fn lane(queued: usize, max_queue_depth: usize) -> LaneSnapshot {
        LaneSnapshot {
            lane: LaneKind::Io,
            running: 1,
            queued,
            max_concurrency: 4,
            max_queue_depth,
            peak_running: 1,
            rejected: 0,
            completed: 0,
        }
    }

    fn inputs<'a>(
        lanes: &'a [LaneSnapshot],
        metrics: &'a MetricsStateSnapshot,
    ) -> HealthInputs<'a> {
        HealthInputs {
            lanes,
            pool_accepting: true,
            metrics,
            admission: AdmissionState::Open,
            dropped_progress_events: 0,
        }
    }

    fn metrics_with(success: usize, failed: usize) -> MetricsStateSnapshot {
        let mut snapshot = MetricsStateSnapshot::default();
        let now = Instant::now();
        for _ in 0..success {
            snapshot
                .state
                .record_stage("parse".into(), StageStatus::Success, Duration::from_millis(5), 1, now);
        }
        for _ in 0..failed {
            snapshot
                .state
                .record_stage("parse".into(), StageStatus::Failed, Duration::from_millis(5), 1, now);
        }
        snapshot
    }

    #[test]
    fn test_all_healthy() {
        let monitor = HealthMonitor::default();
        let lanes = [lane(0, 10)];
        let metrics = metrics_with(10, 0);
        let report = monitor.check(inputs(&lanes, &metrics));
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.components.len(), 4);
    }

    #[test]
    fn test_error_rate_levels() {
        let monitor = HealthMonitor::default();
        let lanes = [lane(0, 10)];

        let metrics = metrics_with(8, 2);
        let report = monitor.check(inputs(&lanes, &metrics));
        assert_eq!(report.component(COMPONENT_PIPELINE).map(|c| c.status), Some(HealthStatus::Degraded));

        let metrics = metrics_with(2, 8);
        let report = monitor.check(inputs(&lanes, &metrics));
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_full_queue_degrades_pool() {
        let monitor = HealthMonitor::default();
        let lanes = [lane(9, 10)];
        let metrics = MetricsStateSnapshot::default();
        let report = monitor.check(inputs(&lanes, &metrics));
        assert_eq!(
            report.component(COMPONENT_WORKER_POOL).map(|c| c.status),
            Some(HealthStatus::Degraded)
        );
    }

    #[test]
    fn test_stalled_pipeline_is_unhealthy() {
        let monitor = HealthMonitor::new(HealthThresholds {
            stall_threshold: Duration::ZERO,
            ..HealthThresholds::default()
        });
        let mut metrics = MetricsStateSnapshot::default();
        metrics.state.documents_started = 1;
        let report = monitor.check(inputs(&[], &metrics));
        assert_eq!(
            report.component(COMPONENT_PIPELINE).map(|c| c.status),
            Some(HealthStatus::Unhealthy)
        );

        metrics
            .state
            .record_document_finished(PipelineStatus::Success, Instant::now());
        let report = monitor.check(inputs(&[], &metrics));
        assert_eq!(
            report.component(COMPONENT_PIPELINE).map(|c| c.status),
            Some(HealthStatus::Healthy)
        );
    }

    #[test]
    fn test_admission_and_progress_components() {
        let monitor = HealthMonitor::default();
        let metrics = MetricsStateSnapshot::default();

        let mut sample = inputs(&[], &metrics);
        sample.admission = AdmissionState::Throttled;
        sample.dropped_progress_events = 3;
        let report = monitor.check(sample);
        assert_eq!(report.component(COMPONENT_ADMISSION).map(|c| c.status), Some(HealthStatus::Degraded));
        assert_eq!(report.component(COMPONENT_PROGRESS).map(|c| c.status), Some(HealthStatus::Degraded));

        // Same drop count: no new drops since the last check.
        let report = monitor.check(sample);
        assert_eq!(report.component(COMPONENT_PROGRESS).map(|c| c.status), Some(HealthStatus::Healthy));

        sample.admission = AdmissionState::Closed;
        assert_eq!(monitor.check(sample).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_readiness() {
        let monitor = HealthMonitor::default();
        assert!(monitor.readiness(true, AdmissionState::Throttled).ready);

        let report = monitor.readiness(false, AdmissionState::Closed);
        assert!(!report.ready);
        assert_eq!(report.reasons.len(), 2);
    }
}
