//! Periodic resource sampling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::admission::{AdmissionController, AdmissionRequest, AdmissionState, Decision};
use super::sampler::SystemSampler;
use super::snapshot::ResourceSnapshot;
use crate::executor::WorkerPool;

/// Default sampling interval (5 seconds).
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 5;

/// Samples host load and lane occupancy and feeds the admission gate.
pub struct ResourceMonitor {
    sampler: Mutex<Box<dyn SystemSampler>>,
    pool: Arc<WorkerPool>,
    controller: AdmissionController,
    latest: RwLock<Option<ResourceSnapshot>>,
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(
        sampler: Box<dyn SystemSampler>,
        pool: Arc<WorkerPool>,
        controller: AdmissionController,
    ) -> Self {
        Self {
            sampler: Mutex::new(sampler),
            pool,
            controller,
            latest: RwLock::new(None),
            interval: Duration::from_secs(DEFAULT_SAMPLE_INTERVAL_SECS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }

    pub fn admission_state(&self) -> AdmissionState {
        self.controller.state()
    }

    /// Takes a sample now and feeds it to the admission gate.
    pub fn sample(&self) -> ResourceSnapshot {
        let load = self.sampler.lock().sample();
        let snapshot = ResourceSnapshot::new(load, self.pool.snapshot());
        let state = self.controller.observe(&snapshot);
        debug!(
            cpu_percent = snapshot.cpu_percent,
            memory_percent = snapshot.memory_percent(),
            active_workers = snapshot.active_workers(),
            queued_tasks = snapshot.queued_tasks(),
            admission = state.as_str(),
            "Resource sample"
        );
        *self.latest.write() = Some(snapshot.clone());
        snapshot
    }

    pub fn admit(&self, request: &AdmissionRequest) -> Decision {
        self.controller.admit(request)
    }

    /// Most recent sample, if any has been taken.
    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.latest.read().clone()
    }

    /// Samples every interval until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sample();
                }
            }
        }
        debug!("Resource monitor stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("interval", &self.interval)
            .field("state", &self.controller.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaneConfig, ResourceLimits};
    use crate::executor::{LaneKind, WorkerPoolConfig};
    use crate::pipeline::DocumentId;
    use crate::resource::{AdmissionConfig, ManualSampler, SystemLoad};

    fn monitor(sampler: ManualSampler) -> ResourceMonitor {
        let mut limits = ResourceLimits::default();
        limits.set_lane(LaneKind::Io, LaneConfig::new(2, 4));
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new(limits)));
        ResourceMonitor::new(
            Box::new(sampler),
            pool,
            AdmissionController::new(AdmissionConfig::default().with_streaks(2, 2)),
        )
    }

    #[tokio::test]
    async fn test_sample_includes_lanes() {
        let sampler = ManualSampler::new();
        sampler.set(SystemLoad {
            cpu_percent: 12.0,
            memory_used_bytes: 1,
            memory_total_bytes: 4,
        });
        let monitor = monitor(sampler);

        assert!(monitor.latest().is_none());
        let snapshot = monitor.sample();
        assert_eq!(snapshot.cpu_percent, 12.0);
        assert_eq!(snapshot.lanes.len(), 3);
        assert_eq!(
            snapshot.lane(LaneKind::Io).map(|l| l.max_queue_depth),
            Some(4)
        );
        assert_eq!(monitor.latest(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_sustained_load_closes_admission() {
        let sampler = ManualSampler::new();
        let monitor = monitor(sampler.clone());
        let request = AdmissionRequest::new(DocumentId::new("doc"));

        sampler.set(SystemLoad {
            cpu_percent: 99.0,
            ..SystemLoad::default()
        });
        monitor.sample();
        assert!(monitor.admit(&request).is_admitted());
        monitor.sample();
        assert_eq!(monitor.admit(&request), Decision::Closed);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let monitor = Arc::new(monitor(ManualSampler::new()).with_interval(Duration::from_millis(5)));
        let shutdown = CancellationToken::new();
        let handle = monitor.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(monitor.latest().is_some());
    }
}
