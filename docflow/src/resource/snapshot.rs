//! Point-in-time resource measurements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sampler::SystemLoad;
use crate::executor::{LaneKind, LaneSnapshot};

/// System load plus per-lane occupancy at one instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub lanes: Vec<LaneSnapshot>,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(load: SystemLoad, lanes: Vec<LaneSnapshot>) -> Self {
        Self {
            cpu_percent: load.cpu_percent,
            memory_used_bytes: load.memory_used_bytes,
            memory_total_bytes: load.memory_total_bytes,
            lanes,
            taken_at: Utc::now(),
        }
    }

    pub fn memory_percent(&self) -> f64 {
        SystemLoad {
            cpu_percent: self.cpu_percent,
            memory_used_bytes: self.memory_used_bytes,
            memory_total_bytes: self.memory_total_bytes,
        }
        .memory_percent()
    }

    /// Fullest lane queue, from 0.0 to 1.0.
    pub fn max_queue_utilization(&self) -> f64 {
        self.lanes
            .iter()
            .map(LaneSnapshot::queue_utilization)
            .fold(0.0, f64::max)
    }

    pub fn lane(&self, kind: LaneKind) -> Option<&LaneSnapshot> {
        self.lanes.iter().find(|l| l.lane == kind)
    }

    /// Running workers across all lanes.
    pub fn active_workers(&self) -> usize {
        self.lanes.iter().map(|l| l.running).sum()
    }

    /// Queued tasks across all lanes.
    pub fn queued_tasks(&self) -> usize {
        self.lanes.iter().map(|l| l.queued).sum()
    }
}
