//! Resource lanes for task concurrency control.
//!
//! Each lane is a semaphore-backed capacity limiter with a bounded waiting
//! area in front of it. Processors declare a resource profile, which maps to
//! one of three lanes:
//!
//! - [`LaneKind::Io`]: file and network waits
//! - [`LaneKind::CpuLight`]: short computations
//! - [`LaneKind::CpuHeavy`]: long computations, bounded tightly
//!
//! # Admission
//!
//! A lane holds at most `max_concurrency + max_queue_depth` tasks. Admission
//! is decided synchronously at submission with a compare-and-swap on the
//! admitted counter, so a burst of submissions is never over-admitted.
//! Admitted tasks then wait for a semaphore permit before running.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LaneConfig;

// =============================================================================
// Lane Kind
// =============================================================================

/// The three execution lanes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    Io,
    CpuLight,
    CpuHeavy,
}

impl LaneKind {
    pub const ALL: [LaneKind; 3] = [LaneKind::Io, LaneKind::CpuLight, LaneKind::CpuHeavy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::CpuLight => "cpu_light",
            Self::CpuHeavy => "cpu_heavy",
        }
    }

    /// Lanes whose processors run as async tasks and are asked to stop via
    /// their token. The others run on the blocking pool.
    pub fn is_cooperative(&self) -> bool {
        !matches!(self, Self::CpuHeavy)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Io => 0,
            Self::CpuLight => 1,
            Self::CpuHeavy => 2,
        }
    }
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaneKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "io" => Ok(Self::Io),
            "cpu_light" => Ok(Self::CpuLight),
            "cpu_heavy" => Ok(Self::CpuHeavy),
            other => Err(format!("unknown lane '{}'", other)),
        }
    }
}

// =============================================================================
// Lane Snapshot
// =============================================================================

/// Point-in-time view of one lane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSnapshot {
    pub lane: LaneKind,
    pub running: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub max_queue_depth: usize,
    pub peak_running: usize,
    pub rejected: u64,
    pub completed: u64,
}

impl LaneSnapshot {
    /// Fraction of the waiting area in use, from 0.0 to 1.0.
    pub fn queue_utilization(&self) -> f64 {
        if self.max_queue_depth == 0 {
            return if self.queued > 0 { 1.0 } else { 0.0 };
        }
        (self.queued as f64 / self.max_queue_depth as f64).min(1.0)
    }

    /// Fraction of running slots in use, from 0.0 to 1.0.
    pub fn saturation(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 0.0;
        }
        (self.running as f64 / self.max_concurrency as f64).min(1.0)
    }
}

// =============================================================================
// Lane
// =============================================================================

/// A bounded lane: a semaphore for running tasks plus a bounded queue.
#[derive(Debug)]
pub struct Lane {
    kind: LaneKind,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    max_queue_depth: usize,
    admitted: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    rejected: AtomicU64,
    completed: AtomicU64,
}

impl Lane {
    /// Creates a lane. A zero concurrency limit is raised to one.
    pub fn new(kind: LaneKind, config: LaneConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            kind,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            max_queue_depth: config.max_queue_depth,
            admitted: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> LaneKind {
        self.kind
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn max_queue_depth(&self) -> usize {
        self.max_queue_depth
    }

    /// Running plus queued.
    pub fn in_flight(&self) -> usize {
        self.admitted.load(Ordering::Acquire)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.in_flight().saturating_sub(self.running())
    }

    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LaneSnapshot {
        LaneSnapshot {
            lane: self.kind,
            running: self.running(),
            queued: self.queued(),
            max_concurrency: self.max_concurrency,
            max_queue_depth: self.max_queue_depth,
            peak_running: self.peak_running(),
            rejected: self.rejected(),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    /// Reserves a place in the lane without waiting.
    ///
    /// Returns `None` when running plus queued tasks already fill the lane.
    pub(crate) fn try_admit(self: &Arc<Self>) -> Option<LaneAdmission> {
        let capacity = self.max_concurrency + self.max_queue_depth;
        let mut current = self.admitted.load(Ordering::Acquire);
        loop {
            if current >= capacity {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            match self.admitted.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(LaneAdmission {
                        lane: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Waits for a running slot.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Option<RunningSlot> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        let current = self.running.fetch_add(1, Ordering::Relaxed) + 1;
        self.update_peak(current);
        Some(RunningSlot {
            _permit: permit,
            lane: Arc::clone(self),
        })
    }

    /// Updates the peak counter if current exceeds it.
    fn update_peak(&self, current: usize) {
        let mut peak = self.peak_running.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_running.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }
}

/// A reserved place in a lane. Released on drop.
#[derive(Debug)]
pub(crate) struct LaneAdmission {
    lane: Arc<Lane>,
}

impl Drop for LaneAdmission {
    fn drop(&mut self) {
        self.lane.admitted.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A running slot in a lane. Released on drop.
#[derive(Debug)]
pub(crate) struct RunningSlot {
    _permit: OwnedSemaphorePermit,
    lane: Arc<Lane>,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.lane.running.fetch_sub(1, Ordering::Relaxed);
        self.lane.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_kind_parse() {
        assert_eq!("io".parse::<LaneKind>(), Ok(LaneKind::Io));
        assert_eq!("cpu-light".parse::<LaneKind>(), Ok(LaneKind::CpuLight));
        assert_eq!("CPU_HEAVY".parse::<LaneKind>(), Ok(LaneKind::CpuHeavy));
        assert!("gpu".parse::<LaneKind>().is_err());
    }

    #[test]
    fn test_lane_kind_display() {
        assert_eq!(LaneKind::CpuLight.to_string(), "cpu_light");
    }

    #[test]
    fn test_cooperative_lanes() {
        assert!(LaneKind::Io.is_cooperative());
        assert!(LaneKind::CpuLight.is_cooperative());
        assert!(!LaneKind::CpuHeavy.is_cooperative());
    }

    #[test]
    fn test_admission_bounded_by_capacity() {
        let lane = Arc::new(Lane::new(LaneKind::Io, LaneConfig::new(2, 3)));
        let admitted: Vec<_> = (0..10).filter_map(|_| lane.try_admit()).collect();

        assert_eq!(admitted.len(), 5);
        assert_eq!(lane.in_flight(), 5);
        assert_eq!(lane.rejected(), 5);

        drop(admitted);
        assert_eq!(lane.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_running_slots_track_peak() {
        let lane = Arc::new(Lane::new(LaneKind::CpuLight, LaneConfig::new(2, 0)));
        let a = lane.acquire().await.unwrap();
        let b = lane.acquire().await.unwrap();
        assert_eq!(lane.running(), 2);
        assert_eq!(lane.peak_running(), 2);

        drop(a);
        drop(b);
        let snapshot = lane.snapshot();
        assert_eq!(snapshot.running, 0);
        assert_eq!(snapshot.peak_running, 2);
        assert_eq!(snapshot.completed, 2);
    }

    #[test]
    fn test_zero_concurrency_raised_to_one() {
        let lane = Lane::new(LaneKind::Io, LaneConfig::new(0, 0));
        assert_eq!(lane.max_concurrency(), 1);
    }

    #[test]
    fn test_snapshot_utilization() {
        let snapshot = LaneSnapshot {
            lane: LaneKind::Io,
            running: 5,
            queued: 5,
            max_concurrency: 5,
            max_queue_depth: 10,
            peak_running: 5,
            rejected: 0,
            completed: 0,
        };
        assert_eq!(snapshot.queue_utilization(), 0.5);
        assert_eq!(snapshot.saturation(), 1.0);
    }
}
