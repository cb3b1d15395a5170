//! Aggregated metrics state.
//!
//! The daemon owns mutable state and updates it from incoming events.
//! Reporters read a shared copy of this state.
//!
//! # Data Structures
//!
//! - `AggregatedState`: counters, per-stage statistics, recent outcomes
//! - `ThroughputHistory`: ring buffer of documents-per-second samples
//! - `RingBuffer<T>`: fixed-size circular buffer

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::executor::LaneKind;
use crate::pipeline::{PipelineStatus, StageStatus};

/// Latency samples kept per stage.
pub const DEFAULT_LATENCY_SAMPLES: usize = 1024;

/// Throughput samples kept (one per second).
pub const DEFAULT_HISTORY_CAPACITY: usize = 60;

/// Recent stage outcomes older than this are dropped.
pub const RECENT_OUTCOME_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Upper bound on recent stage outcomes kept regardless of age.
pub const MAX_RECENT_OUTCOMES: usize = 10_000;

// =============================================================================
// Ring Buffer
// =============================================================================

/// A fixed-size circular buffer.
#[derive(Clone, Debug)]
pub struct RingBuffer<T: Clone> {
    data: Vec<T>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl<T: Clone + Default> RingBuffer<T> {
    /// Creates a buffer. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![T::default(); capacity],
            capacity,
            head: 0,
            len: 0,
        }
    }

    /// Pushes a value, overwriting the oldest one when full.
    pub fn push(&mut self, value: T) {
        self.data[self.head] = value;
        self.head = (self.head + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
    }

    /// Most recently pushed value.
    pub fn last(&self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.capacity - 1) % self.capacity;
        Some(self.data[idx].clone())
    }

    /// Values from oldest to newest.
    pub fn to_vec(&self) -> Vec<T> {
        let start = (self.head + self.capacity - self.len) % self.capacity;
        (0..self.len)
            .map(|i| self.data[(start + i) % self.capacity].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl RingBuffer<f64> {
    /// Nearest-rank percentile, `q` in 0.0..=1.0.
    pub fn percentile(&self, q: f64) -> Option<f64> {
        percentile(self.to_vec(), q)
    }
}

/// Nearest-rank percentile of `values`.
pub(crate) fn percentile(mut values: Vec<f64>, q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let rank = (q.clamp(0.0, 1.0) * values.len() as f64).ceil() as usize;
    Some(values[rank.saturating_sub(1).min(values.len() - 1)])
}

// =============================================================================
// Per-stage statistics
// =============================================================================

/// Counters and latency samples for one stage.
#[derive(Clone, Debug)]
pub struct StageStats {
    /// Terminal results by status, indexed like [`StageStatus::ALL`].
    pub results: [u64; 4],
    /// Attempts dispatched across all results.
    pub attempts: u64,
    pub retries: u64,
    /// Durations in seconds of recent finished stages.
    pub latencies: RingBuffer<f64>,
}

impl Default for StageStats {
    fn default() -> Self {
        Self {
            results: [0; 4],
            attempts: 0,
            retries: 0,
            latencies: RingBuffer::new(DEFAULT_LATENCY_SAMPLES),
        }
    }
}

impl StageStats {
    pub fn count(&self, status: StageStatus) -> u64 {
        self.results[status_index(status)]
    }
}

fn status_index(status: StageStatus) -> usize {
    StageStatus::ALL
        .iter()
        .position(|s| *s == status)
        .unwrap_or_default()
}

fn pipeline_index(status: PipelineStatus) -> usize {
    PipelineStatus::ALL
        .iter()
        .position(|s| *s == status)
        .unwrap_or_default()
}

/// One finished stage, kept for windowed rates.
#[derive(Clone, Debug)]
pub struct StageOutcome {
    pub at: Instant,
    pub stage: String,
    pub status: StageStatus,
    pub duration_secs: f64,
}

// =============================================================================
// Aggregated State
// =============================================================================

/// Aggregated metrics state maintained by the daemon.
#[derive(Clone, Debug)]
pub struct AggregatedState {
    /// When the metrics system started.
    pub uptime_start: Instant,

    // =========================================================================
    // Document Metrics
    // =========================================================================
    pub documents_started: u64,
    pub documents_resumed: u64,
    /// Finished documents by status, indexed like [`PipelineStatus::ALL`].
    pub documents_finished: [u64; 4],
    pub last_completion: Option<Instant>,

    // =========================================================================
    // Stage Metrics
    // =========================================================================
    pub stages: BTreeMap<String, StageStats>,
    pub stage_retries: u64,
    pub recent: VecDeque<StageOutcome>,

    // =========================================================================
    // Admission Metrics
    // =========================================================================
    /// Lane rejections, indexed like [`LaneKind::ALL`].
    pub lane_rejections: [u64; 3],
    pub admission_rejections: u64,
}

impl Default for AggregatedState {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatedState {
    pub fn new() -> Self {
        Self {
            uptime_start: Instant::now(),
            documents_started: 0,
            documents_resumed: 0,
            documents_finished: [0; 4],
            last_completion: None,
            stages: BTreeMap::new(),
            stage_retries: 0,
            recent: VecDeque::new(),
            lane_rejections: [0; 3],
            admission_rejections: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.uptime_start.elapsed()
    }

    pub fn documents(&self, status: PipelineStatus) -> u64 {
        self.documents_finished[pipeline_index(status)]
    }

    pub fn documents_completed(&self) -> u64 {
        self.documents_finished.iter().sum()
    }

    /// Runs started but not yet finished.
    pub fn in_flight_documents(&self) -> u64 {
        self.documents_started
            .saturating_sub(self.documents_completed())
    }

    pub fn rejections_for(&self, lane: LaneKind) -> u64 {
        self.lane_rejections[lane.index()]
    }

    pub(crate) fn record_document_finished(&mut self, status: PipelineStatus, now: Instant) {
        self.documents_finished[pipeline_index(status)] += 1;
        self.last_completion = Some(now);
    }

    pub(crate) fn record_stage(
        &mut self,
        stage: String,
        status: StageStatus,
        duration: Duration,
        attempts: u32,
        now: Instant,
    ) {
        let stats = self.stages.entry(stage.clone()).or_default();
        stats.results[status_index(status)] += 1;
        stats.attempts += u64::from(attempts);
        let duration_secs = duration.as_secs_f64();
        if matches!(status, StageStatus::Success | StageStatus::Failed) {
            stats.latencies.push(duration_secs);
        }

        self.recent.push_back(StageOutcome {
            at: now,
            stage,
            status,
            duration_secs,
        });
        self.prune_recent(now);
    }

    pub(crate) fn record_retry(&mut self, stage: String) {
        self.stage_retries += 1;
        self.stages.entry(stage).or_default().retries += 1;
    }

    fn prune_recent(&mut self, now: Instant) {
        while self.recent.len() > MAX_RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        while self
            .recent
            .front()
            .is_some_and(|o| now.duration_since(o.at) > RECENT_OUTCOME_RETENTION)
        {
            self.recent.pop_front();
        }
    }

    fn recent_within(&self, window: Duration) -> impl Iterator<Item = &StageOutcome> {
        let now = Instant::now();
        self.recent
            .iter()
            .filter(move |o| now.duration_since(o.at) <= window)
    }

    /// Fraction of stages finished within `window` that failed.
    ///
    /// Only `Success` and `Failed` results count; skipped and cancelled
    /// stages never ran to a verdict. Zero when nothing finished.
    pub fn error_rate(&self, window: Duration) -> f64 {
        let (failed, total) = self
            .recent_within(window)
            .filter(|o| matches!(o.status, StageStatus::Success | StageStatus::Failed))
            .fold((0u64, 0u64), |(failed, total), o| {
                (failed + u64::from(o.status == StageStatus::Failed), total + 1)
            });
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    /// 99th percentile stage duration in seconds within `window`, for one
    /// stage or across all stages.
    pub fn stage_p99(&self, stage: Option<&str>, window: Duration) -> Option<f64> {
        let values: Vec<f64> = self
            .recent_within(window)
            .filter(|o| matches!(o.status, StageStatus::Success | StageStatus::Failed))
            .filter(|o| stage.map_or(true, |s| s == o.stage))
            .map(|o| o.duration_secs)
            .collect();
        percentile(values, 0.99)
    }
}

// =============================================================================
// Throughput History
// =============================================================================

/// Documents-per-second samples.
#[derive(Clone, Debug)]
pub struct ThroughputHistory {
    pub documents_per_second: RingBuffer<f64>,
}

impl ThroughputHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            documents_per_second: RingBuffer::new(capacity),
        }
    }

    /// Latest sampled rate, zero before the first sample.
    pub fn current_rate(&self) -> f64 {
        self.documents_per_second.last().unwrap_or(0.0)
    }
}

impl Default for ThroughputHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
