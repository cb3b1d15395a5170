//! Admission control for new pipeline executions.
//!
//! The controller classifies each resource sample as normal, elevated or
//! critical and moves between three states. Requiring streaks of samples
//! before closing or reopening keeps borderline load from flapping the gate.
//!
//! # State Machine
//!
//! ```text
//! Open --[elevated or critical sample]--> Throttled
//! Throttled --[close_after_samples critical in a row]--> Closed
//! Closed --[open_after_samples non-critical in a row]--> Throttled
//! Throttled --[open_after_samples normal in a row]--> Open
//! ```
//!
//! A streak of critical samples long enough to close the gate closes it
//! from `Open` as well.
//!
//! # Thread Safety
//!
//! `AdmissionController` is shared behind `Arc`; the streak counters and
//! state live in one `Mutex`.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::snapshot::ResourceSnapshot;
use crate::pipeline::DocumentId;

/// CPU percent that counts as elevated.
pub const DEFAULT_CPU_THROTTLE_PERCENT: f64 = 75.0;

/// CPU percent that counts as critical.
pub const DEFAULT_CPU_CLOSE_PERCENT: f64 = 90.0;

/// Memory percent that counts as elevated.
pub const DEFAULT_MEMORY_THROTTLE_PERCENT: f64 = 80.0;

/// Memory percent that counts as critical.
pub const DEFAULT_MEMORY_CLOSE_PERCENT: f64 = 92.0;

/// Fullest lane queue fraction that counts as elevated.
pub const DEFAULT_QUEUE_THROTTLE_UTILIZATION: f64 = 0.5;

/// Fullest lane queue fraction that counts as critical.
pub const DEFAULT_QUEUE_CLOSE_UTILIZATION: f64 = 0.9;

/// Consecutive critical samples before the gate closes.
pub const DEFAULT_CLOSE_AFTER_SAMPLES: u32 = 3;

/// Consecutive recovered samples before the gate steps back toward open.
pub const DEFAULT_OPEN_AFTER_SAMPLES: u32 = 3;

/// Delay advised to callers while throttled.
pub const DEFAULT_THROTTLE_DELAY_MS: u64 = 250;

/// Thresholds and streak lengths for admission control.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub cpu_throttle_percent: f64,
    pub cpu_close_percent: f64,
    pub memory_throttle_percent: f64,
    pub memory_close_percent: f64,
    pub queue_throttle_utilization: f64,
    pub queue_close_utilization: f64,
    pub close_after_samples: u32,
    pub open_after_samples: u32,
    pub throttle_delay: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cpu_throttle_percent: DEFAULT_CPU_THROTTLE_PERCENT,
            cpu_close_percent: DEFAULT_CPU_CLOSE_PERCENT,
            memory_throttle_percent: DEFAULT_MEMORY_THROTTLE_PERCENT,
            memory_close_percent: DEFAULT_MEMORY_CLOSE_PERCENT,
            queue_throttle_utilization: DEFAULT_QUEUE_THROTTLE_UTILIZATION,
            queue_close_utilization: DEFAULT_QUEUE_CLOSE_UTILIZATION,
            close_after_samples: DEFAULT_CLOSE_AFTER_SAMPLES,
            open_after_samples: DEFAULT_OPEN_AFTER_SAMPLES,
            throttle_delay: Duration::from_millis(DEFAULT_THROTTLE_DELAY_MS),
        }
    }
}

impl AdmissionConfig {
    pub fn with_streaks(mut self, close_after: u32, open_after: u32) -> Self {
        self.close_after_samples = close_after.max(1);
        self.open_after_samples = open_after.max(1);
        self
    }

    pub fn with_throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = delay;
        self
    }
}

/// Gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    Open,
    Throttled,
    Closed,
}

impl AdmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Throttled => "throttled",
            Self::Closed => "closed",
        }
    }

    /// Numeric value for the admission gauge.
    pub fn gauge_value(&self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Throttled => 1,
            Self::Closed => 2,
        }
    }
}

/// Answer to an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Open,
    /// Admit after waiting `delay`.
    Throttled { delay: Duration },
    /// Reject; the caller must queue or drop the submission itself.
    Closed,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Pressure level of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadLevel {
    Normal,
    Elevated,
    Critical,
}

/// A request to start a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub document_id: DocumentId,
}

impl AdmissionRequest {
    pub fn new(document_id: DocumentId) -> Self {
        Self { document_id }
    }
}

#[derive(Debug)]
struct ControllerInner {
    state: AdmissionState,
    critical_streak: u32,
    calm_streak: u32,
    normal_streak: u32,
}

/// Hysteresis gate over resource samples.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    inner: Mutex<ControllerInner>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ControllerInner {
                state: AdmissionState::Open,
                critical_streak: 0,
                calm_streak: 0,
                normal_streak: 0,
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn state(&self) -> AdmissionState {
        self.inner.lock().state
    }

    /// Classifies one sample against the thresholds.
    pub fn classify(&self, snapshot: &ResourceSnapshot) -> LoadLevel {
        let c = &self.config;
        let cpu = snapshot.cpu_percent;
        let memory = snapshot.memory_percent();
        let queue = snapshot.max_queue_utilization();

        if cpu >= c.cpu_close_percent
            || memory >= c.memory_close_percent
            || queue >= c.queue_close_utilization
        {
            LoadLevel::Critical
        } else if cpu >= c.cpu_throttle_percent
            || memory >= c.memory_throttle_percent
            || queue >= c.queue_throttle_utilization
        {
            LoadLevel::Elevated
        } else {
            LoadLevel::Normal
        }
    }

    /// Feeds one sample into the state machine and returns the new state.
    pub fn observe(&self, snapshot: &ResourceSnapshot) -> AdmissionState {
        let level = self.classify(snapshot);
        let mut inner = self.inner.lock();
        let previous = inner.state;

        match level {
            LoadLevel::Critical => {
                inner.critical_streak += 1;
                inner.calm_streak = 0;
                inner.normal_streak = 0;
            }
            LoadLevel::Elevated => {
                inner.critical_streak = 0;
                inner.calm_streak += 1;
                inner.normal_streak = 0;
            }
            LoadLevel::Normal => {
                inner.critical_streak = 0;
                inner.calm_streak += 1;
                inner.normal_streak += 1;
            }
        }

        let next = match (previous, level) {
            (_, LoadLevel::Critical) if inner.critical_streak >= self.config.close_after_samples => {
                AdmissionState::Closed
            }
            (AdmissionState::Open, LoadLevel::Critical | LoadLevel::Elevated) => {
                AdmissionState::Throttled
            }
            (AdmissionState::Closed, _) if inner.calm_streak >= self.config.open_after_samples => {
                AdmissionState::Throttled
            }
            (AdmissionState::Throttled, LoadLevel::Normal)
                if inner.normal_streak >= self.config.open_after_samples =>
            {
                AdmissionState::Open
            }
            (state, _) => state,
        };

        if next != previous {
            // Each step needs a fresh streak.
            inner.calm_streak = 0;
            inner.normal_streak = 0;
            inner.state = next;
            info!(
                from = previous.as_str(),
                to = next.as_str(),
                cpu_percent = snapshot.cpu_percent,
                memory_percent = snapshot.memory_percent(),
                queue_utilization = snapshot.max_queue_utilization(),
                "Admission state changed"
            );
        }
        next
    }

    /// Decides whether a new pipeline may start now.
    pub fn admit(&self, request: &AdmissionRequest) -> Decision {
        let decision = match self.state() {
            AdmissionState::Open => Decision::Open,
            AdmissionState::Throttled => Decision::Throttled {
                delay: self.config.throttle_delay,
            },
            AdmissionState::Closed => Decision::Closed,
        };
        if !decision.is_admitted() {
            debug!(document_id = %request.document_id, "Admission refused");
        }
        decision
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}
