//! Pipeline configuration types.
//!
//! A [`PipelineConfig`] is an ordered list of [`StageConfig`]s plus the lane
//! limits and retry policy used to run them. The order of stages matters:
//! it is the dispatch order within a wave.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::defaults::{
    default_cpu_heavy_concurrency, default_cpu_light_concurrency, default_stage_timeout,
    DEFAULT_COST_HINT, DEFAULT_CPU_HEAVY_QUEUE_DEPTH, DEFAULT_CPU_LIGHT_QUEUE_DEPTH,
    DEFAULT_INLINE_PAYLOAD_LIMIT, DEFAULT_IO_CONCURRENCY, DEFAULT_IO_QUEUE_DEPTH,
    DEFAULT_MAX_RETRIES,
};
use crate::executor::LaneKind;
use crate::pipeline::RetryPolicy;

// =============================================================================
// Stage configuration
// =============================================================================

/// Declarative description of one stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name.
    pub name: String,
    /// Capability tag used to resolve a processor.
    pub processor_capability: String,
    /// Stages that must succeed before this one runs.
    pub depends_on: Vec<String>,
    /// Stages whose outputs are visible to this stage. `None` means the
    /// direct dependencies.
    pub inputs: Option<Vec<String>>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Relative cost used to weight progress.
    pub cost_hint: f64,
}

impl StageConfig {
    /// Creates a stage with default timeout, retries and cost.
    pub fn new(name: impl Into<String>, processor_capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processor_capability: processor_capability.into(),
            depends_on: Vec::new(),
            inputs: None,
            timeout: default_stage_timeout(),
            max_retries: DEFAULT_MAX_RETRIES,
            cost_hint: DEFAULT_COST_HINT,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = Some(inputs.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cost_hint(mut self, cost_hint: f64) -> Self {
        self.cost_hint = cost_hint;
        self
    }
}

// =============================================================================
// Lane limits
// =============================================================================

/// Concurrency and queue bounds for one lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Tasks allowed to run at once.
    pub max_concurrency: usize,
    /// Tasks allowed to wait for a slot. Submissions beyond
    /// `max_concurrency + max_queue_depth` are rejected.
    pub max_queue_depth: usize,
}

impl LaneConfig {
    pub const fn new(max_concurrency: usize, max_queue_depth: usize) -> Self {
        Self {
            max_concurrency,
            max_queue_depth,
        }
    }

    /// Total number of tasks the lane will hold.
    pub fn capacity(&self) -> usize {
        self.max_concurrency + self.max_queue_depth
    }
}

/// Limits for all three lanes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub io: LaneConfig,
    pub cpu_light: LaneConfig,
    pub cpu_heavy: LaneConfig,
}

impl ResourceLimits {
    pub fn lane(&self, kind: LaneKind) -> LaneConfig {
        match kind {
            LaneKind::Io => self.io,
            LaneKind::CpuLight => self.cpu_light,
            LaneKind::CpuHeavy => self.cpu_heavy,
        }
    }

    pub fn set_lane(&mut self, kind: LaneKind, config: LaneConfig) {
        match kind {
            LaneKind::Io => self.io = config,
            LaneKind::CpuLight => self.cpu_light = config,
            LaneKind::CpuHeavy => self.cpu_heavy = config,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            io: LaneConfig::new(DEFAULT_IO_CONCURRENCY, DEFAULT_IO_QUEUE_DEPTH),
            cpu_light: LaneConfig::new(
                default_cpu_light_concurrency(),
                DEFAULT_CPU_LIGHT_QUEUE_DEPTH,
            ),
            cpu_heavy: LaneConfig::new(
                default_cpu_heavy_concurrency(),
                DEFAULT_CPU_HEAVY_QUEUE_DEPTH,
            ),
        }
    }
}

// =============================================================================
// Pipeline configuration
// =============================================================================

/// Complete description of a pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages in declaration order.
    pub stages: Vec<StageConfig>,
    pub resource_limits: ResourceLimits,
    pub retry: RetryPolicy,
    /// Upper bound on a whole run. `None` disables the limit.
    pub pipeline_timeout: Option<Duration>,
    /// Byte outputs above this size are offloaded to the content store.
    pub inline_payload_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            resource_limits: ResourceLimits::default(),
            retry: RetryPolicy::default(),
            pipeline_timeout: None,
            inline_payload_limit: DEFAULT_INLINE_PAYLOAD_LIMIT,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Looks up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stable SHA-256 fingerprint of the configuration.
    ///
    /// Checkpoints record this value; a checkpoint written under a
    /// different fingerprint is discarded on resume.
    pub fn content_hash(&self) -> String {
        let mut canonical = String::new();
        for stage in &self.stages {
            let inputs = stage
                .inputs
                .as_ref()
                .map(|i| i.join(","))
                .unwrap_or_else(|| "*".to_string());
            let _ = writeln!(
                canonical,
                "stage|{}|{}|{}|{}|{}|{}|{}",
                stage.name,
                stage.processor_capability,
                stage.depends_on.join(","),
                inputs,
                stage.timeout.as_millis(),
                stage.max_retries,
                stage.cost_hint,
            );
        }
        for kind in LaneKind::ALL {
            let lane = self.resource_limits.lane(kind);
            let _ = writeln!(
                canonical,
                "lane|{}|{}|{}",
                kind, lane.max_concurrency, lane.max_queue_depth
            );
        }
        let _ = writeln!(
            canonical,
            "retry|{}|{}|{}",
            self.retry.initial_delay.as_millis(),
            self.retry.multiplier,
            self.retry.max_delay.as_millis()
        );
        let _ = writeln!(
            canonical,
            "pipeline|{}|{}",
            self.pipeline_timeout.map(|t| t.as_millis()).unwrap_or(0),
            self.inline_payload_limit
        );

        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{:02x}", b);
            out
        })
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Appends a stage. Order of calls is dispatch order.
    pub fn stage(mut self, stage: StageConfig) -> Self {
        self.config.stages.push(stage);
        self
    }

    pub fn lane(mut self, kind: LaneKind, config: LaneConfig) -> Self {
        self.config.resource_limits.set_lane(kind, config);
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.config.resource_limits = limits;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn pipeline_timeout(mut self, timeout: Duration) -> Self {
        self.config.pipeline_timeout = Some(timeout);
        self
    }

    pub fn inline_payload_limit(mut self, limit: usize) -> Self {
        self.config.inline_payload_limit = limit;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
