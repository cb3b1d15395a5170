//! Pipeline configuration.
//!
//! Pipelines are described by a [`PipelineConfig`], built programmatically
//! with [`PipelineConfig::builder`] or loaded from an INI file with
//! [`PipelineConfig::load_from`].

mod defaults;
mod file;
mod parser;
mod settings;

pub use defaults::{
    available_cpus, default_cpu_heavy_concurrency, default_cpu_light_concurrency,
    default_stage_timeout, DEFAULT_COST_HINT, DEFAULT_CPU_HEAVY_QUEUE_DEPTH,
    DEFAULT_CPU_LIGHT_QUEUE_DEPTH, DEFAULT_INLINE_PAYLOAD_LIMIT, DEFAULT_IO_CONCURRENCY,
    DEFAULT_IO_QUEUE_DEPTH, DEFAULT_MAX_RETRIES, DEFAULT_STAGE_TIMEOUT_SECS,
};
pub use file::ConfigFileError;
pub use settings::{
    LaneConfig, PipelineConfig, PipelineConfigBuilder, ResourceLimits, StageConfig,
};
