//! Default values for pipeline configuration.
//!
//! Every tunable has a `DEFAULT_*` constant here so that programmatic
//! construction and INI parsing agree on what "unset" means.

use std::time::Duration;

/// Default per-stage timeout in seconds.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 60;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default relative cost of a stage for progress weighting.
pub const DEFAULT_COST_HINT: f64 = 1.0;

/// Outputs larger than this many bytes are moved to the content store.
pub const DEFAULT_INLINE_PAYLOAD_LIMIT: usize = 64 * 1024;

/// Default concurrency for the I/O lane.
pub const DEFAULT_IO_CONCURRENCY: usize = 32;

/// Default queue depth for the I/O lane.
pub const DEFAULT_IO_QUEUE_DEPTH: usize = 256;

/// Default queue depth for the light CPU lane.
pub const DEFAULT_CPU_LIGHT_QUEUE_DEPTH: usize = 128;

/// Default queue depth for the heavy CPU lane.
pub const DEFAULT_CPU_HEAVY_QUEUE_DEPTH: usize = 32;

/// Fallback CPU count when detection fails.
pub const FALLBACK_CPU_COUNT: usize = 4;

/// Returns the default stage timeout.
pub fn default_stage_timeout() -> Duration {
    Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS)
}

/// Number of logical CPUs, or [`FALLBACK_CPU_COUNT`].
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_CPU_COUNT)
}

/// Default concurrency for the light CPU lane (one per core).
pub fn default_cpu_light_concurrency() -> usize {
    available_cpus()
}

/// Default concurrency for the heavy CPU lane (half the cores, at least one).
pub fn default_cpu_heavy_concurrency() -> usize {
    (available_cpus() / 2).max(1)
}
