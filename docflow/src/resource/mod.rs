//! Resource monitoring and admission control.
//!
//! [`ResourceMonitor`] periodically samples host load through a
//! [`SystemSampler`] together with the worker pool's lane occupancy, and
//! feeds each [`ResourceSnapshot`] to an [`AdmissionController`] that gates
//! new pipeline executions.

mod admission;
mod monitor;
mod sampler;
mod snapshot;

pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionRequest, AdmissionState, Decision, LoadLevel,
    DEFAULT_CLOSE_AFTER_SAMPLES, DEFAULT_CPU_CLOSE_PERCENT, DEFAULT_CPU_THROTTLE_PERCENT,
    DEFAULT_MEMORY_CLOSE_PERCENT, DEFAULT_MEMORY_THROTTLE_PERCENT, DEFAULT_OPEN_AFTER_SAMPLES,
    DEFAULT_QUEUE_CLOSE_UTILIZATION, DEFAULT_QUEUE_THROTTLE_UTILIZATION, DEFAULT_THROTTLE_DELAY_MS,
};
pub use monitor::{ResourceMonitor, DEFAULT_SAMPLE_INTERVAL_SECS};
pub use sampler::{parse_cpu_times, parse_meminfo, CpuTimes, ManualSampler, ProcSampler, SystemLoad, SystemSampler};
pub use snapshot::ResourceSnapshot;
