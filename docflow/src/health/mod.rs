//! Service health, readiness and alerting.
//!
//! - [`HealthMonitor`] derives per-component [`HealthStatus`] from the
//!   worker pool, published metrics, admission state and progress buffers
//! - [`AlertManager`] evaluates threshold rules over the metrics window and
//!   notifies registered callbacks
//!
//! Reports serialize to the JSON bodies of `/health` and `/ready`; serving
//! them is left to the embedding application.

mod alerts;
mod monitor;
mod status;

pub use alerts::{
    Alert, AlertCallback, AlertManager, AlertMetric, AlertRule, AlertState,
    DEFAULT_ALERT_COOLDOWN_SECS,
};
pub use monitor::{
    HealthInputs, HealthMonitor, HealthThresholds, COMPONENT_ADMISSION, COMPONENT_PIPELINE,
    COMPONENT_PROGRESS, COMPONENT_WORKER_POOL, DEFAULT_DEGRADED_ERROR_RATE,
    DEFAULT_ERROR_RATE_WINDOW_SECS, DEFAULT_QUEUE_DEGRADED_UTILIZATION,
    DEFAULT_STALL_THRESHOLD_SECS, DEFAULT_UNHEALTHY_ERROR_RATE,
};
pub use status::{ComponentHealth, HealthReport, HealthStatus, ReadinessReport};
