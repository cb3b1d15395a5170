//! Bounded worker pool with three resource lanes.
//!
//! Tasks are routed to a lane by the processor's resource profile. Each
//! lane bounds both running and waiting tasks, rejecting submissions beyond
//! its capacity so callers can apply backpressure.

mod config;
mod handle;
mod lane;
mod pool;
mod task;
mod telemetry;

pub use config::{WorkerPoolConfig, DEFAULT_CANCEL_GRACE_MS, DEFAULT_SHUTDOWN_GRACE_SECS};
pub use handle::TaskHandle;
pub use lane::{Lane, LaneKind, LaneSnapshot};
pub use pool::{ShutdownReport, SubmitError, WorkerPool};
pub use task::{AttemptFailure, AttemptOutcome, Task, TaskReport};
pub use telemetry::{
    MultiplexTelemetrySink, NullTelemetrySink, TelemetryEvent, TelemetrySink,
    TracingTelemetrySink,
};
