//! Worker pool configuration.
//!
//! This module contains the [`WorkerPoolConfig`] struct and related constants
//! for configuring the worker pool.

use std::time::Duration;

use crate::config::{PipelineConfig, ResourceLimits};

// =============================================================================
// Configuration Constants
// =============================================================================

/// Default time allowed for in-flight tasks to finish on graceful shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Default time a cooperative processor gets to stop after being cancelled
/// before it is aborted.
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 2_000;

// =============================================================================
// Worker Pool Configuration
// =============================================================================

/// Configuration for the worker pool.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerPoolConfig {
    /// Per-lane concurrency and queue limits.
    pub limits: ResourceLimits,

    /// How long graceful shutdown waits for in-flight tasks.
    pub shutdown_grace: Duration,

    /// How long an `io` or `cpu_light` processor may keep running after
    /// cancellation before it is aborted.
    pub cancel_grace: Duration,
}

impl WorkerPoolConfig {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
        }
    }
}

impl From<&PipelineConfig> for WorkerPoolConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self::new(config.resource_limits)
    }
}
