//! Validated stages.

use std::time::Duration;

use crate::config::StageConfig;

/// A stage after graph validation.
///
/// Unlike [`StageConfig`], `inputs` is always resolved: it is either the
/// declared input list or the direct dependencies.
#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    pub name: String,
    pub processor_capability: String,
    pub depends_on: Vec<String>,
    pub inputs: Vec<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub cost_hint: f64,
    /// Position in the configuration.
    pub position: usize,
}

impl Stage {
    pub(crate) fn from_config(config: &StageConfig, position: usize) -> Self {
        Self {
            name: config.name.clone(),
            processor_capability: config.processor_capability.clone(),
            depends_on: config.depends_on.clone(),
            inputs: config
                .inputs
                .clone()
                .unwrap_or_else(|| config.depends_on.clone()),
            timeout: config.timeout,
            max_retries: config.max_retries,
            cost_hint: config.cost_hint,
            position,
        }
    }

    /// Maximum number of attempts, counting the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}
