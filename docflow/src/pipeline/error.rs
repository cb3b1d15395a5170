//! Pipeline errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::executor::LaneKind;

/// A pipeline definition that cannot be run.
///
/// Raised by [`PipelineGraph::build`](super::PipelineGraph::build) before
/// any document is processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("stage name must not be empty")]
    EmptyStageName,

    #[error("stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("stage '{stage}' depends on undefined stage '{dependency}'")]
    UndefinedDependency { stage: String, dependency: String },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("stage '{stage}' reads input '{input}' which is not one of its dependencies")]
    InvalidInput { stage: String, input: String },

    #[error("stage '{stage}' must have a non-zero timeout")]
    ZeroTimeout { stage: String },

    #[error("lane {lane} must allow at least one concurrent task")]
    InvalidLaneLimit { lane: LaneKind },
}

/// Checkpoint persistence errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint for '{document}' could not be decoded: {source}")]
    Corrupt {
        document: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}
