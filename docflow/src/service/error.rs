//! Service error types.

use thiserror::Error;

use crate::config::ConfigFileError;
use crate::pipeline::{ConfigurationError, DocumentId};

/// Errors that can occur during service operations.
///
/// Stage failures are never errors here; they are reported in the
/// [`PipelineResult`](crate::pipeline::PipelineResult).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The pipeline definition is invalid.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The pipeline configuration file could not be loaded.
    #[error("Config file error: {0}")]
    ConfigFile(#[from] ConfigFileError),

    /// Admission control refused a new document.
    #[error("Admission closed, document '{document_id}' rejected")]
    AdmissionClosed { document_id: DocumentId },

    /// The document id is already being processed or resumed.
    #[error("Document '{document_id}' is already being processed")]
    AlreadyRunning { document_id: DocumentId },

    /// The service was built outside a Tokio runtime.
    #[error("Runtime error: no Tokio runtime available")]
    NoRuntime,

    /// The service is shutting down and accepts no new documents.
    #[error("Service is shutting down")]
    ShuttingDown,
}
