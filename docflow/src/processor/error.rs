//! Processor and registry errors.

use thiserror::Error;

/// Error returned by a processor.
///
/// Recoverable errors are retried with backoff; unrecoverable errors fail
/// the stage immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    #[error("{0}")]
    Recoverable(String),

    #[error("{0}")]
    Unrecoverable(String),

    /// The processor observed cancellation and stopped early.
    #[error("processor cancelled")]
    Cancelled,
}

impl ProcessorError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

impl From<std::io::Error> for ProcessorError {
    fn from(e: std::io::Error) -> Self {
        Self::Unrecoverable(e.to_string())
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Unrecoverable(e.to_string())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ProcessorError {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Unrecoverable(e.to_string())
    }
}

/// Processor registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a processor is already registered under '{0}'")]
    DuplicateTag(String),

    #[error("no processor provides capability '{capability}' required by stage '{stage}'")]
    ProcessorNotFound { stage: String, capability: String },
}
