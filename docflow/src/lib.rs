//! Docflow - DAG-scheduled document processing
//!
//! This library runs documents through pipelines of processor stages. Stages
//! form a dependency graph and run in waves on a bounded, lane-partitioned
//! worker pool, with retries, checkpoint/resume, progress streaming,
//! resource-based admission control, metrics and health reporting.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module provides a simplified facade:
//!
//! ```ignore
//! use docflow::config::{PipelineConfig, StageConfig};
//! use docflow::pipeline::Document;
//! use docflow::service::ServiceBuilder;
//!
//! let config = PipelineConfig::builder()
//!     .stage(StageConfig::new("parse", "pdf-parse"))
//!     .stage(StageConfig::new("ocr", "tesseract").depends_on(["parse"]))
//!     .stage(StageConfig::new("classify", "classifier").depends_on(["parse"]))
//!     .stage(StageConfig::new("index", "indexer").depends_on(["ocr", "classify"]))
//!     .build();
//!
//! let service = ServiceBuilder::new(config).with_registry(registry).build()?;
//! let result = service.process(Document::new("doc-1", "/data/doc-1.pdf")).await?;
//! ```
//!
//! The lower-level building blocks ([`pipeline::PipelineManager`],
//! [`executor::WorkerPool`], [`progress::ProgressTracker`], ...) can also be
//! wired by hand.

pub mod config;
pub mod executor;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod resource;
pub mod service;

/// Version of the docflow library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
