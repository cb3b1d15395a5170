//! High-level service facade for document processing.
//!
//! This module wires every engine component together behind
//! [`DocflowService`], following the Facade pattern.
//!
//! # Example
//!
//! ```ignore
//! use docflow::config::{PipelineConfig, StageConfig};
//! use docflow::service::ServiceBuilder;
//!
//! let config = PipelineConfig::builder()
//!     .stage(StageConfig::new("parse", "pdf-parse"))
//!     .stage(StageConfig::new("ocr", "tesseract").depends_on(["parse"]))
//!     .build();
//!
//! let service = ServiceBuilder::new(config).with_registry(registry).build()?;
//! let result = service.process(Document::new("doc-1", "/data/doc-1.pdf")).await?;
//! ```

mod builder;
mod error;
mod facade;

pub use builder::{create_pool, spawn_alert_loop, ServiceBuilder, DEFAULT_ALERT_INTERVAL_SECS};
pub use error::ServiceError;
pub use facade::DocflowService;
