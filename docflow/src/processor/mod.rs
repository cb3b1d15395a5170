//! Processors and the registry that resolves them.
//!
//! Stages name a capability; the [`ProcessorRegistry`] maps that capability
//! to a [`Processor`] implementation. Processors receive a read-only
//! [`ContextView`] and return a [`StageOutput`].

mod content_store;
mod context;
mod error;
mod output;
mod registry;
mod traits;

pub use content_store::{
    ContentId, ContentStore, ContentStoreError, FileContentStore, MemoryContentStore,
};
pub use context::ContextView;
pub use error::{ProcessorError, RegistryError};
pub use output::StageOutput;
pub use registry::{ProcessorRegistry, ResolvedProcessor};
pub use traits::{
    factory, shared, ProcessFuture, Processor, ProcessorFactory, ProcessorMetadata,
    ResourceProfile,
};
