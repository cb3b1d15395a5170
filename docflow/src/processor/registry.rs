//! Processor registry.
//!
//! Processors are registered under a primary tag together with a factory.
//! The factory is called once at registration to read the processor's
//! metadata, which is cached; the entry then answers to its tag and every
//! capability that metadata advertises. Every resolution calls the factory
//! again, so each stage run gets its own instance. Register with
//! [`shared`](super::shared) to hand out one instance to every run.
//!
//! When several processors provide the capability a stage asks for, the one
//! with the highest [`ProcessorMetadata::priority`] wins and ties go to the
//! earliest registration.

use std::cmp::Reverse;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::error::RegistryError;
use super::traits::{Processor, ProcessorFactory, ProcessorMetadata};
use crate::pipeline::Stage;

struct RegistryEntry {
    tag: String,
    metadata: ProcessorMetadata,
    factory: ProcessorFactory,
    sequence: u64,
}

impl RegistryEntry {
    fn answers_to(&self, capability: &str) -> bool {
        self.tag == capability || self.metadata.provides(capability)
    }
}

/// A processor chosen for a stage.
#[derive(Clone)]
pub struct ResolvedProcessor {
    pub tag: String,
    pub metadata: ProcessorMetadata,
    pub processor: Arc<dyn Processor>,
}

impl fmt::Debug for ResolvedProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedProcessor")
            .field("tag", &self.tag)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Thread-safe mapping from capability tags to processors.
#[derive(Default)]
pub struct ProcessorRegistry {
    entries: RwLock<Vec<RegistryEntry>>,
    next_sequence: AtomicU64,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor under `tag`.
    ///
    /// Fails with [`RegistryError::DuplicateTag`] if `tag` is taken.
    pub fn register(
        &self,
        tag: impl Into<String>,
        factory: ProcessorFactory,
    ) -> Result<(), RegistryError> {
        self.insert(tag.into(), factory, false)
    }

    /// Registers a processor under `tag`, replacing any existing entry.
    ///
    /// The replacement keeps the original registration's position for
    /// tie-breaking.
    pub fn register_override(&self, tag: impl Into<String>, factory: ProcessorFactory) {
        // Cannot fail when overriding.
        let _ = self.insert(tag.into(), factory, true);
    }

    fn insert(
        &self,
        tag: String,
        factory: ProcessorFactory,
        allow_override: bool,
    ) -> Result<(), RegistryError> {
        let instance = factory();
        let metadata = instance.capabilities();

        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.tag == tag) {
            if !allow_override {
                return Err(RegistryError::DuplicateTag(tag));
            }
            info!(tag = %tag, processor = %metadata.name, "Processor registration overridden");
            existing.metadata = metadata;
            existing.factory = factory;
            return Ok(());
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);

        debug!(
            tag = %tag,
            processor = %metadata.name,
            capabilities = ?metadata.capabilities,
            lane = %metadata.resource_profile,
            priority = metadata.priority,
            "Processor registered"
        );
        entries.push(RegistryEntry {
            tag,
            metadata,
            factory,
            sequence,
        });
        Ok(())
    }

    /// Picks the processor for a stage and builds an instance of it.
    pub fn resolve(&self, stage: &Stage) -> Result<ResolvedProcessor, RegistryError> {
        self.resolve_capability(&stage.processor_capability)
            .ok_or_else(|| RegistryError::ProcessorNotFound {
                stage: stage.name.clone(),
                capability: stage.processor_capability.clone(),
            })
    }

    /// Picks the best processor answering to `capability`.
    ///
    /// The factory runs outside the registry lock.
    pub fn resolve_capability(&self, capability: &str) -> Option<ResolvedProcessor> {
        let (tag, metadata, factory) = {
            let entries = self.entries.read();
            let best = entries
                .iter()
                .filter(|e| e.answers_to(capability))
                .max_by_key(|e| (e.metadata.priority, Reverse(e.sequence)))?;
            (best.tag.clone(), best.metadata.clone(), Arc::clone(&best.factory))
        };
        Some(ResolvedProcessor {
            tag,
            metadata,
            processor: factory(),
        })
    }

    /// Builds a fresh instance from the factory registered under `tag`.
    pub fn instantiate(&self, tag: &str) -> Option<Arc<dyn Processor>> {
        let factory = {
            let entries = self.entries.read();
            entries
                .iter()
                .find(|e| e.tag == tag)
                .map(|e| Arc::clone(&e.factory))
        };
        factory.map(|f| f())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.read().iter().any(|e| e.tag == tag)
    }

    /// Every tag and capability currently answered, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let entries = self.entries.read();
        let mut all: Vec<String> = entries
            .iter()
            .flat_map(|e| std::iter::once(e.tag.clone()).chain(e.metadata.capabilities.clone()))
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("processors", &self.len())
            .finish()
    }
}
