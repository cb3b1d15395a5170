//! The processor contract.
//!
//! A processor performs the work of one stage. The engine never inspects
//! what a processor does; it only needs to know which lane the work belongs
//! on and which capability tags it answers to.
//!
//! ```text
//! ┌──────────────────┐   resolve(capability)   ┌────────────────────┐
//! │ PipelineManager  │ ──────────────────────▶ │ ProcessorRegistry  │
//! └──────────────────┘                         └────────────────────┘
//!          │ Task { view, processor }                   │ factory()
//!          ▼                                            ▼
//! ┌──────────────────┐   process(&ContextView) ┌────────────────────┐
//! │   WorkerPool     │ ──────────────────────▶ │  dyn Processor     │
//! │ io / cpu_light / │                         └────────────────────┘
//! │    cpu_heavy     │
//! └──────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::context::ContextView;
use super::error::ProcessorError;
use super::output::StageOutput;
use crate::executor::LaneKind;

// ============================================================================
// Resource Profile
// ============================================================================

/// Kind of work a processor does, which decides its lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceProfile {
    /// Waits on files or the network.
    Io,
    /// Short computations.
    CpuLight,
    /// Long computations that must be bounded tightly.
    CpuHeavy,
}

impl ResourceProfile {
    pub fn lane(self) -> LaneKind {
        match self {
            Self::Io => LaneKind::Io,
            Self::CpuLight => LaneKind::CpuLight,
            Self::CpuHeavy => LaneKind::CpuHeavy,
        }
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lane())
    }
}

impl FromStr for ResourceProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<LaneKind>().map(|lane| match lane {
            LaneKind::Io => Self::Io,
            LaneKind::CpuLight => Self::CpuLight,
            LaneKind::CpuHeavy => Self::CpuHeavy,
        })
    }
}

// ============================================================================
// Processor Metadata
// ============================================================================

/// What a processor offers and how it should be scheduled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorMetadata {
    /// Name for logs.
    pub name: String,
    /// Capability tags this processor answers to.
    pub capabilities: Vec<String>,
    pub resource_profile: ResourceProfile,
    pub supports_batch: bool,
    /// Higher wins when several processors share a capability.
    pub priority: i32,
}

impl ProcessorMetadata {
    /// Metadata for a processor named `name` providing one capability of the
    /// same name, on the light CPU lane.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            capabilities: vec![name.clone()],
            name,
            resource_profile: ResourceProfile::CpuLight,
            supports_batch: false,
            priority: 0,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        let capability = capability.into();
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn with_profile(mut self, profile: ResourceProfile) -> Self {
        self.resource_profile = profile;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_support(mut self) -> Self {
        self.supports_batch = true;
        self
    }

    pub fn provides(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

// ============================================================================
// Processor Trait
// ============================================================================

/// Future returned by [`Processor::process`].
pub type ProcessFuture<'a> =
    Pin<Box<dyn Future<Output = Result<StageOutput, ProcessorError>> + Send + 'a>>;

/// The unit of work behind a stage.
///
/// Processors on the `io` and `cpu_light` lanes are expected to check
/// [`ContextView::is_cancelled`] and return [`ProcessorError::Cancelled`]
/// promptly. Processors on the `cpu_heavy` lane run on a blocking thread
/// and may do synchronous work; once they time out or are cancelled their
/// result is discarded, and the lane slot is freed when they return.
///
/// # Example
///
/// ```ignore
/// struct Uppercase;
///
/// impl Processor for Uppercase {
///     fn capabilities(&self) -> ProcessorMetadata {
///         ProcessorMetadata::new("uppercase")
///     }
///
///     fn process<'a>(&'a self, view: &'a ContextView) -> ProcessFuture<'a> {
///         Box::pin(async move {
///             Ok(StageOutput::text(view.document().source.to_uppercase()))
///         })
///     }
/// }
/// ```
pub trait Processor: Send + Sync + 'static {
    fn capabilities(&self) -> ProcessorMetadata;

    fn process<'a>(&'a self, view: &'a ContextView) -> ProcessFuture<'a>;
}

/// Creates processor instances on demand.
pub type ProcessorFactory = Arc<dyn Fn() -> Arc<dyn Processor> + Send + Sync>;

/// Wraps a constructor closure as a [`ProcessorFactory`].
pub fn factory<P, F>(make: F) -> ProcessorFactory
where
    P: Processor,
    F: Fn() -> P + Send + Sync + 'static,
{
    Arc::new(move || Arc::new(make()) as Arc<dyn Processor>)
}

/// Factory that hands out clones of one shared instance.
pub fn shared<P: Processor>(processor: Arc<P>) -> ProcessorFactory {
    Arc::new(move || Arc::clone(&processor) as Arc<dyn Processor>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_defaults() {
        let meta = ProcessorMetadata::new("parse");
        assert_eq!(meta.capabilities, vec!["parse"]);
        assert_eq!(meta.resource_profile, ResourceProfile::CpuLight);
        assert_eq!(meta.priority, 0);
        assert!(!meta.supports_batch);
    }

    #[test]
    fn test_metadata_capabilities_deduplicated() {
        let meta = ProcessorMetadata::new("parse")
            .with_capability("pdf")
            .with_capability("pdf");
        assert_eq!(meta.capabilities, vec!["parse", "pdf"]);
        assert!(meta.provides("pdf"));
        assert!(!meta.provides("ocr"));
    }

    #[test]
    fn test_profile_to_lane() {
        assert_eq!(ResourceProfile::Io.lane(), LaneKind::Io);
        assert_eq!(ResourceProfile::CpuHeavy.lane(), LaneKind::CpuHeavy);
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!("cpu_heavy".parse::<ResourceProfile>(), Ok(ResourceProfile::CpuHeavy));
        assert!("gpu".parse::<ResourceProfile>().is_err());
    }
}
