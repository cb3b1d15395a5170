//! Document pipelines.
//!
//! A pipeline is a DAG of named stages. Each stage is backed by a processor
//! capability and runs once its dependencies have succeeded:
//!
//! ```text
//!            ┌──────────┐
//!        ┌──▶│   ocr    │──┐
//! ┌─────┐│   └──────────┘  │  ┌──────────┐
//! │parse│┤                 ├─▶│  index   │
//! └─────┘│   ┌──────────┐  │  └──────────┘
//!        └──▶│ classify │──┘
//!            └──────────┘
//! ```
//!
//! # Key Components
//!
//! - [`PipelineGraph`] - Validated stage graph (no cycles, no dangling deps)
//! - [`PipelineManager`] - Runs documents through the graph in waves
//! - [`PipelineContext`] - Per-run accumulated stage results
//! - [`CheckpointStore`] - Persists contexts so runs can be resumed
//! - [`PipelineResult`] - Terminal outcome of a run
//!
//! # Statuses
//!
//! Every stage of a finished run has exactly one terminal [`StageStatus`].
//! The [`PipelineStatus`] is derived from them: all successful is
//! `Success`, some successful is `PartialFailure`, none is
//! `TotalFailure`, and a cancelled run that did not complete is
//! `Cancelled`.

mod checkpoint;
mod context;
mod dispatch;
mod document;
mod error;
mod graph;
mod lifecycle;
mod manager;
mod policy;
mod result;
mod stage;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use context::PipelineContext;
pub use document::{Document, DocumentId};
pub use error::{CheckpointError, ConfigurationError};
pub use graph::PipelineGraph;
pub use manager::{PipelineManager, DEFAULT_SUBMIT_RETRY_DELAY_MS};
pub use policy::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_SECS,
};
pub use result::{
    ErrorDetail, ErrorKind, PipelineResult, PipelineStatus, StageResult, StageStatus,
};
pub use stage::Stage;
