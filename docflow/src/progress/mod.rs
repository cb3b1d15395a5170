//! Real-time progress reporting.
//!
//! The pipeline manager and processors record [`ProgressEvent`]s into the
//! [`ProgressTracker`]; clients follow a document with a
//! [`ProgressSubscription`].

mod event;
mod subscription;
mod tracker;

pub use event::{ProgressEvent, ProgressStatus};
pub use subscription::ProgressSubscription;
pub use tracker::{
    ProgressReporter, ProgressTracker, DEFAULT_PROGRESS_BUFFER, DEFAULT_RETAINED_DOCUMENTS,
};
