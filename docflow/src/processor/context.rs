//! Read-only view handed to processors.
//!
//! The [`ContextView`] provides processors with access to:
//! - The document being processed
//! - Outputs of the stages this stage declared as inputs
//! - Cancellation checking via `CancellationToken`
//! - The content store, for resolving offloaded outputs
//! - A progress reporter for intra-stage progress
//!
//! Processors cannot write to the pipeline context. Their only output is
//! the value they return.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::content_store::ContentStore;
use super::error::ProcessorError;
use super::output::StageOutput;
use crate::pipeline::Document;
use crate::progress::ProgressReporter;

/// Immutable snapshot of everything a processor may read.
#[derive(Clone)]
pub struct ContextView {
    document: Arc<Document>,
    stage: String,
    attempt: u32,
    inputs: Arc<HashMap<String, StageOutput>>,
    cancellation: CancellationToken,
    content_store: Arc<dyn ContentStore>,
    progress: Option<ProgressReporter>,
}

impl ContextView {
    pub fn new(
        document: Arc<Document>,
        stage: impl Into<String>,
        inputs: Arc<HashMap<String, StageOutput>>,
        cancellation: CancellationToken,
        content_store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            document,
            stage: stage.into(),
            attempt: 1,
            inputs,
            cancellation,
            content_store,
            progress: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Name of the stage being executed.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Output of an upstream stage, if it was declared as an input.
    pub fn input(&self, stage: &str) -> Option<&StageOutput> {
        self.inputs.get(stage)
    }

    pub fn inputs(&self) -> &HashMap<String, StageOutput> {
        &self.inputs
    }

    /// Returns the bytes behind an input, loading offloaded content from the
    /// store. Text inputs are returned as UTF-8 bytes.
    pub async fn input_bytes(&self, stage: &str) -> Result<Option<Bytes>, ProcessorError> {
        match self.inputs.get(stage) {
            None | Some(StageOutput::Empty) => Ok(None),
            Some(StageOutput::Bytes(b)) => Ok(Some(b.clone())),
            Some(StageOutput::Text(s)) => Ok(Some(Bytes::from(s.clone()))),
            Some(StageOutput::Json(v)) => Ok(Some(Bytes::from(serde_json::to_vec(v)?))),
            Some(StageOutput::Reference(id)) => self
                .content_store
                .get(id)
                .await
                .map_err(|e| ProcessorError::recoverable(e.to_string())),
        }
    }

    /// Checks whether the stage has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns a clone of the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Waits until the stage is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.content_store
    }

    /// Reports intra-stage progress as a percentage (0-100). Never blocks.
    pub fn report_progress(&self, percent: f64) {
        if let Some(reporter) = &self.progress {
            reporter.report(percent);
        }
    }
}

impl fmt::Debug for ContextView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextView")
            .field("document", &self.document.id)
            .field("stage", &self.stage)
            .field("attempt", &self.attempt)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
