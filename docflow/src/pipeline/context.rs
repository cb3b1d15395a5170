//! Per-document execution state.
//!
//! A [`PipelineContext`] belongs to exactly one run. Lane workers never see
//! it: they receive a [`ContextView`](crate::processor::ContextView) built
//! from it and return results that the orchestration loop writes back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::checkpoint::Checkpoint;
use super::document::{Document, DocumentId};
use super::result::{StageResult, StageStatus};
use super::stage::Stage;
use crate::processor::StageOutput;

/// Mutable state of one pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    document: Arc<Document>,
    config_hash: String,
    results: BTreeMap<String, StageResult>,
    errors: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    restored: usize,
}

impl PipelineContext {
    pub fn new(document: Document, config_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            document: Arc::new(document),
            config_hash: config_hash.into(),
            results: BTreeMap::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            restored: 0,
        }
    }

    /// Rebuilds a context from a checkpoint.
    ///
    /// Only successful results are kept; every other stage runs again.
    /// Errors belong to the run that recorded them, so the new run starts
    /// with none.
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        let results: BTreeMap<_, _> = checkpoint
            .results
            .into_iter()
            .filter(|(_, result)| result.is_success())
            .collect();
        Self {
            document: Arc::new(checkpoint.document),
            config_hash: checkpoint.config_hash,
            restored: results.len(),
            results,
            errors: Vec::new(),
            created_at: checkpoint.created_at,
            updated_at: Utc::now(),
        }
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document.id
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Number of results restored from a checkpoint.
    pub fn restored(&self) -> usize {
        self.restored
    }

    pub fn results(&self) -> &BTreeMap<String, StageResult> {
        &self.results
    }

    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.results.get(stage)
    }

    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        self.results.get(stage).map(|r| r.status)
    }

    /// Records a stage's terminal result.
    ///
    /// Results are append-only: a stage that already has one keeps it, and
    /// `false` is returned.
    pub fn record(&mut self, stage: impl Into<String>, result: StageResult) -> bool {
        let stage = stage.into();
        if self.results.contains_key(&stage) {
            return false;
        }
        self.results.insert(stage, result);
        self.updated_at = Utc::now();
        true
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.updated_at = Utc::now();
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Successful outputs of the stage's declared inputs.
    pub fn inputs_for(&self, stage: &Stage) -> Arc<HashMap<String, StageOutput>> {
        let inputs = stage
            .inputs
            .iter()
            .filter_map(|name| {
                let result = self.results.get(name)?;
                if !result.is_success() {
                    return None;
                }
                let output = result.output.clone()?;
                Some((name.clone(), output))
            })
            .collect();
        Arc::new(inputs)
    }

    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            document: (*self.document).clone(),
            config_hash: self.config_hash.clone(),
            results: self.results.clone(),
            errors: self.errors.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::pipeline::{ErrorDetail, ErrorKind};
    use std::time::Duration;

    fn ok(text: &str) -> StageResult {
        StageResult::success(StageOutput::text(text), Duration::from_millis(1), 1)
    }

    fn failed() -> StageResult {
        StageResult::failed(
            ErrorDetail::new(ErrorKind::Unrecoverable, "boom"),
            Duration::from_millis(1),
            1,
        )
    }

    #[test]
    fn test_results_are_append_only() {
        let mut ctx = PipelineContext::new(Document::new("d", "s"), "hash");
        assert!(ctx.record("parse", ok("first")));
        assert!(!ctx.record("parse", ok("second")));
        assert_eq!(
            ctx.result("parse").and_then(|r| r.output.as_ref()).and_then(|o| o.as_text()),
            Some("first")
        );
    }

    #[test]
    fn test_inputs_only_include_successes() {
        let mut ctx = PipelineContext::new(Document::new("d", "s"), "hash");
        ctx.record("parse", ok("text"));
        ctx.record("ocr", failed());

        let config = StageConfig::new("merge", "merge").depends_on(["parse", "ocr"]);
        let stage = Stage::from_config(&config, 2);
        let inputs = ctx.inputs_for(&stage);

        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs.get("parse").and_then(|o| o.as_text()), Some("text"));
    }

    #[test]
    fn test_from_checkpoint_keeps_only_successes_and_no_errors() {
        let mut ctx = PipelineContext::new(Document::new("d", "s"), "hash");
        ctx.record("parse", ok("text"));
        ctx.record("ocr", failed());
        ctx.push_error("pipeline timed out");

        let restored = PipelineContext::from_checkpoint(ctx.to_checkpoint());
        assert_eq!(restored.restored(), 1);
        assert_eq!(restored.status("parse"), Some(StageStatus::Success));
        assert_eq!(restored.status("ocr"), None);
        assert!(restored.errors().is_empty());
        assert_eq!(restored.config_hash(), "hash");
    }
}
