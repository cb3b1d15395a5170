//! Per-document progress tracking.
//!
//! Each document gets a bounded ring buffer of events. Recording never
//! blocks: when the buffer is full the oldest event is dropped and counted.
//! Subscribers read from the buffer at their own pace and skip ahead if
//! they fall behind.
//!
//! Document-level percent is the cost-weighted average of stage percents.
//! Stages that finished (succeeded, failed or skipped) count as 100%. The
//! recorded percent is clamped so it never decreases.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::event::{ProgressEvent, ProgressStatus};
use super::subscription::ProgressSubscription;
use crate::pipeline::DocumentId;

/// Default number of buffered events per document.
pub const DEFAULT_PROGRESS_BUFFER: usize = 256;

/// Default number of finished documents kept for late subscribers.
pub const DEFAULT_RETAINED_DOCUMENTS: usize = 1024;

// =============================================================================
// Channel
// =============================================================================

pub(crate) struct ChannelState {
    pub(crate) events: VecDeque<ProgressEvent>,
    pub(crate) next_sequence: u64,
    pub(crate) closed: bool,
    weights: Vec<(String, f64)>,
    stage_percent: HashMap<String, f64>,
    last_percent: f64,
    dropped: u64,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            next_sequence: 0,
            closed: false,
            weights: Vec::new(),
            stage_percent: HashMap::new(),
            last_percent: 0.0,
            dropped: 0,
        }
    }

    /// Sequence number of the oldest buffered event.
    pub(crate) fn oldest_sequence(&self) -> u64 {
        self.events
            .front()
            .map(|e| e.sequence)
            .unwrap_or(self.next_sequence)
    }

    fn weighted_percent(&self) -> f64 {
        if self.weights.is_empty() {
            if self.stage_percent.is_empty() {
                return 0.0;
            }
            let sum: f64 = self.stage_percent.values().sum();
            return sum / self.stage_percent.len() as f64;
        }

        let total: f64 = self.weights.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let done: f64 = self
            .weights
            .iter()
            .map(|(stage, w)| w * self.stage_percent.get(stage).copied().unwrap_or(0.0))
            .sum();
        done / total
    }
}

pub(crate) struct DocumentChannel {
    pub(crate) state: Mutex<ChannelState>,
    pub(crate) notify: Notify,
}

impl DocumentChannel {
    fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::new()),
            notify: Notify::new(),
        }
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Records progress events and serves subscriptions.
pub struct ProgressTracker {
    documents: DashMap<DocumentId, Arc<DocumentChannel>>,
    capacity: usize,
    retained: usize,
    closed_order: Mutex<VecDeque<DocumentId>>,
    dropped_events: AtomicU64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_BUFFER)
    }
}

impl ProgressTracker {
    /// Creates a tracker buffering `capacity` events per document.
    pub fn new(capacity: usize) -> Self {
        Self {
            documents: DashMap::new(),
            capacity: capacity.max(1),
            retained: DEFAULT_RETAINED_DOCUMENTS,
            closed_order: Mutex::new(VecDeque::new()),
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Limits how many finished documents stay queryable.
    pub fn with_retained_documents(mut self, retained: usize) -> Self {
        self.retained = retained;
        self
    }

    fn channel(&self, document_id: &DocumentId) -> Arc<DocumentChannel> {
        if let Some(existing) = self.documents.get(document_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.documents
                .entry(document_id.clone())
                .or_insert_with(|| Arc::new(DocumentChannel::new()))
                .value(),
        )
    }

    /// Declares the stages of a run and their cost weights.
    ///
    /// Each registration starts a new run: the channel reopens and stage
    /// progress restarts from zero. Buffered events and sequence numbers
    /// carry over. Stages restored from a checkpoint are reported again by
    /// the run itself.
    pub fn register<I>(&self, document_id: &DocumentId, weights: I)
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let channel = self.channel(document_id);
        let mut state = channel.state.lock();
        state.stage_percent.clear();
        state.last_percent = 0.0;
        state.weights = weights
            .into_iter()
            .map(|(stage, w)| (stage, if w.is_finite() && w > 0.0 { w } else { 1.0 }))
            .collect();
        state.closed = false;
    }

    /// Records an event. Never blocks on subscribers.
    ///
    /// Returns the event's sequence number.
    pub fn record(&self, mut event: ProgressEvent) -> u64 {
        let channel = self.channel(&event.document_id);
        let sequence = {
            let mut state = channel.state.lock();

            if let Some(stage) = &event.stage {
                let target = if event.status.completes_stage() {
                    Some(100.0)
                } else {
                    event
                        .stage_percent
                        .filter(|p| p.is_finite())
                        .map(|p| p.clamp(0.0, 100.0))
                };
                if let Some(target) = target {
                    let current = state.stage_percent.entry(stage.clone()).or_insert(0.0);
                    if target > *current {
                        *current = target;
                    }
                }
            }

            let percent = state.weighted_percent().max(state.last_percent);
            state.last_percent = percent;
            event.percent = percent;
            event.sequence = state.next_sequence;
            state.next_sequence += 1;

            if state.events.len() >= self.capacity {
                state.events.pop_front();
                state.dropped += 1;
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
            trace!(
                document_id = %event.document_id,
                status = event.status.as_str(),
                percent = event.percent,
                "Progress recorded"
            );
            let sequence = event.sequence;
            state.events.push_back(event);
            sequence
        };
        channel.notify.notify_waiters();
        sequence
    }

    /// Subscribes to events recorded from now on.
    pub fn subscribe(&self, document_id: &DocumentId) -> ProgressSubscription {
        let channel = self.channel(document_id);
        let cursor = channel.state.lock().next_sequence;
        ProgressSubscription::new(document_id.clone(), channel, cursor)
    }

    /// Subscribes starting from the oldest buffered event.
    pub fn subscribe_from_start(&self, document_id: &DocumentId) -> ProgressSubscription {
        let channel = self.channel(document_id);
        let cursor = channel.state.lock().oldest_sequence();
        ProgressSubscription::new(document_id.clone(), channel, cursor)
    }

    /// Current document-level percent, if the document is known.
    pub fn aggregate(&self, document_id: &DocumentId) -> Option<f64> {
        self.documents
            .get(document_id)
            .map(|c| c.value().state.lock().last_percent)
    }

    /// Buffered events for a document, oldest first.
    pub fn history(&self, document_id: &DocumentId) -> Vec<ProgressEvent> {
        self.documents
            .get(document_id)
            .map(|c| c.value().state.lock().events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks a document's stream finished. Subscriptions end once they have
    /// drained the buffer.
    pub fn close(&self, document_id: &DocumentId) {
        if let Some(channel) = self.documents.get(document_id).map(|c| Arc::clone(c.value())) {
            channel.state.lock().closed = true;
            channel.notify.notify_waiters();
        }

        let evicted = {
            let mut order = self.closed_order.lock();
            order.retain(|id| id != document_id);
            order.push_back(document_id.clone());
            let excess = order.len().saturating_sub(self.retained);
            order.drain(..excess).collect::<Vec<_>>()
        };
        for id in evicted {
            self.documents
                .remove_if(&id, |_, channel| channel.state.lock().closed);
        }
    }

    /// Forgets a document entirely.
    pub fn remove(&self, document_id: &DocumentId) {
        if let Some((_, channel)) = self.documents.remove(document_id) {
            channel.state.lock().closed = true;
            channel.notify.notify_waiters();
        }
    }

    /// Events dropped across all documents because a buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Events dropped for one document.
    pub fn dropped_for(&self, document_id: &DocumentId) -> u64 {
        self.documents
            .get(document_id)
            .map(|c| c.value().state.lock().dropped)
            .unwrap_or(0)
    }

    /// Documents currently tracked.
    pub fn tracked_documents(&self) -> usize {
        self.documents.len()
    }

    /// Documents with an open stream.
    pub fn active_documents(&self) -> usize {
        self.documents
            .iter()
            .filter(|c| !c.value().state.lock().closed)
            .count()
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("documents", &self.documents.len())
            .field("capacity", &self.capacity)
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}

// =============================================================================
// Reporter
// =============================================================================

/// Handle processors use to report intra-stage progress.
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    document_id: DocumentId,
    stage: String,
}

impl ProgressReporter {
    pub fn new(tracker: Arc<ProgressTracker>, document_id: DocumentId, stage: impl Into<String>) -> Self {
        Self {
            tracker,
            document_id,
            stage: stage.into(),
        }
    }

    /// Reports the stage's own percent complete.
    pub fn report(&self, percent: f64) {
        self.tracker.record(
            ProgressEvent::stage(
                self.document_id.clone(),
                self.stage.clone(),
                ProgressStatus::StageProgress,
            )
            .with_stage_percent(percent),
        );
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("document_id", &self.document_id)
            .field("stage", &self.stage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::new("doc")
    }

    fn stage_event(stage: &str, status: ProgressStatus) -> ProgressEvent {
        ProgressEvent::stage(doc(), stage, status)
    }

    #[test]
    fn test_weighted_aggregate() {
        let tracker = ProgressTracker::default();
        tracker.register(&doc(), [("parse".to_string(), 1.0), ("embed".to_string(), 3.0)]);

        tracker.record(stage_event("parse", ProgressStatus::StageSucceeded));
        assert_eq!(tracker.aggregate(&doc()), Some(25.0));

        tracker.record(stage_event("embed", ProgressStatus::StageProgress).with_stage_percent(50.0));
        assert_eq!(tracker.aggregate(&doc()), Some(62.5));

        tracker.record(stage_event("embed", ProgressStatus::StageSucceeded));
        assert_eq!(tracker.aggregate(&doc()), Some(100.0));
    }

    #[test]
    fn test_percent_never_decreases() {
        let tracker = ProgressTracker::default();
        tracker.register(&doc(), [("parse".to_string(), 1.0)]);

        tracker.record(stage_event("parse", ProgressStatus::StageProgress).with_stage_percent(80.0));
        tracker.record(stage_event("parse", ProgressStatus::StageRetrying).with_stage_percent(0.0));
        tracker.record(stage_event("parse", ProgressStatus::StageProgress).with_stage_percent(10.0));

        let percents: Vec<f64> = tracker.history(&doc()).iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![80.0, 80.0, 80.0]);
    }

    #[test]
    fn test_register_restarts_progress_for_new_run() {
        let tracker = ProgressTracker::default();
        let weights = || [("parse".to_string(), 1.0), ("embed".to_string(), 1.0)];
        tracker.register(&doc(), weights());
        tracker.record(stage_event("parse", ProgressStatus::StageSucceeded));
        tracker.record(stage_event("embed", ProgressStatus::StageFailed));
        tracker.close(&doc());
        assert_eq!(tracker.aggregate(&doc()), Some(100.0));

        tracker.register(&doc(), weights());
        assert_eq!(tracker.aggregate(&doc()), Some(0.0));

        let first = tracker.record(ProgressEvent::pipeline(doc(), ProgressStatus::PipelineStarted));
        tracker.record(stage_event("parse", ProgressStatus::StageSucceeded));

        let history = tracker.history(&doc());
        let started = history.iter().find(|e| e.sequence == first).unwrap();
        assert_eq!(started.percent, 0.0);
        assert_eq!(history.last().unwrap().percent, 50.0);
    }

    #[test]
    fn test_uniform_weights_when_unregistered() {
        let tracker = ProgressTracker::default();
        tracker.record(stage_event("a", ProgressStatus::StageSucceeded));
        tracker.record(stage_event("b", ProgressStatus::StageStarted).with_stage_percent(0.0));
        assert_eq!(tracker.aggregate(&doc()), Some(50.0));
    }

    #[test]
    fn test_full_buffer_drops_oldest() {
        let tracker = ProgressTracker::new(3);
        for _ in 0..5 {
            tracker.record(stage_event("a", ProgressStatus::StageProgress));
        }

        let sequences: Vec<u64> = tracker.history(&doc()).iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
        assert_eq!(tracker.dropped_events(), 2);
        assert_eq!(tracker.dropped_for(&doc()), 2);
    }

    #[test]
    fn test_reporter_records_stage_progress() {
        let tracker = Arc::new(ProgressTracker::default());
        tracker.register(&doc(), [("parse".to_string(), 1.0)]);
        let reporter = ProgressReporter::new(Arc::clone(&tracker), doc(), "parse");

        reporter.report(30.0);
        reporter.report(250.0);

        assert_eq!(tracker.aggregate(&doc()), Some(100.0));
        let history = tracker.history(&doc());
        assert_eq!(history[0].stage_percent, Some(30.0));
    }

    #[test]
    fn test_close_evicts_beyond_retention() {
        let tracker = ProgressTracker::default().with_retained_documents(1);
        let a = DocumentId::new("a");
        let b = DocumentId::new("b");
        tracker.record(ProgressEvent::pipeline(a.clone(), ProgressStatus::PipelineStarted));
        tracker.record(ProgressEvent::pipeline(b.clone(), ProgressStatus::PipelineStarted));

        tracker.close(&a);
        assert_eq!(tracker.tracked_documents(), 2);
        tracker.close(&b);
        assert_eq!(tracker.tracked_documents(), 1);
        assert!(tracker.aggregate(&a).is_none());
        assert!(tracker.aggregate(&b).is_some());
    }

    #[test]
    fn test_active_documents() {
        let tracker = ProgressTracker::default();
        tracker.register(&doc(), Vec::new());
        assert_eq!(tracker.active_documents(), 1);
        tracker.close(&doc());
        assert_eq!(tracker.active_documents(), 0);
    }
}
