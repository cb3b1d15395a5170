//! Progress subscriptions.

use std::sync::Arc;

use futures::Stream;

use super::event::ProgressEvent;
use super::tracker::DocumentChannel;
use crate::pipeline::DocumentId;

/// Reads a document's progress events in order.
///
/// A slow subscriber never blocks the producer. If it falls behind the
/// buffer, it skips to the oldest event still buffered and counts what it
/// missed in [`lagged`](Self::lagged).
pub struct ProgressSubscription {
    document_id: DocumentId,
    channel: Arc<DocumentChannel>,
    cursor: u64,
    lagged: u64,
}

enum Poll {
    Event(ProgressEvent),
    Closed,
    Empty,
}

impl ProgressSubscription {
    pub(crate) fn new(document_id: DocumentId, channel: Arc<DocumentChannel>, cursor: u64) -> Self {
        Self {
            document_id,
            channel,
            cursor,
            lagged: 0,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Events this subscriber missed by falling behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    fn poll_next(&mut self) -> Poll {
        let state = self.channel.state.lock();
        let oldest = state.oldest_sequence();
        if self.cursor < oldest {
            self.lagged += oldest - self.cursor;
            self.cursor = oldest;
        }
        if self.cursor < state.next_sequence {
            let index = (self.cursor - oldest) as usize;
            if let Some(event) = state.events.get(index) {
                self.cursor += 1;
                return Poll::Event(event.clone());
            }
        }
        if state.closed {
            Poll::Closed
        } else {
            Poll::Empty
        }
    }

    /// Returns the next event if one is buffered.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        match self.poll_next() {
            Poll::Event(event) => Some(event),
            Poll::Closed | Poll::Empty => None,
        }
    }

    /// Waits for the next event. Returns `None` once the document's stream
    /// is closed and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        let channel = Arc::clone(&self.channel);
        loop {
            let notified = channel.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll_next() {
                Poll::Event(event) => return Some(event),
                Poll::Closed => return None,
                Poll::Empty => notified.await,
            }
        }
    }

    /// Converts the subscription into a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

impl std::fmt::Debug for ProgressSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSubscription")
            .field("document_id", &self.document_id)
            .field("cursor", &self.cursor)
            .field("lagged", &self.lagged)
            .finish()
    }
}
