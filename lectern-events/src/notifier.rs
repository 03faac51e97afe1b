use std::sync::Arc;

use dashmap::DashMap;
use lectern_core::{DocumentId, StatusEvent};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default per-document buffer before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The subscriber fell behind and `0` events were dropped for it.
    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),

    #[error("document channel closed")]
    Closed,
}

struct NotifierInner {
    channels: DashMap<DocumentId, broadcast::Sender<StatusEvent>>,
    capacity: usize,
}

/// Fans status events out to the subscribers of one document.
///
/// Cheap to clone; clones share channels.
#[derive(Clone)]
pub struct DocumentNotifier {
    inner: Arc<NotifierInner>,
}

impl Default for DocumentNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DocumentNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                channels: DashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Publish to the subscribers of `document_id`.
    ///
    /// Returns how many subscribers the event reached. Zero is not an error.
    pub fn publish(&self, document_id: DocumentId, event: StatusEvent) -> usize {
        let Some(tx) = self
            .inner
            .channels
            .get(&document_id)
            .map(|entry| entry.value().clone())
        else {
            debug!(document_id = %document_id, block_idx = event.block_idx, "No subscribers for document");
            return 0;
        };

        match tx.send(event) {
            Ok(receivers) => {
                debug!(document_id = %document_id, receivers, "Published status event");
                receivers
            }
            Err(_) => {
                debug!(document_id = %document_id, "Subscribers left before publish");
                0
            }
        }
    }

    /// Subscribe to `document_id`, creating its channel if needed.
    pub fn subscribe(&self, document_id: DocumentId) -> DocumentSubscription {
        let rx = self
            .inner
            .channels
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe();
        DocumentSubscription {
            document_id,
            rx: Some(rx),
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn subscriber_count(&self, document_id: DocumentId) -> usize {
        self.inner
            .channels
            .get(&document_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Documents that currently have at least one subscriber.
    pub fn active_documents(&self) -> usize {
        self.inner.channels.len()
    }
}

/// A live subscription to one document's events.
///
/// Dropping the last subscription of a document removes its channel.
pub struct DocumentSubscription {
    document_id: DocumentId,
    /// Only `None` while dropping.
    rx: Option<broadcast::Receiver<StatusEvent>>,
    inner: Arc<NotifierInner>,
}

impl DocumentSubscription {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Next event for this document.
    ///
    /// Events carrying another document id are skipped.
    pub async fn recv(&mut self) -> Result<StatusEvent, SubscriptionError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(SubscriptionError::Closed);
        };
        loop {
            match rx.recv().await {
                Ok(event) if event.document_id == self.document_id => return Ok(event),
                Ok(event) => {
                    warn!(
                        expected = %self.document_id,
                        received = %event.document_id,
                        "Dropping status event for foreign document"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(SubscriptionError::Lagged(skipped))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }
}

impl Drop for DocumentSubscription {
    fn drop(&mut self) {
        // Release our receiver first so concurrent drops see each other.
        drop(self.rx.take());
        let removed = self
            .inner
            .channels
            .remove_if(&self.document_id, |_, tx| tx.receiver_count() == 0);
        if removed.is_some() {
            debug!(document_id = %self.document_id, "Closed document channel");
        }
    }
}
