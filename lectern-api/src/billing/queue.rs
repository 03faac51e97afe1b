//! Billing event queue.
//!
//! The hot path appends and returns immediately. The drain task leases
//! batches, then acks what it applied and puts failures back at the front
//! in their original order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use lectern_core::BillingEvent;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

#[derive(Default)]
pub struct BillingQueue {
    events: Mutex<VecDeque<BillingEvent>>,
    notify: Notify,
    in_flight: AtomicUsize,
}

impl BillingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BillingEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event and wake the drain task. Returns the new depth.
    pub fn enqueue(&self, event: BillingEvent) -> usize {
        let depth = {
            let mut events = self.lock();
            events.push_back(event);
            events.len()
        };
        self.notify.notify_one();
        depth
    }

    /// Take up to `max` events from the front, oldest first.
    pub fn lease(&self, max: usize) -> Vec<BillingEvent> {
        let mut events = self.lock();
        let n = max.min(events.len());
        let leased: Vec<BillingEvent> = events.drain(..n).collect();
        self.in_flight.fetch_add(leased.len(), Ordering::Relaxed);
        leased
    }

    /// Settle `count` leased events as applied.
    pub fn ack(&self, count: usize) {
        self.release(count);
    }

    /// Return leased events to the front of the queue, keeping their order.
    pub fn nack(&self, failed: Vec<BillingEvent>) {
        let count = failed.len();
        {
            let mut events = self.lock();
            for event in failed.into_iter().rev() {
                events.push_front(event);
            }
        }
        self.release(count);
    }

    fn release(&self, count: usize) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(count))
            });
    }

    /// Events waiting to be leased.
    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Resolves after the next enqueue (or immediately if one was missed).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lectern_core::{new_entity_id, ResourceKind};
    use proptest::prelude::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn event(user_id: Uuid, quantity: u64) -> BillingEvent {
        BillingEvent {
            user_id,
            resource_kind: ResourceKind::Characters,
            quantity,
            correlation_id: new_entity_id(),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_lease_ack() {
        let queue = BillingQueue::new();
        let user = new_entity_id();
        for q in 1..=5 {
            queue.enqueue(event(user, q));
        }

        let batch = queue.lease(3);
        assert_eq!(batch.iter().map(|e| e.quantity).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.in_flight(), 3);

        queue.ack(3);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_nack_restores_order() {
        let queue = BillingQueue::new();
        let user = new_entity_id();
        for q in 1..=4 {
            queue.enqueue(event(user, q));
        }

        let batch = queue.lease(2);
        queue.enqueue(event(user, 5));
        queue.nack(batch);

        let all = queue.lease(10);
        assert_eq!(
            all.iter().map(|e| e.quantity).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let queue = std::sync::Arc::new(BillingQueue::new());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.notified().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(event(new_entity_id(), 1));

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(woke.is_ok());
    }

    proptest! {
        /// A lease that is put back leaves the queue in enqueue order, even
        /// with appends in between.
        #[test]
        fn prop_nack_preserves_fifo(
            steps in proptest::collection::vec((1usize..4, 0usize..5), 1..20),
        ) {
            let queue = BillingQueue::new();
            let user = new_entity_id();
            let mut next = 0u64;
            for (appends, lease) in steps {
                for _ in 0..appends {
                    next += 1;
                    queue.enqueue(event(user, next));
                }
                let batch = queue.lease(lease);
                next += 1;
                queue.enqueue(event(user, next));
                queue.nack(batch);
                prop_assert_eq!(queue.in_flight(), 0);
            }

            let all = queue.lease(usize::MAX);
            let quantities: Vec<u64> = all.iter().map(|e| e.quantity).collect();
            prop_assert_eq!(quantities, (1..=next).collect::<Vec<_>>());
        }
    }
}
