//! Billing Drain Background Task
//!
//! Wakes when the billing queue is notified (or on a periodic tick), leases a
//! batch, groups it by user in enqueue order and applies each user's events
//! in one ledger call. Users run concurrently; one user's events never do.
//!
//! A user whose ledger call fails gets their events put back at the front of
//! the queue in their original order. Nothing here can stall the hot path:
//! the consumer only ever appends to the queue.

use crate::billing::{BillingQueue, UsageLedger};
use crate::constants::{DEFAULT_BILLING_BATCH_SIZE, DEFAULT_BILLING_DRAIN_INTERVAL_SECS};
use crate::telemetry::metrics;
use futures_util::future::join_all;
use lectern_core::{BillingEvent, UserId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the billing drain task.
#[derive(Debug, Clone)]
pub struct BillingDrainConfig {
    /// Maximum events leased per batch (default: 256)
    pub batch_size: usize,

    /// Fallback drain interval when no enqueue wakes the task (default: 5 seconds)
    pub interval: Duration,

    /// Queue depth above which `/health/billing` reports degraded
    pub degraded_depth: usize,
}

impl Default for BillingDrainConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BILLING_BATCH_SIZE,
            interval: Duration::from_secs(DEFAULT_BILLING_DRAIN_INTERVAL_SECS),
            degraded_depth: DEFAULT_BILLING_BATCH_SIZE * 40,
        }
    }
}

impl BillingDrainConfig {
    /// Create BillingDrainConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `LECTERN_BILLING_BATCH_SIZE`: Events per batch (default: 256)
    /// - `LECTERN_BILLING_DRAIN_INTERVAL_SECS`: Fallback interval (default: 5)
    /// - `LECTERN_BILLING_DEGRADED_DEPTH`: Health threshold (default: 10240)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let batch_size = std::env::var("LECTERN_BILLING_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_size);

        let interval = Duration::from_secs(
            std::env::var("LECTERN_BILLING_DRAIN_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BILLING_DRAIN_INTERVAL_SECS),
        );

        let degraded_depth = std::env::var("LECTERN_BILLING_DEGRADED_DEPTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.degraded_depth);

        Self {
            batch_size: batch_size.max(1),
            interval,
            degraded_depth,
        }
    }

    /// Create a configuration for development/testing with a short interval.
    pub fn development() -> Self {
        Self {
            batch_size: 16,
            interval: Duration::from_millis(200),
            degraded_depth: 1000,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the drain task, read by `/health/billing`.
#[derive(Debug, Default)]
pub struct BillingDrainMetrics {
    /// Batches processed since startup
    pub batches: AtomicU64,

    /// Events applied for the first time
    pub events_applied: AtomicU64,

    /// Events the ledger had already seen
    pub events_duplicate: AtomicU64,

    /// Events returned to the queue after a failed ledger call
    pub events_retried: AtomicU64,

    /// Batches in a row that had at least one failed user
    pub consecutive_failed_batches: AtomicU64,

    /// Duration of the most recent batch in microseconds
    pub last_batch_micros: AtomicU64,
}

impl BillingDrainMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> BillingDrainSnapshot {
        BillingDrainSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            events_retried: self.events_retried.load(Ordering::Relaxed),
            consecutive_failed_batches: self.consecutive_failed_batches.load(Ordering::Relaxed),
            last_batch_ms: self.last_batch_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    fn record(&self, report: &DrainReport, elapsed: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events_applied.fetch_add(report.applied, Ordering::Relaxed);
        self.events_duplicate.fetch_add(report.duplicates, Ordering::Relaxed);
        self.events_retried.fetch_add(report.retried, Ordering::Relaxed);
        self.last_batch_micros
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
        if report.failed_users > 0 {
            self.consecutive_failed_batches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_failed_batches.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of drain metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingDrainSnapshot {
    pub batches: u64,
    pub events_applied: u64,
    pub events_duplicate: u64,
    pub events_retried: u64,
    pub consecutive_failed_batches: u64,
    pub last_batch_ms: f64,
}

/// Outcome of one [`drain_once`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub leased: usize,
    pub users: usize,
    pub applied: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub failed_users: usize,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that drains the billing queue until shutdown.
///
/// # Arguments
///
/// * `queue` - Billing queue filled by the result consumer
/// * `ledger` - Where usage is applied
/// * `config` - Batch size and fallback interval
/// * `metrics` - Shared counters, also read by the health route
/// * `shutdown_rx` - Watch receiver for shutdown signal
pub async fn billing_drain_task(
    queue: Arc<BillingQueue>,
    ledger: Arc<dyn UsageLedger>,
    config: BillingDrainConfig,
    metrics: Arc<BillingDrainMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<BillingDrainMetrics> {
    let mut tick = interval(config.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        batch_size = config.batch_size,
        interval_ms = config.interval.as_millis() as u64,
        "Billing drain task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Billing drain task shutting down");
                    break;
                }
            }

            _ = queue.notified() => {
                drain_available(&queue, ledger.as_ref(), &config, &metrics).await;
            }

            _ = tick.tick() => {
                drain_available(&queue, ledger.as_ref(), &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        batches = snapshot.batches,
        events_applied = snapshot.events_applied,
        events_retried = snapshot.events_retried,
        remaining = queue.depth(),
        "Billing drain task completed"
    );

    metrics
}

/// Drain batches until the queue is empty or a batch has a failure.
async fn drain_available(
    queue: &BillingQueue,
    ledger: &dyn UsageLedger,
    config: &BillingDrainConfig,
    drain_metrics: &BillingDrainMetrics,
) {
    loop {
        let report = drain_once(queue, ledger, config.batch_size, drain_metrics).await;
        if report.leased == 0 || report.failed_users > 0 {
            break;
        }
    }
}

/// Lease one batch and apply it.
pub async fn drain_once(
    queue: &BillingQueue,
    ledger: &dyn UsageLedger,
    batch_size: usize,
    drain_metrics: &BillingDrainMetrics,
) -> DrainReport {
    let batch = queue.lease(batch_size);
    if batch.is_empty() {
        if let Some(m) = metrics() {
            m.set_billing_queue_depth(queue.depth());
        }
        return DrainReport::default();
    }

    let started = Instant::now();
    let leased = batch.len();
    let groups = group_by_user(batch);

    let results = join_all(groups.into_iter().map(|(user_id, events)| async move {
        let result = ledger.apply(user_id, &events).await;
        (user_id, events, result)
    }))
    .await;

    let mut report = DrainReport {
        leased,
        users: results.len(),
        ..DrainReport::default()
    };

    for (user_id, events, result) in results {
        match result {
            Ok(receipt) => {
                report.applied += receipt.applied;
                report.duplicates += receipt.duplicates;
                queue.ack(events.len());
                tracing::debug!(
                    user_id = %user_id,
                    applied = receipt.applied,
                    duplicates = receipt.duplicates,
                    "Applied usage"
                );
            }
            Err(e) => {
                report.failed_users += 1;
                report.retried += events.len() as u64;
                tracing::warn!(
                    user_id = %user_id,
                    events = events.len(),
                    error = %e,
                    "Usage apply failed, returning events to queue"
                );
                queue.nack(events);
            }
        }
    }

    let elapsed = started.elapsed();
    drain_metrics.record(&report, elapsed);
    if let Some(m) = metrics() {
        m.record_billing_batch(report.applied, report.duplicates, report.retried, elapsed.as_secs_f64());
        m.set_billing_queue_depth(queue.depth());
    }

    report
}

/// Group events by user, keeping first-seen user order and per-user event order.
fn group_by_user(batch: Vec<BillingEvent>) -> Vec<(UserId, Vec<BillingEvent>)> {
    let mut groups: Vec<(UserId, Vec<BillingEvent>)> = Vec::new();
    for event in batch {
        match groups.iter_mut().find(|(user_id, _)| *user_id == event.user_id) {
            Some((_, events)) => events.push(event),
            None => groups.push((event.user_id, vec![event])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{LedgerReceipt, MemoryUsageLedger};
    use async_trait::async_trait;
    use chrono::Utc;
    use lectern_core::{new_entity_id, BillingError, ResourceKind, UsagePools};
    use std::sync::atomic::AtomicBool;

    fn event(user_id: UserId, quantity: u64) -> BillingEvent {
        BillingEvent {
            user_id,
            resource_kind: ResourceKind::Characters,
            quantity,
            correlation_id: new_entity_id(),
            enqueued_at: Utc::now(),
        }
    }

    /// Fails every call for one user until told to recover.
    struct FlakyLedger {
        inner: MemoryUsageLedger,
        failing_user: UserId,
        failing: AtomicBool,
    }

    #[async_trait]
    impl UsageLedger for FlakyLedger {
        async fn apply(
            &self,
            user_id: UserId,
            events: &[BillingEvent],
        ) -> Result<LedgerReceipt, BillingError> {
            if user_id == self.failing_user && self.failing.load(Ordering::SeqCst) {
                return Err(BillingError::PoolUnavailable {
                    reason: "injected".to_string(),
                });
            }
            self.inner.apply(user_id, events).await
        }
    }

    #[test]
    fn test_group_by_user_keeps_order() {
        let a = new_entity_id();
        let b = new_entity_id();
        let batch = vec![event(a, 1), event(b, 2), event(a, 3), event(b, 4)];
        let groups = group_by_user(batch);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, a);
        assert_eq!(
            groups[0].1.iter().map(|e| e.quantity).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(
            groups[1].1.iter().map(|e| e.quantity).collect::<Vec<_>>(),
            vec![2, 4]
        );
    }

    #[tokio::test]
    async fn test_failed_user_retried_in_order() {
        let good = new_entity_id();
        let bad = new_entity_id();
        let ledger = FlakyLedger {
            inner: MemoryUsageLedger::new(UsagePools {
                plan_remaining: 1000,
                ..UsagePools::default()
            }),
            failing_user: bad,
            failing: AtomicBool::new(true),
        };
        let queue = BillingQueue::new();
        let drain_metrics = BillingDrainMetrics::new();

        let bad_events: Vec<BillingEvent> = (1..=3).map(|q| event(bad, q)).collect();
        queue.enqueue(event(good, 10));
        for e in &bad_events {
            queue.enqueue(e.clone());
        }

        let report = drain_once(&queue, &ledger, 10, &drain_metrics).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.retried, 3);
        assert_eq!(report.failed_users, 1);
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.in_flight(), 0);

        ledger.failing.store(false, Ordering::SeqCst);
        let report = drain_once(&queue, &ledger, 10, &drain_metrics).await;
        assert_eq!(report.applied, 3);

        let expected: Vec<_> = bad_events.iter().map(|e| e.correlation_id).collect();
        assert_eq!(ledger.inner.history(bad).await, expected);

        let snapshot = drain_metrics.snapshot();
        assert_eq!(snapshot.batches, 2);
        assert_eq!(snapshot.events_applied, 4);
        assert_eq!(snapshot.consecutive_failed_batches, 0);
    }

    #[tokio::test]
    async fn test_task_drains_on_notify_and_stops() {
        let queue = Arc::new(BillingQueue::new());
        let ledger = Arc::new(MemoryUsageLedger::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = BillingDrainConfig {
            interval: Duration::from_secs(3600),
            ..BillingDrainConfig::development()
        };

        let handle = tokio::spawn(billing_drain_task(
            Arc::clone(&queue),
            ledger.clone() as Arc<dyn UsageLedger>,
            config,
            Arc::new(BillingDrainMetrics::new()),
            shutdown_rx,
        ));

        let user = new_entity_id();
        for q in 0..40 {
            queue.enqueue(event(user, q));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while ledger.history(user).await.len() < 40 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ledger.history(user).await.len(), 40);

        let _ = shutdown_tx.send(true);
        let metrics = handle.await.expect("drain task panicked");
        assert_eq!(metrics.snapshot().events_applied, 40);
    }
}
