//! Job Lease Reaper Background Task
//!
//! Workers that take a job and die never post a result. This task retires
//! every processing job whose lease ran out and publishes a retryable error
//! for it, so listening clients can request the block again right away.

use crate::constants::{DEFAULT_JOB_LEASE_SECS, DEFAULT_JOB_REAP_INTERVAL_SECS};
use crate::queue::JobQueue;
use lectern_core::{ErrorKind, StatusEvent};
use lectern_events::DocumentNotifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Configuration for job leases and the reaper task.
#[derive(Debug, Clone)]
pub struct JobLeaseConfig {
    /// How long a worker may hold a job (default: 60 seconds)
    pub lease: Duration,

    /// Sweep interval (default: 5 seconds)
    pub interval: Duration,
}

impl Default for JobLeaseConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(DEFAULT_JOB_LEASE_SECS),
            interval: Duration::from_secs(DEFAULT_JOB_REAP_INTERVAL_SECS),
        }
    }
}

impl JobLeaseConfig {
    /// Create JobLeaseConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `LECTERN_JOB_LEASE_SECS`: Processing lease (default: 60)
    /// - `LECTERN_JOB_REAP_INTERVAL_SECS`: Sweep interval (default: 5)
    pub fn from_env() -> Self {
        let lease = std::env::var("LECTERN_JOB_LEASE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_JOB_LEASE_SECS);
        let interval = std::env::var("LECTERN_JOB_REAP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_JOB_REAP_INTERVAL_SECS);

        Self {
            lease: Duration::from_secs(lease.max(1)),
            interval: Duration::from_secs(interval.max(1)),
        }
    }

    /// Short lease and interval for development/testing.
    pub fn development() -> Self {
        Self {
            lease: Duration::from_secs(10),
            interval: Duration::from_millis(500),
        }
    }
}

/// Retire expired jobs once and announce each as a transient failure.
/// Returns how many were reaped.
pub fn reap_once(jobs: &JobQueue, notifier: &DocumentNotifier) -> usize {
    let expired = jobs.reap_expired();
    for job in &expired {
        let key = job.job_key();
        tracing::warn!(
            job_id = %job.job_id,
            document_id = %key.document_id,
            block_idx = key.block_idx,
            queue = %job.queue,
            "Job lease expired without a result"
        );
        notifier.publish(
            key.document_id,
            StatusEvent::failed(
                &key,
                ErrorKind::TransientWorkerFailure,
                "worker did not report before its lease expired",
            )
            .with_job(job.job_id),
        );
    }
    expired.len()
}

/// Background task that sweeps expired job leases until shutdown.
pub async fn lease_reaper_task(
    jobs: Arc<JobQueue>,
    notifier: DocumentNotifier,
    config: JobLeaseConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(config.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        lease_secs = jobs.lease().as_secs(),
        interval_ms = config.interval.as_millis() as u64,
        "Job lease reaper started"
    );

    let mut reaped = 0usize;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!(reaped, "Job lease reaper shutting down");
                    break;
                }
            }

            _ = tick.tick() => {
                reaped += reap_once(&jobs, &notifier);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::{new_entity_id, BlockStatus, JobKey, SynthesisJob, SynthesisParams};

    fn taken_job(jobs: &JobQueue) -> SynthesisJob {
        let key = JobKey::new(new_entity_id(), 5, "kokoro", "af_heart");
        let job = SynthesisJob::new(new_entity_id(), &key, "Lost.", SynthesisParams::default());
        let _ = jobs.enqueue(job.clone());
        let _ = jobs.next(&job.queue);
        job
    }

    #[tokio::test]
    async fn test_reap_publishes_retryable_error_with_job_id() {
        let jobs =
            JobQueue::with_queues(["synthesis.kokoro".to_string()]).with_lease(Duration::ZERO);
        let notifier = DocumentNotifier::default();
        let job = taken_job(&jobs);
        let mut sub = notifier.subscribe(job.document_id);

        assert_eq!(reap_once(&jobs, &notifier), 1);
        assert_eq!(jobs.outstanding(), 0);

        let event = sub.recv().await.expect("status event");
        assert_eq!(event.status, BlockStatus::Error);
        assert_eq!(event.job_id, Some(job.job_id));
        let kind = event.error.map(|e| e.kind);
        assert_eq!(kind, Some(ErrorKind::TransientWorkerFailure));
        assert!(kind.is_some_and(|k| k.is_retryable()));
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() {
        let jobs = Arc::new(
            JobQueue::with_queues(["synthesis.kokoro".to_string()]).with_lease(Duration::ZERO),
        );
        let job = taken_job(&jobs);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(lease_reaper_task(
            Arc::clone(&jobs),
            DocumentNotifier::default(),
            JobLeaseConfig {
                lease: Duration::ZERO,
                interval: Duration::from_millis(10),
            },
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(jobs.status(&job.job_key()).is_none());

        let _ = shutdown_tx.send(true);
        let finished = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(finished.is_ok());
    }
}
