//! Result consumer: the hot path.
//!
//! A worker result is written to the artifact cache, announced on the
//! document's channel and turned into a billing event, in that order, and
//! nothing else. Billing is only appended to a queue, so a slow or broken
//! ledger never delays audio reaching the listener.

use std::sync::Arc;
use std::time::Instant;

use lectern_core::{
    BillingEvent, ContentKey, ErrorKind, JobId, JobKey, StatusEvent, SynthesisJob, SynthesisOutcome,
    SynthesisResult,
};
use lectern_events::DocumentNotifier;
use lectern_storage::ArtifactStore;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::billing::BillingQueue;
use crate::queue::JobQueue;
use crate::telemetry::metrics;

/// What [`ResultConsumer::consume`] did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Audio cached, status published, usage queued.
    Cached { subscribers: usize },
    /// A result for a job that was already retired. Not written, not billed.
    Duplicate { subscribers: usize },
    /// The result named a content key other than its job's. Not written.
    KeyMismatch,
    /// The worker reported a failure; published as an error.
    WorkerFailed { kind: ErrorKind },
    /// The cache write failed; published as a storage error.
    StoreFailed,
}

impl ConsumeOutcome {
    fn label(&self) -> &'static str {
        match self {
            ConsumeOutcome::Cached { .. } => "cached",
            ConsumeOutcome::Duplicate { .. } => "duplicate",
            ConsumeOutcome::KeyMismatch => "key_mismatch",
            ConsumeOutcome::WorkerFailed { .. } => "worker_error",
            ConsumeOutcome::StoreFailed => "storage_error",
        }
    }
}

pub struct ResultConsumer {
    store: Arc<dyn ArtifactStore>,
    notifier: DocumentNotifier,
    jobs: Arc<JobQueue>,
    billing: Arc<BillingQueue>,
}

impl ResultConsumer {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        notifier: DocumentNotifier,
        jobs: Arc<JobQueue>,
        billing: Arc<BillingQueue>,
    ) -> Self {
        Self {
            store,
            notifier,
            jobs,
            billing,
        }
    }

    /// Handle one worker result.
    ///
    /// Audio is only written under the content key of the job it answers; a
    /// result naming any other key is rejected.
    pub async fn consume(&self, result: SynthesisResult) -> ConsumeOutcome {
        let started = Instant::now();
        let key = result.job_key();
        let job_id = result.job_id;

        let outcome = match result.outcome {
            SynthesisOutcome::Success { audio, duration_ms } => {
                match self.jobs.outstanding_job(&key, job_id) {
                    None => self.republish_retired(&key, job_id, &result.content_key).await,
                    Some(job) if job.content_key != result.content_key => {
                        warn!(
                            job_id = %job_id,
                            expected = %job.content_key,
                            reported = %result.content_key,
                            "Worker reported a foreign content key"
                        );
                        self.jobs.complete(&key, job_id);
                        self.notifier.publish(
                            key.document_id,
                            StatusEvent::failed(
                                &key,
                                ErrorKind::TransientWorkerFailure,
                                "worker returned audio for a different content key",
                            )
                            .with_job(job_id),
                        );
                        ConsumeOutcome::KeyMismatch
                    }
                    Some(job) => self.cache_result(&key, job, audio, duration_ms).await,
                }
            }
            SynthesisOutcome::Failure { kind, message } => {
                if self.jobs.complete(&key, job_id).is_some() {
                    warn!(
                        job_id = %job_id,
                        block_idx = key.block_idx,
                        kind = ?kind,
                        message = %message,
                        "Worker reported failure"
                    );
                    self.notifier.publish(
                        key.document_id,
                        StatusEvent::failed(&key, kind, message).with_job(job_id),
                    );
                } else {
                    debug!(job_id = %job_id, "Failure for a job that is no longer outstanding");
                }
                ConsumeOutcome::WorkerFailed { kind }
            }
        };

        if let Some(m) = metrics() {
            m.record_result(outcome.label(), started.elapsed().as_secs_f64());
        }
        outcome
    }

    async fn cache_result(
        &self,
        key: &JobKey,
        job: SynthesisJob,
        audio: Vec<u8>,
        duration_ms: u64,
    ) -> ConsumeOutcome {
        let bytes = audio.len();
        if let Err(e) = self.store.store(&job.content_key, audio, false).await {
            error!(
                job_id = %job.job_id,
                content_key = %job.content_key,
                error = %e,
                "Cache write failed"
            );
            // Retire the job so a client retry can enqueue a fresh one.
            self.jobs.complete(key, job.job_id);
            self.notifier.publish(
                key.document_id,
                StatusEvent::failed(key, ErrorKind::StorageFailure, e.to_string()).with_job(job.job_id),
            );
            return ConsumeOutcome::StoreFailed;
        }

        let retired = self.jobs.complete(key, job.job_id);
        let subscribers = self.notifier.publish(
            key.document_id,
            StatusEvent::cached(key, job.content_key.clone()).with_job(job.job_id),
        );
        if subscribers == 0 {
            debug!(
                document_id = %key.document_id,
                block_idx = key.block_idx,
                "Cached with no listeners"
            );
        }

        match retired {
            Some(job) => {
                let depth = self.billing.enqueue(BillingEvent::for_job(&job));
                if let Some(m) = metrics() {
                    m.set_billing_queue_depth(depth);
                }
                info!(
                    job_id = %job.job_id,
                    block_idx = key.block_idx,
                    bytes,
                    duration_ms,
                    subscribers,
                    "Result cached"
                );
                ConsumeOutcome::Cached { subscribers }
            }
            None => {
                debug!(job_id = %job.job_id, "Duplicate result, not billed");
                ConsumeOutcome::Duplicate { subscribers }
            }
        }
    }

    /// A result for a job that is already retired. Its key cannot be checked,
    /// so nothing is written; if the key is already cached it is announced again.
    async fn republish_retired(&self, key: &JobKey, job_id: JobId, content_key: &ContentKey) -> ConsumeOutcome {
        match self.store.contains(content_key).await {
            Ok(true) => {
                let subscribers = self
                    .notifier
                    .publish(key.document_id, StatusEvent::cached(key, content_key.clone()));
                debug!(job_id = %job_id, subscribers, "Duplicate result, re-announced");
                ConsumeOutcome::Duplicate { subscribers }
            }
            Ok(false) => {
                debug!(job_id = %job_id, content_key = %content_key, "Unverifiable result dropped");
                ConsumeOutcome::Duplicate { subscribers: 0 }
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Cache lookup failed for duplicate result");
                ConsumeOutcome::Duplicate { subscribers: 0 }
            }
        }
    }

    /// Consume results from `rx` until it closes, one task per result.
    pub fn spawn_pool(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SynthesisResult>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                let consumer = Arc::clone(&self);
                tokio::spawn(async move {
                    consumer.consume(result).await;
                });
            }
            debug!("Result channel closed, consumer pool stopping");
        })
    }
}
