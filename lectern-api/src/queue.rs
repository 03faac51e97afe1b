//! In-process job queue.
//!
//! One FIFO per model queue (`synthesis.<model>`) plus an index of
//! outstanding jobs keyed by [`JobKey`]. A key has at most one outstanding
//! job from enqueue until its result is consumed or its processing lease
//! runs out.
//!
//! A worker that takes a job and never reports holds it for at most the
//! lease. After that a new request for the key replaces the job, and
//! [`JobQueue::reap_expired`] retires it so clients can be told.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lectern_core::{
    queue_for_model, BlockStatus, ContentKey, JobId, JobKey, ModelCatalog, QueueError,
    SynthesisJob,
};
use tracing::{debug, warn};

use crate::constants::DEFAULT_JOB_LEASE_SECS;

/// Result of [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// The job was accepted and is waiting for a worker.
    Enqueued(SynthesisJob),
    /// A job for the same key is already queued or processing.
    AlreadyOutstanding {
        job_id: JobId,
        status: BlockStatus,
        content_key: ContentKey,
    },
}

struct Outstanding {
    job: SynthesisJob,
    status: BlockStatus,
    /// When a worker took the job. `None` while queued.
    taken_at: Option<Instant>,
}

impl Outstanding {
    fn lease_expired(&self, lease: Duration, now: Instant) -> bool {
        self.taken_at
            .is_some_and(|at| now.saturating_duration_since(at) >= lease)
    }
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<String, VecDeque<(JobKey, JobId)>>,
    outstanding: HashMap<JobKey, Outstanding>,
}

pub struct JobQueue {
    known: HashSet<String>,
    lease: Duration,
    state: Mutex<QueueState>,
}

impl JobQueue {
    /// A queue set serving every model in `catalog`.
    pub fn for_catalog(catalog: &ModelCatalog) -> Self {
        Self::with_queues(catalog.models.iter().map(|m| queue_for_model(&m.slug)))
    }

    pub fn with_queues(queues: impl IntoIterator<Item = String>) -> Self {
        let known: HashSet<String> = queues.into_iter().collect();
        let pending = known.iter().map(|q| (q.clone(), VecDeque::new())).collect();
        Self {
            known,
            lease: Duration::from_secs(DEFAULT_JOB_LEASE_SECS),
            state: Mutex::new(QueueState {
                pending,
                outstanding: HashMap::new(),
            }),
        }
    }

    /// How long a worker may hold a job before it is given up on.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every critical section leaves the state consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_known(&self, queue: &str) -> bool {
        self.known.contains(queue)
    }

    /// Enqueue unless a job for the same key is already outstanding.
    ///
    /// A processing job whose lease ran out does not count: it is replaced.
    pub fn enqueue(&self, job: SynthesisJob) -> Result<EnqueueOutcome, QueueError> {
        if !self.is_known(&job.queue) {
            return Err(QueueError::UnknownQueue { queue: job.queue });
        }
        let key = job.job_key();
        let mut state = self.lock();

        let expired = state
            .outstanding
            .get(&key)
            .is_some_and(|existing| existing.lease_expired(self.lease, Instant::now()));
        if expired {
            if let Some(stale) = state.outstanding.remove(&key) {
                warn!(
                    job_id = %stale.job.job_id,
                    document_id = %key.document_id,
                    block_idx = key.block_idx,
                    "Processing lease expired, replacing job"
                );
            }
        }

        if let Some(existing) = state.outstanding.get(&key) {
            debug!(
                document_id = %key.document_id,
                block_idx = key.block_idx,
                job_id = %existing.job.job_id,
                "Job already outstanding"
            );
            return Ok(EnqueueOutcome::AlreadyOutstanding {
                job_id: existing.job.job_id,
                status: existing.status,
                content_key: existing.job.content_key.clone(),
            });
        }

        state
            .pending
            .entry(job.queue.clone())
            .or_default()
            .push_back((key.clone(), job.job_id));
        state.outstanding.insert(
            key,
            Outstanding {
                job: job.clone(),
                status: BlockStatus::Queued,
                taken_at: None,
            },
        );
        debug!(job_id = %job.job_id, queue = %job.queue, "Job enqueued");
        Ok(EnqueueOutcome::Enqueued(job))
    }

    /// Hand the oldest waiting job of `queue` to a worker and mark it processing.
    pub fn next(&self, queue: &str) -> Result<Option<SynthesisJob>, QueueError> {
        if !self.is_known(queue) {
            return Err(QueueError::UnknownQueue {
                queue: queue.to_string(),
            });
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(pending) = state.pending.get_mut(queue) else {
            return Ok(None);
        };

        while let Some((key, job_id)) = pending.pop_front() {
            // Entries whose job already completed are stale.
            match state.outstanding.get_mut(&key) {
                Some(entry) if entry.job.job_id == job_id => {
                    entry.status = BlockStatus::Processing;
                    entry.taken_at = Some(Instant::now());
                    return Ok(Some(entry.job.clone()));
                }
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Retire the outstanding job for `key` if it is `job_id`.
    ///
    /// Returns the job exactly once; later calls and mismatched ids get `None`.
    pub fn complete(&self, key: &JobKey, job_id: JobId) -> Option<SynthesisJob> {
        let mut state = self.lock();
        match state.outstanding.get(key) {
            Some(entry) if entry.job.job_id == job_id => {
                state.outstanding.remove(key).map(|entry| entry.job)
            }
            _ => None,
        }
    }

    /// The outstanding job for `key` if it is `job_id`, without retiring it.
    pub fn outstanding_job(&self, key: &JobKey, job_id: JobId) -> Option<SynthesisJob> {
        self.lock()
            .outstanding
            .get(key)
            .filter(|entry| entry.job.job_id == job_id)
            .map(|entry| entry.job.clone())
    }

    /// Retire every processing job whose lease has run out.
    pub fn reap_expired(&self) -> Vec<SynthesisJob> {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<JobKey> = state
            .outstanding
            .iter()
            .filter(|(_, entry)| entry.lease_expired(self.lease, now))
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .iter()
            .filter_map(|key| state.outstanding.remove(key))
            .map(|entry| entry.job)
            .collect()
    }

    pub fn status(&self, key: &JobKey) -> Option<BlockStatus> {
        self.lock().outstanding.get(key).map(|entry| entry.status)
    }

    /// Jobs waiting in `queue`, not counting ones a worker already took.
    pub fn depth(&self, queue: &str) -> usize {
        let state = self.lock();
        state
            .outstanding
            .values()
            .filter(|entry| entry.job.queue == queue && entry.status == BlockStatus::Queued)
            .count()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }
}
