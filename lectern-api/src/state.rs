//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use lectern_core::{ModelCatalog, SynthesisResult};
use lectern_events::DocumentNotifier;
use lectern_storage::ArtifactStore;
use tokio::sync::mpsc;

use crate::billing::BillingQueue;
use crate::consumer::ResultConsumer;
use crate::documents::DocumentStore;
use crate::jobs::{BillingDrainConfig, BillingDrainMetrics, JobLeaseConfig};
use crate::queue::JobQueue;

/// Everything route handlers share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<ModelCatalog>,
    pub documents: DocumentStore,
    pub store: Arc<dyn ArtifactStore>,
    pub notifier: DocumentNotifier,
    pub jobs: Arc<JobQueue>,
    pub billing: Arc<BillingQueue>,
    pub billing_metrics: Arc<BillingDrainMetrics>,
    pub billing_config: BillingDrainConfig,
    /// Inbound worker results, drained by the consumer pool.
    pub results: mpsc::Sender<SynthesisResult>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire up the pipeline. The returned receiver feeds
    /// [`ResultConsumer::spawn_pool`].
    pub fn new(
        catalog: ModelCatalog,
        store: Arc<dyn ArtifactStore>,
        ws_capacity: usize,
        result_channel_capacity: usize,
        billing_config: BillingDrainConfig,
        lease_config: &JobLeaseConfig,
    ) -> (Self, mpsc::Receiver<SynthesisResult>) {
        let (results, results_rx) = mpsc::channel(result_channel_capacity.max(1));
        let jobs = Arc::new(JobQueue::for_catalog(&catalog).with_lease(lease_config.lease));
        let state = Self {
            catalog: Arc::new(catalog),
            documents: DocumentStore::new(),
            store,
            notifier: DocumentNotifier::new(ws_capacity),
            jobs,
            billing: Arc::new(BillingQueue::new()),
            billing_metrics: Arc::new(BillingDrainMetrics::new()),
            billing_config,
            results,
            started_at: Instant::now(),
        };
        (state, results_rx)
    }

    /// A result consumer sharing this state's store, notifier and queues.
    pub fn consumer(&self) -> Arc<ResultConsumer> {
        Arc::new(ResultConsumer::new(
            Arc::clone(&self.store),
            self.notifier.clone(),
            Arc::clone(&self.jobs),
            Arc::clone(&self.billing),
        ))
    }
}
