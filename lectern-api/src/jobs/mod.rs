//! Background Jobs for LECTERN API
//!
//! - `billing_drain`: applies queued usage events to the ledger
//! - `lease_reaper`: retires synthesis jobs whose worker went silent
//!
//! # Usage
//!
//! ```ignore
//! use lectern_api::jobs::{billing_drain_task, BillingDrainConfig, BillingDrainMetrics};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let metrics = Arc::new(BillingDrainMetrics::new());
//! tokio::spawn(billing_drain_task(queue, ledger, BillingDrainConfig::from_env(), metrics, shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod billing_drain;
pub mod lease_reaper;

pub use billing_drain::{
    billing_drain_task, drain_once, BillingDrainConfig, BillingDrainMetrics, BillingDrainSnapshot,
    DrainReport,
};
pub use lease_reaper::{lease_reaper_task, reap_once, JobLeaseConfig};
