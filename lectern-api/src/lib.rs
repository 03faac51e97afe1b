//! LECTERN API - Synthesis Delivery Server
//!
//! HTTP and WebSocket surface over the delivery pipeline:
//!
//! - Clients register documents and request block synthesis
//! - Workers pull jobs per model queue and post results back
//! - The result consumer (hot path) caches audio, notifies the document's
//!   subscribers and queues usage
//! - The billing drain (cold path) applies usage to the ledger
//!
//! Configuration comes from `LECTERN_*` environment variables, see
//! [`ServerConfig::from_env`].

pub mod billing;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod documents;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod ws;

pub use billing::{BillingDbConfig, BillingQueue, MemoryUsageLedger, PgUsageLedger, UsageLedger};
pub use config::ServerConfig;
pub use consumer::{ConsumeOutcome, ResultConsumer};
pub use documents::DocumentStore;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use queue::{EnqueueOutcome, JobQueue};
pub use routes::create_api_router;
pub use state::AppState;
