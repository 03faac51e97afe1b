//! LECTERN API Server Binary

use std::sync::Arc;

use axum::Router;
use lectern_api::jobs::{billing_drain_task, lease_reaper_task, BillingDrainConfig, JobLeaseConfig};
use lectern_api::telemetry::{init_tracing, TelemetryConfig};
use lectern_api::{
    create_api_router, ApiError, ApiResult, AppState, BillingDbConfig, MemoryUsageLedger,
    PgUsageLedger, ServerConfig, UsageLedger,
};
use lectern_storage::{ArtifactStore, LmdbArtifactCache};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let config = ServerConfig::from_env();
    config.validate().map_err(|e| ApiError::internal_error(e.to_string()))?;
    let catalog = config
        .load_catalog()
        .map_err(|e| ApiError::internal_error(format!("Failed to load model catalog: {}", e)))?;

    let cache = LmdbArtifactCache::open(config.cache.clone())
        .map_err(|e| ApiError::internal_error(format!("Failed to open artifact cache: {}", e)))?;
    let store: Arc<dyn ArtifactStore> = Arc::new(cache);

    let ledger: Arc<dyn UsageLedger> = match BillingDbConfig::from_env() {
        Some(db_config) => {
            let ledger = PgUsageLedger::from_config(&db_config)?;
            ledger.ensure_schema().await?;
            tracing::info!(host = %db_config.host, pool_size = db_config.max_size, "Billing ledger: PostgreSQL");
            Arc::new(ledger)
        }
        None => {
            tracing::warn!("LECTERN_BILLING_DB_HOST not set, using in-memory billing ledger");
            Arc::new(MemoryUsageLedger::default())
        }
    };

    let billing_config = BillingDrainConfig::from_env();
    let lease_config = JobLeaseConfig::from_env();
    let (state, results_rx) = AppState::new(
        catalog,
        store,
        config.ws_capacity,
        config.result_channel_capacity,
        billing_config.clone(),
        &lease_config,
    );

    let consumer_pool = state.consumer().spawn_pool(results_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = tokio::spawn(billing_drain_task(
        Arc::clone(&state.billing),
        ledger,
        billing_config,
        Arc::clone(&state.billing_metrics),
        shutdown_rx.clone(),
    ));
    let reaper = tokio::spawn(lease_reaper_task(
        Arc::clone(&state.jobs),
        state.notifier.clone(),
        lease_config,
        shutdown_rx,
    ));

    let app: Router = create_api_router(state, &config);

    let addr = config
        .bind_addr()
        .map_err(|e| ApiError::invalid_input(e.to_string()))?;
    tracing::info!(%addr, "Starting LECTERN API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = drain.await {
        tracing::error!(error = %e, "Billing drain task failed");
    }
    if let Err(e) = reaper.await {
        tracing::error!(error = %e, "Job lease reaper failed");
    }
    consumer_pool.abort();

    Ok(())
}
