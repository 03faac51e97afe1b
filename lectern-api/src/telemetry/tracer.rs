//! Tracing Subscriber Initialization
//!
//! JSON logs filtered by `LECTERN_LOG` (falling back to `RUST_LOG`).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ApiError, ApiResult};

const DEFAULT_FILTER: &str = "lectern_api=debug,lectern_storage=info,tower_http=debug,info";

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log filter directive, `EnvFilter` syntax
    pub log_filter: Option<String>,
    /// Service name attached to the startup record
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (production, staging, development)
    pub environment: String,
    /// Emit JSON lines instead of the human-readable format
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: std::env::var("LECTERN_LOG").ok(),
            service_name: std::env::var("LECTERN_SERVICE_NAME")
                .unwrap_or_else(|_| "lectern-api".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: std::env::var("LECTERN_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            json: std::env::var("LECTERN_LOG_FORMAT")
                .map(|s| s != "pretty")
                .unwrap_or(true),
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> EnvFilter {
        match &self.log_filter {
            Some(directive) => EnvFilter::try_new(directive)
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup before anything logs. A second call fails.
pub fn init_tracing(config: &TelemetryConfig) -> ApiResult<()> {
    let registry = tracing_subscriber::registry().with(config.env_filter());

    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = config.service_name,
        service_version = config.service_version,
        environment = config.environment,
        "Telemetry initialized"
    );

    Ok(())
}
