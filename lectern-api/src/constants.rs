//! Constants for LECTERN API
//!
//! Defaults for every environment-driven setting live here.

// ============================================================================
// SERVER
// ============================================================================

/// Default bind host
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 3000;

/// Default CORS max age in seconds (24 hours)
pub const DEFAULT_CORS_MAX_AGE_SECS: u64 = 86400;

// ============================================================================
// HOT PATH
// ============================================================================

/// Buffered worker results waiting for a consumer task
pub const DEFAULT_RESULT_CHANNEL_CAPACITY: usize = 1024;

/// Per-document status events buffered before a subscriber lags
pub const DEFAULT_WS_CAPACITY: usize = 256;

/// How long a worker may hold a job before it is given up on (seconds)
pub const DEFAULT_JOB_LEASE_SECS: u64 = 60;

/// How often expired job leases are swept (seconds)
pub const DEFAULT_JOB_REAP_INTERVAL_SECS: u64 = 5;

/// Default artifact cache directory
pub const DEFAULT_CACHE_ROOT: &str = "./lectern-cache";

// ============================================================================
// BILLING
// ============================================================================

/// Events leased per drain cycle
pub const DEFAULT_BILLING_BATCH_SIZE: usize = 256;

/// Drain interval when nothing wakes the drain task (seconds)
pub const DEFAULT_BILLING_DRAIN_INTERVAL_SECS: u64 = 5;

/// Pool size of the billing database. Kept separate from any request pool.
pub const DEFAULT_BILLING_POOL_SIZE: usize = 2;

/// Connection timeout for the billing pool (seconds)
pub const DEFAULT_BILLING_DB_TIMEOUT_SECS: u64 = 10;
