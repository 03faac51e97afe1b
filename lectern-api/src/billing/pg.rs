//! PostgreSQL usage ledger.
//!
//! Runs on its own small connection pool so billing load can never starve
//! request handling. Each `apply` is one transaction holding the user's
//! account row lock.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use lectern_core::{BillingError, BillingEvent, UsagePools, UserId};
use tokio_postgres::NoTls;

use super::ledger::{LedgerReceipt, UsageLedger};
use crate::constants::{DEFAULT_BILLING_DB_TIMEOUT_SECS, DEFAULT_BILLING_POOL_SIZE};
use crate::error::{ApiError, ApiResult};

/// Tables the ledger needs. Safe to run repeatedly.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_accounts (
    user_id             UUID PRIMARY KEY,
    plan_remaining      BIGINT NOT NULL DEFAULT 0,
    rollover_remaining  BIGINT NOT NULL DEFAULT 0,
    purchased_remaining BIGINT NOT NULL DEFAULT 0,
    overage_used        BIGINT NOT NULL DEFAULT 0,
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS usage_events (
    correlation_id UUID PRIMARY KEY,
    user_id        UUID NOT NULL REFERENCES usage_accounts (user_id),
    resource_kind  TEXT NOT NULL,
    quantity       BIGINT NOT NULL,
    from_plan      BIGINT NOT NULL,
    from_rollover  BIGINT NOT NULL,
    from_purchased BIGINT NOT NULL,
    to_overage     BIGINT NOT NULL,
    enqueued_at    TIMESTAMPTZ NOT NULL,
    applied_at     TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS usage_events_user_idx ON usage_events (user_id, enqueued_at);
"#;

/// Connection settings for the billing database.
#[derive(Debug, Clone)]
pub struct BillingDbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait bound for acquiring a connection
    pub timeout: Duration,
}

impl Default for BillingDbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "lectern".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: DEFAULT_BILLING_POOL_SIZE,
            timeout: Duration::from_secs(DEFAULT_BILLING_DB_TIMEOUT_SECS),
        }
    }
}

impl BillingDbConfig {
    /// Read `LECTERN_BILLING_DB_*` variables.
    ///
    /// Returns `None` when `LECTERN_BILLING_DB_HOST` is unset, which selects
    /// the in-memory ledger.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("LECTERN_BILLING_DB_HOST").ok()?;
        let defaults = Self::default();
        Some(Self {
            host,
            port: std::env::var("LECTERN_BILLING_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("LECTERN_BILLING_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("LECTERN_BILLING_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("LECTERN_BILLING_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("LECTERN_BILLING_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: Duration::from_secs(
                std::env::var("LECTERN_BILLING_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BILLING_DB_TIMEOUT_SECS),
            ),
        })
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = PoolConfig::new(self.max_size.max(1));
        pool_config.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create billing pool: {}", e)))?;

        Ok(pool)
    }
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Ledger backed by PostgreSQL.
#[derive(Clone)]
pub struct PgUsageLedger {
    pool: Pool,
}

impl PgUsageLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &BillingDbConfig) -> ApiResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Create the ledger tables if missing.
    pub async fn ensure_schema(&self) -> ApiResult<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }

    async fn apply_in_tx(
        &self,
        user_id: UserId,
        events: &[BillingEvent],
    ) -> Result<LedgerReceipt, ApplyError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute(
            "INSERT INTO usage_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
            &[&user_id],
        )
        .await?;

        let row = tx
            .query_one(
                "SELECT plan_remaining, rollover_remaining, purchased_remaining, overage_used \
                 FROM usage_accounts WHERE user_id = $1 FOR UPDATE",
                &[&user_id],
            )
            .await?;
        let mut pools = UsagePools {
            plan_remaining: from_db(row.get(0)),
            rollover_remaining: from_db(row.get(1)),
            purchased_remaining: from_db(row.get(2)),
            overage_used: from_db(row.get(3)),
        };

        let mut receipt = LedgerReceipt {
            user_id,
            ..LedgerReceipt::default()
        };

        for event in events {
            let mut next = pools;
            let deduction = next.apply(event.quantity);
            let inserted = tx
                .execute(
                    "INSERT INTO usage_events \
                     (correlation_id, user_id, resource_kind, quantity, \
                      from_plan, from_rollover, from_purchased, to_overage, enqueued_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     ON CONFLICT (correlation_id) DO NOTHING",
                    &[
                        &event.correlation_id,
                        &user_id,
                        &event.resource_kind.as_str(),
                        &to_db(event.quantity),
                        &to_db(deduction.from_plan),
                        &to_db(deduction.from_rollover),
                        &to_db(deduction.from_purchased),
                        &to_db(deduction.to_overage),
                        &event.enqueued_at,
                    ],
                )
                .await?;

            if inserted == 0 {
                receipt.duplicates += 1;
                continue;
            }
            pools = next;
            receipt.applied += 1;
            receipt.deduction = receipt.deduction.merge(deduction);
        }

        if receipt.applied > 0 {
            tx.execute(
                "UPDATE usage_accounts SET plan_remaining = $2, rollover_remaining = $3, \
                 purchased_remaining = $4, overage_used = $5, updated_at = now() \
                 WHERE user_id = $1",
                &[
                    &user_id,
                    &to_db(pools.plan_remaining),
                    &to_db(pools.rollover_remaining),
                    &to_db(pools.purchased_remaining),
                    &to_db(pools.overage_used),
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(receipt)
    }
}

enum ApplyError {
    Pool(deadpool_postgres::PoolError),
    Db(tokio_postgres::Error),
}

impl From<deadpool_postgres::PoolError> for ApplyError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        ApplyError::Pool(err)
    }
}

impl From<tokio_postgres::Error> for ApplyError {
    fn from(err: tokio_postgres::Error) -> Self {
        ApplyError::Db(err)
    }
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn apply(
        &self,
        user_id: UserId,
        events: &[BillingEvent],
    ) -> Result<LedgerReceipt, BillingError> {
        if let Some(foreign) = events.iter().find(|e| e.user_id != user_id) {
            return Err(BillingError::ApplyFailed {
                user_id,
                reason: format!("event {} belongs to {}", foreign.correlation_id, foreign.user_id),
            });
        }

        self.apply_in_tx(user_id, events).await.map_err(|err| match err {
            ApplyError::Pool(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Billing pool unavailable");
                BillingError::PoolUnavailable {
                    reason: e.to_string(),
                }
            }
            ApplyError::Db(e) => {
                tracing::warn!(user_id = %user_id, error = ?e, "Billing transaction failed");
                BillingError::ApplyFailed {
                    user_id,
                    reason: e.to_string(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_is_small() {
        let config = BillingDbConfig::default();
        assert_eq!(config.max_size, 2);
    }

    #[test]
    fn test_pool_creation_is_lazy() -> Result<(), ApiError> {
        // No connection is attempted until the first `get`.
        let pool = BillingDbConfig::default().create_pool()?;
        assert_eq!(pool.status().max_size, 2);
        Ok(())
    }

    #[test]
    fn test_db_conversions_saturate() {
        assert_eq!(to_db(u64::MAX), i64::MAX);
        assert_eq!(from_db(-5), 0);
        assert_eq!(from_db(42), 42);
    }

    #[cfg(feature = "db-tests")]
    #[tokio::test]
    async fn test_apply_against_database() -> Result<(), Box<dyn std::error::Error>> {
        use chrono::Utc;
        use lectern_core::{new_entity_id, ResourceKind};

        let config = BillingDbConfig::from_env().ok_or("LECTERN_BILLING_DB_HOST not set")?;
        let ledger = PgUsageLedger::from_config(&config)?;
        ledger.ensure_schema().await?;

        let user = new_entity_id();
        let event = BillingEvent {
            user_id: user,
            resource_kind: ResourceKind::Characters,
            quantity: 12,
            correlation_id: new_entity_id(),
            enqueued_at: Utc::now(),
        };
        let first = ledger.apply(user, std::slice::from_ref(&event)).await?;
        assert_eq!(first.applied, 1);
        assert_eq!(first.deduction.to_overage, 12);

        let again = ledger.apply(user, &[event]).await?;
        assert_eq!(again.duplicates, 1);
        Ok(())
    }
}
