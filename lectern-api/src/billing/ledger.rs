//! Usage ledger abstraction and the in-process ledger.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use lectern_core::{BillingError, BillingEvent, Deduction, UsagePools, UserId};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// What one `apply` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerReceipt {
    pub user_id: UserId,
    /// Events applied for the first time.
    pub applied: u64,
    /// Events whose correlation id was already recorded.
    pub duplicates: u64,
    pub deduction: Deduction,
}

/// Applies metered usage to a user's balances.
///
/// `events` all belong to `user_id` and are in enqueue order. An
/// implementation applies them atomically, skipping correlation ids it has
/// already seen, so redelivery is harmless.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn apply(
        &self,
        user_id: UserId,
        events: &[BillingEvent],
    ) -> Result<LedgerReceipt, BillingError>;
}

#[derive(Default)]
struct Account {
    pools: UsagePools,
    seen: HashSet<Uuid>,
    history: Vec<Uuid>,
}

/// Ledger kept in process memory. Used in development and tests.
pub struct MemoryUsageLedger {
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
    default_pools: UsagePools,
}

impl Default for MemoryUsageLedger {
    fn default() -> Self {
        Self::new(UsagePools::default())
    }
}

impl MemoryUsageLedger {
    /// New accounts start with `default_pools`.
    pub fn new(default_pools: UsagePools) -> Self {
        Self {
            accounts: DashMap::new(),
            default_pools,
        }
    }

    fn account(&self, user_id: UserId) -> Arc<Mutex<Account>> {
        self.accounts
            .entry(user_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Account {
                    pools: self.default_pools,
                    ..Account::default()
                }))
            })
            .value()
            .clone()
    }

    pub async fn set_pools(&self, user_id: UserId, pools: UsagePools) {
        self.account(user_id).lock().await.pools = pools;
    }

    pub async fn pools(&self, user_id: UserId) -> UsagePools {
        self.account(user_id).lock().await.pools
    }

    /// Correlation ids applied for `user_id`, in application order.
    pub async fn history(&self, user_id: UserId) -> Vec<Uuid> {
        self.account(user_id).lock().await.history.clone()
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn apply(
        &self,
        user_id: UserId,
        events: &[BillingEvent],
    ) -> Result<LedgerReceipt, BillingError> {
        let account = self.account(user_id);
        let mut account = account.lock().await;
        let mut receipt = LedgerReceipt {
            user_id,
            ..LedgerReceipt::default()
        };

        for event in events {
            if event.user_id != user_id {
                return Err(BillingError::ApplyFailed {
                    user_id,
                    reason: format!("event {} belongs to {}", event.correlation_id, event.user_id),
                });
            }
        }

        for event in events {
            if !account.seen.insert(event.correlation_id) {
                receipt.duplicates += 1;
                continue;
            }
            let deduction = account.pools.apply(event.quantity);
            account.history.push(event.correlation_id);
            receipt.deduction = receipt.deduction.merge(deduction);
            receipt.applied += 1;
        }
        Ok(receipt)
    }
}
