//! Billing cold path.
//!
//! The result consumer appends [`lectern_core::BillingEvent`]s to a
//! [`BillingQueue`]; the drain job in [`crate::jobs::billing_drain`] applies
//! them through a [`UsageLedger`], serially per user and concurrently across
//! users.

pub mod ledger;
pub mod pg;
pub mod queue;

pub use ledger::{LedgerReceipt, MemoryUsageLedger, UsageLedger};
pub use pg::{BillingDbConfig, PgUsageLedger};
pub use queue::BillingQueue;
