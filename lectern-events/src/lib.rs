//! LECTERN Events - Document Status Fan-out
//!
//! Status pushes are scoped to one document. Subscribers of document A
//! never see events for document B, and a document with no listeners has
//! no channel at all.
//!
//! Delivery is at-most-once. Nothing is persisted or replayed: a client that
//! missed an event reconciles by asking the cache directly.

mod notifier;

pub use notifier::{DocumentNotifier, DocumentSubscription, SubscriptionError};
