//! Quota ledger: balances, owned keys and purchased quota bundles.
//!
//! Two mutation paths exist: [`LedgerStore::purchase`] moves money and quota
//! between two accounts, and [`LedgerStore::debit`] consumes quota after an
//! upstream completion. Both are atomic and re-validate their preconditions
//! inside the transaction.

pub mod model;
mod purchase;
pub mod store;

pub use model::{
    Account, DebitOutcome, NewListing, OwnedKey, PurchaseReceipt, QuotaBundle, QuotaSource,
    SourceKind,
};
pub use purchase::tokens_for_spend;
pub use store::LedgerStore;

use crate::error::{Error, Result};
use std::sync::Arc;

/// Run a ledger operation on the blocking pool.
///
/// Writers may wait up to `busy_timeout_ms` on SQLite's lock, which must not
/// stall the async workers.
pub async fn blocking<T, F>(store: &Arc<LedgerStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&LedgerStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| Error::Persistence(format!("ledger task failed: {e}")))?
}
