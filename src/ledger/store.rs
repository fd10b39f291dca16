//! SQLite-backed quota ledger.
//!
//! Tables:
//! - `accounts`: id, display_name, balance (decimal text)
//! - `owned_keys`: account_id, name, encrypted_credential, available
//! - `quota_bundles`: account_id, name, tokens_remaining, price_per_token,
//!   expires_at, seller_id, original_key_id
//!
//! Keys and bundles are child rows of their account (the relational form of
//! an account document with embedded collections) and are listed in
//! insertion order. Every mutation runs in an `IMMEDIATE` transaction on a
//! pooled connection, so concurrent writers serialise on SQLite's writer
//! lock and re-validate their preconditions inside the transaction.

use super::model::{Account, DebitOutcome, NewListing, OwnedKey, QuotaBundle, QuotaSource};
use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    balance TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS owned_keys (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    encrypted_credential TEXT NOT NULL,
    available INTEGER NOT NULL CHECK (available >= 0),
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_owned_keys_account ON owned_keys(account_id);

CREATE TABLE IF NOT EXISTS quota_bundles (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    tokens_remaining INTEGER NOT NULL CHECK (tokens_remaining >= 0),
    price_per_token TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    seller_id TEXT NOT NULL,
    original_key_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bundles_account ON quota_bundles(account_id);
CREATE INDEX IF NOT EXISTS idx_bundles_merge ON quota_bundles(account_id, name, seller_id);
";

const BUNDLE_COLUMNS: &str =
    "id, name, tokens_remaining, price_per_token, expires_at, seller_id, original_key_id";

/// Quota ledger with pooled SQLite persistence.
pub struct LedgerStore {
    pool: Pool<SqliteConnectionManager>,
}

impl LedgerStore {
    /// Open (or create) the ledger database at the given path.
    pub fn open(db_path: &Path, config: &LedgerConfig) -> Result<Self> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .build(manager)?;

        pool.get()?.execute_batch(SCHEMA)?;
        tracing::debug!(path = %db_path.display(), "Ledger database ready");

        Ok(Self { pool })
    }

    pub(super) fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // ── Accounts ────────────────────────────────────────────────────

    /// Create an account with an opening balance.
    pub fn create_account(&self, display_name: &str, opening_balance: Decimal) -> Result<Account> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(Error::validation("display name cannot be empty"));
        }
        if opening_balance < Decimal::ZERO {
            return Err(Error::validation("opening balance cannot be negative"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO accounts (id, display_name, balance, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, display_name, opening_balance.to_string(), now_epoch()],
        )?;
        tracing::info!(account_id = %id, "Account created");

        Ok(Account {
            id,
            display_name: display_name.to_string(),
            balance: opening_balance,
            owned_keys: Vec::new(),
            bundles: Vec::new(),
        })
    }

    /// Add funds to an account. Returns the new balance.
    pub fn deposit(&self, account_id: &str, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(Error::validation("deposit amount must be greater than zero"));
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let balance = load_balance(&tx, account_id)?.ok_or_else(|| Error::not_found("account"))?;
        let new_balance = balance + amount;
        store_balance(&tx, account_id, new_balance)?;
        tx.commit()?;

        tracing::info!(account_id, %amount, %new_balance, "Deposit recorded");
        Ok(new_balance)
    }

    /// Load an account with its owned keys and bundles.
    pub fn account(&self, account_id: &str) -> Result<Account> {
        let conn = self.connection()?;
        load_account(&conn, account_id)?.ok_or_else(|| Error::not_found("account"))
    }

    pub fn account_exists(&self, account_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        Ok(load_balance(&conn, account_id)?.is_some())
    }

    // ── Owned keys ──────────────────────────────────────────────────

    /// Register an upstream credential (already encrypted) with its quota.
    pub fn add_owned_key(
        &self,
        account_id: &str,
        name: &str,
        encrypted_credential: &str,
        available: i64,
    ) -> Result<OwnedKey> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("key name cannot be empty"));
        }
        if available < 0 {
            return Err(Error::validation("available tokens cannot be negative"));
        }

        let conn = self.connection()?;
        if load_balance(&conn, account_id)?.is_none() {
            return Err(Error::not_found("account"));
        }

        let key = OwnedKey {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            encrypted_credential: encrypted_credential.to_string(),
            available,
        };
        conn.execute(
            "INSERT INTO owned_keys (id, account_id, name, encrypted_credential, available, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.id,
                account_id,
                key.name,
                key.encrypted_credential,
                key.available,
                now_epoch()
            ],
        )?;
        tracing::info!(account_id, key_id = %key.id, name = %key.name, "Owned key registered");

        Ok(key)
    }

    /// Remove an owned key. Bundles listed from it stay, but can no longer be
    /// spent: their credential is resolved from this key.
    pub fn remove_owned_key(&self, account_id: &str, key_id: &str) -> Result<()> {
        let conn = self.connection()?;
        let deleted = conn.execute(
            "DELETE FROM owned_keys WHERE id = ?1 AND account_id = ?2",
            params![key_id, account_id],
        )?;
        if deleted == 0 {
            return Err(Error::not_found("key"));
        }
        tracing::info!(account_id, key_id, "Owned key removed");
        Ok(())
    }

    pub fn owned_key(&self, account_id: &str, key_id: &str) -> Result<Option<OwnedKey>> {
        let conn = self.connection()?;
        load_owned_key(&conn, account_id, key_id)
    }

    // ── Bundles ─────────────────────────────────────────────────────

    /// List a slice of an owned key's quota for resale.
    ///
    /// The key itself is not touched: only debits mutate `available`.
    pub fn create_listing(&self, seller_id: &str, listing: &NewListing) -> Result<QuotaBundle> {
        if listing.tokens <= 0 {
            return Err(Error::validation("listing must offer at least one token"));
        }
        if listing.price_per_token <= Decimal::ZERO {
            return Err(Error::validation("price per token must be greater than zero"));
        }
        if listing.expires_at <= Utc::now() {
            return Err(Error::validation("listing expiry must be in the future"));
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let key = load_owned_key(&tx, seller_id, &listing.key_id)?
            .ok_or_else(|| Error::not_found("key"))?;
        if listing.tokens > key.available {
            return Err(Error::InsufficientTokens {
                required: listing.tokens,
                available: key.available,
            });
        }

        let bundle = QuotaBundle {
            id: uuid::Uuid::new_v4().to_string(),
            name: key.name.clone(),
            tokens_remaining: listing.tokens,
            price_per_token: listing.price_per_token,
            expires_at: truncate_to_millis(listing.expires_at),
            seller_id: seller_id.to_string(),
            original_key_id: key.id.clone(),
        };
        insert_bundle(&tx, seller_id, &bundle)?;
        tx.commit()?;

        tracing::info!(
            seller_id,
            bundle_id = %bundle.id,
            tokens = bundle.tokens_remaining,
            price = %bundle.price_per_token,
            "Quota listed for resale"
        );
        Ok(bundle)
    }

    pub fn bundle(&self, account_id: &str, bundle_id: &str) -> Result<Option<QuotaBundle>> {
        let conn = self.connection()?;
        load_bundle(&conn, account_id, bundle_id)
    }

    /// Unexpired bundles still held by the seller that created them.
    pub fn marketplace(&self) -> Result<Vec<QuotaBundle>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUNDLE_COLUMNS} FROM quota_bundles
             WHERE account_id = seller_id AND expires_at > ?1
             ORDER BY rowid"
        ))?;
        let bundles = stmt
            .query_map(params![Utc::now().timestamp_millis()], bundle_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bundles)
    }

    // ── Debit ───────────────────────────────────────────────────────

    /// Subtract `tokens_used` from a quota source.
    ///
    /// The decrement is conditional on the counter itself
    /// (`... WHERE n >= tokens_used`), so of several requests that passed an
    /// earlier optimistic check only those that still fit succeed; the rest
    /// fail with [`Error::InsufficientTokens`] and leave the counter as is.
    /// A bundle that reaches zero is removed in the same transaction.
    pub fn debit(&self, source: &QuotaSource, tokens_used: i64) -> Result<DebitOutcome> {
        if tokens_used < 0 {
            return Err(Error::validation("tokens used cannot be negative"));
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let outcome = match source {
            QuotaSource::OwnedKey { account_id, key_id } => {
                let updated = tx.execute(
                    "UPDATE owned_keys SET available = available - ?1
                     WHERE id = ?2 AND account_id = ?3 AND available >= ?1",
                    params![tokens_used, key_id, account_id],
                )?;
                let current = load_owned_key(&tx, account_id, key_id)?
                    .ok_or_else(|| Error::not_found("key"))?;
                if updated == 0 {
                    return Err(Error::InsufficientTokens {
                        required: tokens_used,
                        available: current.available,
                    });
                }
                DebitOutcome {
                    remaining: current.available,
                    pruned: false,
                }
            }
            QuotaSource::Bundle {
                account_id,
                bundle_id,
            } => {
                let updated = tx.execute(
                    "UPDATE quota_bundles SET tokens_remaining = tokens_remaining - ?1
                     WHERE id = ?2 AND account_id = ?3 AND tokens_remaining >= ?1",
                    params![tokens_used, bundle_id, account_id],
                )?;
                let current = load_bundle(&tx, account_id, bundle_id)?
                    .ok_or_else(|| Error::not_found("bundle"))?;
                if updated == 0 {
                    return Err(Error::InsufficientTokens {
                        required: tokens_used,
                        available: current.tokens_remaining,
                    });
                }
                let pruned = current.tokens_remaining == 0;
                if pruned {
                    delete_bundle(&tx, account_id, bundle_id)?;
                }
                DebitOutcome {
                    remaining: current.tokens_remaining,
                    pruned,
                }
            }
        };

        tx.commit()?;
        tracing::debug!(
            account_id = source.account_id(),
            tokens_used,
            remaining = outcome.remaining,
            pruned = outcome.pruned,
            "Quota debited"
        );
        Ok(outcome)
    }
}

// ── Row helpers ─────────────────────────────────────────────────────

pub(super) fn load_balance(conn: &Connection, account_id: &str) -> Result<Option<Decimal>> {
    let balance = conn
        .query_row(
            "SELECT balance FROM accounts WHERE id = ?1",
            params![account_id],
            |row| decimal_column(row, 0),
        )
        .optional()?;
    Ok(balance)
}

pub(super) fn store_balance(conn: &Connection, account_id: &str, balance: Decimal) -> Result<()> {
    if balance < Decimal::ZERO {
        return Err(Error::Persistence(format!(
            "refusing to store negative balance for account {account_id}"
        )));
    }
    conn.execute(
        "UPDATE accounts SET balance = ?1 WHERE id = ?2",
        params![balance.to_string(), account_id],
    )?;
    Ok(())
}

fn load_account(conn: &Connection, account_id: &str) -> Result<Option<Account>> {
    let header = conn
        .query_row(
            "SELECT display_name, balance FROM accounts WHERE id = ?1",
            params![account_id],
            |row| Ok((row.get::<_, String>(0)?, decimal_column(row, 1)?)),
        )
        .optional()?;
    let Some((display_name, balance)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, name, encrypted_credential, available
         FROM owned_keys WHERE account_id = ?1 ORDER BY rowid",
    )?;
    let owned_keys = stmt
        .query_map(params![account_id], owned_key_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {BUNDLE_COLUMNS} FROM quota_bundles WHERE account_id = ?1 ORDER BY rowid"
    ))?;
    let bundles = stmt
        .query_map(params![account_id], bundle_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(Account {
        id: account_id.to_string(),
        display_name,
        balance,
        owned_keys,
        bundles,
    }))
}

pub(super) fn load_owned_key(
    conn: &Connection,
    account_id: &str,
    key_id: &str,
) -> Result<Option<OwnedKey>> {
    let key = conn
        .query_row(
            "SELECT id, name, encrypted_credential, available
             FROM owned_keys WHERE id = ?1 AND account_id = ?2",
            params![key_id, account_id],
            owned_key_from_row,
        )
        .optional()?;
    Ok(key)
}

pub(super) fn load_bundle(
    conn: &Connection,
    account_id: &str,
    bundle_id: &str,
) -> Result<Option<QuotaBundle>> {
    let bundle = conn
        .query_row(
            &format!(
                "SELECT {BUNDLE_COLUMNS} FROM quota_bundles WHERE id = ?1 AND account_id = ?2"
            ),
            params![bundle_id, account_id],
            bundle_from_row,
        )
        .optional()?;
    Ok(bundle)
}

/// First bundle in the account with the given `(name, seller_id)` pair.
pub(super) fn find_mergeable_bundle(
    conn: &Connection,
    account_id: &str,
    name: &str,
    seller_id: &str,
) -> Result<Option<QuotaBundle>> {
    let bundle = conn
        .query_row(
            &format!(
                "SELECT {BUNDLE_COLUMNS} FROM quota_bundles
                 WHERE account_id = ?1 AND name = ?2 AND seller_id = ?3
                 ORDER BY rowid LIMIT 1"
            ),
            params![account_id, name, seller_id],
            bundle_from_row,
        )
        .optional()?;
    Ok(bundle)
}

pub(super) fn insert_bundle(conn: &Connection, account_id: &str, bundle: &QuotaBundle) -> Result<()> {
    conn.execute(
        "INSERT INTO quota_bundles
            (id, account_id, name, tokens_remaining, price_per_token, expires_at,
             seller_id, original_key_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            bundle.id,
            account_id,
            bundle.name,
            bundle.tokens_remaining,
            bundle.price_per_token.to_string(),
            bundle.expires_at.timestamp_millis(),
            bundle.seller_id,
            bundle.original_key_id,
            now_epoch(),
        ],
    )?;
    Ok(())
}

pub(super) fn delete_bundle(conn: &Connection, account_id: &str, bundle_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM quota_bundles WHERE id = ?1 AND account_id = ?2",
        params![bundle_id, account_id],
    )?;
    Ok(())
}

fn owned_key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OwnedKey> {
    Ok(OwnedKey {
        id: row.get(0)?,
        name: row.get(1)?,
        encrypted_credential: row.get(2)?,
        available: row.get(3)?,
    })
}

fn bundle_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuotaBundle> {
    let expires_ms: i64 = row.get(4)?;
    let expires_at = DateTime::<Utc>::from_timestamp_millis(expires_ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Integer,
            format!("timestamp out of range: {expires_ms}").into(),
        )
    })?;
    Ok(QuotaBundle {
        id: row.get(0)?,
        name: row.get(1)?,
        tokens_remaining: row.get(2)?,
        price_per_token: decimal_column(row, 3)?,
        expires_at,
        seller_id: row.get(5)?,
        original_key_id: row.get(6)?,
    })
}

fn decimal_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Stored timestamps carry millisecond precision.
fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    pub(crate) fn make_store() -> (TempDir, LedgerStore) {
        let tmp = TempDir::new().unwrap();
        let store = LedgerStore::open(&tmp.path().join("ledger.db"), &LedgerConfig::default())
            .unwrap();
        (tmp, store)
    }

    /// Seller with one 1000-token "gpt-4" key and a 100-token listing at 0.5/token.
    pub(crate) fn seed_listing(store: &LedgerStore) -> (Account, OwnedKey, QuotaBundle) {
        let seller = store.create_account("seller", dec!(0)).unwrap();
        let key = store
            .add_owned_key(&seller.id, "gpt-4", "aes256:opaque", 1_000)
            .unwrap();
        let bundle = store
            .create_listing(
                &seller.id,
                &NewListing {
                    key_id: key.id.clone(),
                    tokens: 100,
                    price_per_token: dec!(0.5),
                    expires_at: Utc::now() + ChronoDuration::days(30),
                },
            )
            .unwrap();
        (seller, key, bundle)
    }

    #[test]
    fn create_and_load_account() {
        let (_tmp, store) = make_store();
        let account = store.create_account("alice", dec!(12.50)).unwrap();

        let loaded = store.account(&account.id).unwrap();
        assert_eq!(loaded.display_name, "alice");
        assert_eq!(loaded.balance, dec!(12.50));
        assert!(loaded.owned_keys.is_empty());
        assert!(loaded.bundles.is_empty());
    }

    #[test]
    fn create_account_rejects_negative_balance() {
        let (_tmp, store) = make_store();
        assert!(matches!(
            store.create_account("bob", dec!(-1)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn unknown_account_is_not_found() {
        let (_tmp, store) = make_store();
        assert!(matches!(store.account("nope"), Err(Error::NotFound(_))));
        assert!(matches!(
            store.deposit("nope", dec!(1)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn deposit_accumulates() {
        let (_tmp, store) = make_store();
        let account = store.create_account("alice", dec!(1)).unwrap();
        store.deposit(&account.id, dec!(2.25)).unwrap();
        let balance = store.deposit(&account.id, dec!(0.75)).unwrap();
        assert_eq!(balance, dec!(4));
        assert!(store.deposit(&account.id, dec!(0)).is_err());
    }

    #[test]
    fn keys_and_bundles_keep_insertion_order() {
        let (_tmp, store) = make_store();
        let (seller, key, first) = seed_listing(&store);
        store
            .add_owned_key(&seller.id, "claude-3-opus", "aes256:x", 10)
            .unwrap();
        let second = store
            .create_listing(
                &seller.id,
                &NewListing {
                    key_id: key.id.clone(),
                    tokens: 5,
                    price_per_token: dec!(1),
                    expires_at: Utc::now() + ChronoDuration::days(1),
                },
            )
            .unwrap();

        let account = store.account(&seller.id).unwrap();
        let names: Vec<_> = account.owned_keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["gpt-4", "claude-3-opus"]);
        let ids: Vec<_> = account.bundles.iter().map(|b| b.id.clone()).collect();
        assert_eq!(ids, [first.id, second.id]);
    }

    #[test]
    fn listing_validates_against_key() {
        let (_tmp, store) = make_store();
        let (seller, key, _) = seed_listing(&store);
        let mut listing = NewListing {
            key_id: key.id.clone(),
            tokens: 5_000,
            price_per_token: dec!(0.1),
            expires_at: Utc::now() + ChronoDuration::days(1),
        };
        assert!(matches!(
            store.create_listing(&seller.id, &listing),
            Err(Error::InsufficientTokens { .. })
        ));

        listing.tokens = 10;
        listing.price_per_token = dec!(0);
        assert!(matches!(
            store.create_listing(&seller.id, &listing),
            Err(Error::Validation(_))
        ));

        listing.price_per_token = dec!(0.1);
        listing.key_id = "missing".into();
        assert!(matches!(
            store.create_listing(&seller.id, &listing),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn listing_does_not_touch_key_quota() {
        let (_tmp, store) = make_store();
        let (seller, key, _) = seed_listing(&store);
        let key = store.owned_key(&seller.id, &key.id).unwrap().unwrap();
        assert_eq!(key.available, 1_000);
    }

    #[test]
    fn marketplace_lists_only_seller_held_unexpired_bundles() {
        let (_tmp, store) = make_store();
        let (_seller, _key, bundle) = seed_listing(&store);
        let listed = store.marketplace().unwrap();
        assert_eq!(listed, vec![bundle]);
    }

    #[test]
    fn debit_owned_key() {
        let (_tmp, store) = make_store();
        let (seller, key, _) = seed_listing(&store);
        let source = QuotaSource::OwnedKey {
            account_id: seller.id.clone(),
            key_id: key.id.clone(),
        };

        let outcome = store.debit(&source, 400).unwrap();
        assert_eq!(outcome, DebitOutcome { remaining: 600, pruned: false });

        let outcome = store.debit(&source, 600).unwrap();
        assert_eq!(outcome.remaining, 0);
        assert!(!outcome.pruned);
        // Owned keys stay at zero instead of being removed.
        assert!(store.owned_key(&seller.id, &key.id).unwrap().is_some());
    }

    #[test]
    fn overdraft_leaves_counter_unchanged() {
        let (_tmp, store) = make_store();
        let (seller, _key, bundle) = seed_listing(&store);
        let source = QuotaSource::Bundle {
            account_id: seller.id.clone(),
            bundle_id: bundle.id.clone(),
        };

        let err = store.debit(&source, 101).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientTokens {
                required: 101,
                available: 100
            }
        ));
        let current = store.bundle(&seller.id, &bundle.id).unwrap().unwrap();
        assert_eq!(current.tokens_remaining, 100);
    }

    #[test]
    fn bundle_reaching_zero_is_pruned() {
        let (_tmp, store) = make_store();
        let (seller, _key, bundle) = seed_listing(&store);
        let source = QuotaSource::Bundle {
            account_id: seller.id.clone(),
            bundle_id: bundle.id.clone(),
        };

        let outcome = store.debit(&source, 100).unwrap();
        assert_eq!(outcome, DebitOutcome { remaining: 0, pruned: true });
        assert!(store.bundle(&seller.id, &bundle.id).unwrap().is_none());
        assert!(store.account(&seller.id).unwrap().bundles.is_empty());

        assert!(matches!(store.debit(&source, 1), Err(Error::NotFound(_))));
    }

    #[test]
    fn debit_of_foreign_source_is_not_found() {
        let (_tmp, store) = make_store();
        let (_seller, key, _) = seed_listing(&store);
        let other = store.create_account("mallory", dec!(0)).unwrap();
        let source = QuotaSource::OwnedKey {
            account_id: other.id,
            key_id: key.id,
        };
        assert!(matches!(store.debit(&source, 1), Err(Error::NotFound(_))));
    }

    #[test]
    fn removing_a_key_leaves_its_listing() {
        let (_tmp, store) = make_store();
        let (seller, key, bundle) = seed_listing(&store);
        store.remove_owned_key(&seller.id, &key.id).unwrap();
        assert!(store.owned_key(&seller.id, &key.id).unwrap().is_none());
        assert!(store.bundle(&seller.id, &bundle.id).unwrap().is_some());
        assert!(matches!(
            store.remove_owned_key(&seller.id, &key.id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_debits_never_double_spend() {
        let (_tmp, store) = make_store();
        let seller = store.create_account("seller", dec!(0)).unwrap();
        let key = store
            .add_owned_key(&seller.id, "gemini-1.5-pro", "aes256:x", 10)
            .unwrap();
        let store = Arc::new(store);
        let source = QuotaSource::OwnedKey {
            account_id: seller.id.clone(),
            key_id: key.id.clone(),
        };

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let source = source.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    store.debit(&source, 6)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let overdrafts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::InsufficientTokens { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(overdrafts, 1);
        let key = store.owned_key(&seller.id, &key.id).unwrap().unwrap();
        assert_eq!(key.available, 4);
    }
}
