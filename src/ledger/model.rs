//! Ledger records: accounts with their owned keys and quota bundles.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A user's ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub display_name: String,
    /// Never negative; debits that would violate this are rejected.
    pub balance: Decimal,
    pub owned_keys: Vec<OwnedKey>,
    pub bundles: Vec<QuotaBundle>,
}

impl Account {
    pub fn owned_key(&self, key_id: &str) -> Option<&OwnedKey> {
        self.owned_keys.iter().find(|k| k.id == key_id)
    }

    pub fn bundle(&self, bundle_id: &str) -> Option<&QuotaBundle> {
        self.bundles.iter().find(|b| b.id == bundle_id)
    }
}

/// A user-registered upstream credential with its own token quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedKey {
    pub id: String,
    /// Display name; the provider is inferred from it.
    pub name: String,
    /// `aes256:`-prefixed envelope, never serialized to clients.
    #[serde(skip_serializing, default)]
    pub encrypted_credential: String,
    pub available: i64,
}

/// A priced slice of a seller's [`OwnedKey`] quota.
///
/// The seller's listing and every buyer's copy are separate rows; each one
/// traces back to the seller's key through `seller_id` + `original_key_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaBundle {
    pub id: String,
    pub name: String,
    pub tokens_remaining: i64,
    pub price_per_token: Decimal,
    pub expires_at: DateTime<Utc>,
    pub seller_id: String,
    pub original_key_id: String,
}

impl QuotaBundle {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Which collection a chat request draws its quota from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// An [`OwnedKey`] (`keyType=user` on the wire).
    Owned,
    /// A purchased [`QuotaBundle`] (`keyType=temp` on the wire).
    Purchased,
}

impl SourceKind {
    /// Parse the HTTP `keyType` value.
    pub fn from_key_type(key_type: &str) -> Option<Self> {
        match key_type {
            "user" => Some(Self::Owned),
            "temp" => Some(Self::Purchased),
            _ => None,
        }
    }
}

/// Handle on a concrete quota counter, produced by the resolver and
/// consumed by [`LedgerStore::debit`](super::LedgerStore::debit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaSource {
    OwnedKey { account_id: String, key_id: String },
    Bundle { account_id: String, bundle_id: String },
}

impl QuotaSource {
    pub fn account_id(&self) -> &str {
        match self {
            Self::OwnedKey { account_id, .. } | Self::Bundle { account_id, .. } => account_id,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::OwnedKey { .. } => SourceKind::Owned,
            Self::Bundle { .. } => SourceKind::Purchased,
        }
    }
}

/// Outcome of a successful purchase.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub tokens_received: i64,
    pub amount_spent: Decimal,
    pub remaining_balance: Decimal,
    /// Buyer-side bundle after the merge or append.
    pub purchased_token: QuotaBundle,
}

/// Outcome of a successful debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebitOutcome {
    pub remaining: i64,
    /// The bundle reached zero and was removed from the account.
    pub pruned: bool,
}

/// Parameters for listing part of an owned key's quota for resale.
#[derive(Debug, Clone)]
pub struct NewListing {
    pub key_id: String,
    pub tokens: i64,
    pub price_per_token: Decimal,
    pub expires_at: DateTime<Utc>,
}
