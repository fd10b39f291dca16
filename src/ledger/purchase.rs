//! Atomic two-account purchase of resale quota.

use super::model::{PurchaseReceipt, QuotaBundle};
use super::store::{
    delete_bundle, find_mergeable_bundle, insert_bundle, load_balance, load_bundle,
    store_balance, LedgerStore,
};
use crate::error::{Error, Result};
use chrono::Utc;
use rusqlite::{params, TransactionBehavior};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Whole tokens a spend buys at the given price (rounded down).
///
/// Returns `None` when the quotient does not fit a token counter.
pub fn tokens_for_spend(spend: Decimal, price_per_token: Decimal) -> Option<i64> {
    spend.checked_div(price_per_token)?.floor().to_i64()
}

impl LedgerStore {
    /// Buy quota from a seller's bundle.
    ///
    /// The buyer is charged `floor(requested_spend / price) * price`, never
    /// more than `requested_spend`. Both balances, the seller's bundle and
    /// the buyer's bundle change in one `IMMEDIATE` transaction; every
    /// precondition is evaluated inside it, so a concurrent purchase that
    /// drained the bundle first turns this one into `InsufficientSupply`.
    pub fn purchase(
        &self,
        buyer_id: &str,
        seller_id: &str,
        bundle_id: &str,
        requested_spend: Decimal,
    ) -> Result<PurchaseReceipt> {
        if requested_spend <= Decimal::ZERO {
            return Err(Error::validation("amount must be greater than zero"));
        }
        if buyer_id == seller_id {
            return Err(Error::validation("cannot buy from your own listing"));
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let buyer_balance = load_balance(&tx, buyer_id)?.ok_or_else(|| Error::not_found("buyer"))?;
        let seller_balance =
            load_balance(&tx, seller_id)?.ok_or_else(|| Error::not_found("seller"))?;
        if buyer_balance < requested_spend {
            return Err(Error::InsufficientFunds {
                required: requested_spend.to_string(),
                available: buyer_balance.to_string(),
            });
        }

        let listing =
            load_bundle(&tx, seller_id, bundle_id)?.ok_or_else(|| Error::not_found("token"))?;
        if listing.is_expired_at(Utc::now()) {
            return Err(Error::Expired);
        }

        let tokens = tokens_for_spend(requested_spend, listing.price_per_token)
            .ok_or_else(|| Error::validation("amount is out of range"))?;
        if tokens <= 0 {
            return Err(Error::InvalidAmount {
                price_per_token: listing.price_per_token.to_string(),
            });
        }
        if tokens > listing.tokens_remaining {
            return Err(Error::InsufficientSupply {
                requested: tokens,
                remaining: listing.tokens_remaining,
            });
        }

        let actual_spend = listing.price_per_token * Decimal::from(tokens);
        if buyer_balance < actual_spend {
            return Err(Error::InsufficientFunds {
                required: actual_spend.to_string(),
                available: buyer_balance.to_string(),
            });
        }

        let remaining_balance = buyer_balance - actual_spend;
        store_balance(&tx, buyer_id, remaining_balance)?;
        store_balance(&tx, seller_id, seller_balance + actual_spend)?;

        // Seller side.
        let updated = tx.execute(
            "UPDATE quota_bundles SET tokens_remaining = tokens_remaining - ?1
             WHERE id = ?2 AND account_id = ?3 AND tokens_remaining >= ?1",
            params![tokens, bundle_id, seller_id],
        )?;
        if updated == 0 {
            return Err(Error::InsufficientSupply {
                requested: tokens,
                remaining: listing.tokens_remaining,
            });
        }
        let seller_left = listing.tokens_remaining - tokens;
        if seller_left == 0 {
            delete_bundle(&tx, seller_id, bundle_id)?;
        }

        // Buyer side: merge by (name, seller) or append a fresh entry.
        let purchased_id =
            match find_mergeable_bundle(&tx, buyer_id, &listing.name, &listing.seller_id)? {
                Some(existing) => {
                    let expires_at = existing.expires_at.max(listing.expires_at);
                    tx.execute(
                        "UPDATE quota_bundles
                         SET tokens_remaining = tokens_remaining + ?1, expires_at = ?2
                         WHERE id = ?3 AND account_id = ?4",
                        params![
                            tokens,
                            expires_at.timestamp_millis(),
                            existing.id,
                            buyer_id
                        ],
                    )?;
                    existing.id
                }
                None => {
                    let bundle = QuotaBundle {
                        id: uuid::Uuid::new_v4().to_string(),
                        name: listing.name.clone(),
                        tokens_remaining: tokens,
                        price_per_token: listing.price_per_token,
                        expires_at: listing.expires_at,
                        seller_id: listing.seller_id.clone(),
                        original_key_id: listing.original_key_id.clone(),
                    };
                    insert_bundle(&tx, buyer_id, &bundle)?;
                    bundle.id
                }
            };
        let purchased_token = load_bundle(&tx, buyer_id, &purchased_id)?
            .ok_or_else(|| Error::Persistence("purchased bundle missing after write".into()))?;

        tx.commit()?;

        tracing::info!(
            buyer_id,
            seller_id,
            bundle_id,
            tokens,
            %actual_spend,
            seller_left,
            "Quota purchased"
        );

        Ok(PurchaseReceipt {
            tokens_received: tokens,
            amount_spent: actual_spend,
            remaining_balance,
            purchased_token,
        })
    }
}
