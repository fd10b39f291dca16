//! Resolve a quota source to a usable upstream credential.

use crate::error::{Error, Result};
use crate::ledger::{LedgerStore, QuotaSource, SourceKind};
use crate::providers::{infer_provider, ProviderKind};
use crate::security::CredentialCipher;
use chrono::Utc;
use std::sync::Arc;

/// Everything the metering pipeline needs to call upstream and debit after.
#[derive(Clone)]
pub struct ResolvedCredential {
    /// Decrypted API key.
    pub credential: String,
    pub provider: ProviderKind,
    pub source: QuotaSource,
    /// Quota left on the source at resolution time.
    pub remaining: i64,
    /// Key or bundle name the provider was inferred from.
    pub display_name: String,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("credential", &"<redacted>")
            .field("provider", &self.provider)
            .field("source", &self.source)
            .field("remaining", &self.remaining)
            .field("display_name", &self.display_name)
            .finish()
    }
}

#[derive(Clone)]
pub struct CredentialResolver {
    ledger: Arc<LedgerStore>,
    cipher: CredentialCipher,
}

impl CredentialResolver {
    pub fn new(ledger: Arc<LedgerStore>, cipher: CredentialCipher) -> Self {
        Self { ledger, cipher }
    }

    /// Look up the source, check it can still be spent and decrypt its key.
    ///
    /// A purchased bundle has no credential of its own; the key is read from
    /// the seller's original owned key at call time.
    pub fn resolve(
        &self,
        account_id: &str,
        kind: SourceKind,
        source_id: &str,
    ) -> Result<ResolvedCredential> {
        match kind {
            SourceKind::Owned => {
                let key = self
                    .ledger
                    .owned_key(account_id, source_id)?
                    .ok_or_else(|| Error::not_found("key"))?;
                if key.available <= 0 {
                    return Err(Error::Exhausted);
                }
                let provider = infer_provider(&key.name)?;
                let credential = self.cipher.decrypt(&key.encrypted_credential)?;
                Ok(ResolvedCredential {
                    credential,
                    provider,
                    source: QuotaSource::OwnedKey {
                        account_id: account_id.to_string(),
                        key_id: key.id,
                    },
                    remaining: key.available,
                    display_name: key.name,
                })
            }
            SourceKind::Purchased => {
                let bundle = self
                    .ledger
                    .bundle(account_id, source_id)?
                    .ok_or_else(|| Error::not_found("key"))?;
                if bundle.is_expired_at(Utc::now()) {
                    return Err(Error::Expired);
                }
                if bundle.tokens_remaining <= 0 {
                    return Err(Error::Exhausted);
                }
                let provider = infer_provider(&bundle.name)?;

                if !self.ledger.account_exists(&bundle.seller_id)? {
                    return Err(Error::not_found("seller"));
                }
                let original = self
                    .ledger
                    .owned_key(&bundle.seller_id, &bundle.original_key_id)?
                    .ok_or_else(|| Error::not_found("original key"))?;
                let credential = self.cipher.decrypt(&original.encrypted_credential)?;

                Ok(ResolvedCredential {
                    credential,
                    provider,
                    source: QuotaSource::Bundle {
                        account_id: account_id.to_string(),
                        bundle_id: bundle.id,
                    },
                    remaining: bundle.tokens_remaining,
                    display_name: bundle.name,
                })
            }
        }
    }

    /// Provider behind a source, for display. No expiry or quota checks and
    /// no decryption.
    pub fn provider_for(
        &self,
        account_id: &str,
        kind: SourceKind,
        source_id: &str,
    ) -> Result<ProviderKind> {
        let name = match kind {
            SourceKind::Owned => self
                .ledger
                .owned_key(account_id, source_id)?
                .map(|k| k.name),
            SourceKind::Purchased => self.ledger.bundle(account_id, source_id)?.map(|b| b.name),
        }
        .ok_or_else(|| Error::not_found("key"))?;
        infer_provider(&name)
    }
}
