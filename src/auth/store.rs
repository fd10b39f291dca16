//! SQLite-backed API token store.
//!
//! Tables:
//! - `api_tokens`: token_hash, account_id, label, created_at, last_used_at
//!
//! Only the SHA-256 hash of a token is persisted; the plaintext is shown once
//! at issue time.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Visible prefix so leaked tokens are easy to recognise.
const TOKEN_PREFIX: &str = "qm_";

/// An issued token, as listed for its owner.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub account_id: String,
    pub label: String,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

pub struct TokenStore {
    conn: Mutex<rusqlite::Connection>,
}

impl TokenStore {
    /// Open (or create) the token database at the given path.
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS api_tokens (
                token_hash TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                label TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_api_tokens_account ON api_tokens(account_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Issue a token for an account. Returns the plaintext token.
    pub fn issue(&self, account_id: &str, label: &str) -> Result<String> {
        if account_id.trim().is_empty() {
            bail!("Account id must not be empty");
        }
        let token = generate_token();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_tokens (token_hash, account_id, label, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![hash_token(&token), account_id, label.trim(), epoch_secs()],
        )?;
        Ok(token)
    }

    /// Resolve a presented token to its account id.
    ///
    /// `Ok(None)` for unknown tokens; `Err` only when the store itself fails.
    pub fn validate(&self, token: &str) -> Result<Option<String>> {
        if !token.starts_with(TOKEN_PREFIX) {
            return Ok(None);
        }
        let token_hash = hash_token(token);
        let conn = self.conn.lock();
        let account_id: Option<String> = conn
            .query_row(
                "SELECT account_id FROM api_tokens WHERE token_hash = ?1",
                rusqlite::params![token_hash],
                |row| row.get(0),
            )
            .optional()?;
        let Some(account_id) = account_id else {
            return Ok(None);
        };

        if let Err(e) = conn.execute(
            "UPDATE api_tokens SET last_used_at = ?1 WHERE token_hash = ?2",
            rusqlite::params![epoch_secs(), token_hash],
        ) {
            tracing::warn!(error = %e, "Failed to record token use");
        }
        Ok(Some(account_id))
    }

    pub fn revoke(&self, token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM api_tokens WHERE token_hash = ?1",
            rusqlite::params![hash_token(token)],
        )?;
        Ok(deleted > 0)
    }

    pub fn list(&self, account_id: &str) -> Result<Vec<TokenInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, label, created_at, last_used_at
             FROM api_tokens WHERE account_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(rusqlite::params![account_id], |row| {
            Ok(TokenInfo {
                account_id: row.get(0)?,
                label: row.get(1)?,
                created_at: row.get(2)?,
                last_used_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
}

/// Single SHA-256 pass; tokens are already high-entropy.
fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
