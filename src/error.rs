//! Error taxonomy shared by the ledger, resolver, providers and gateway.

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a ledger or gateway operation can surface.
///
/// Validation and not-found errors are raised before any mutation is staged.
/// `Persistence` raised inside a ledger transaction means the whole
/// transaction was rolled back.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing input. No state change.
    #[error("{0}")]
    Validation(String),

    /// Referenced account, key or bundle is absent.
    #[error("{0} not found")]
    NotFound(String),

    /// The requested spend cannot buy a single token.
    #[error("amount too small to buy a single token (price per token: {price_per_token})")]
    InvalidAmount { price_per_token: String },

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    #[error("insufficient tokens: required {required}, available {available}")]
    InsufficientTokens { required: i64, available: i64 },

    #[error("insufficient supply: requested {requested} tokens, {remaining} remaining")]
    InsufficientSupply { requested: i64, remaining: i64 },

    /// Quota source already reads zero before any upstream call.
    #[error("quota exhausted")]
    Exhausted,

    #[error("quota bundle expired")]
    Expired,

    #[error("unable to infer provider from key name '{0}'")]
    UnknownProvider(String),

    /// Upstream transport, authentication or status failure.
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    /// Storage-layer failure during a ledger operation.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("credential cipher failure: {0}")]
    Crypto(String),

    #[error("unauthorized")]
    Unauthorized,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Status code used when an upstream failure has no HTTP status
    /// (connect errors, timeouts, undecodable bodies).
    pub const TRANSPORT_STATUS: u16 = 502;

    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// Whether the error belongs to the server side (5xx) rather than the caller.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. } | Self::Persistence(_) | Self::Crypto(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Self::Persistence(format!("connection pool: {e}"))
    }
}

// The request URL is dropped from the message: it can carry credentials.
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let status = e
            .status()
            .map_or(Self::TRANSPORT_STATUS, |s| s.as_u16());
        let timed_out = e.is_timeout();
        let e = e.without_url();
        let message = if timed_out {
            format!("upstream request timed out: {e}")
        } else {
            e.to_string()
        };
        Self::Provider { status, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_server_side() {
        assert!(Error::provider(401, "bad key").is_internal());
        assert!(Error::Persistence("disk full".into()).is_internal());
        assert!(!Error::Exhausted.is_internal());
        assert!(!Error::not_found("bundle").is_internal());
    }

    #[tokio::test]
    async fn transport_errors_omit_request_url() {
        // Nothing listens on port 9 of the loopback interface.
        let err: Error = reqwest::Client::new()
            .post("http://127.0.0.1:9/v1/chat?key=sk-hidden-credential")
            .send()
            .await
            .unwrap_err()
            .into();
        let Error::Provider { status, message } = err else {
            panic!("expected a provider error");
        };
        assert_eq!(status, Error::TRANSPORT_STATUS);
        assert!(!message.contains("sk-hidden-credential"));
        assert!(!message.contains("127.0.0.1"));
    }

    #[test]
    fn messages_carry_context() {
        let err = Error::InsufficientSupply {
            requested: 50,
            remaining: 10,
        };
        assert_eq!(
            err.to_string(),
            "insufficient supply: requested 50 tokens, 10 remaining"
        );
        assert_eq!(Error::not_found("seller").to_string(), "seller not found");
        assert_eq!(
            Error::UnknownProvider("llama-3".into()).to_string(),
            "unable to infer provider from key name 'llama-3'"
        );
    }
}
