//! Upstream chat providers.
//!
//! Each provider implements [`ChatProvider`]: send one user message with a
//! caller-supplied credential and get back the completion text plus token
//! usage. The provider behind a key is never chosen by the caller; it is
//! inferred from the key or bundle name by [`infer_provider`].

pub mod anthropic;
pub mod catalog;
pub mod gemini;
pub mod openai;

use crate::config::ProvidersConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use anthropic::AnthropicProvider;
pub use catalog::{models_for, ModelInfo};
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

// ── Provider kind ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::OpenAi, Self::Anthropic, Self::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infer the provider from a key or bundle name.
///
/// Case-insensitive substring match, checked in order `gpt`, `claude`,
/// `gemini`; the first hit wins.
pub fn infer_provider(name: &str) -> Result<ProviderKind> {
    let lower = name.to_lowercase();
    if lower.contains("gpt") {
        Ok(ProviderKind::OpenAi)
    } else if lower.contains("claude") {
        Ok(ProviderKind::Anthropic)
    } else if lower.contains("gemini") {
        Ok(ProviderKind::Gemini)
    } else {
        Err(Error::UnknownProvider(name.to_string()))
    }
}

/// Longest model id accepted from callers.
const MAX_MODEL_ID_LEN: usize = 128;

/// Check a caller-supplied model id before it reaches an upstream request.
///
/// Some providers put the model into the URL path, so only ASCII letters,
/// digits, `.`, `_` and `-` are allowed.
pub fn validate_model_id(model: &str) -> Result<()> {
    let valid = !model.is_empty()
        && model.len() <= MAX_MODEL_ID_LEN
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::validation(
            "modelId may only contain letters, digits, '.', '_' and '-'",
        ))
    }
}

// ── Usage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl Usage {
    /// `ceil(chars / 4)` for the message and the output independently,
    /// summed for the total.
    pub fn estimate(message: &str, output: &str) -> Self {
        let prompt_tokens = estimate_tokens(message);
        let completion_tokens = estimate_tokens(output);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Deterministic token estimate: one token per four Unicode scalar values,
/// rounded up.
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    (chars + 3) / 4
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

// ── Trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Send one user message. Any transport, auth or status failure is
    /// returned as [`Error::Provider`]; nothing is retried.
    async fn send(&self, credential: &str, model: &str, message: &str) -> Result<Completion>;
}

/// Turn a non-success upstream response into [`Error::Provider`].
pub(crate) async fn status_error(provider: ProviderKind, resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(500).collect();
    tracing::warn!(%provider, status = status.as_u16(), "Upstream returned an error");
    Error::provider(status.as_u16(), format!("{provider} API error {status}: {body}"))
}

pub(crate) fn malformed(provider: ProviderKind, what: &str) -> Error {
    Error::provider(
        Error::TRANSPORT_STATUS,
        format!("{provider} response missing {what}"),
    )
}

// ── Registry ────────────────────────────────────────────────────

/// One [`ChatProvider`] per [`ProviderKind`].
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP providers for every kind, sharing one client.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self::new()
            .with(Arc::new(OpenAiProvider::new(
                client.clone(),
                &config.openai_base_url,
            )))
            .with(Arc::new(AnthropicProvider::new(
                client.clone(),
                &config.anthropic_base_url,
                config.max_output_tokens,
            )))
            .with(Arc::new(GeminiProvider::new(client, &config.gemini_base_url))))
    }

    /// Register (or replace) the provider for its kind.
    pub fn with(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ChatProvider>> {
        self.providers.get(&kind).cloned().ok_or_else(|| {
            Error::provider(
                Error::TRANSPORT_STATUS,
                format!("no provider configured for {kind}"),
            )
        })
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.providers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("providers", &kinds)
            .finish()
    }
}
