//! Anthropic-compatible `/v1/messages`. Usage is estimated from text length.

use super::{status_error, ChatProvider, Completion, ProviderKind, Usage};
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    endpoint: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, base_url: &str, max_tokens: u32) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            max_tokens,
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn send(&self, credential: &str, model: &str, message: &str) -> Result<Completion> {
        let payload = serde_json::json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": message,
            }]
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", credential)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(self.kind(), resp).await);
        }

        let body: MessagesResponse = resp.json().await?;
        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect();

        let usage = Usage::estimate(message, &text);
        Ok(Completion { text, usage })
    }
}
