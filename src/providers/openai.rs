//! OpenAI-compatible `/v1/chat/completions`. Usage is taken from the response.

use super::{malformed, status_error, ChatProvider, Completion, ProviderKind, Usage};
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;

pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn send(&self, credential: &str, model: &str, message: &str) -> Result<Completion> {
        let payload = serde_json::json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": message,
            }]
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(self.kind(), resp).await);
        }

        let body: ChatResponse = resp.json().await?;
        let text = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| malformed(self.kind(), "choices"))?
            .message
            .content
            .unwrap_or_default();
        let usage = body.usage.ok_or_else(|| malformed(self.kind(), "usage"))?;

        Ok(Completion {
            text,
            usage: Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        })
    }
}
