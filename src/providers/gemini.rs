//! Gemini-compatible `generateContent`. Usage is estimated from text length.
//!
//! The key travels in the `x-goog-api-key` header, never in the URL.

use super::{status_error, validate_model_id, ChatProvider, Completion, ProviderKind, Usage};
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:generateContent", self.base_url)
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn send(&self, credential: &str, model: &str, message: &str) -> Result<Completion> {
        validate_model_id(model)?;
        let payload = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": message }]
            }]
        });

        let resp = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", credential)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(self.kind(), resp).await);
        }

        let body: GenerateResponse = resp.json().await?;
        let text: String = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        let usage = Usage::estimate(message, &text);
        Ok(Completion { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_key_in_header_and_estimates_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
            .and(header("x-goog-api-key", "AIza-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "Hello, "}, {"text": "world"}]}}]
            })))
            .mount(&server)
            .await;

        let provider = GeminiProvider::new(reqwest::Client::new(), &server.uri());
        let completion = provider
            .send("AIza-test", "gemini-1.5-flash", "hi!")
            .await
            .unwrap();
        assert_eq!(completion.text, "Hello, world");
        // "hi!" -> 1, "Hello, world" (12 chars) -> 3.
        assert_eq!(completion.usage.total_tokens, 4);
    }

    #[tokio::test]
    async fn empty_candidates_yield_empty_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": []
            })))
            .mount(&server)
            .await;

        let provider = GeminiProvider::new(reqwest::Client::new(), &server.uri());
        let completion = provider.send("k", "gemini-pro", "abcde").await.unwrap();
        assert_eq!(completion.text, "");
        assert_eq!(completion.usage.total_tokens, 2);
    }

    #[tokio::test]
    async fn hostile_model_id_never_reaches_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": []
            })))
            .expect(0)
            .mount(&server)
            .await;

        let provider = GeminiProvider::new(reqwest::Client::new(), &server.uri());
        for model in ["../../v1/files", "gemini-pro:generateContent?alt=sse", "x#y"] {
            assert!(matches!(
                provider.send("k", model, "hi").await,
                Err(Error::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn unreachable_upstream_is_provider_error_without_key() {
        // Nothing listens on port 9 of the loopback interface.
        let provider = GeminiProvider::new(reqwest::Client::new(), "http://127.0.0.1:9");
        let err = provider
            .send("AIza-seller-secret", "gemini-pro", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { status: 502, .. }));
        assert!(!err.to_string().contains("AIza-seller-secret"));
    }
}
