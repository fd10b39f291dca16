//! Metered chat: resolve the quota source, call upstream, debit actual usage.

use super::resolver::CredentialResolver;
use crate::error::{Error, Result};
use crate::ledger::{self, LedgerStore, SourceKind};
use crate::providers::{validate_model_id, ProviderRegistry, Usage};
use serde::Serialize;
use std::sync::Arc;

/// One chat request against a caller's quota source.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub account_id: String,
    pub kind: SourceKind,
    pub source_id: String,
    pub model_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutcome {
    pub response: String,
    pub usage: Usage,
    /// Quota left on the source after the debit (0 when the bundle was pruned).
    pub remaining_tokens: i64,
}

pub struct UsageMeteringPipeline {
    resolver: CredentialResolver,
    ledger: Arc<LedgerStore>,
    providers: ProviderRegistry,
}

impl UsageMeteringPipeline {
    pub fn new(
        resolver: CredentialResolver,
        ledger: Arc<LedgerStore>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            resolver,
            ledger,
            providers,
        }
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    /// Resolve, send, then debit the reported (or estimated) usage.
    ///
    /// The cost is only known after the upstream call, so the debit is a
    /// conditional decrement: when a concurrent request consumed the quota
    /// first, this one fails with [`Error::InsufficientTokens`], the counter
    /// is left untouched and the completion text is withheld. The upstream
    /// cost of such a request is absorbed by the service.
    pub async fn handle_chat(&self, request: ChatRequest) -> Result<ChatOutcome> {
        if request.message.trim().is_empty() {
            return Err(Error::validation("message is required"));
        }
        if request.model_id.trim().is_empty() {
            return Err(Error::validation("modelId is required"));
        }
        validate_model_id(&request.model_id)?;

        let resolver = self.resolver.clone();
        let (account_id, kind, source_id) = (
            request.account_id.clone(),
            request.kind,
            request.source_id.clone(),
        );
        let resolved = ledger::blocking(&self.ledger, move |_| {
            resolver.resolve(&account_id, kind, &source_id)
        })
        .await?;

        let provider = self.providers.get(resolved.provider)?;
        let completion = match provider
            .send(&resolved.credential, &request.model_id, &request.message)
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                tracing::warn!(
                    account_id = %request.account_id,
                    provider = %resolved.provider,
                    model = %request.model_id,
                    "Upstream call failed, nothing debited: {e}"
                );
                return Err(e);
            }
        };

        let tokens_used = completion.usage.total_tokens;
        let source = resolved.source.clone();
        let debit = ledger::blocking(&self.ledger, move |store| store.debit(&source, tokens_used));
        let outcome = match debit.await {
            Ok(outcome) => outcome,
            Err(e @ Error::InsufficientTokens { .. }) => {
                tracing::warn!(
                    account_id = %request.account_id,
                    provider = %resolved.provider,
                    model = %request.model_id,
                    absorbed_tokens = tokens_used,
                    "Usage exceeded remaining quota; upstream cost absorbed"
                );
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            account_id = %request.account_id,
            provider = %resolved.provider,
            model = %request.model_id,
            source = ?request.kind,
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            tokens_used,
            remaining = outcome.remaining,
            pruned = outcome.pruned,
            "Chat metered"
        );

        Ok(ChatOutcome {
            response: completion.text,
            usage: completion.usage,
            remaining_tokens: outcome.remaining,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::billing::resolver::tests::{fixture, Fixture};
    use crate::providers::{ChatProvider, Completion, ProviderKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Canned provider that records the credentials it was called with.
    pub(crate) struct MockProvider {
        pub kind: ProviderKind,
        pub reply: std::result::Result<Completion, u16>,
        pub calls: Mutex<Vec<(String, String, String)>>,
    }

    impl MockProvider {
        pub(crate) fn replying(kind: ProviderKind, text: &str, total_tokens: i64) -> Arc<Self> {
            Arc::new(Self {
                kind,
                reply: Ok(Completion {
                    text: text.to_string(),
                    usage: Usage {
                        prompt_tokens: total_tokens / 2,
                        completion_tokens: total_tokens - total_tokens / 2,
                        total_tokens,
                    },
                }),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn failing(kind: ProviderKind, status: u16) -> Arc<Self> {
            Arc::new(Self {
                kind,
                reply: Err(status),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn send(&self, credential: &str, model: &str, message: &str) -> Result<Completion> {
            self.calls
                .lock()
                .push((credential.into(), model.into(), message.into()));
            match &self.reply {
                Ok(completion) => Ok(completion.clone()),
                Err(status) => Err(Error::provider(*status, "mock upstream failure")),
            }
        }
    }

    fn pipeline(fx: &Fixture, provider: Arc<MockProvider>) -> UsageMeteringPipeline {
        UsageMeteringPipeline::new(
            CredentialResolver::new(Arc::clone(&fx.ledger), fx.cipher.clone()),
            Arc::clone(&fx.ledger),
            ProviderRegistry::new().with(provider),
        )
    }

    fn bundle_request(fx: &Fixture) -> ChatRequest {
        ChatRequest {
            account_id: fx.buyer.id.clone(),
            kind: SourceKind::Purchased,
            source_id: fx.bundle.id.clone(),
            model_id: "gpt-4o".into(),
            message: "hello".into(),
        }
    }

    #[tokio::test]
    async fn chat_debits_reported_usage() {
        let fx = fixture();
        let provider = MockProvider::replying(ProviderKind::OpenAi, "hi", 12);
        let outcome = pipeline(&fx, provider.clone())
            .handle_chat(bundle_request(&fx))
            .await
            .unwrap();

        assert_eq!(outcome.response, "hi");
        assert_eq!(outcome.usage.total_tokens, 12);
        assert_eq!(outcome.remaining_tokens, 8);
        let bundle = fx.ledger.bundle(&fx.buyer.id, &fx.bundle.id).unwrap().unwrap();
        assert_eq!(bundle.tokens_remaining, 8);

        let calls = provider.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "sk-seller");
        assert_eq!(calls[0].1, "gpt-4o");
        assert_eq!(calls[0].2, "hello");
    }

    #[tokio::test]
    async fn owned_key_chat_decrements_available() {
        let fx = fixture();
        let provider = MockProvider::replying(ProviderKind::OpenAi, "ok", 40);
        let outcome = pipeline(&fx, provider)
            .handle_chat(ChatRequest {
                account_id: fx.seller.id.clone(),
                kind: SourceKind::Owned,
                source_id: fx.seller_key.id.clone(),
                model_id: "gpt-4o".into(),
                message: "hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.remaining_tokens, 960);
        let key = fx
            .ledger
            .owned_key(&fx.seller.id, &fx.seller_key.id)
            .unwrap()
            .unwrap();
        assert_eq!(key.available, 960);
    }

    #[tokio::test]
    async fn exact_drain_prunes_bundle() {
        let fx = fixture();
        let provider = MockProvider::replying(ProviderKind::OpenAi, "done", 20);
        let outcome = pipeline(&fx, provider)
            .handle_chat(bundle_request(&fx))
            .await
            .unwrap();
        assert_eq!(outcome.remaining_tokens, 0);
        assert!(fx.ledger.bundle(&fx.buyer.id, &fx.bundle.id).unwrap().is_none());

        // The next request finds nothing to spend.
        let provider = MockProvider::replying(ProviderKind::OpenAi, "x", 1);
        assert!(matches!(
            pipeline(&fx, provider.clone()).handle_chat(bundle_request(&fx)).await,
            Err(Error::NotFound(_))
        ));
        assert!(provider.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn overdraft_withholds_text_and_keeps_counter() {
        let fx = fixture();
        let provider = MockProvider::replying(ProviderKind::OpenAi, "secret answer", 25);
        let err = pipeline(&fx, provider.clone())
            .handle_chat(bundle_request(&fx))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InsufficientTokens {
                required: 25,
                available: 20
            }
        ));
        assert_eq!(provider.calls.lock().len(), 1);
        let bundle = fx.ledger.bundle(&fx.buyer.id, &fx.bundle.id).unwrap().unwrap();
        assert_eq!(bundle.tokens_remaining, 20);
    }

    #[tokio::test]
    async fn provider_failure_debits_nothing() {
        let fx = fixture();
        let provider = MockProvider::failing(ProviderKind::OpenAi, 401);
        let err = pipeline(&fx, provider)
            .handle_chat(bundle_request(&fx))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { status: 401, .. }));
        let bundle = fx.ledger.bundle(&fx.buyer.id, &fx.bundle.id).unwrap().unwrap();
        assert_eq!(bundle.tokens_remaining, 20);
    }

    #[tokio::test]
    async fn concurrent_chats_cannot_overdraw() {
        let fx = fixture();
        // Both pass resolution with 20 remaining; only one 15-token debit fits.
        let provider = MockProvider::replying(ProviderKind::OpenAi, "a", 15);
        let pipeline = Arc::new(pipeline(&fx, provider));
        let (a, b) = tokio::join!(
            pipeline.handle_chat(bundle_request(&fx)),
            pipeline.handle_chat(bundle_request(&fx))
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::InsufficientTokens { .. }))));
        let bundle = fx.ledger.bundle(&fx.buyer.id, &fx.bundle.id).unwrap().unwrap();
        assert_eq!(bundle.tokens_remaining, 5);
    }

    #[tokio::test]
    async fn foreign_bundle_is_not_found() {
        let fx = fixture();
        let stranger = fx
            .ledger
            .create_account("stranger", rust_decimal::Decimal::ZERO)
            .unwrap();
        let provider = MockProvider::replying(ProviderKind::OpenAi, "x", 1);
        let err = pipeline(&fx, provider.clone())
            .handle_chat(ChatRequest {
                account_id: stranger.id.clone(),
                ..bundle_request(&fx)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(provider.calls.lock().is_empty());
        let bundle = fx.ledger.bundle(&fx.buyer.id, &fx.bundle.id).unwrap().unwrap();
        assert_eq!(bundle.tokens_remaining, 20);
    }

    #[tokio::test]
    async fn deleted_seller_key_is_not_found() {
        let fx = fixture();
        fx.ledger
            .remove_owned_key(&fx.seller.id, &fx.seller_key.id)
            .unwrap();
        let provider = MockProvider::replying(ProviderKind::OpenAi, "x", 1);
        let err = pipeline(&fx, provider.clone())
            .handle_chat(bundle_request(&fx))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(what) if what == "original key"));
        assert!(provider.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn blank_input_is_rejected_before_resolution() {
        let fx = fixture();
        let provider = MockProvider::replying(ProviderKind::OpenAi, "x", 1);
        let p = pipeline(&fx, provider.clone());
        let mut request = bundle_request(&fx);
        request.message = "   ".into();
        assert!(matches!(p.handle_chat(request).await, Err(Error::Validation(_))));
        let mut request = bundle_request(&fx);
        request.model_id = String::new();
        assert!(matches!(p.handle_chat(request).await, Err(Error::Validation(_))));
        assert!(provider.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn model_id_with_url_syntax_is_rejected() {
        let fx = fixture();
        let provider = MockProvider::replying(ProviderKind::OpenAi, "x", 1);
        let p = pipeline(&fx, provider.clone());
        for model_id in ["../files", "gpt-4o?alt=sse", "gpt-4o#x", "gpt-4o:generateContent"] {
            let request = ChatRequest {
                model_id: model_id.into(),
                ..bundle_request(&fx)
            };
            assert!(matches!(p.handle_chat(request).await, Err(Error::Validation(_))));
        }
        assert!(provider.calls.lock().is_empty());
        let bundle = fx.ledger.bundle(&fx.buyer.id, &fx.bundle.id).unwrap().unwrap();
        assert_eq!(bundle.tokens_remaining, 20);
    }
}
