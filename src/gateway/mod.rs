//! Axum HTTP gateway for the quota marketplace.
//!
//! - Request body size limit and whole-request timeout from `[gateway]`
//! - Bearer API tokens on every route except `/health`
//! - Ledger work runs on the blocking pool; upstream calls stay async

use crate::auth::TokenStore;
use crate::billing::{ChatRequest, CredentialResolver, UsageMeteringPipeline};
use crate::config::{Config, GatewayConfig};
use crate::error::Error;
use crate::ledger::{self, LedgerStore, SourceKind};
use crate::providers::{models_for, ProviderRegistry};
use crate::security::CredentialCipher;
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerStore>,
    pub pipeline: Arc<UsageMeteringPipeline>,
    pub tokens: Arc<TokenStore>,
}

impl AppState {
    pub fn new(
        ledger: Arc<LedgerStore>,
        cipher: CredentialCipher,
        providers: ProviderRegistry,
        tokens: Arc<TokenStore>,
    ) -> Self {
        let resolver = CredentialResolver::new(Arc::clone(&ledger), cipher);
        let pipeline = UsageMeteringPipeline::new(resolver, Arc::clone(&ledger), providers);
        Self {
            ledger,
            pipeline: Arc::new(pipeline),
            tokens,
        }
    }

    /// Open the ledger, key file and token store under the workspace.
    pub fn from_config(config: &Config) -> Result<Self> {
        let ledger = LedgerStore::open(&config.db_path(), &config.ledger)
            .context("Failed to open ledger database")?;
        let cipher = CredentialCipher::load_or_generate(&config.key_path())
            .context("Failed to load credential key")?;
        let providers = ProviderRegistry::from_config(&config.providers)
            .context("Failed to build provider clients")?;
        let tokens = TokenStore::new(&config.workspace_dir.join("auth.db"))
            .context("Failed to open token store")?;
        Ok(Self::new(
            Arc::new(ledger),
            cipher,
            providers,
            Arc::new(tokens),
        ))
    }
}

/// Build the router with CORS, body limit and timeout layers.
pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/available-models", get(handle_available_models))
        .route("/buy-tokens", post(handle_buy_tokens))
        .route("/chat", post(handle_chat))
        .route("/account", get(handle_account))
        .route("/marketplace", get(handle_marketplace))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let state = AppState::from_config(&config)?;
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid gateway address {}:{}",
                config.gateway.host, config.gateway.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual = listener.local_addr()?;

    tracing::info!(
        addr = %actual,
        workspace = %config.workspace_dir.display(),
        "Gateway listening"
    );

    let app = router(state, &config.gateway);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// ERRORS & AUTH
// ══════════════════════════════════════════════════════════════════════════════

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_)
        | Error::InvalidAmount { .. }
        | Error::InsufficientFunds { .. }
        | Error::InsufficientTokens { .. }
        | Error::InsufficientSupply { .. }
        | Error::Exhausted
        | Error::Expired
        | Error::UnknownProvider(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        Error::Provider { .. } => StatusCode::BAD_GATEWAY,
        Error::Persistence(_) | Error::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{message}` for client errors, `{message, detail}` for server errors.
fn error_response(err: &Error) -> ApiResponse {
    let status = status_for(err);
    let body = match err {
        Error::Provider { .. } => serde_json::json!({
            "message": "Upstream provider request failed",
            "detail": err.to_string(),
        }),
        _ if err.is_internal() => {
            tracing::error!("Request failed: {err}");
            serde_json::json!({
                "message": "Internal server error",
                "detail": err.to_string(),
            })
        }
        _ => serde_json::json!({ "message": err.to_string() }),
    };
    (status, Json(body))
}

fn bad_request(message: impl Into<String>) -> ApiResponse {
    error_response(&Error::Validation(message.into()))
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Resolve the caller's account from the bearer token.
///
/// The lookup runs on the blocking pool; a failing token store is a 500,
/// not a 401.
async fn require_account(state: &AppState, headers: &HeaderMap) -> Result<String, ApiResponse> {
    let token = extract_bearer_token(headers)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"message": "Missing Authorization header"})),
            )
        })?
        .to_string();
    let tokens = Arc::clone(&state.tokens);
    match tokio::task::spawn_blocking(move || tokens.validate(&token)).await {
        Ok(Ok(Some(account_id))) => Ok(account_id),
        Ok(Ok(None)) => Err(error_response(&Error::Unauthorized)),
        Ok(Err(e)) => Err(error_response(&Error::Persistence(format!(
            "token lookup: {e}"
        )))),
        Err(e) => Err(error_response(&Error::Persistence(format!(
            "token lookup task failed: {e}"
        )))),
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiResponse> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("{name} is required")))
}

fn parse_key_type(value: Option<String>) -> Result<SourceKind, ApiResponse> {
    let key_type = required(value, "keyType")?;
    SourceKind::from_key_type(&key_type)
        .ok_or_else(|| bad_request("keyType must be 'temp' or 'user'"))
}

fn json_ok<T: serde::Serialize>(value: &T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => error_response(&Error::Persistence(format!("response encoding: {e}"))),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public
async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableModelsQuery {
    pub key_type: Option<String>,
    pub key_id: Option<String>,
}

/// GET /available-models: models of the provider behind a key or bundle.
async fn handle_available_models(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AvailableModelsQuery>,
) -> ApiResponse {
    let account_id = match require_account(&state, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let (kind, key_id) = match (
        parse_key_type(query.key_type),
        required(query.key_id, "keyId"),
    ) {
        (Ok(kind), Ok(key_id)) => (kind, key_id),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let resolver = state.pipeline.resolver().clone();
    let provider = ledger::blocking(&state.ledger, move |_| {
        resolver.provider_for(&account_id, kind, &key_id)
    })
    .await;
    match provider {
        Ok(provider) => json_ok(&models_for(provider)),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyTokensBody {
    pub seller_id: Option<String>,
    pub token_id: Option<String>,
    pub amount: Option<Decimal>,
}

/// POST /buy-tokens: purchase quota from a seller's listing.
async fn handle_buy_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BuyTokensBody>, JsonRejection>,
) -> ApiResponse {
    let buyer_id = match require_account(&state, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(format!("Invalid request: {}", e.body_text())),
    };
    let (seller_id, token_id) = match (
        required(body.seller_id, "sellerId"),
        required(body.token_id, "tokenId"),
    ) {
        (Ok(seller), Ok(token)) => (seller, token),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    let Some(amount) = body.amount else {
        return bad_request("amount is required");
    };

    let receipt = ledger::blocking(&state.ledger, move |store| {
        store.purchase(&buyer_id, &seller_id, &token_id, amount)
    })
    .await;
    match receipt {
        Ok(receipt) => json_ok(&receipt),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: Option<String>,
    pub key_type: Option<String>,
    pub key_id: Option<String>,
    pub model_id: Option<String>,
}

fn chat_request(account_id: String, body: ChatBody) -> Result<ChatRequest, ApiResponse> {
    Ok(ChatRequest {
        kind: parse_key_type(body.key_type)?,
        source_id: required(body.key_id, "keyId")?,
        model_id: required(body.model_id, "modelId")?,
        message: body
            .message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| bad_request("message is required"))?,
        account_id,
    })
}

/// POST /chat: metered chat against an owned key or purchased bundle.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> ApiResponse {
    let account_id = match require_account(&state, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(format!("Invalid request: {}", e.body_text())),
    };
    let request = match chat_request(account_id, body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };

    match state.pipeline.handle_chat(request).await {
        Ok(outcome) => json_ok(&outcome),
        Err(e) => error_response(&e),
    }
}

/// GET /account: the caller's balance, keys and bundles (no credentials).
async fn handle_account(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let account_id = match require_account(&state, &headers).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match ledger::blocking(&state.ledger, move |store| store.account(&account_id)).await {
        Ok(account) => json_ok(&account),
        Err(e) => error_response(&e),
    }
}

/// GET /marketplace: every unexpired listing.
async fn handle_marketplace(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    if let Err(resp) = require_account(&state, &headers).await {
        return resp;
    }
    match ledger::blocking(&state.ledger, LedgerStore::marketplace).await {
        Ok(listings) => json_ok(&listings),
        Err(e) => error_response(&e),
    }
}
