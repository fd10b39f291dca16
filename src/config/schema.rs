use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Top-level config ────────────────────────────────────────────

/// Runtime configuration, persisted as `config.toml` in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Directory holding the ledger database and the credential key file.
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for Config {
    fn default() -> Self {
        let workspace_dir = default_workspace_dir();
        Self {
            config_path: workspace_dir.join("config.toml"),
            workspace_dir,
            gateway: GatewayConfig::default(),
            ledger: LedgerConfig::default(),
            providers: ProvidersConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

// ── Gateway ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whole-request timeout. Must exceed `providers.timeout_secs`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8787
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ── Ledger ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LedgerConfig {
    /// Database file name, relative to the workspace.
    #[serde(default = "default_db_file")]
    pub db_file: String,
    /// How long a writer waits for SQLite's lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_db_file() -> String {
    "ledger.db".into()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_size() -> u32 {
    8
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_size: default_pool_size(),
        }
    }
}

// ── Providers ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProvidersConfig {
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,
    /// Per upstream call. Expiry surfaces as a provider error.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// `max_tokens` sent to upstreams that require one.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".into()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_max_output_tokens() -> u32 {
    1024
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai_base_url: default_openai_base_url(),
            anthropic_base_url: default_anthropic_base_url(),
            gemini_base_url: default_gemini_base_url(),
            timeout_secs: default_provider_timeout_secs(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

// ── Security ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SecurityConfig {
    /// AES-256 key for stored credentials, relative to the workspace.
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

fn default_key_file() -> String {
    "credential.key".into()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────

fn default_workspace_dir() -> PathBuf {
    UserDirs::new()
        .map(|u| u.home_dir().join(".quotamart"))
        .unwrap_or_else(|| PathBuf::from(".quotamart"))
}

impl Config {
    /// Load `config.toml` from the workspace, writing defaults on first run.
    ///
    /// The workspace is `$QUOTAMART_WORKSPACE` when set, else `~/.quotamart`.
    pub fn load_or_init() -> Result<Self> {
        let workspace_dir = std::env::var("QUOTAMART_WORKSPACE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map_or_else(default_workspace_dir, PathBuf::from);
        let mut config = Self::load_from(&workspace_dir)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load (or create) the config stored under `workspace_dir`.
    pub fn load_from(workspace_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(workspace_dir).with_context(|| {
            format!("Failed to create workspace {}", workspace_dir.display())
        })?;
        let config_path = workspace_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            let config = Config::default();
            let contents =
                toml::to_string_pretty(&config).context("Failed to serialize default config")?;
            std::fs::write(&config_path, contents)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            tracing::info!(path = %config_path.display(), "Wrote default config");
            config
        };
        config.workspace_dir = workspace_dir.to_path_buf();
        config.config_path = config_path;
        Ok(config)
    }

    /// Environment variables win over `config.toml`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("QUOTAMART_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("QUOTAMART_PORT") {
            match port.parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid QUOTAMART_PORT"),
            }
        }
        if let Some(url) = get("QUOTAMART_OPENAI_BASE_URL") {
            self.providers.openai_base_url = url;
        }
        if let Some(url) = get("QUOTAMART_ANTHROPIC_BASE_URL") {
            self.providers.anthropic_base_url = url;
        }
        if let Some(url) = get("QUOTAMART_GEMINI_BASE_URL") {
            self.providers.gemini_base_url = url;
        }
        if let Some(secs) = get("QUOTAMART_PROVIDER_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => self.providers.timeout_secs = secs,
                Err(_) => {
                    tracing::warn!(value = %secs, "Ignoring invalid QUOTAMART_PROVIDER_TIMEOUT_SECS");
                }
            }
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.workspace_dir.join(&self.ledger.db_file)
    }

    pub fn key_path(&self) -> PathBuf {
        self.workspace_dir.join(&self.security.key_file)
    }

    /// JSON schema of `config.toml`.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or_default()
    }
}
