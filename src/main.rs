use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use quotamart::auth::TokenStore;
use quotamart::config::Config;
use quotamart::ledger::{LedgerStore, NewListing};
use quotamart::security::CredentialCipher;
use rust_decimal::Decimal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Resell unused LLM API quota and spend it through a metered gateway.
#[derive(Parser)]
#[command(name = "quotamart")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (debug logging).
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway.
    Gateway {
        /// Override `[gateway] host`.
        #[arg(long)]
        host: Option<String>,
        /// Override `[gateway] port`.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Manage accounts and their API tokens.
    #[command(subcommand)]
    Account(AccountCommand),

    /// Manage owned upstream keys.
    #[command(subcommand)]
    Key(KeyCommand),

    /// List owned quota for resale.
    #[command(subcommand)]
    Listing(ListingCommand),

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum AccountCommand {
    /// Create an account and print its first API token.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "0")]
        balance: Decimal,
    },
    /// Add funds to an account.
    Deposit(AmountArgs),
    /// Print an account as JSON.
    Show {
        #[arg(long)]
        account: String,
    },
    /// Issue an additional API token.
    Token {
        #[arg(long)]
        account: String,
        #[arg(long, default_value = "cli")]
        label: String,
    },
    /// List an account's API tokens (labels and last use only).
    Tokens {
        #[arg(long)]
        account: String,
    },
    /// Revoke an API token.
    Revoke {
        #[arg(long)]
        token: String,
    },
}

#[derive(Args)]
struct AmountArgs {
    #[arg(long)]
    account: String,
    #[arg(long)]
    amount: Decimal,
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Register an upstream API key. The name decides the provider
    /// (contains "gpt", "claude" or "gemini").
    Add {
        #[arg(long)]
        account: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        credential: String,
        /// Token quota available on this key.
        #[arg(long)]
        tokens: i64,
    },
    /// Remove an owned key.
    Remove {
        #[arg(long)]
        account: String,
        #[arg(long)]
        key: String,
    },
}

#[derive(Subcommand)]
enum ListingCommand {
    /// Offer part of an owned key's quota at a fixed price per token.
    Create {
        #[arg(long)]
        account: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        tokens: i64,
        #[arg(long)]
        price: Decimal,
        #[arg(long, default_value_t = 30)]
        expires_in_days: i64,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the JSON schema of config.toml.
    Schema,
    /// Print the effective configuration as TOML.
    Show,
}

// ============================================================================
// Logging Setup
// ============================================================================

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("quotamart=debug,info")
        } else {
            EnvFilter::new("quotamart=info,warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Commands::Config(ConfigCommand::Schema) = cli.command {
        println!("{}", serde_json::to_string_pretty(&Config::json_schema())?);
        return Ok(());
    }

    let mut config = Config::load_or_init()?;

    match cli.command {
        Commands::Gateway { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            quotamart::gateway::run_gateway(config).await
        }
        Commands::Account(cmd) => run_account(&config, cmd),
        Commands::Key(cmd) => run_key(&config, cmd),
        Commands::Listing(cmd) => run_listing(&config, cmd),
        Commands::Config(ConfigCommand::Show) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Config(ConfigCommand::Schema) => Ok(()),
    }
}

fn open_ledger(config: &Config) -> Result<LedgerStore> {
    LedgerStore::open(&config.db_path(), &config.ledger).context("Failed to open ledger database")
}

fn open_tokens(config: &Config) -> Result<TokenStore> {
    TokenStore::new(&config.workspace_dir.join("auth.db"))
}

fn run_account(config: &Config, cmd: AccountCommand) -> Result<()> {
    let ledger = open_ledger(config)?;
    match cmd {
        AccountCommand::Create { name, balance } => {
            let account = ledger.create_account(&name, balance)?;
            let token = open_tokens(config)?.issue(&account.id, "cli")?;
            println!("Account: {}", account.id);
            println!("API token (shown once): {token}");
        }
        AccountCommand::Deposit(AmountArgs { account, amount }) => {
            let balance = ledger.deposit(&account, amount)?;
            println!("Balance: {balance}");
        }
        AccountCommand::Show { account } => {
            let account = ledger.account(&account)?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
        AccountCommand::Token { account, label } => {
            if !ledger.account_exists(&account)? {
                anyhow::bail!("Account {account} not found");
            }
            let token = open_tokens(config)?.issue(&account, &label)?;
            println!("API token (shown once): {token}");
        }
        AccountCommand::Tokens { account } => {
            for info in open_tokens(config)?.list(&account)? {
                let last_used = info
                    .last_used_at
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                    .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
                let created = DateTime::<Utc>::from_timestamp(info.created_at, 0)
                    .map_or_else(|| info.created_at.to_string(), |t| t.to_rfc3339());
                println!("{}  created {created}  last used {last_used}", info.label);
            }
        }
        AccountCommand::Revoke { token } => {
            if !open_tokens(config)?.revoke(token.trim())? {
                anyhow::bail!("Token not found");
            }
            println!("Token revoked");
        }
    }
    Ok(())
}

fn run_key(config: &Config, cmd: KeyCommand) -> Result<()> {
    let ledger = open_ledger(config)?;
    match cmd {
        KeyCommand::Add {
            account,
            name,
            credential,
            tokens,
        } => {
            let provider = quotamart::providers::infer_provider(&name)?;
            let cipher = CredentialCipher::load_or_generate(&config.key_path())?;
            let sealed = cipher.encrypt(credential.trim())?;
            let key = ledger.add_owned_key(&account, &name, &sealed, tokens)?;
            println!("Key: {} ({provider}, {} tokens)", key.id, key.available);
        }
        KeyCommand::Remove { account, key } => {
            ledger.remove_owned_key(&account, &key)?;
            println!("Removed key {key}");
        }
    }
    Ok(())
}

fn run_listing(config: &Config, cmd: ListingCommand) -> Result<()> {
    let ledger = open_ledger(config)?;
    match cmd {
        ListingCommand::Create {
            account,
            key,
            tokens,
            price,
            expires_in_days,
        } => {
            let expires_at = listing_expiry(Utc::now(), expires_in_days)?;
            let bundle = ledger.create_listing(
                &account,
                &NewListing {
                    key_id: key,
                    tokens,
                    price_per_token: price,
                    expires_at,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }
    }
    Ok(())
}

fn listing_expiry(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .with_context(|| format!("--expires-in-days {days} is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_expiry_adds_days() {
        let now = Utc::now();
        assert_eq!(listing_expiry(now, 30).unwrap(), now + Duration::days(30));
    }

    #[test]
    fn listing_expiry_out_of_range_is_an_error() {
        let now = Utc::now();
        assert!(listing_expiry(now, i64::MAX).is_err());
        assert!(listing_expiry(now, 1_000_000_000).is_err());
    }

    #[test]
    fn token_subcommands_parse() {
        let cli = Cli::try_parse_from(["quotamart", "account", "revoke", "--token", "qm_x"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Account(AccountCommand::Revoke { token }) if token == "qm_x"
        ));
        let cli = Cli::try_parse_from(["quotamart", "account", "tokens", "--account", "a1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Account(AccountCommand::Tokens { account }) if account == "a1"
        ));
    }
}
