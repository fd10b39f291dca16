pub mod schema;

pub use schema::{Config, GatewayConfig, LedgerConfig, ProvidersConfig, SecurityConfig};
