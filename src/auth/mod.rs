//! API token authentication for the gateway.
//!
//! Tokens are opaque random hex strings issued per account from the CLI and
//! looked up server-side by their SHA-256 hash.

pub mod store;

pub use store::{TokenInfo, TokenStore};
