//! quotamart: resell unused LLM API quota and spend it through a metered
//! chat gateway.
//!
//! The [`ledger`] keeps balances, owned keys and purchased quota bundles;
//! [`billing`] resolves credentials and meters chat usage against the ledger;
//! [`providers`] talks to the upstream model APIs; [`gateway`] exposes it
//! all over HTTP.

pub mod auth;
pub mod billing;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod providers;
pub mod security;

pub use config::Config;
pub use error::{Error, Result};
