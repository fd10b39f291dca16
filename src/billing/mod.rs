//! Metered access to upstream providers.
//!
//! - [`CredentialResolver`]: quota source → decrypted credential + provider
//! - [`UsageMeteringPipeline`]: resolve → send → debit actual usage

pub mod pipeline;
pub mod resolver;

pub use pipeline::{ChatOutcome, ChatRequest, UsageMeteringPipeline};
pub use resolver::{CredentialResolver, ResolvedCredential};
