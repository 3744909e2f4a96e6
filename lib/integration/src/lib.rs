//! Third-party integration layer for the patchbay engine.
//!
//! This crate owns everything between a workflow step and a provider's HTTP
//! API:
//!
//! - **Credential store**: per-(user, app) OAuth token persistence (C1)
//! - **Adapters**: thin typed wrappers over Gmail, Slack, GitHub and generic
//!   webhooks (C2)
//! - **Dispatcher**: token resolution with transparent refresh, a TTL
//!   read-through cache for reference data, and routing to adapters (C3)
//!
//! Adapters are stateless and take the access token as an argument; all
//! business logic (caching, refresh, error classification) lives in the
//! dispatcher.

pub mod adapter;
pub mod cache;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod oauth;

pub use cache::ResponseCache;
pub use credential::{Credential, CredentialError, CredentialStore, InMemoryCredentialStore, TokenSet};
pub use dispatcher::Dispatcher;
pub use error::ApiError;
pub use notify::{InMemoryNotifier, Notifier, TracingNotifier};
pub use oauth::{ProviderConfig, ProviderRegistry};
