//! OpenID Connect provider
//!
//! A single-client, single-resource-server OIDC provider that stands in for
//! the Cognito hosted UI during local development. Any login name is
//! accepted, consent is granted automatically and all state is kept in
//! memory.
//!
//! # Usage example
//! ```rust,ignore
//! let provider = Arc::new(oidc::Provider::new(&config, oidc::SigningKeys::generate()?));
//! let app = oidc::create_oidc_router(provider.clone()).layer(oidc::cors_layer(provider));
//! axum::serve(listener, app).await?;
//! ```

mod account;
mod error;
mod handlers;
mod keys;
mod policy;
mod provider;
mod router;
mod store;
mod templates;
mod types;

pub use keys::SigningKeys;
pub use provider::Provider;
pub use router::{DISCOVERY_PATH, cors_layer, create_oidc_router};
