//! Cognito hosted UI compatibility
//!
//! Cognito clients talk to the hosted UI in ways a plain OIDC provider does
//! not understand: the authorization request omits `scope` and `resource`,
//! sign-in starts at `/login` or `/signup`, and logout passes `logout_uri`.
//! The middleware here turns each of those into a redirect the provider
//! handles natively.

mod middleware;

pub use middleware::{CompatConfig, cognito_compat_middleware};
