//! OAuth/OIDC protocol error type definitions

use std::fmt;

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};

use super::types::OAuthErrorResponse;

/// Protocol errors surfaced to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OidcError {
    /// Missing or malformed parameter
    InvalidRequest(String),

    /// Client authentication failed
    InvalidClient(String),

    /// Code or refresh token is invalid, expired or belongs to someone else
    InvalidGrant(String),

    /// Client may not use the requested grant
    UnauthorizedClient(String),

    UnsupportedGrantType(String),

    UnsupportedResponseType(String),

    InvalidScope(String),

    /// Unknown resource indicator
    InvalidTarget(String),

    /// Bearer token rejected
    InvalidToken(String),

    /// `prompt=none` without an active session
    LoginRequired,

    /// End-user cancelled the interaction
    AccessDenied(String),

    /// Route or record does not exist
    NotFound(String),

    /// Internal state error
    InternalError(String),
}

impl fmt::Display for OidcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OidcError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            OidcError::InvalidClient(msg) => write!(f, "Client authentication failed: {}", msg),
            OidcError::InvalidGrant(msg) => write!(f, "Invalid grant: {}", msg),
            OidcError::UnauthorizedClient(msg) => write!(f, "Unauthorized client: {}", msg),
            OidcError::UnsupportedGrantType(grant) => {
                write!(f, "Unsupported grant_type: {}", grant)
            }
            OidcError::UnsupportedResponseType(rt) => {
                write!(f, "Unsupported response_type: {}", rt)
            }
            OidcError::InvalidScope(msg) => write!(f, "Invalid scope: {}", msg),
            OidcError::InvalidTarget(msg) => write!(f, "Invalid resource: {}", msg),
            OidcError::InvalidToken(msg) => write!(f, "Invalid token: {}", msg),
            OidcError::LoginRequired => write!(f, "End-User authentication is required"),
            OidcError::AccessDenied(msg) => write!(f, "Access denied: {}", msg),
            OidcError::NotFound(msg) => write!(f, "Not found: {}", msg),
            OidcError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for OidcError {}

impl OidcError {
    /// OAuth `error` code
    pub fn error_code(&self) -> &'static str {
        match self {
            OidcError::InvalidRequest(_) => "invalid_request",
            OidcError::InvalidClient(_) => "invalid_client",
            OidcError::InvalidGrant(_) => "invalid_grant",
            OidcError::UnauthorizedClient(_) => "unauthorized_client",
            OidcError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OidcError::UnsupportedResponseType(_) => "unsupported_response_type",
            OidcError::InvalidScope(_) => "invalid_scope",
            OidcError::InvalidTarget(_) => "invalid_target",
            OidcError::InvalidToken(_) => "invalid_token",
            OidcError::LoginRequired => "login_required",
            OidcError::AccessDenied(_) => "access_denied",
            OidcError::NotFound(_) => "invalid_request",
            OidcError::InternalError(_) => "server_error",
        }
    }

    /// Get corresponding HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            OidcError::InvalidClient(_) | OidcError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            OidcError::NotFound(_) => StatusCode::NOT_FOUND,
            OidcError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Convert to OAuth error body
    pub fn to_body(&self) -> OAuthErrorResponse {
        OAuthErrorResponse::new(self.error_code(), self.description())
    }

    /// Human readable `error_description`
    pub fn description(&self) -> String {
        match self {
            OidcError::InvalidRequest(msg)
            | OidcError::InvalidClient(msg)
            | OidcError::InvalidGrant(msg)
            | OidcError::UnauthorizedClient(msg)
            | OidcError::InvalidScope(msg)
            | OidcError::InvalidTarget(msg)
            | OidcError::InvalidToken(msg)
            | OidcError::AccessDenied(msg)
            | OidcError::NotFound(msg)
            | OidcError::InternalError(msg) => msg.clone(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for OidcError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(self.to_body())).into_response();

        match &self {
            OidcError::InvalidToken(_) => {
                let challenge = format!(
                    "Bearer error=\"invalid_token\", error_description=\"{}\"",
                    self.description().replace('"', "'")
                );
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
                }
            }
            OidcError::InvalidClient(_) => {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"cognito-local\""),
                );
            }
            _ => {}
        }

        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}
