//! Small response builders shared by the provider and the middleware

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

/// `302 Found` to `location`
///
/// A location that is not a valid header value yields a 500 rather than a
/// redirect without a `Location`.
pub fn found(location: impl Into<String>) -> Response {
    let location = location.into();
    match HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(e) => {
            tracing::error!(location = ?location, "Refusing to redirect: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
