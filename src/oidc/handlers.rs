//! OIDC endpoint handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Form, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};

use crate::common::{auth, response::found};

use super::error::OidcError;
use super::provider::{AuthorizationError, Provider, error_redirect};
use super::templates;
use super::types::{
    AuthorizationParams, EndSessionParams, LoginForm, TokenOperationRequest, TokenRequest,
    UserinfoParams,
};

/// Shared state of the OIDC routes
#[derive(Clone)]
pub struct OidcState {
    pub provider: Arc<Provider>,
}

fn error_page(error: OidcError) -> Response {
    let status = match error.status_code() {
        StatusCode::UNAUTHORIZED => StatusCode::BAD_REQUEST,
        status => status,
    };
    (status, Html(templates::render_error_page(&error))).into_response()
}

/// Decode a form body whatever its declared content type
fn form_fields(body: &Bytes) -> HashMap<String, String> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn no_store<T: IntoResponse>(body: T) -> Response {
    (
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
        ],
        body,
    )
        .into_response()
}

// === Authorization ===

/// GET /oauth2/authorize
pub async fn authorize_get(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Query(params): Query<AuthorizationParams>,
) -> Response {
    authorize(&state.provider, &headers, &params)
}

/// POST /oauth2/authorize
pub async fn authorize_post(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Form(params): Form<AuthorizationParams>,
) -> Response {
    authorize(&state.provider, &headers, &params)
}

fn authorize(provider: &Provider, headers: &HeaderMap, params: &AuthorizationParams) -> Response {
    let request = match provider.validate_authorization(params) {
        Ok(request) => request,
        Err(AuthorizationError::Page(error)) => {
            tracing::warn!("Authorization request rejected: {}", error);
            return error_page(error);
        }
        Err(err) => {
            let location = err.location().unwrap_or_default();
            tracing::info!("Authorization error returned to client: {}", location);
            return found(location);
        }
    };

    let prompts: Vec<&str> = params
        .prompt
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .collect();
    let session = provider.current_session(headers);

    if prompts.contains(&"none") {
        return match session {
            Some(mut session) if !prompts.contains(&"login") => {
                found(provider.complete_authorization(&request, &mut session))
            }
            _ => found(error_redirect(
                &request.redirect_uri,
                &OidcError::LoginRequired,
                request.state.as_deref(),
            )),
        };
    }

    match session {
        Some(mut session) if !prompts.contains(&"login") => {
            tracing::debug!(account_id = %session.account_id, "Resuming existing session");
            found(provider.complete_authorization(&request, &mut session))
        }
        _ => {
            let uid = provider.begin_interaction(request);
            found(format!("/interaction/{}", uid))
        }
    }
}

// === Interaction ===

/// GET /interaction/{uid}
pub async fn interaction_page(State(state): State<OidcState>, Path(uid): Path<String>) -> Response {
    match state.provider.find_interaction(&uid) {
        Ok(interaction) => Html(templates::render_login_page(
            &uid,
            &interaction.request.client_id,
            &interaction.request.scopes,
            None,
        ))
        .into_response(),
        Err(error) => error_page(error),
    }
}

/// POST /interaction/{uid}/login
pub async fn interaction_login(
    State(state): State<OidcState>,
    Path(uid): Path<String>,
    Form(form): Form<LoginForm>,
) -> Response {
    let provider = &state.provider;
    let login = form.login.trim();

    if login.is_empty() {
        return match provider.find_interaction(&uid) {
            Ok(interaction) => (
                StatusCode::BAD_REQUEST,
                Html(templates::render_login_page(
                    &uid,
                    &interaction.request.client_id,
                    &interaction.request.scopes,
                    Some("Username is required"),
                )),
            )
                .into_response(),
            Err(error) => error_page(error),
        };
    }

    let interaction = match provider.take_interaction(&uid) {
        Ok(interaction) => interaction,
        Err(error) => return error_page(error),
    };

    let mut session = provider.start_session(login);
    let location = provider.complete_authorization(&interaction.request, &mut session);
    let cookie = provider.session_cookie(&session);

    ([(header::SET_COOKIE, cookie)], found(location)).into_response()
}

/// GET /interaction/{uid}/abort
pub async fn interaction_abort(State(state): State<OidcState>, Path(uid): Path<String>) -> Response {
    match state.provider.take_interaction(&uid) {
        Ok(interaction) => {
            tracing::info!(%uid, "Login interaction aborted");
            found(error_redirect(
                &interaction.request.redirect_uri,
                &OidcError::AccessDenied("End-User aborted interaction".to_string()),
                interaction.request.state.as_deref(),
            ))
        }
        Err(error) => error_page(error),
    }
}

// === Token ===

/// POST /oauth2/token
pub async fn token(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    match state.provider.token(&headers, &request) {
        Ok(response) => no_store(Json(response)),
        Err(error) => {
            tracing::warn!("Token request failed: {}", error);
            error.into_response()
        }
    }
}

/// GET /jwks
pub async fn jwks(State(state): State<OidcState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(state.provider.keys().jwks()),
    )
}

/// GET /.well-known/openid-configuration
pub async fn discovery(State(state): State<OidcState>) -> impl IntoResponse {
    Json(state.provider.discovery())
}

// === Userinfo ===

/// GET /oauth2/userInfo
pub async fn userinfo_get(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Query(params): Query<UserinfoParams>,
) -> Response {
    userinfo(&state.provider, &headers, params.access_token)
}

/// POST /oauth2/userInfo
pub async fn userinfo_post(State(state): State<OidcState>, headers: HeaderMap, body: Bytes) -> Response {
    let access_token = form_fields(&body).remove("access_token");
    userinfo(&state.provider, &headers, access_token)
}

fn userinfo(provider: &Provider, headers: &HeaderMap, access_token: Option<String>) -> Response {
    let Some(token) = auth::extract_bearer_token(headers).or(access_token) else {
        return OidcError::InvalidToken("no access token provided".to_string()).into_response();
    };

    match provider.userinfo(&token) {
        Ok(claims) => no_store(Json(claims)),
        Err(error) => {
            tracing::debug!("Userinfo rejected: {}", error);
            error.into_response()
        }
    }
}

// === Introspection / Revocation ===

/// POST /token/introspection
pub async fn introspection(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Form(request): Form<TokenOperationRequest>,
) -> Response {
    let provider = &state.provider;
    if let Err(error) = provider.authenticate_client(
        &headers,
        request.client_id.as_deref(),
        request.client_secret.as_deref(),
    ) {
        return error.into_response();
    }
    let Some(token) = request.token.as_deref() else {
        return OidcError::InvalidRequest("missing required parameter 'token'".to_string())
            .into_response();
    };

    no_store(Json(provider.introspect(token, request.token_type_hint.as_deref())))
}

/// POST /oauth2/revoke
pub async fn revocation(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Form(request): Form<TokenOperationRequest>,
) -> Response {
    let provider = &state.provider;
    let client = match provider.authenticate_client(
        &headers,
        request.client_id.as_deref(),
        request.client_secret.as_deref(),
    ) {
        Ok(client) => client,
        Err(error) => return error.into_response(),
    };
    let Some(token) = request.token.as_deref() else {
        return OidcError::InvalidRequest("missing required parameter 'token'".to_string())
            .into_response();
    };

    provider.revoke(client, token);
    StatusCode::OK.into_response()
}

// === End Session ===

/// GET /logout
pub async fn end_session_get(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Query(params): Query<EndSessionParams>,
) -> Response {
    end_session(&state.provider, &headers, &params)
}

/// POST /logout
pub async fn end_session_post(State(state): State<OidcState>, headers: HeaderMap, body: Bytes) -> Response {
    let mut fields = form_fields(&body);
    let params = EndSessionParams {
        id_token_hint: fields.remove("id_token_hint"),
        post_logout_redirect_uri: fields.remove("post_logout_redirect_uri"),
        state: fields.remove("state"),
        client_id: fields.remove("client_id"),
    };
    end_session(&state.provider, &headers, &params)
}

fn end_session(provider: &Provider, headers: &HeaderMap, params: &EndSessionParams) -> Response {
    let session = provider.current_session(headers);
    let clear = provider.clear_session_cookie();

    match provider.end_session(session, params) {
        Ok(Some(location)) => ([(header::SET_COOKIE, clear)], found(location)).into_response(),
        Ok(None) => (
            [(header::SET_COOKIE, clear)],
            Html(templates::render_logged_out_page()),
        )
            .into_response(),
        Err(error) => {
            tracing::warn!("End session rejected: {}", error);
            error_page(error)
        }
    }
}

// === Fallbacks ===

/// Routes of provider features that are not enabled
pub async fn feature_disabled() -> Response {
    OidcError::NotFound("feature is not enabled".to_string()).into_response()
}

pub async fn not_found() -> Response {
    OidcError::NotFound("unrecognized route or not allowed method".to_string()).into_response()
}
