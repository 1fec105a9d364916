//! Provider engine
//!
//! Protocol logic behind the HTTP handlers: authorization request
//! validation, interactions, sessions, code and refresh token grants, token
//! minting and verification. HTTP extraction and response shaping stay in
//! `handlers`.

use std::collections::{BTreeSet, HashMap};

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::common::auth;
use crate::model::config::{ClientConfig, Config, RoutesConfig, TokenEndpointAuthMethod};

use super::error::OidcError;
use super::keys::{ALGORITHM, SigningKeys};
use super::policy::Policy;
use super::store::{
    AuthorizationCode, Interaction, MemoryStore, PendingAuthorization, RefreshToken, Session,
};
use super::types::{
    AuthorizationParams, DiscoveryDocument, EndSessionParams, IntrospectionResponse,
    IssuedClaims, TokenRequest, TokenResponse,
};

pub const SESSION_COOKIE: &str = "_session";

/// Why an authorization request could not proceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    /// No trusted redirect URI, report to the user agent
    Page(OidcError),
    /// Report to the client through its redirect URI
    Redirect {
        redirect_uri: String,
        state: Option<String>,
        error: OidcError,
    },
}

impl AuthorizationError {
    /// Redirect target for [`AuthorizationError::Redirect`]
    pub fn location(&self) -> Option<String> {
        match self {
            AuthorizationError::Page(_) => None,
            AuthorizationError::Redirect {
                redirect_uri,
                state,
                error,
            } => Some(error_redirect(redirect_uri, error, state.as_deref())),
        }
    }
}

/// Build `redirect_uri?error=..&error_description=..&state=..`
pub fn error_redirect(redirect_uri: &str, error: &OidcError, state: Option<&str>) -> String {
    let mut pairs = vec![
        ("error", error.error_code().to_string()),
        ("error_description", error.description()),
    ];
    if let Some(state) = state {
        pairs.push(("state", state.to_string()));
    }
    append_query(redirect_uri, &pairs)
}

/// Append query parameters to a URI, keeping what is already there
pub fn append_query(uri: &str, pairs: &[(&str, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    let extra = serializer.finish();
    if extra.is_empty() {
        return uri.to_string();
    }

    let (base, fragment) = match uri.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (uri, None),
    };
    let separator = if !base.contains('?') {
        "?"
    } else if base.ends_with('?') || base.ends_with('&') {
        ""
    } else {
        "&"
    };
    match fragment {
        Some(fragment) => format!("{base}{separator}{extra}#{fragment}"),
        None => format!("{base}{separator}{extra}"),
    }
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url(SHA-256(verifier)), the S256 PKCE transform
pub fn pkce_s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn is_valid_pkce_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// What a token response is minted from
struct TokenContext<'a> {
    client: &'a ClientConfig,
    account_id: &'a str,
    session_id: &'a str,
    scopes: &'a [String],
    nonce: Option<&'a str>,
    auth_time: i64,
}

pub struct Provider {
    issuer: String,
    routes: RoutesConfig,
    policy: Policy,
    keys: SigningKeys,
    store: MemoryStore,
}

impl Provider {
    pub fn new(config: &Config, keys: SigningKeys) -> Self {
        Self {
            issuer: config.effective_issuer(),
            routes: config.routes.clone(),
            policy: Policy::from_config(config),
            keys,
            store: MemoryStore::new(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn routes(&self) -> &RoutesConfig {
        &self.routes
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn keys(&self) -> &SigningKeys {
        &self.keys
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.issuer, path)
    }

    pub fn discovery(&self) -> DiscoveryDocument {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let mut scopes: BTreeSet<String> = self.policy.scope_claims.keys().cloned().collect();
        scopes.insert("openid".to_string());
        scopes.extend(self.policy.client_scopes().into_iter().map(str::to_string));

        let mut claims: BTreeSet<String> = self
            .policy
            .scope_claims
            .values()
            .flatten()
            .cloned()
            .collect();
        claims.extend(strings(&[
            "sub",
            "username",
            "cognito:groups",
            "auth_time",
            "iss",
            "sid",
        ]));

        let mut auth_methods = vec![
            TokenEndpointAuthMethod::ClientSecretBasic,
            TokenEndpointAuthMethod::ClientSecretPost,
        ];
        if self.policy.client.token_endpoint_auth_method == TokenEndpointAuthMethod::None {
            auth_methods.insert(0, TokenEndpointAuthMethod::None);
        }

        DiscoveryDocument {
            issuer: self.issuer.clone(),
            authorization_endpoint: self.url(&self.routes.authorization),
            token_endpoint: self.url(&self.routes.token),
            userinfo_endpoint: self.url(&self.routes.userinfo),
            jwks_uri: self.url(&self.routes.jwks),
            end_session_endpoint: self.url(&self.routes.end_session),
            introspection_endpoint: self.url(&self.routes.introspection),
            revocation_endpoint: self.url(&self.routes.revocation),
            scopes_supported: scopes.into_iter().collect(),
            claims_supported: claims.into_iter().collect(),
            response_types_supported: strings(&["code"]),
            response_modes_supported: strings(&["query"]),
            grant_types_supported: strings(&["authorization_code", "refresh_token"]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: strings(&[ALGORITHM]),
            token_endpoint_auth_methods_supported: auth_methods
                .iter()
                .map(|m| m.as_str().to_string())
                .collect(),
            code_challenge_methods_supported: strings(&["S256"]),
            claims_parameter_supported: false,
            request_parameter_supported: false,
        }
    }

    // === Authorization ===

    /// Validate an authorization request
    ///
    /// Client and redirect URI problems are reported on a page. Everything
    /// after the redirect URI is trusted goes back to the client.
    pub fn validate_authorization(
        &self,
        params: &AuthorizationParams,
    ) -> Result<PendingAuthorization, AuthorizationError> {
        let client_id = params
            .client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AuthorizationError::Page(OidcError::InvalidRequest(
                    "missing required parameter 'client_id'".to_string(),
                ))
            })?;
        let client = self.policy.find_client(client_id).ok_or_else(|| {
            tracing::warn!(client_id, "Authorization request for unknown client");
            AuthorizationError::Page(OidcError::InvalidClient(format!(
                "client '{}' is not registered",
                client_id
            )))
        })?;

        let redirect_uri = match params.redirect_uri.as_deref().filter(|u| !u.is_empty()) {
            Some(uri) => uri.to_string(),
            None if client.redirect_uris.len() == 1 => client.redirect_uris[0].clone(),
            None => {
                return Err(AuthorizationError::Page(OidcError::InvalidRequest(
                    "missing required parameter 'redirect_uri'".to_string(),
                )));
            }
        };
        if !self.policy.accepts_redirect_uri(client, &redirect_uri) {
            tracing::warn!(client_id, %redirect_uri, "Rejected redirect_uri");
            return Err(AuthorizationError::Page(OidcError::InvalidRequest(format!(
                "redirect_uri '{}' is not registered for this client",
                redirect_uri
            ))));
        }

        let fail = |error: OidcError| AuthorizationError::Redirect {
            redirect_uri: redirect_uri.clone(),
            state: params.state.clone(),
            error,
        };

        match params.response_type.as_deref() {
            Some("code") => {}
            Some(other) => return Err(fail(OidcError::UnsupportedResponseType(other.to_string()))),
            None => {
                return Err(fail(OidcError::InvalidRequest(
                    "missing required parameter 'response_type'".to_string(),
                )));
            }
        }

        let allowed = self.policy.client_scopes();
        let mut scopes: Vec<String> = Vec::new();
        for scope in params.scope.as_deref().unwrap_or_default().split_whitespace() {
            if allowed.contains(scope) && !scopes.iter().any(|s| s == scope) {
                scopes.push(scope.to_string());
            }
        }
        if !scopes.iter().any(|s| s == "openid") {
            return Err(fail(OidcError::InvalidRequest(
                "openid scope must be requested".to_string(),
            )));
        }

        let resource = params.resource.clone().filter(|r| !r.is_empty());
        if let Some(resource) = &resource {
            if *resource != self.policy.resource.uri {
                return Err(fail(OidcError::InvalidTarget(format!(
                    "resource '{}' is not recognized",
                    resource
                ))));
            }
        }

        let code_challenge = params.code_challenge.clone().filter(|c| !c.is_empty());
        match (code_challenge.as_deref(), params.code_challenge_method.as_deref()) {
            (None, Some(_)) => {
                return Err(fail(OidcError::InvalidRequest(
                    "code_challenge_method requires code_challenge".to_string(),
                )));
            }
            (Some(_), method) if method.unwrap_or("plain") != "S256" => {
                return Err(fail(OidcError::InvalidRequest(
                    "only S256 code_challenge_method is supported".to_string(),
                )));
            }
            _ => {}
        }

        Ok(PendingAuthorization {
            client_id: client.client_id.clone(),
            redirect_uri,
            scopes,
            state: params.state.clone(),
            nonce: params.nonce.clone(),
            resource,
            code_challenge,
        })
    }

    /// Park a validated request until the end-user logs in, returning its uid
    pub fn begin_interaction(&self, request: PendingAuthorization) -> String {
        let uid = Uuid::new_v4().simple().to_string();
        let interaction = Interaction {
            request,
            expires_at: Utc::now() + Duration::seconds(self.policy.lifetimes.interaction),
        };
        self.store.interactions.save(uid.clone(), interaction);
        tracing::debug!(%uid, "Started login interaction");
        uid
    }

    pub fn find_interaction(&self, uid: &str) -> Result<Interaction, OidcError> {
        self.store
            .interactions
            .find(uid)
            .ok_or_else(|| OidcError::NotFound("interaction session not found or expired".to_string()))
    }

    pub fn take_interaction(&self, uid: &str) -> Result<Interaction, OidcError> {
        self.store
            .interactions
            .take(uid)
            .ok_or_else(|| OidcError::NotFound("interaction session not found or expired".to_string()))
    }

    pub fn start_session(&self, account_id: &str) -> Session {
        let now = Utc::now();
        let session = Session {
            id: random_token(32),
            account_id: account_id.to_string(),
            login_ts: now.timestamp(),
            grants: HashMap::new(),
            expires_at: now + Duration::seconds(self.policy.lifetimes.session),
        };
        self.store.sessions.save(session.id.clone(), session.clone());
        tracing::info!(account_id, "Session started");
        session
    }

    /// Live session named by the request's session cookie
    pub fn current_session(&self, headers: &HeaderMap) -> Option<Session> {
        let id = auth::extract_cookie(headers, SESSION_COOKIE)?;
        self.store.sessions.find(&id)
    }

    pub fn session_cookie(&self, session: &Session) -> String {
        format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE, session.id, self.policy.lifetimes.session
        )
    }

    pub fn clear_session_cookie(&self) -> String {
        format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
    }

    /// Approve the request for the session's account and return the client redirect
    pub fn complete_authorization(
        &self,
        request: &PendingAuthorization,
        session: &mut Session,
    ) -> String {
        let grant = self.policy.load_existing_grant(&self.store, session);

        let scopes: Vec<String> = request
            .scopes
            .iter()
            .filter(|scope| grant.covers(scope))
            .cloned()
            .collect();

        let code = AuthorizationCode {
            code: random_token(32),
            client_id: request.client_id.clone(),
            account_id: session.account_id.clone(),
            grant_id: grant.id.clone(),
            session_id: session.id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scopes,
            resource: request.resource.clone(),
            nonce: request.nonce.clone(),
            code_challenge: request.code_challenge.clone(),
            auth_time: session.login_ts,
            expires_at: Utc::now() + Duration::seconds(self.policy.lifetimes.authorization_code),
        };
        self.store.codes.save(code.code.clone(), code.clone());

        tracing::info!(
            client_id = %request.client_id,
            account_id = %session.account_id,
            "Issued authorization code"
        );

        let mut pairs = vec![("code", code.code)];
        if let Some(state) = &request.state {
            pairs.push(("state", state.clone()));
        }
        append_query(&request.redirect_uri, &pairs)
    }

    // === Token endpoint ===

    /// Authenticate the client of a token, introspection or revocation request
    pub fn authenticate_client(
        &self,
        headers: &HeaderMap,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Result<&ClientConfig, OidcError> {
        let basic = auth::extract_basic_credentials(headers);
        let (id, secret) = match &basic {
            Some((id, secret)) => {
                if client_id.is_some_and(|form_id| form_id != id) {
                    return Err(OidcError::InvalidRequest(
                        "client_id in body does not match Authorization header".to_string(),
                    ));
                }
                (id.as_str(), Some(secret.as_str()))
            }
            None => match client_id {
                Some(id) => (id, client_secret),
                None => {
                    return Err(OidcError::InvalidClient(
                        "no client authentication mechanism provided".to_string(),
                    ));
                }
            },
        };

        let client = self.policy.find_client(id).ok_or_else(|| {
            tracing::warn!(client_id = id, "Unknown client");
            OidcError::InvalidClient("client not found".to_string())
        })?;

        match client.token_endpoint_auth_method {
            TokenEndpointAuthMethod::None => Ok(client),
            TokenEndpointAuthMethod::ClientSecretBasic | TokenEndpointAuthMethod::ClientSecretPost => {
                match secret {
                    Some(secret) if auth::constant_time_eq(secret, &client.client_secret) => Ok(client),
                    _ => {
                        tracing::warn!(client_id = id, "Invalid client secret");
                        Err(OidcError::InvalidClient("invalid secret provided".to_string()))
                    }
                }
            }
        }
    }

    pub fn token(&self, headers: &HeaderMap, request: &TokenRequest) -> Result<TokenResponse, OidcError> {
        let client = self.authenticate_client(
            headers,
            request.client_id.as_deref(),
            request.client_secret.as_deref(),
        )?;

        let grant_type = request.grant_type.as_deref().ok_or_else(|| {
            OidcError::InvalidRequest("missing required parameter 'grant_type'".to_string())
        })?;
        match grant_type {
            "authorization_code" | "refresh_token" => {
                if !self.policy.allows_grant_type(client, grant_type) {
                    return Err(OidcError::UnauthorizedClient(format!(
                        "requested grant type '{}' is not allowed for this client",
                        grant_type
                    )));
                }
            }
            other => return Err(OidcError::UnsupportedGrantType(other.to_string())),
        }

        if grant_type == "authorization_code" {
            self.exchange_code(client, request)
        } else {
            self.refresh(client, request)
        }
    }

    /// A `resource` sent to the token endpoint must name the resource the grant was issued for
    ///
    /// Codes and refresh tokens obtained without a resource indicator are
    /// bound to the configured resource server.
    fn check_token_resource(&self, requested: Option<&str>, bound: Option<&str>) -> Result<(), OidcError> {
        let Some(requested) = requested.filter(|r| !r.is_empty()) else {
            return Ok(());
        };
        let bound = bound.unwrap_or(&self.policy.resource.uri);
        if requested != bound {
            tracing::warn!(requested, bound, "Token request names another resource");
            return Err(OidcError::InvalidTarget(format!(
                "resource '{}' does not match the grant",
                requested
            )));
        }
        Ok(())
    }

        fn exchange_code(&self, client: &ClientConfig, request: &TokenRequest) -> Result<TokenResponse, OidcError> {
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| OidcError::InvalidRequest("missing required parameter 'code'".to_string()))?;
        let code = self
            .store
            .codes
            .take(code)
            .ok_or_else(|| OidcError::InvalidGrant("authorization code not found or expired".to_string()))?;

        if code.client_id != client.client_id {
            tracing::warn!(expected = %code.client_id, got = %client.client_id, "Code used by another client");
            return Err(OidcError::InvalidGrant("client mismatch".to_string()));
        }
        if let Some(redirect_uri) = request.redirect_uri.as_deref() {
            if redirect_uri != code.redirect_uri {
                return Err(OidcError::InvalidGrant("redirect_uri mismatch".to_string()));
            }
        }
        self.check_token_resource(request.resource.as_deref(), code.resource.as_deref())?;
        match (&code.code_challenge, request.code_verifier.as_deref()) {
            (Some(challenge), Some(verifier)) => {
                if !is_valid_pkce_verifier(verifier) || pkce_s256(verifier) != *challenge {
                    tracing::warn!(account_id = %code.account_id, "PKCE verification failed");
                    return Err(OidcError::InvalidGrant("PKCE verification failed".to_string()));
                }
            }
            (Some(_), None) => {
                return Err(OidcError::InvalidGrant("code_verifier is required".to_string()));
            }
            (None, Some(_)) => {
                return Err(OidcError::InvalidGrant(
                    "code_verifier sent for a code without code_challenge".to_string(),
                ));
            }
            (None, None) => {}
        }
        if self.store.grants.find(&code.grant_id).is_none() {
            return Err(OidcError::InvalidGrant("grant not found".to_string()));
        }

        let context = TokenContext {
            client,
            account_id: &code.account_id,
            session_id: &code.session_id,
            scopes: &code.scopes,
            nonce: code.nonce.as_deref(),
            auth_time: code.auth_time,
        };
        let mut response = self.mint(&context)?;

        if self.policy.issue_refresh_token(client) {
            let now = Utc::now();
            let refresh_token = RefreshToken {
                token: random_token(48),
                client_id: client.client_id.clone(),
                account_id: code.account_id.clone(),
                grant_id: code.grant_id.clone(),
                session_id: code.session_id.clone(),
                scopes: code.scopes.clone(),
                resource: code.resource.clone(),
                auth_time: code.auth_time,
                issued_at: now,
                expires_at: now + Duration::seconds(self.policy.lifetimes.refresh_token),
            };
            response.refresh_token = Some(refresh_token.token.clone());
            self.store
                .refresh_tokens
                .save(refresh_token.token.clone(), refresh_token);
        }

        tracing::info!(client_id = %client.client_id, account_id = %code.account_id, "Exchanged authorization code");
        Ok(response)
    }

    fn refresh(&self, client: &ClientConfig, request: &TokenRequest) -> Result<TokenResponse, OidcError> {
        let token = request.refresh_token.as_deref().ok_or_else(|| {
            OidcError::InvalidRequest("missing required parameter 'refresh_token'".to_string())
        })?;
        let mut stored = self
            .store
            .refresh_tokens
            .find(token)
            .ok_or_else(|| OidcError::InvalidGrant("refresh token not found or expired".to_string()))?;

        if stored.client_id != client.client_id {
            return Err(OidcError::InvalidGrant("client mismatch".to_string()));
        }
        self.check_token_resource(request.resource.as_deref(), stored.resource.as_deref())?;
        if self.store.grants.find(&stored.grant_id).is_none() {
            self.store.refresh_tokens.remove(token);
            return Err(OidcError::InvalidGrant("grant not found".to_string()));
        }

        let scopes: Vec<String> = match request.scope.as_deref() {
            Some(requested) => {
                let mut narrowed = Vec::new();
                for scope in requested.split_whitespace() {
                    if !stored.scopes.iter().any(|s| s == scope) {
                        return Err(OidcError::InvalidScope(format!(
                            "refresh token missing requested scope '{}'",
                            scope
                        )));
                    }
                    narrowed.push(scope.to_string());
                }
                narrowed
            }
            None => stored.scopes.clone(),
        };

        let context = TokenContext {
            client,
            account_id: &stored.account_id,
            session_id: &stored.session_id,
            scopes: &scopes,
            nonce: None,
            auth_time: stored.auth_time,
        };
        let mut response = self.mint(&context)?;

        if self.policy.rotate_refresh_token() {
            self.store.refresh_tokens.remove(token);
            stored.token = random_token(48);
            stored.issued_at = Utc::now();
            self.store.refresh_tokens.save(stored.token.clone(), stored.clone());
        }
        response.refresh_token = Some(stored.token);

        tracing::info!(client_id = %client.client_id, account_id = %stored.account_id, "Refreshed tokens");
        Ok(response)
    }

    /// Sign the access token and, for `openid`, the ID token
    fn mint(&self, context: &TokenContext<'_>) -> Result<TokenResponse, OidcError> {
        let account = self.policy.find_account(context.account_id);
        let now = Utc::now().timestamp();
        let resource_scopes = self.policy.resource_scopes();

        let access_scope = context
            .scopes
            .iter()
            .filter(|s| resource_scopes.contains(s.as_str()))
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");

        let mut access_claims = Map::new();
        access_claims.insert("iss".to_string(), json!(self.issuer));
        access_claims.insert("aud".to_string(), json!(self.policy.resource.audience));
        access_claims.insert("iat".to_string(), json!(now));
        access_claims.insert(
            "exp".to_string(),
            json!(now + self.policy.resource.access_token_ttl),
        );
        access_claims.insert("jti".to_string(), json!(Uuid::new_v4().to_string()));
        access_claims.insert("client_id".to_string(), json!(context.client.client_id));
        access_claims.insert("scope".to_string(), json!(access_scope));
        access_claims.insert("auth_time".to_string(), json!(context.auth_time));
        access_claims.insert("token_use".to_string(), json!("access"));
        access_claims.extend(account.extra_token_claims());

        let access_token = self
            .keys
            .sign(&access_claims)
            .map_err(|e| OidcError::InternalError(format!("failed to sign access token: {}", e)))?;

        let id_token = if context.scopes.iter().any(|s| s == "openid") {
            let mut id_claims =
                account.claims_for_scopes(context.scopes.iter().map(String::as_str), &self.policy.scope_claims);
            id_claims.insert("iss".to_string(), json!(self.issuer));
            id_claims.insert("aud".to_string(), json!(context.client.client_id));
            id_claims.insert("iat".to_string(), json!(now));
            id_claims.insert("exp".to_string(), json!(now + self.policy.lifetimes.id_token));
            id_claims.insert("auth_time".to_string(), json!(context.auth_time));
            id_claims.insert("sid".to_string(), json!(context.session_id));
            id_claims.insert("token_use".to_string(), json!("id"));
            if let Some(nonce) = context.nonce {
                id_claims.insert("nonce".to_string(), json!(nonce));
            }
            id_claims.extend(account.extra_token_claims());

            Some(
                self.keys
                    .sign(&id_claims)
                    .map_err(|e| OidcError::InternalError(format!("failed to sign ID token: {}", e)))?,
            )
        } else {
            None
        };

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.policy.resource.access_token_ttl,
            id_token,
            refresh_token: None,
            scope: context.scopes.join(" "),
        })
    }

    // === Token verification ===

    /// Verify a token this provider signed, `token_use` must match
    pub fn verify_token(&self, token: &str, token_use: &str, check_exp: bool) -> Result<IssuedClaims, OidcError> {
        let validation = SigningKeys::validation(&self.issuer, check_exp);
        let claims: IssuedClaims = self
            .keys
            .verify(token, &validation)
            .map_err(|e| OidcError::InvalidToken(e.to_string()))?;

        if claims.token_use.as_deref() != Some(token_use) {
            return Err(OidcError::InvalidToken(format!("not an {} token", token_use)));
        }
        Ok(claims)
    }

    /// Claims for the account behind a bearer access token
    pub fn userinfo(&self, token: &str) -> Result<Map<String, Value>, OidcError> {
        let claims = self.verify_token(token, "access", true)?;
        let scopes = claims.scope.as_deref().unwrap_or_default();
        let account = self.policy.find_account(&claims.sub);
        tracing::debug!(sub = %claims.sub, "Served userinfo");
        Ok(account.claims_for_scopes(
            scopes.split_whitespace().chain(std::iter::once("openid")),
            &self.policy.scope_claims,
        ))
    }

    pub fn introspect(&self, token: &str, hint: Option<&str>) -> IntrospectionResponse {
        let refresh_first = hint == Some("refresh_token");
        if refresh_first {
            if let Some(response) = self.introspect_refresh_token(token) {
                return response;
            }
        }
        if let Ok(claims) = self.verify_token(token, "access", true) {
            return IntrospectionResponse {
                active: true,
                sub: Some(claims.sub),
                client_id: claims.client_id,
                scope: claims.scope,
                exp: Some(claims.exp),
                iat: Some(claims.iat),
                iss: Some(claims.iss),
                aud: Some(claims.aud),
                token_type: Some("access_token".to_string()),
                username: claims.username,
                jti: claims.jti,
            };
        }
        if !refresh_first {
            if let Some(response) = self.introspect_refresh_token(token) {
                return response;
            }
        }
        IntrospectionResponse::inactive()
    }

    fn introspect_refresh_token(&self, token: &str) -> Option<IntrospectionResponse> {
        let stored = self.store.refresh_tokens.find(token)?;
        self.store.grants.find(&stored.grant_id)?;
        Some(IntrospectionResponse {
            active: true,
            sub: Some(stored.account_id.clone()),
            client_id: Some(stored.client_id.clone()),
            scope: Some(stored.scopes.join(" ")),
            exp: Some(stored.expires_at.timestamp()),
            iat: Some(stored.issued_at.timestamp()),
            iss: Some(self.issuer.clone()),
            aud: Some(json!(stored.client_id)),
            token_type: Some("refresh_token".to_string()),
            username: Some(stored.account_id),
            jti: None,
        })
    }

    /// Revoke a refresh token owned by `client`; unknown tokens are ignored
    pub fn revoke(&self, client: &ClientConfig, token: &str) {
        let removed = self
            .store
            .refresh_tokens
            .remove_where(|t| t.token == token && t.client_id == client.client_id);
        if removed > 0 {
            tracing::info!(client_id = %client.client_id, "Revoked refresh token");
        }
    }

    // === End session ===

    /// End the current session and work out where to send the user agent
    pub fn end_session(
        &self,
        session: Option<Session>,
        params: &EndSessionParams,
    ) -> Result<Option<String>, OidcError> {
        let hinted_client = match params.id_token_hint.as_deref().filter(|h| !h.is_empty()) {
            Some(hint) => {
                let claims = self
                    .verify_token(hint, "id", false)
                    .map_err(|e| OidcError::InvalidRequest(format!("could not validate id_token_hint: {}", e)))?;
                claims.aud.as_str().map(str::to_string)
            }
            None => None,
        };

        let client_id = match (params.client_id.as_deref(), hinted_client.as_deref()) {
            (Some(id), Some(hinted)) if id != hinted => {
                return Err(OidcError::InvalidRequest(
                    "client_id does not match the id_token_hint audience".to_string(),
                ));
            }
            (Some(id), _) => Some(id),
            (None, hinted) => hinted,
        };
        let client = match client_id {
            Some(id) => Some(
                self.policy
                    .find_client(id)
                    .ok_or_else(|| OidcError::InvalidClient("client not found".to_string()))?,
            ),
            None => None,
        };

        let location = match params.post_logout_redirect_uri.as_deref().filter(|u| !u.is_empty()) {
            Some(uri) => {
                if !self.policy.accepts_post_logout_redirect_uri(client, uri) {
                    tracing::warn!(uri, "Rejected post_logout_redirect_uri");
                    return Err(OidcError::InvalidRequest(
                        "post_logout_redirect_uri not registered".to_string(),
                    ));
                }
                let state = params.state.iter().map(|s| ("state", s.clone())).collect::<Vec<_>>();
                Some(append_query(uri, &state))
            }
            None => None,
        };

        if let Some(session) = session {
            self.store.sessions.remove(&session.id);
            let grant_ids: Vec<&String> = session.grants.values().collect();
            for grant_id in &grant_ids {
                self.store.grants.remove(grant_id);
            }
            let revoked = self
                .store
                .refresh_tokens
                .remove_where(|t| t.session_id == session.id);
            tracing::info!(
                account_id = %session.account_id,
                grants = grant_ids.len(),
                refresh_tokens = revoked,
                "Session ended"
            );
        }

        Ok(location)
    }
}
