//! Request rewriting middleware

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, header},
    middleware::Next,
    response::Response,
};

use crate::common::response::found;
use crate::model::config::Config;

/// Informal sign-in entry points redirected to the authorization endpoint
const ALIASES: [&str; 3] = ["/login", "/signup", "/authorize"];

/// What the middleware needs to know about the provider
#[derive(Debug, Clone)]
pub struct CompatConfig {
    pub authorization_path: String,
    pub end_session_path: String,
    pub default_scope: String,
    pub default_resource: String,
}

impl CompatConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            authorization_path: config.routes.authorization.clone(),
            end_session_path: config.routes.end_session.clone(),
            default_scope: config.client.scope.clone(),
            default_resource: config.resource.uri.clone(),
        }
    }
}

/// Outcome of inspecting one request
///
/// Redirecting variants carry the target as `path?query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    PassThrough,
    InjectDefaults(String),
    Alias(String),
    RewriteLogout(String),
}

impl Disposition {
    /// Redirect target, absolute when the request named its host
    pub fn location(&self, host: Option<&str>) -> Option<String> {
        let target = match self {
            Disposition::PassThrough => return None,
            Disposition::InjectDefaults(target)
            | Disposition::Alias(target)
            | Disposition::RewriteLogout(target) => target,
        };
        Some(match host {
            Some(host) => format!("http://{}{}", host, target),
            None => target.clone(),
        })
    }
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn with_query(path: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return path.to_string();
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{}?{}", path, query)
}

/// Decide what to do with a request
///
/// Empty `scope` / `resource` values count as absent, so a redirect with
/// defaults injected is never itself redirected again.
pub fn classify(method: &Method, path: &str, query: Option<&str>, config: &CompatConfig) -> Disposition {
    if method != Method::GET {
        return Disposition::PassThrough;
    }

    if path == config.authorization_path {
        let pairs = parse_query(query);
        let present = |name: &str| pairs.iter().any(|(k, v)| k == name && !v.is_empty());
        if present("scope") && present("resource") {
            return Disposition::PassThrough;
        }

        let mut merged = vec![
            ("scope".to_string(), config.default_scope.clone()),
            ("resource".to_string(), config.default_resource.clone()),
        ];
        for (key, value) in pairs {
            if key != "scope" && key != "resource" {
                merged.push((key, value));
            } else if !value.is_empty() {
                if let Some(slot) = merged.iter_mut().find(|(k, _)| *k == key) {
                    slot.1 = value;
                }
            }
        }
        return Disposition::InjectDefaults(with_query(&config.authorization_path, &merged));
    }

    if ALIASES.contains(&path) {
        let target = match query.filter(|q| !q.is_empty()) {
            Some(query) => format!("{}?{}", config.authorization_path, query),
            None => config.authorization_path.clone(),
        };
        return Disposition::Alias(target);
    }

    if path == config.end_session_path {
        let pairs = parse_query(query);
        let Some(logout_uri) = pairs
            .iter()
            .find(|(k, v)| k == "logout_uri" && !v.is_empty())
            .map(|(_, v)| v.clone())
        else {
            return Disposition::PassThrough;
        };

        let mut rewritten = vec![("post_logout_redirect_uri".to_string(), logout_uri)];
        rewritten.extend(pairs.into_iter().filter(|(k, _)| k != "logout_uri"));
        return Disposition::RewriteLogout(with_query(&config.end_session_path, &rewritten));
    }

    Disposition::PassThrough
}

/// Redirect Cognito style requests to their OIDC equivalents
pub async fn cognito_compat_middleware(
    State(config): State<Arc<CompatConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let disposition = classify(
        request.method(),
        request.uri().path(),
        request.uri().query(),
        &config,
    );
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok());

    match disposition.location(host) {
        Some(location) => {
            tracing::debug!(path = %request.uri().path(), %location, "Cognito compatibility redirect");
            found(location)
        }
        None => next.run(request).await,
    }
}
