use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Longest accepted lifetime for any token, code or session (ten years)
pub const MAX_TTL: i64 = 10 * 365 * 24 * 60 * 60;

/// Client authentication method at the token, introspection and revocation endpoints
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    None,
    ClientSecretBasic,
    ClientSecretPost,
}

impl Default for TokenEndpointAuthMethod {
    fn default() -> Self {
        Self::None
    }
}

impl TokenEndpointAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
        }
    }
}

/// The single static client registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_client_secret")]
    pub client_secret: String,

    #[serde(default = "default_application_type")]
    pub application_type: String,

    #[serde(default = "default_redirect_uris")]
    pub redirect_uris: Vec<String>,

    #[serde(default = "default_post_logout_redirect_uris")]
    pub post_logout_redirect_uris: Vec<String>,

    /// Space separated scope the client may request
    #[serde(default = "default_client_scope")]
    pub scope: String,

    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,

    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,

    #[serde(default)]
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            client_secret: default_client_secret(),
            application_type: default_application_type(),
            redirect_uris: default_redirect_uris(),
            post_logout_redirect_uris: default_post_logout_redirect_uris(),
            scope: default_client_scope(),
            grant_types: default_grant_types(),
            response_types: default_response_types(),
            token_endpoint_auth_method: TokenEndpointAuthMethod::default(),
        }
    }
}

/// Resource server that access tokens are minted for
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Resource indicator injected as `resource` when a client omits it
    #[serde(default = "default_resource_uri")]
    pub uri: String,

    /// `aud` of issued access tokens
    #[serde(default = "default_audience")]
    pub audience: String,

    /// Scope served by the resource server, falls back to the client scope if not configured
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Access token lifetime in seconds
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl: i64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            uri: default_resource_uri(),
            audience: default_audience(),
            scope: None,
            access_token_ttl: default_access_token_ttl(),
        }
    }
}

/// Route paths, laid out like the Cognito hosted UI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutesConfig {
    pub authorization: String,
    pub backchannel_authentication: String,
    pub code_verification: String,
    pub device_authorization: String,
    pub end_session: String,
    pub introspection: String,
    pub jwks: String,
    pub pushed_authorization_request: String,
    pub registration: String,
    pub revocation: String,
    pub token: String,
    pub userinfo: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            authorization: "/oauth2/authorize".to_string(),
            backchannel_authentication: "/backchannel".to_string(),
            code_verification: "/device".to_string(),
            device_authorization: "/device/auth".to_string(),
            end_session: "/logout".to_string(),
            introspection: "/token/introspection".to_string(),
            jwks: "/jwks".to_string(),
            pushed_authorization_request: "/request".to_string(),
            registration: "/reg".to_string(),
            revocation: "/oauth2/revoke".to_string(),
            token: "/oauth2/token".to_string(),
            userinfo: "/oauth2/userInfo".to_string(),
        }
    }
}

impl RoutesConfig {
    /// Every configured route with its JSON key
    pub fn all(&self) -> [(&'static str, &str); 12] {
        [
            ("authorization", &self.authorization),
            ("backchannelAuthentication", &self.backchannel_authentication),
            ("codeVerification", &self.code_verification),
            ("deviceAuthorization", &self.device_authorization),
            ("endSession", &self.end_session),
            ("introspection", &self.introspection),
            ("jwks", &self.jwks),
            ("pushedAuthorizationRequest", &self.pushed_authorization_request),
            ("registration", &self.registration),
            ("revocation", &self.revocation),
            ("token", &self.token),
            ("userinfo", &self.userinfo),
        ]
    }

    /// Routes of provider features this server does not enable
    pub fn disabled(&self) -> [&str; 5] {
        [
            &self.registration,
            &self.pushed_authorization_request,
            &self.code_verification,
            &self.device_authorization,
            &self.backchannel_authentication,
        ]
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Issuer URL, defaults to http://localhost:{port}
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub resource: ResourceConfig,

    #[serde(default)]
    pub routes: RoutesConfig,

    /// Claims released per scope
    #[serde(default = "default_claims")]
    pub claims: BTreeMap<String, Vec<String>>,

    /// Separator between the account name and its groups in an account identifier
    #[serde(default = "default_group_delimiter")]
    pub group_delimiter: String,

    /// Accept any redirect_uri / post_logout_redirect_uri instead of the registered ones
    #[serde(default = "default_permissive_redirects")]
    pub permissive_redirects: bool,

    /// PKCS#8 PEM file with the P-256 signing key, a fresh key is generated if not configured
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key_path: Option<String>,

    #[serde(default = "default_id_token_ttl")]
    pub id_token_ttl: i64,

    #[serde(default = "default_authorization_code_ttl")]
    pub authorization_code_ttl: i64,

    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl: i64,

    #[serde(default = "default_session_ttl")]
    pub session_ttl: i64,

    #[serde(default = "default_interaction_ttl")]
    pub interaction_ttl: i64,

    /// Config file path (runtime metadata, not written to JSON)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_client_id() -> String {
    "fun".to_string()
}

fn default_client_secret() -> String {
    "stack".to_string()
}

fn default_application_type() -> String {
    "web".to_string()
}

fn default_redirect_uris() -> Vec<String> {
    vec!["http://localhost:12345".to_string()]
}

fn default_post_logout_redirect_uris() -> Vec<String> {
    vec!["http://localhost:12345?logout".to_string()]
}

fn default_client_scope() -> String {
    "email profile openid api".to_string()
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string(), "refresh_token".to_string()]
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

fn default_resource_uri() -> String {
    "urn:fun:stack".to_string()
}

fn default_audience() -> String {
    "fun-api".to_string()
}

fn default_access_token_ttl() -> i64 {
    60 * 60
}

fn default_claims() -> BTreeMap<String, Vec<String>> {
    let set = |claims: &[&str]| claims.iter().map(|c| c.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        ("api".to_string(), Vec::new()),
        ("address".to_string(), set(&["address"])),
        ("email".to_string(), set(&["email", "email_verified"])),
        (
            "phone".to_string(),
            set(&["phone_number", "phone_number_verified"]),
        ),
        (
            "profile".to_string(),
            set(&[
                "birthdate",
                "family_name",
                "gender",
                "given_name",
                "locale",
                "middle_name",
                "name",
                "nickname",
                "picture",
                "preferred_username",
                "profile",
                "updated_at",
                "website",
                "zoneinfo",
                "cognito:username",
            ]),
        ),
    ])
}

fn default_group_delimiter() -> String {
    "+".to_string()
}

fn default_permissive_redirects() -> bool {
    true
}

fn default_id_token_ttl() -> i64 {
    60 * 60
}

fn default_authorization_code_ttl() -> i64 {
    10 * 60
}

fn default_refresh_token_ttl() -> i64 {
    14 * 24 * 60 * 60
}

fn default_session_ttl() -> i64 {
    14 * 24 * 60 * 60
}

fn default_interaction_ttl() -> i64 {
    60 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            issuer: None,
            client: ClientConfig::default(),
            resource: ResourceConfig::default(),
            routes: RoutesConfig::default(),
            claims: default_claims(),
            group_delimiter: default_group_delimiter(),
            permissive_redirects: default_permissive_redirects(),
            signing_key_path: None,
            id_token_ttl: default_id_token_ttl(),
            authorization_code_ttl: default_authorization_code_ttl(),
            refresh_token_ttl: default_refresh_token_ttl(),
            session_ttl: default_session_ttl(),
            interaction_ttl: default_interaction_ttl(),
            config_path: None,
        }
    }
}

impl Config {
    /// Get default config file path
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// Get effective issuer
    /// Prefers issuer, falls back to http://localhost:{port} if not configured
    pub fn effective_issuer(&self) -> String {
        match &self.issuer {
            Some(issuer) => issuer.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }

    /// Get effective resource scope (falls back to the client scope)
    pub fn effective_resource_scope(&self) -> &str {
        self.resource.scope.as_deref().unwrap_or(&self.client.scope)
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // Config file doesn't exist, return default config
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Get config file path (if available)
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.client.client_id.trim().is_empty() {
            anyhow::bail!("client.clientId must not be empty");
        }
        if self.group_delimiter.is_empty() {
            anyhow::bail!("groupDelimiter must not be empty");
        }
        if !self.client.response_types.iter().any(|t| t == "code") {
            anyhow::bail!("client.responseTypes must include \"code\"");
        }
        for (name, ttl) in [
            ("resource.accessTokenTtl", self.resource.access_token_ttl),
            ("idTokenTtl", self.id_token_ttl),
            ("authorizationCodeTtl", self.authorization_code_ttl),
            ("refreshTokenTtl", self.refresh_token_ttl),
            ("sessionTtl", self.session_ttl),
            ("interactionTtl", self.interaction_ttl),
        ] {
            if ttl <= 0 {
                anyhow::bail!("{} must be positive, got {}", name, ttl);
            }
            if ttl > MAX_TTL {
                anyhow::bail!("{} must be at most {} seconds, got {}", name, MAX_TTL, ttl);
            }
        }

        let routes = self.routes.all();
        for (i, (name, path)) in routes.iter().enumerate() {
            if !path.starts_with('/') {
                anyhow::bail!("routes.{} must start with '/', got {:?}", name, path);
            }
            if let Some((other, _)) = routes[..i].iter().find(|(_, p)| p == path) {
                anyhow::bail!("routes.{} and routes.{} both use {:?}", other, name, path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cognito_layout() {
        let config = Config::default();
        assert_eq!(config.port, 8082);
        assert_eq!(config.client.client_id, "fun");
        assert_eq!(config.client.scope, "email profile openid api");
        assert_eq!(config.resource.uri, "urn:fun:stack");
        assert_eq!(config.resource.audience, "fun-api");
        assert_eq!(config.routes.authorization, "/oauth2/authorize");
        assert_eq!(config.routes.userinfo, "/oauth2/userInfo");
        assert!(config.permissive_redirects);
        assert_eq!(config.claims["email"], vec!["email", "email_verified"]);
    }

    #[test]
    fn test_effective_issuer() {
        let mut config = Config::default();
        config.port = 9000;
        assert_eq!(config.effective_issuer(), "http://localhost:9000");

        config.issuer = Some("https://auth.example.com/".to_string());
        assert_eq!(config.effective_issuer(), "https://auth.example.com");
    }

    #[test]
    fn test_effective_resource_scope_falls_back_to_client() {
        let mut config = Config::default();
        assert_eq!(config.effective_resource_scope(), "email profile openid api");

        config.resource.scope = Some("api".to_string());
        assert_eq!(config.effective_resource_scope(), "api");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"port": 3000, "client": {"clientId": "web", "tokenEndpointAuthMethod": "client_secret_basic"}}"#,
        )
        .unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.client.client_id, "web");
        assert_eq!(config.client.client_secret, "stack");
        assert_eq!(
            config.client.token_endpoint_auth_method,
            TokenEndpointAuthMethod::ClientSecretBasic
        );
        assert_eq!(config.routes, RoutesConfig::default());
    }

    #[test]
    fn test_partial_routes_override() {
        let config: Config =
            serde_json::from_str(r#"{"routes": {"userinfo": "/userinfo"}}"#).unwrap();
        assert_eq!(config.routes.userinfo, "/userinfo");
        assert_eq!(config.routes.token, "/oauth2/token");
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let config = Config::load("/nonexistent/cognito-local.json").unwrap();
        assert_eq!(config.port, 8082);
        assert!(config.config_path().is_some());
    }

    #[test]
    fn test_load_rejects_non_positive_ttl() {
        let dir = std::env::temp_dir().join(format!("cognito-local-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(&path, r#"{"idTokenTtl": 0}"#).unwrap();

        let result = Config::load(&path);
        assert!(result.is_err());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_rejects_oversized_ttl() {
        let dir = std::env::temp_dir().join(format!("cognito-local-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        fs::write(&path, r#"{"sessionTtl": 10000000000000}"#).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("sessionTtl"));

        fs::write(&path, format!(r#"{{"refreshTokenTtl": {}}}"#, MAX_TTL)).unwrap();
        assert!(Config::load(&path).is_ok());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_rejects_bad_routes() {
        let dir = std::env::temp_dir().join(format!("cognito-local-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        fs::write(&path, r#"{"routes": {"token": "oauth2/token"}}"#).unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(&path, r#"{"routes": {"userinfo": "/jwks"}}"#).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("routes.jwks"));

        fs::remove_dir_all(&dir).unwrap();
    }
}
