//! OIDC router
//!
//! # Endpoints (default paths)
//! - `GET|POST /oauth2/authorize` - authorization endpoint
//! - `POST /oauth2/token` - code and refresh token grants
//! - `GET|POST /oauth2/userInfo` - claims for a bearer access token
//! - `POST /token/introspection`, `POST /oauth2/revoke`
//! - `GET|POST /logout` - RP-initiated logout
//! - `GET /jwks`, `GET /.well-known/openid-configuration`
//! - `/interaction/{uid}` - login page, `/login` and `/abort` below it
//!
//! Paths other than the interaction and discovery routes come from
//! [`RoutesConfig`](crate::model::config::RoutesConfig).

use std::sync::Arc;

use axum::{
    Router,
    http::Method,
    routing::{any, get, post},
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::handlers::{
    OidcState, authorize_get, authorize_post, discovery, end_session_get, end_session_post,
    feature_disabled, interaction_abort, interaction_login, interaction_page, introspection, jwks,
    not_found, revocation, token, userinfo_get, userinfo_post,
};
use super::provider::Provider;

pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Create the OIDC router
///
/// Unmatched requests fall through to an OAuth `invalid_request` 404, so
/// layers added on top of this router also see them.
pub fn create_oidc_router(provider: Arc<Provider>) -> Router {
    let routes = provider.routes().clone();
    let state = OidcState { provider };

    let mut router = Router::new()
        .route(&routes.authorization, get(authorize_get).post(authorize_post))
        .route(&routes.token, post(token))
        .route(&routes.userinfo, get(userinfo_get).post(userinfo_post))
        .route(&routes.introspection, post(introspection))
        .route(&routes.revocation, post(revocation))
        .route(&routes.end_session, get(end_session_get).post(end_session_post))
        .route(&routes.jwks, get(jwks))
        .route(DISCOVERY_PATH, get(discovery))
        .route("/interaction/{uid}", get(interaction_page))
        .route("/interaction/{uid}/login", post(interaction_login))
        .route("/interaction/{uid}/abort", get(interaction_abort));

    for path in routes.disabled() {
        router = router.route(path, any(feature_disabled));
    }

    router.fallback(not_found).with_state(state)
}

/// CORS layer, origins are admitted by the provider policy
pub fn cors_layer(provider: Arc<Provider>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _parts| {
            provider.policy().client_based_cors(origin)
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, Response, StatusCode, header},
    };
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use http_body_util::BodyExt;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::model::config::Config;
    use crate::oidc::keys::SigningKeys;

    const AUTHORIZE: &str = "/oauth2/authorize?client_id=fun&response_type=code\
        &scope=openid%20email%20api&redirect_uri=http%3A%2F%2Flocalhost%3A12345\
        &state=abc&nonce=n0&resource=urn%3Afun%3Astack";

    fn app_with(config: &Config) -> Router {
        create_oidc_router(Arc::new(Provider::new(config, SigningKeys::generate().unwrap())))
    }

    fn app() -> Router {
        app_with(&Config::default())
    }

    async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
        app.clone().oneshot(request).await.unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn form_request(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn location(response: &Response<Body>) -> String {
        response.headers()[header::LOCATION].to_str().unwrap().to_string()
    }

    fn query_param(location: &str, name: &str) -> Option<String> {
        url::Url::parse(location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    async fn json(response: Response<Body>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Authorize and log in as `login`, returning the client redirect and session cookie
    async fn login(app: &Router, login: &str) -> (String, String) {
        let response = send(app, get_request(AUTHORIZE)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let interaction = location(&response);
        assert!(interaction.starts_with("/interaction/"));

        let page = send(app, get_request(&interaction)).await;
        assert_eq!(page.status(), StatusCode::OK);
        assert!(text(page).await.contains(&format!("{}/login", interaction)));

        let body = format!("login={}&password=x", url::form_urlencoded::byte_serialize(login.as_bytes()).collect::<String>());
        let response = send(app, form_request(&format!("{}/login", interaction), &body)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let cookie = response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        (location(&response), cookie)
    }

    async fn exchange(app: &Router, code: &str) -> Value {
        let body = format!(
            "grant_type=authorization_code&code={}&client_id=fun&redirect_uri=http%3A%2F%2Flocalhost%3A12345",
            code
        );
        let response = send(app, form_request("/oauth2/token", &body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        json(response).await
    }

    fn verify_with_jwk(token: &str, jwk: &Value) -> Value {
        let x = URL_SAFE_NO_PAD.decode(jwk["x"].as_str().unwrap()).unwrap();
        let y = URL_SAFE_NO_PAD.decode(jwk["y"].as_str().unwrap()).unwrap();
        let point = p256::EncodedPoint::from_affine_coordinates(
            x.as_slice().into(),
            y.as_slice().into(),
            false,
        );
        let key = VerifyingKey::from_encoded_point(&point).unwrap();

        let (input, signature) = token.rsplit_once('.').unwrap();
        let signature = Signature::from_slice(&URL_SAFE_NO_PAD.decode(signature).unwrap()).unwrap();
        key.verify(input.as_bytes(), &signature).unwrap();

        let payload = input.split('.').nth(1).unwrap();
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_full_code_flow() {
        let app = app();
        let (redirect, _) = login(&app, "alice+admins+ops").await;
        assert!(redirect.starts_with("http://localhost:12345?code="));
        assert_eq!(query_param(&redirect, "state").as_deref(), Some("abc"));

        let code = query_param(&redirect, "code").unwrap();
        let tokens = exchange(&app, &code).await;
        assert_eq!(tokens["token_type"], "Bearer");
        assert!(tokens["refresh_token"].is_string());

        let access_token = tokens["access_token"].as_str().unwrap();
        let response = send(
            &app,
            Request::get("/oauth2/userInfo")
                .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let info = json(response).await;
        assert_eq!(info["sub"], "alice+admins+ops");
        assert_eq!(info["email"], "alice+admins+ops@localhost");
        assert_eq!(info["email_verified"], true);

        let jwks = json(send(&app, get_request("/jwks")).await).await;
        let jwk = &jwks["keys"][0];
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["alg"], "ES256");

        let access = verify_with_jwk(access_token, jwk);
        assert_eq!(access["aud"], "fun-api");
        assert_eq!(access["cognito:groups"], serde_json::json!(["admins", "ops"]));

        let id = verify_with_jwk(tokens["id_token"].as_str().unwrap(), jwk);
        assert_eq!(id["aud"], "fun");
        assert_eq!(id["nonce"], "n0");
        assert_eq!(id["sub"], "alice+admins+ops");
    }

    #[tokio::test]
    async fn test_session_reuses_grant_without_login() {
        let config = Config::default();
        let provider = Arc::new(Provider::new(&config, SigningKeys::generate().unwrap()));
        let app = create_oidc_router(provider.clone());

        let (_, cookie) = login(&app, "alice").await;
        assert!(cookie.starts_with("_session="));
        assert_eq!(provider.store().grants.len(), 1);

        let response = send(
            &app,
            Request::get(AUTHORIZE)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let redirect = location(&response);
        assert!(redirect.starts_with("http://localhost:12345?code="));
        assert_eq!(provider.store().grants.len(), 1);

        let tokens = exchange(&app, &query_param(&redirect, "code").unwrap()).await;
        assert!(tokens["access_token"].is_string());
    }

    #[tokio::test]
    async fn test_prompt_none_without_session() {
        let app = app();
        let response = send(&app, get_request(&format!("{}&prompt=none", AUTHORIZE))).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let redirect = location(&response);
        assert_eq!(query_param(&redirect, "error").as_deref(), Some("login_required"));
        assert_eq!(query_param(&redirect, "state").as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_refresh_token_not_rotated() {
        let app = app();
        let (redirect, _) = login(&app, "bob").await;
        let tokens = exchange(&app, &query_param(&redirect, "code").unwrap()).await;
        let refresh_token = tokens["refresh_token"].as_str().unwrap();

        let body = format!("grant_type=refresh_token&refresh_token={}&client_id=fun", refresh_token);
        let response = send(&app, form_request("/oauth2/token", &body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let refreshed = json(response).await;
        assert_eq!(refreshed["refresh_token"], refresh_token);
        assert_ne!(refreshed["access_token"], tokens["access_token"]);
    }

    #[tokio::test]
    async fn test_token_errors() {
        let app = app();

        let response = send(&app, form_request("/oauth2/token", "grant_type=authorization_code&code=nope&client_id=fun")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "invalid_grant");

        let response = send(&app, form_request("/oauth2/token", "grant_type=password&client_id=fun")).await;
        assert_eq!(json(response).await["error"], "unsupported_grant_type");

        let response = send(&app, form_request("/oauth2/token", "grant_type=authorization_code&code=x&client_id=evil")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["error"], "invalid_client");
    }

    #[tokio::test]
    async fn test_userinfo_rejects_missing_and_bad_tokens() {
        let app = app();

        let response = send(&app, get_request("/oauth2/userInfo")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let response = send(&app, get_request("/oauth2/userInfo?access_token=garbage")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["error"], "invalid_token");
    }

    #[tokio::test]
    async fn test_permissive_accepts_unregistered_redirect() {
        let app = app();
        let uri = "/oauth2/authorize?client_id=fun&response_type=code&scope=openid\
            &redirect_uri=https%3A%2F%2Felsewhere.example%2Fcb";
        let response = send(&app, get_request(uri)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("/interaction/"));
    }

    #[tokio::test]
    async fn test_strict_rejects_unregistered_redirect() {
        let mut config = Config::default();
        config.permissive_redirects = false;
        let app = app_with(&config);

        let uri = "/oauth2/authorize?client_id=fun&response_type=code&scope=openid\
            &redirect_uri=https%3A%2F%2Felsewhere.example%2Fcb";
        let response = send(&app, get_request(uri)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!response.headers().contains_key(header::LOCATION));
        assert!(text(response).await.contains("invalid_request"));
    }

    #[tokio::test]
    async fn test_redirect_uri_with_newline_is_rejected() {
        let app = app();
        let uri = "/oauth2/authorize?client_id=fun&response_type=token&scope=openid&state=s\
            &redirect_uri=http%3A%2F%2Flocalhost%3A12345%2F%0Acb";
        let response = send(&app, get_request(uri)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!response.headers().contains_key(header::LOCATION));
        assert!(text(response).await.contains("invalid_request"));

        let response = send(
            &app,
            get_request("/logout?post_logout_redirect_uri=http%3A%2F%2Flocalhost%3A12345%2F%0Acb"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!response.headers().contains_key(header::LOCATION));
    }

    #[tokio::test]
    async fn test_abort_returns_access_denied() {
        let app = app();
        let response = send(&app, get_request(AUTHORIZE)).await;
        let interaction = location(&response);

        let response = send(&app, get_request(&format!("{}/abort", interaction))).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let redirect = location(&response);
        assert_eq!(query_param(&redirect, "error").as_deref(), Some("access_denied"));

        let response = send(&app, get_request(&interaction)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_login_is_rejected() {
        let app = app();
        let response = send(&app, get_request(AUTHORIZE)).await;
        let interaction = location(&response);

        let response = send(&app, form_request(&format!("{}/login", interaction), "login=+&password=")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(text(response).await.contains("Username is required"));
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let app = app();
        let (_, cookie) = login(&app, "carol").await;

        let response = send(
            &app,
            Request::get("/logout?post_logout_redirect_uri=http%3A%2F%2Flocalhost%3A12345%3Flogout&client_id=fun&state=s")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "http://localhost:12345?logout&state=s");
        let cleared = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cleared.contains("Max-Age=0"));

        let response = send(
            &app,
            Request::get(AUTHORIZE)
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(location(&response).starts_with("/interaction/"));
    }

    #[tokio::test]
    async fn test_logout_without_redirect_renders_page() {
        let app = app();
        let response = send(&app, Request::post("/logout").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(text(response).await.contains("Signed out"));
    }

    #[tokio::test]
    async fn test_introspection_and_revocation() {
        let app = app();
        let (redirect, _) = login(&app, "dave").await;
        let tokens = exchange(&app, &query_param(&redirect, "code").unwrap()).await;
        let refresh_token = tokens["refresh_token"].as_str().unwrap();

        let body = format!("token={}&client_id=fun", tokens["access_token"].as_str().unwrap());
        let response = send(&app, form_request("/token/introspection", &body)).await;
        let introspected = json(response).await;
        assert_eq!(introspected["active"], true);
        assert_eq!(introspected["sub"], "dave");

        let body = format!("token={}&client_id=fun", refresh_token);
        let response = send(&app, form_request("/oauth2/revoke", &body)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = format!("token={}&client_id=fun", refresh_token);
        let introspected = json(send(&app, form_request("/token/introspection", &body)).await).await;
        assert_eq!(introspected["active"], false);
    }

    #[tokio::test]
    async fn test_discovery_and_disabled_features() {
        let app = app();
        let doc = json(send(&app, get_request(DISCOVERY_PATH)).await).await;
        assert_eq!(doc["issuer"], "http://localhost:8082");
        assert_eq!(doc["token_endpoint"], "http://localhost:8082/oauth2/token");
        assert_eq!(doc["end_session_endpoint"], "http://localhost:8082/logout");

        for path in ["/reg", "/request", "/device", "/device/auth", "/backchannel"] {
            let response = send(&app, get_request(path)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
            assert_eq!(json(response).await["error"], "invalid_request");
        }

        let response = send(&app, get_request("/nowhere")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
