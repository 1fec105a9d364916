mod common;
mod compat;
mod model;
mod oidc;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{Router, middleware};
use clap::Parser;
use compat::{CompatConfig, cognito_compat_middleware};
use model::arg::Args;
use model::config::Config;
use oidc::{DISCOVERY_PATH, Provider, SigningKeys};

/// How often expired interactions, sessions, codes and tokens are purged
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Load configuration, command line flags win over the file
    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let mut config = Config::load(&config_path).context("Failed to load config")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(issuer) = args.issuer {
        config.issuer = Some(issuer);
    }
    match config.config_path().filter(|p| p.exists()) {
        Some(path) => tracing::info!("Loaded config from {}", path.display()),
        None => tracing::info!("No config file at {}, using defaults", config_path),
    }

    let keys = match &config.signing_key_path {
        Some(path) => SigningKeys::from_pem_file(path)?,
        None => {
            tracing::warn!("No signingKeyPath configured, tokens will not survive a restart");
            SigningKeys::generate()?
        }
    };
    tracing::info!("Signing key kid: {}", keys.kid());

    let (app, provider) = build_app(&config, keys);

    // Purge expired state in the background
    let cleanup_provider = provider.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let store = cleanup_provider.store();
            let removed = store.cleanup_expired();
            if removed > 0 {
                tracing::debug!(removed, sessions = store.sessions.len(), "Purged expired records");
            }
        }
    });

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let routes = &config.routes;
    tracing::info!("Starting OIDC provider: {}", addr);
    tracing::info!("Issuer: {}", provider.issuer());
    tracing::info!(
        "Client: {} (token endpoint auth: {})",
        config.client.client_id,
        config.client.token_endpoint_auth_method.as_str()
    );
    tracing::info!("Available endpoints:");
    tracing::info!("  GET      {}", DISCOVERY_PATH);
    tracing::info!("  GET/POST {}", routes.authorization);
    tracing::info!("  POST     {}", routes.token);
    tracing::info!("  GET/POST {}", routes.userinfo);
    tracing::info!("  POST     {}", routes.introspection);
    tracing::info!("  POST     {}", routes.revocation);
    tracing::info!("  GET/POST {}", routes.end_session);
    tracing::info!("  GET      {}", routes.jwks);
    tracing::info!("Cognito aliases: /login /signup /authorize");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Assemble the provider and its HTTP surface
fn build_app(config: &Config, keys: SigningKeys) -> (Router, Arc<Provider>) {
    let provider = Arc::new(Provider::new(config, keys));
    let compat = Arc::new(CompatConfig::from_config(config));

    let app = oidc::create_oidc_router(provider.clone())
        .layer(middleware::from_fn_with_state(
            compat,
            cognito_compat_middleware,
        ))
        .layer(oidc::cors_layer(provider.clone()));

    (app, provider)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}
