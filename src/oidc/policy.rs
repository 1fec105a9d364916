//! Grant and claims policy
//!
//! The decisions a development stand-in for Cognito makes on behalf of the
//! end-user: consent is never asked, any redirect target may be accepted,
//! every origin may call the API, and refresh tokens are always issued but
//! never rotated.

use std::collections::{BTreeMap, BTreeSet};

use axum::http::HeaderValue;
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::model::config::{ClientConfig, Config};

use super::account::Account;
use super::store::{Grant, MemoryStore, Session};

/// An absolute URI that can be sent back verbatim in a `Location` header
///
/// `Url::parse` drops tabs and newlines instead of failing on them, so those
/// are rejected before parsing.
fn is_absolute_uri(uri: &str) -> bool {
    !uri.chars().any(|c| c.is_control() || c.is_whitespace()) && url::Url::parse(uri).is_ok()
}

/// Resource server access tokens are minted for
#[derive(Debug, Clone)]
pub struct ResourceServer {
    pub uri: String,
    pub audience: String,
    pub scope: String,
    pub access_token_ttl: i64,
}

/// Token and record lifetimes in seconds
#[derive(Debug, Clone, Copy)]
pub struct Lifetimes {
    pub id_token: i64,
    pub authorization_code: i64,
    pub refresh_token: i64,
    pub session: i64,
    pub interaction: i64,
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub client: ClientConfig,
    pub resource: ResourceServer,
    pub scope_claims: BTreeMap<String, Vec<String>>,
    pub group_delimiter: String,
    pub permissive_redirects: bool,
    pub lifetimes: Lifetimes,
}

impl Policy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: config.client.clone(),
            resource: ResourceServer {
                uri: config.resource.uri.clone(),
                audience: config.resource.audience.clone(),
                scope: config.effective_resource_scope().to_string(),
                access_token_ttl: config.resource.access_token_ttl,
            },
            scope_claims: config.claims.clone(),
            group_delimiter: config.group_delimiter.clone(),
            permissive_redirects: config.permissive_redirects,
            lifetimes: Lifetimes {
                id_token: config.id_token_ttl,
                authorization_code: config.authorization_code_ttl,
                refresh_token: config.refresh_token_ttl,
                session: config.session_ttl,
                interaction: config.interaction_ttl,
            },
        }
    }

    /// The single static client, if `client_id` names it
    pub fn find_client(&self, client_id: &str) -> Option<&ClientConfig> {
        (self.client.client_id == client_id).then_some(&self.client)
    }

    pub fn find_account(&self, account_id: &str) -> Account {
        Account::find(account_id, &self.group_delimiter)
    }

    /// Scopes the client may be granted
    pub fn client_scopes(&self) -> BTreeSet<&str> {
        self.client.scope.split_whitespace().collect()
    }

    /// Scopes carried by access tokens for the resource server
    pub fn resource_scopes(&self) -> BTreeSet<&str> {
        self.resource.scope.split_whitespace().collect()
    }

    pub fn accepts_redirect_uri(&self, client: &ClientConfig, redirect_uri: &str) -> bool {
        if self.permissive_redirects {
            return is_absolute_uri(redirect_uri);
        }
        client.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    pub fn accepts_post_logout_redirect_uri(&self, client: Option<&ClientConfig>, uri: &str) -> bool {
        if self.permissive_redirects {
            return is_absolute_uri(uri);
        }
        client.is_some_and(|c| c.post_logout_redirect_uris.iter().any(|u| u == uri))
    }

    pub fn allows_grant_type(&self, client: &ClientConfig, grant_type: &str) -> bool {
        client.grant_types.iter().any(|g| g == grant_type)
    }

    /// Refresh tokens go to every client allowed to redeem them, `offline_access` or not
    pub fn issue_refresh_token(&self, client: &ClientConfig) -> bool {
        self.allows_grant_type(client, "refresh_token")
    }

    /// A refresh token is reused until it expires
    pub fn rotate_refresh_token(&self) -> bool {
        false
    }

    pub fn client_based_cors(&self, _origin: &HeaderValue) -> bool {
        true
    }

    /// Reuse the grant recorded on the session for this client, or approve a new one
    ///
    /// A new grant covers the full client scope, both as OIDC scopes and as
    /// scopes on the resource server, and is persisted immediately. A reused
    /// grant that would expire before the session is extended to match it.
    pub fn load_existing_grant(&self, store: &MemoryStore, session: &mut Session) -> Grant {
        let client_id = self.client.client_id.as_str();

        if let Some(mut grant) = session
            .grant_id_for(client_id)
            .and_then(|grant_id| store.grants.find(grant_id))
            .filter(|grant| grant.client_id == client_id && grant.account_id == session.account_id)
        {
            if grant.expires_at < session.expires_at {
                grant.expires_at = session.expires_at;
                store.grants.save(grant.id.clone(), grant.clone());
            }
            tracing::debug!(grant_id = %grant.id, client_id, "Reusing existing grant");
            return grant;
        }

        let mut grant = Grant {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            account_id: session.account_id.clone(),
            openid_scopes: BTreeSet::new(),
            resource_scopes: BTreeMap::new(),
            expires_at: session
                .expires_at
                .max(Utc::now() + Duration::seconds(self.lifetimes.session)),
        };
        grant.add_oidc_scope(&self.client.scope);
        grant.add_resource_scope(&self.resource.uri, &self.resource.scope);

        store.grants.save(grant.id.clone(), grant.clone());
        session
            .grants
            .insert(client_id.to_string(), grant.id.clone());
        store.sessions.save(session.id.clone(), session.clone());

        tracing::info!(
            grant_id = %grant.id,
            client_id,
            account_id = %grant.account_id,
            "Auto-approved new grant"
        );
        grant
    }
}
