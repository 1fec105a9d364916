//! In-memory storage for provider state
//!
//! Everything lives in process memory and is lost on restart. Each table is a
//! `HashMap` behind a `parking_lot::Mutex`; locks are only held for a single
//! map operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Records that expire and get purged by [`MemoryStore::cleanup_expired`]
pub trait Expiring {
    fn expires_at(&self) -> DateTime<Utc>;

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// Authorization request that has passed validation and waits for a login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub resource: Option<String>,
    pub code_challenge: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Interaction {
    pub request: PendingAuthorization,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub account_id: String,
    /// Unix time of the login, becomes `auth_time`
    pub login_ts: i64,
    /// client_id -> grant id
    pub grants: HashMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn grant_id_for(&self, client_id: &str) -> Option<&str> {
        self.grants.get(client_id).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Grant {
    pub id: String,
    pub client_id: String,
    pub account_id: String,
    pub openid_scopes: BTreeSet<String>,
    /// resource indicator -> scopes
    pub resource_scopes: BTreeMap<String, BTreeSet<String>>,
    pub expires_at: DateTime<Utc>,
}

impl Grant {
    pub fn add_oidc_scope(&mut self, scope: &str) {
        self.openid_scopes
            .extend(scope.split_whitespace().map(str::to_string));
    }

    pub fn add_resource_scope(&mut self, resource: &str, scope: &str) {
        self.resource_scopes
            .entry(resource.to_string())
            .or_default()
            .extend(scope.split_whitespace().map(str::to_string));
    }

    pub fn covers(&self, scope: &str) -> bool {
        self.openid_scopes.contains(scope)
            || self.resource_scopes.values().any(|s| s.contains(scope))
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub account_id: String,
    pub grant_id: String,
    pub session_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub auth_time: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub account_id: String,
    pub grant_id: String,
    pub session_id: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub auth_time: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

macro_rules! impl_expiring {
    ($($ty:ty),*) => {
        $(impl Expiring for $ty {
            fn expires_at(&self) -> DateTime<Utc> {
                self.expires_at
            }
        })*
    };
}

impl_expiring!(Interaction, Session, Grant, AuthorizationCode, RefreshToken);

/// One keyed table of expiring records
pub struct Table<T> {
    entries: Mutex<HashMap<String, T>>,
}

impl<T: Expiring + Clone> Table<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn save(&self, key: impl Into<String>, value: T) {
        self.entries.lock().insert(key.into(), value);
    }

    /// Live record for `key`, expired records are treated as missing
    pub fn find(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|value| !value.is_expired(Utc::now()))
            .cloned()
    }

    /// Remove and return the live record for `key`
    pub fn take(&self, key: &str) -> Option<T> {
        let value = self.entries.lock().remove(key)?;
        (!value.is_expired(Utc::now())).then_some(value)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove every record matching `predicate`, returning how many went
    pub fn remove_where<F: Fn(&T) -> bool>(&self, predicate: F) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, value| !predicate(value));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn purge(&self, now: DateTime<Utc>) -> usize {
        self.remove_where(|value| value.is_expired(now))
    }
}

/// All provider state
pub struct MemoryStore {
    pub interactions: Table<Interaction>,
    pub sessions: Table<Session>,
    pub grants: Table<Grant>,
    pub codes: Table<AuthorizationCode>,
    pub refresh_tokens: Table<RefreshToken>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            interactions: Table::new(),
            sessions: Table::new(),
            grants: Table::new(),
            codes: Table::new(),
            refresh_tokens: Table::new(),
        }
    }

    /// Drop expired records from every table
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        self.interactions.purge(now)
            + self.sessions.purge(now)
            + self.grants.purge(now)
            + self.codes.purge(now)
            + self.refresh_tokens.purge(now)
    }
}
