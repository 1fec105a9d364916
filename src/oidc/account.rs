//! Accounts synthesised from an opaque identifier
//!
//! There is no user store. Whatever login name is typed on the login page
//! becomes the account identifier, and group memberships ride along inside
//! it: with the default `+` delimiter, `alice+admins+ops` is the account
//! `alice+admins+ops` in groups `admins` and `ops`.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub account_id: String,
    pub groups: Vec<String>,
}

impl Account {
    /// Build an account from its identifier, splitting groups on `delimiter`
    pub fn find(account_id: &str, delimiter: &str) -> Self {
        let groups = account_id
            .split(delimiter)
            .skip(1)
            .filter(|group| !group.is_empty())
            .map(|group| group.to_string())
            .collect();

        Self {
            account_id: account_id.to_string(),
            groups,
        }
    }

    /// Every claim the account can supply
    pub fn claims(&self) -> Map<String, Value> {
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!(self.account_id));
        claims.insert("cognito:username".to_string(), json!(self.account_id));
        claims.insert(
            "email".to_string(),
            json!(format!("{}@localhost", self.account_id)),
        );
        claims.insert("email_verified".to_string(), json!(true));
        claims
    }

    /// Claims released for `scopes`, `sub` is always included
    pub fn claims_for_scopes<'a, I>(
        &self,
        scopes: I,
        scope_claims: &BTreeMap<String, Vec<String>>,
    ) -> Map<String, Value>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let available = self.claims();
        let mut released = Map::new();
        released.insert("sub".to_string(), json!(self.account_id));

        for scope in scopes {
            let Some(names) = scope_claims.get(scope) else {
                continue;
            };
            for name in names {
                if let Some(value) = available.get(name) {
                    released.insert(name.clone(), value.clone());
                }
            }
        }
        released
    }

    /// Claims stamped onto every issued token
    pub fn extra_token_claims(&self) -> Map<String, Value> {
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!(self.account_id));
        claims.insert("username".to_string(), json!(self.account_id));
        claims.insert("cognito:groups".to_string(), json!(self.groups));
        claims
    }
}
