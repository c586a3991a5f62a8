//! Token → account resolution.
//!
//! Stand-in for the external authentication service: an accounts file maps
//! bearer tokens to user ids and the admin flag. Tokens arrive on the
//! WebSocket upgrade as `?token=<token>`; connections without a valid token
//! proceed as anonymous actors.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// One resolved account.
#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: String,
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    token: String,
    user_id: String,
    #[serde(default)]
    is_admin: bool,
}

/// In-memory token table, loaded once at startup.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    by_token: HashMap<String, Account>,
}

impl AccountRegistry {
    /// Load accounts from a JSON file: `[{"token": "...", "user_id": "...",
    /// "is_admin": false}, ...]`. A missing path yields an empty registry
    /// (anonymous-only mode).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<AccountEntry> = serde_json::from_str(&raw)?;

        let mut by_token = HashMap::new();
        for entry in entries {
            by_token.insert(
                entry.token,
                Account {
                    user_id: entry.user_id,
                    is_admin: entry.is_admin,
                },
            );
        }

        Ok(Self { by_token })
    }

    /// Resolve a bearer token to an account, if known.
    pub fn resolve(&self, token: &str) -> Option<&Account> {
        self.by_token.get(token)
    }

    /// Extract the `token` query parameter from a WebSocket upgrade URI.
    pub fn token_from_query(query: Option<&str>) -> Option<&str> {
        query?
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
    }
}
