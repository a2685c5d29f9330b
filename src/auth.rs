//! Identity validation seam.
//!
//! The signaling server never stores users itself; it asks an
//! [`IdentityProvider`] (backed by the external user store) whether a
//! token/user pair is valid before mutating any room state.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::protocol::UserId;

/// What the external user store knows about an authenticated user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub role: String,
    #[serde(default)]
    pub is_blocked: bool,
    /// Display name from the user record; falls back to the user id.
    #[serde(default)]
    pub name: Option<String>,
    /// Carried into the audit trail only.
    #[serde(default)]
    pub email: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` means the token is unknown; `Ok(Some)` may still be a
    /// blocked user, which the caller must reject.
    async fn validate(&self, user_id: &UserId, auth_token: &str) -> Result<Option<Identity>>;
}

/// Token-table provider, loadable from a JSON file mapping token -> identity.
pub struct StaticIdentityProvider {
    by_token: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    pub fn new(by_token: HashMap<String, Identity>) -> Self {
        Self { by_token }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let by_token: HashMap<String, Identity> = serde_json::from_str(&raw)?;
        Ok(Self::new(by_token))
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn validate(&self, user_id: &UserId, auth_token: &str) -> Result<Option<Identity>> {
        Ok(self
            .by_token
            .get(auth_token)
            .filter(|identity| &identity.id == user_id)
            .cloned())
    }
}

/// Accepts any non-empty token. Development only; the server binary warns
/// loudly when it falls back to this.
pub struct PermissiveIdentityProvider;

#[async_trait]
impl IdentityProvider for PermissiveIdentityProvider {
    async fn validate(&self, user_id: &UserId, auth_token: &str) -> Result<Option<Identity>> {
        if auth_token.is_empty() {
            return Ok(None);
        }
        Ok(Some(Identity {
            id: user_id.clone(),
            role: "user".to_owned(),
            is_blocked: false,
            name: None,
            email: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_checks_token_and_user_pairing() {
        let mut table = HashMap::new();
        table.insert(
            "tok-alice".to_owned(),
            Identity {
                id: "alice".into(),
                role: "user".into(),
                is_blocked: false,
                name: Some("Alice".into()),
                email: None,
            },
        );
        let provider = StaticIdentityProvider::new(table);

        assert!(provider
            .validate(&"alice".into(), "tok-alice")
            .await
            .unwrap()
            .is_some());
        // Right token, wrong user: rejected.
        assert!(provider
            .validate(&"mallory".into(), "tok-alice")
            .await
            .unwrap()
            .is_none());
        assert!(provider
            .validate(&"alice".into(), "tok-unknown")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn permissive_provider_rejects_empty_tokens() {
        let provider = PermissiveIdentityProvider;
        assert!(provider.validate(&"a".into(), "").await.unwrap().is_none());
        assert!(provider.validate(&"a".into(), "x").await.unwrap().is_some());
    }
}
