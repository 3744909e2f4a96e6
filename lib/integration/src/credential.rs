//! Per-(user, app) OAuth credential storage.
//!
//! The store is the only writer of token rows. The OAuth handshake
//! collaborator creates rows through [`CredentialStore::save`]; the
//! dispatcher refreshes them in place through
//! [`CredentialStore::update_access`]. Implementations must project sensitive
//! columns only for [`CredentialStore::load`]; listing surfaces elsewhere
//! omit them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{AppName, CredentialId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A stored OAuth credential for one (user, app) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Unique identifier.
    pub id: CredentialId,
    /// The owning user.
    pub user_id: UserId,
    /// The app this credential authenticates against.
    pub app: AppName,
    /// Bearer token; never empty.
    pub access_token: String,
    /// Refresh token, when the provider issued one.
    pub refresh_token: Option<String>,
    /// Expiry instant (UTC). Absent for providers that do not expire tokens.
    pub expires_at: Option<DateTime<Utc>>,
    /// Raw provider response from the handshake (e.g. the installing Slack
    /// user id under `authed_user.id`).
    pub metadata: JsonValue,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Returns whether the access token has expired relative to `now`.
    ///
    /// Tokens without an expiry never expire.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Token material written by the handshake collaborator.
#[derive(Debug, Clone)]
pub struct TokenSet {
    /// Bearer token.
    pub access_token: String,
    /// Refresh token, when issued.
    pub refresh_token: Option<String>,
    /// Expiry instant, when issued.
    pub expires_at: Option<DateTime<Utc>>,
    /// Raw provider response.
    pub metadata: JsonValue,
}

/// Errors from credential storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The access token was empty.
    EmptyAccessToken,
    /// The underlying store rejected the operation.
    StorageFailed { reason: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyAccessToken => write!(f, "access token must not be empty"),
            Self::StorageFailed { reason } => {
                write!(f, "credential storage failed: {reason}")
            }
        }
    }
}

impl std::error::Error for CredentialError {}

/// Storage contract for credentials (C1).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Loads the full credential for (user, app), or `None` when the app was
    /// never connected.
    async fn load(
        &self,
        user_id: UserId,
        app: AppName,
    ) -> Result<Option<Credential>, CredentialError>;

    /// Creates or replaces the credential for (user, app).
    async fn save(
        &self,
        user_id: UserId,
        app: AppName,
        tokens: TokenSet,
    ) -> Result<Credential, CredentialError>;

    /// Rewrites the access token and expiry in place, leaving the refresh
    /// token and metadata untouched. Used by the dispatcher after a refresh.
    async fn update_access(
        &self,
        user_id: UserId,
        app: AppName,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CredentialError>;
}

/// In-memory credential store.
///
/// Backs tests and local development; one row per (user, app), as the
/// relational UNIQUE constraint guarantees in production.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    rows: Arc<Mutex<HashMap<(UserId, AppName), Credential>>>,
}

impl InMemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(
        &self,
        user_id: UserId,
        app: AppName,
    ) -> Result<Option<Credential>, CredentialError> {
        Ok(self.rows.lock().unwrap().get(&(user_id, app)).cloned())
    }

    async fn save(
        &self,
        user_id: UserId,
        app: AppName,
        tokens: TokenSet,
    ) -> Result<Credential, CredentialError> {
        if tokens.access_token.is_empty() {
            return Err(CredentialError::EmptyAccessToken);
        }

        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let credential = match rows.get(&(user_id, app)) {
            Some(existing) => Credential {
                id: existing.id,
                user_id,
                app,
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token.or_else(|| existing.refresh_token.clone()),
                expires_at: tokens.expires_at,
                metadata: tokens.metadata,
                created_at: existing.created_at,
                updated_at: now,
            },
            None => Credential {
                id: CredentialId::new(),
                user_id,
                app,
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_at: tokens.expires_at,
                metadata: tokens.metadata,
                created_at: now,
                updated_at: now,
            },
        };
        rows.insert((user_id, app), credential.clone());
        Ok(credential)
    }

    async fn update_access(
        &self,
        user_id: UserId,
        app: AppName,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CredentialError> {
        if access_token.is_empty() {
            return Err(CredentialError::EmptyAccessToken);
        }

        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&(user_id, app)) {
            Some(row) => {
                row.access_token = access_token.to_string();
                row.expires_at = expires_at;
                row.updated_at = Utc::now();
                Ok(())
            }
            None => Err(CredentialError::StorageFailed {
                reason: format!("no credential for user {user_id} app {app}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn token_set(access: &str) -> TokenSet {
        TokenSet {
            access_token: access.to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            metadata: json!({"authed_user": {"id": "U123"}}),
        }
    }

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let mut cred = Credential {
            id: CredentialId::new(),
            user_id: UserId::new(),
            app: AppName::Gmail,
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Some(now - Duration::minutes(5)),
            metadata: JsonValue::Null,
            created_at: now,
            updated_at: now,
        };
        assert!(cred.is_expired(now));

        cred.expires_at = Some(now + Duration::minutes(5));
        assert!(!cred.is_expired(now));

        cred.expires_at = None;
        assert!(!cred.is_expired(now));
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = InMemoryCredentialStore::new();
        let user = UserId::new();

        let first = store
            .save(user, AppName::Slack, token_set("tok1"))
            .await
            .unwrap();
        let second = store
            .save(user, AppName::Slack, token_set("tok2"))
            .await
            .unwrap();

        // Same row, refreshed contents.
        assert_eq!(first.id, second.id);
        let loaded = store.load(user, AppName::Slack).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "tok2");
    }

    #[tokio::test]
    async fn update_access_rewrites_in_place() {
        let store = InMemoryCredentialStore::new();
        let user = UserId::new();
        store
            .save(user, AppName::Gmail, token_set("old"))
            .await
            .unwrap();

        let new_expiry = Utc::now() + Duration::hours(2);
        store
            .update_access(user, AppName::Gmail, "new", Some(new_expiry))
            .await
            .unwrap();

        let loaded = store.load(user, AppName::Gmail).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "new");
        assert_eq!(loaded.expires_at, Some(new_expiry));
        // Refresh token survives an access-token rewrite.
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn empty_access_token_is_rejected() {
        let store = InMemoryCredentialStore::new();
        let user = UserId::new();

        let mut tokens = token_set("x");
        tokens.access_token = String::new();
        assert_eq!(
            store.save(user, AppName::Gmail, tokens).await.unwrap_err(),
            CredentialError::EmptyAccessToken
        );
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = InMemoryCredentialStore::new();
        let loaded = store.load(UserId::new(), AppName::Github).await.unwrap();
        assert!(loaded.is_none());
    }
}
