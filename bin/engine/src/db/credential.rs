//! Postgres credential store (C1).
//!
//! The only repository that projects token columns; everything else reads
//! credentials through the dispatcher. Sensitive fields are selected solely
//! by [`CredentialStore::load`].

use crate::db::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{AppName, CredentialId, UserId};
use patchbay_integration::{Credential, CredentialError, CredentialStore, TokenSet};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Repository for credential rows.
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct CredentialRow {
    id: String,
    user_id: String,
    app: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CredentialRow {
    fn try_into_record(self) -> Result<Credential, CredentialError> {
        let id = CredentialId::from_str(&self.id).map_err(|e| CredentialError::StorageFailed {
            reason: decode_error("invalid credential id", e),
        })?;
        let user_id = UserId::from_str(&self.user_id).map_err(|e| {
            CredentialError::StorageFailed {
                reason: decode_error("invalid user id", e),
            }
        })?;
        let app = AppName::from_str(&self.app).map_err(|e| CredentialError::StorageFailed {
            reason: decode_error("invalid app name", e),
        })?;

        Ok(Credential {
            id,
            user_id,
            app,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn storage_failed(e: sqlx::Error) -> CredentialError {
    CredentialError::StorageFailed {
        reason: e.to_string(),
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn load(
        &self,
        user_id: UserId,
        app: AppName,
    ) -> Result<Option<Credential>, CredentialError> {
        let row: Option<CredentialRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, app, access_token, refresh_token, expires_at,
                   metadata, created_at, updated_at
            FROM credentials
            WHERE user_id = $1 AND app = $2
            "#,
        )
        .bind(user_id.to_string())
        .bind(app.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_failed)?;

        match row {
            Some(row) => Ok(Some(row.try_into_record()?)),
            None => Ok(None),
        }
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
        let row: CredentialRow = sqlx::query_as(
            r#"
            INSERT INTO credentials
                (id, user_id, app, access_token, refresh_token, expires_at,
                 metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (user_id, app) DO UPDATE
            SET access_token = EXCLUDED.access_token,
                refresh_token = COALESCE(EXCLUDED.refresh_token, credentials.refresh_token),
                expires_at = EXCLUDED.expires_at,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            RETURNING id, user_id, app, access_token, refresh_token, expires_at,
                      metadata, created_at, updated_at
            "#,
        )
        .bind(CredentialId::new().to_string())
        .bind(user_id.to_string())
        .bind(app.as_str())
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at)
        .bind(&tokens.metadata)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_failed)?;

        row.try_into_record()
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

        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = $3, expires_at = $4, updated_at = NOW()
            WHERE user_id = $1 AND app = $2
            "#,
        )
        .bind(user_id.to_string())
        .bind(app.as_str())
        .bind(access_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(storage_failed)?;

        if result.rows_affected() == 0 {
            return Err(CredentialError::StorageFailed {
                reason: format!("no credential for user {user_id} app {app}"),
            });
        }
        Ok(())
    }
}
