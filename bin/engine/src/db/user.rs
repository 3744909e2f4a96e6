//! Postgres user lookups.
//!
//! Registration and deletion are owned by an external collaborator; the
//! engine only resolves ownership.

use crate::db::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{User, UserId};
use patchbay_workflow::{StoreError, UserStore};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Repository for user rows.
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct UserRow {
    id: String,
    email: String,
    display_name: String,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn try_into_record(self) -> Result<User, StoreError> {
        let id = UserId::from_str(&self.id).map_err(|e| StoreError::StorageFailed {
            reason: decode_error("invalid user id", e),
        })?;
        Ok(User {
            id,
            email: self.email,
            display_name: self.display_name,
            created_at: self.created_at,
        })
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, email, display_name, created_at FROM users WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::StorageFailed {
            reason: e.to_string(),
        })?;

        match row {
            Some(row) => Ok(Some(row.try_into_record()?)),
            None => Ok(None),
        }
    }
}
