//! Postgres workflow store.
//!
//! Step lists round-trip through the `steps` jsonb column. The `(user_id,
//! name)` UNIQUE constraint backs the per-user name invariant; violations
//! surface as [`StoreError::NameTaken`].

use crate::db::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{UserId, WorkflowId};
use patchbay_workflow::{StoreError, Workflow, WorkflowStore};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Repository for workflow rows.
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const WORKFLOW_COLUMNS: &str = "id, user_id, name, description, is_active, \
     polling_interval_seconds, last_run_at, steps, created_at, updated_at";

#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    user_id: String,
    name: String,
    description: String,
    is_active: bool,
    polling_interval_seconds: i64,
    last_run_at: Option<DateTime<Utc>>,
    steps: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn try_into_record(self) -> Result<Workflow, StoreError> {
        let id = WorkflowId::from_str(&self.id).map_err(|e| StoreError::StorageFailed {
            reason: decode_error("invalid workflow id", e),
        })?;
        let user_id = UserId::from_str(&self.user_id).map_err(|e| StoreError::StorageFailed {
            reason: decode_error("invalid user id", e),
        })?;
        let steps = serde_json::from_value(self.steps).map_err(|e| StoreError::StorageFailed {
            reason: decode_error("invalid steps payload", e),
        })?;

        Ok(Workflow {
            id,
            user_id,
            name: self.name,
            description: self.description,
            is_active: self.is_active,
            polling_interval_seconds: self.polling_interval_seconds.max(0) as u64,
            last_run_at: self.last_run_at,
            steps,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn map_write_error(e: sqlx::Error, name: &str) -> StoreError {
    if let Some(db) = e.as_database_error()
        && db.is_unique_violation()
    {
        return StoreError::NameTaken {
            name: name.to_string(),
        };
    }
    StoreError::StorageFailed {
        reason: e.to_string(),
    }
}

fn storage_failed(e: sqlx::Error) -> StoreError {
    StoreError::StorageFailed {
        reason: e.to_string(),
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn create(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let steps = serde_json::to_value(&workflow.steps).map_err(|e| {
            StoreError::StorageFailed {
                reason: decode_error("failed to encode steps", e),
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO workflows
                (id, user_id, name, description, is_active,
                 polling_interval_seconds, last_run_at, steps, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(workflow.user_id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.is_active)
        .bind(workflow.polling_interval_seconds as i64)
        .bind(workflow.last_run_at)
        .bind(steps)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &workflow.name))?;

        Ok(())
    }

    async fn find(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_failed)?;

        match row {
            Some(row) => Ok(Some(row.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn find_for_user(
        &self,
        id: WorkflowId,
        user_id: UserId,
    ) -> Result<Option<Workflow>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1 AND user_id = $2"
        ))
        .bind(id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_failed)?;

        match row {
            Some(row) => Ok(Some(row.try_into_record()?)),
            None => Ok(None),
        }
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Workflow>, StoreError> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE user_id = $1 ORDER BY created_at ASC"
        ))
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_failed)?;

        rows.into_iter().map(|r| r.try_into_record()).collect()
    }

    async fn list_active(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE is_active = TRUE ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_failed)?;

        rows.into_iter().map(|r| r.try_into_record()).collect()
    }

    async fn update(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let steps = serde_json::to_value(&workflow.steps).map_err(|e| {
            StoreError::StorageFailed {
                reason: decode_error("failed to encode steps", e),
            }
        })?;

        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET name = $2, description = $3, is_active = $4,
                polling_interval_seconds = $5, steps = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.is_active)
        .bind(workflow.polling_interval_seconds as i64)
        .bind(steps)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &workflow.name))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_active(&self, id: WorkflowId, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflows SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(storage_failed)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn touch_last_run(&self, id: WorkflowId, at: DateTime<Utc>) -> Result<(), StoreError> {
        // Targeted single-column write; never touches steps or flags.
        let result = sqlx::query("UPDATE workflows SET last_run_at = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(storage_failed)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: WorkflowId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_failed)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
