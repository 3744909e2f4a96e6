//! Postgres run store.

use crate::db::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{WorkflowId, WorkflowRunId};
use patchbay_workflow::{RunError, RunStatus, RunStore, WorkflowRun};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Repository for workflow-run rows.
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RUN_COLUMNS: &str = "id, workflow_id, status, trigger_data, execution_log, \
     retry_count, error, started_at, finished_at";

#[derive(FromRow)]
struct RunRow {
    id: String,
    workflow_id: String,
    status: String,
    trigger_data: serde_json::Value,
    execution_log: serde_json::Value,
    retry_count: i32,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn try_into_record(self) -> Result<WorkflowRun, RunError> {
        let id = WorkflowRunId::from_str(&self.id).map_err(|e| RunError::StorageFailed {
            reason: decode_error("invalid run id", e),
        })?;
        let workflow_id =
            WorkflowId::from_str(&self.workflow_id).map_err(|e| RunError::StorageFailed {
                reason: decode_error("invalid workflow id", e),
            })?;
        let status = RunStatus::parse(&self.status).ok_or_else(|| RunError::StorageFailed {
            reason: decode_error("invalid run status", &self.status),
        })?;
        let execution_log =
            serde_json::from_value(self.execution_log).map_err(|e| RunError::StorageFailed {
                reason: decode_error("invalid execution log", e),
            })?;

        Ok(WorkflowRun {
            id,
            workflow_id,
            status,
            trigger_data: self.trigger_data,
            execution_log,
            retry_count: self.retry_count.max(0) as u32,
            error: self.error,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

fn storage_failed(e: sqlx::Error) -> RunError {
    RunError::StorageFailed {
        reason: e.to_string(),
    }
}

fn encode_log(run: &WorkflowRun) -> Result<serde_json::Value, RunError> {
    serde_json::to_value(&run.execution_log).map_err(|e| RunError::StorageFailed {
        reason: decode_error("failed to encode execution log", e),
    })
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create(&self, run: &WorkflowRun) -> Result<(), RunError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, status, trigger_data, execution_log,
                 retry_count, error, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.status.as_str())
        .bind(&run.trigger_data)
        .bind(encode_log(run)?)
        .bind(run.retry_count as i32)
        .bind(&run.error)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(storage_failed)?;

        Ok(())
    }

    async fn update(&self, run: &WorkflowRun) -> Result<(), RunError> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, execution_log = $3, retry_count = $4,
                error = $5, finished_at = $6
            WHERE id = $1
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.status.as_str())
        .bind(encode_log(run)?)
        .bind(run.retry_count as i32)
        .bind(&run.error)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(storage_failed)?;

        Ok(())
    }

    async fn find(&self, id: WorkflowRunId) -> Result<Option<WorkflowRun>, RunError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"
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

    async fn list_for_workflow(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RunError> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs \
             WHERE workflow_id = $1 ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(workflow_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_failed)?;

        rows.into_iter().map(|r| r.try_into_record()).collect()
    }

    async fn delete_for_workflow(&self, workflow_id: WorkflowId) -> Result<u64, RunError> {
        let result = sqlx::query("DELETE FROM workflow_runs WHERE workflow_id = $1")
            .bind(workflow_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_failed)?;

        Ok(result.rows_affected())
    }
}
