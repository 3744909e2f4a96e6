//! Postgres processed-trigger store (C5).
//!
//! The UNIQUE index on `(workflow_id, trigger_type, external_id)` makes
//! `record` idempotent: the duplicate insert from a racing poller or retried
//! job lands on `ON CONFLICT DO NOTHING`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::WorkflowId;
use patchbay_workflow::{DedupError, ProcessedTrigger, ProcessedTriggerStore};
use sqlx::{PgPool, Row};
use std::collections::HashSet;

/// Repository for processed-trigger rows.
pub struct PgProcessedTriggerStore {
    pool: PgPool,
}

impl PgProcessedTriggerStore {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_failed(e: sqlx::Error) -> DedupError {
    DedupError::StorageFailed {
        reason: e.to_string(),
    }
}

#[async_trait]
impl ProcessedTriggerStore for PgProcessedTriggerStore {
    async fn filter_unprocessed(
        &self,
        workflow_id: WorkflowId,
        trigger_type: &str,
        external_ids: Vec<String>,
    ) -> Result<Vec<String>, DedupError> {
        if external_ids.is_empty() {
            return Ok(external_ids);
        }

        let rows = sqlx::query(
            r#"
            SELECT external_id FROM processed_triggers
            WHERE workflow_id = $1 AND trigger_type = $2
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(trigger_type)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_failed)?;

        let processed: HashSet<String> = rows
            .into_iter()
            .map(|row| row.get::<String, _>("external_id"))
            .collect();

        Ok(external_ids
            .into_iter()
            .filter(|id| !processed.contains(id))
            .collect())
    }

    async fn record(&self, row: ProcessedTrigger) -> Result<bool, DedupError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_triggers
                (workflow_id, trigger_type, external_id, metadata, processed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_id, trigger_type, external_id) DO NOTHING
            "#,
        )
        .bind(row.workflow_id.to_string())
        .bind(&row.trigger_type)
        .bind(&row.external_id)
        .bind(&row.metadata)
        .bind(row.processed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_failed)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_for_workflow(&self, workflow_id: WorkflowId) -> Result<u64, DedupError> {
        let result = sqlx::query("DELETE FROM processed_triggers WHERE workflow_id = $1")
            .bind(workflow_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_failed)?;

        Ok(result.rows_affected())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DedupError> {
        let result = sqlx::query("DELETE FROM processed_triggers WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage_failed)?;

        Ok(result.rows_affected())
    }
}
