//! Postgres event log (C10).
//!
//! Rows are append-only; `run_id` is nulled by the database when a run is
//! deleted, so the trail outlives the runs it explains.

use crate::db::decode_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{
    EventLog, EventLogError, EventType, LogEntry, LogEntryId, LogFilter, UserId, WorkflowId,
    WorkflowRunId,
};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Repository for event-log rows.
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    /// Creates a new repository.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn query_entries(
        &self,
        column: &str,
        key: String,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        let sql = format!(
            "SELECT id, event_type, details, user_id, workflow_id, run_id, created_at \
             FROM event_log \
             WHERE {column} = $1 AND ($2::text IS NULL OR event_type = $2) \
             ORDER BY created_at DESC LIMIT $3"
        );

        let rows: Vec<LogRow> = sqlx::query_as(&sql)
            .bind(key)
            .bind(filter.event_type.map(|t| t.as_str()))
            .bind(i64::from(filter.effective_limit()))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_failed)?;

        rows.into_iter().map(|r| r.try_into_record()).collect()
    }
}

#[derive(FromRow)]
struct LogRow {
    id: String,
    event_type: String,
    details: serde_json::Value,
    user_id: Option<String>,
    workflow_id: Option<String>,
    run_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl LogRow {
    fn try_into_record(self) -> Result<LogEntry, EventLogError> {
        let id = LogEntryId::from_str(&self.id).map_err(|e| EventLogError::StorageFailed {
            reason: decode_error("invalid log id", e),
        })?;
        let event_type =
            EventType::parse(&self.event_type).ok_or_else(|| EventLogError::StorageFailed {
                reason: decode_error("invalid event type", &self.event_type),
            })?;

        Ok(LogEntry {
            id,
            event_type,
            details: self.details,
            user_id: parse_ref(self.user_id, "invalid user id")?,
            workflow_id: parse_ref(self.workflow_id, "invalid workflow id")?,
            run_id: parse_ref(self.run_id, "invalid run id")?,
            created_at: self.created_at,
        })
    }
}

fn parse_ref<T>(value: Option<String>, what: &str) -> Result<Option<T>, EventLogError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            T::from_str(&raw).map_err(|e| EventLogError::StorageFailed {
                reason: decode_error(what, e),
            })
        })
        .transpose()
}

fn storage_failed(e: sqlx::Error) -> EventLogError {
    EventLogError::StorageFailed {
        reason: e.to_string(),
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, entry: LogEntry) -> Result<(), EventLogError> {
        sqlx::query(
            r#"
            INSERT INTO event_log
                (id, event_type, details, user_id, workflow_id, run_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.event_type.as_str())
        .bind(&entry.details)
        .bind(entry.user_id.map(|id| id.to_string()))
        .bind(entry.workflow_id.map(|id| id.to_string()))
        .bind(entry.run_id.map(|id| id.to_string()))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_failed)?;

        Ok(())
    }

    async fn list_for_workflow(
        &self,
        workflow_id: WorkflowId,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        self.query_entries("workflow_id", workflow_id.to_string(), filter)
            .await
    }

    async fn list_for_run(
        &self,
        run_id: WorkflowRunId,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        self.query_entries("run_id", run_id.to_string(), filter).await
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventLogError> {
        let result = sqlx::query("DELETE FROM event_log WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage_failed)?;

        Ok(result.rows_affected())
    }
}
