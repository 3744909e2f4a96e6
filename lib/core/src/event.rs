//! Append-only event log for workflow lifecycle events.
//!
//! Every state change in the engine is recorded as a [`LogEntry`] so that any
//! run outcome can be explained after the fact. Entries are never updated;
//! the reaper deletes rows past the retention horizon.

use crate::id::{LogEntryId, UserId, WorkflowId, WorkflowRunId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Default number of entries returned by a log query.
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Hard cap on the number of entries returned by a log query.
pub const MAX_QUERY_LIMIT: u32 = 500;

/// The closed set of lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowCreated,
    WorkflowActivated,
    WorkflowDeactivated,
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    TriggerChecked,
    TriggerFired,
    ActionStarted,
    ActionCompleted,
    ActionFailed,
    TokenRefreshed,
}

impl EventType {
    /// Returns the snake_case name used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow_created",
            Self::WorkflowActivated => "workflow_activated",
            Self::WorkflowDeactivated => "workflow_deactivated",
            Self::WorkflowExecutionStarted => "workflow_execution_started",
            Self::WorkflowExecutionCompleted => "workflow_execution_completed",
            Self::WorkflowExecutionFailed => "workflow_execution_failed",
            Self::TriggerChecked => "trigger_checked",
            Self::TriggerFired => "trigger_fired",
            Self::ActionStarted => "action_started",
            Self::ActionCompleted => "action_completed",
            Self::ActionFailed => "action_failed",
            Self::TokenRefreshed => "token_refreshed",
        }
    }

    /// Parses the storage name back into an event type.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workflow_created" => Some(Self::WorkflowCreated),
            "workflow_activated" => Some(Self::WorkflowActivated),
            "workflow_deactivated" => Some(Self::WorkflowDeactivated),
            "workflow_execution_started" => Some(Self::WorkflowExecutionStarted),
            "workflow_execution_completed" => Some(Self::WorkflowExecutionCompleted),
            "workflow_execution_failed" => Some(Self::WorkflowExecutionFailed),
            "trigger_checked" => Some(Self::TriggerChecked),
            "trigger_fired" => Some(Self::TriggerFired),
            "action_started" => Some(Self::ActionStarted),
            "action_completed" => Some(Self::ActionCompleted),
            "action_failed" => Some(Self::ActionFailed),
            "token_refreshed" => Some(Self::TokenRefreshed),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique identifier.
    pub id: LogEntryId,
    /// What happened.
    pub event_type: EventType,
    /// Opaque structured detail blob.
    pub details: JsonValue,
    /// Owning user, when known.
    pub user_id: Option<UserId>,
    /// Related workflow, when known.
    pub workflow_id: Option<WorkflowId>,
    /// Related run, when known. Nulled when the run is deleted; the entry
    /// itself survives.
    pub run_id: Option<WorkflowRunId>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    /// Creates a new entry with no references.
    #[must_use]
    pub fn new(event_type: EventType, details: JsonValue) -> Self {
        Self {
            id: LogEntryId::new(),
            event_type,
            details,
            user_id: None,
            workflow_id: None,
            run_id: None,
            created_at: Utc::now(),
        }
    }

    /// Attaches the owning user.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Attaches the related workflow.
    #[must_use]
    pub fn with_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Attaches the related run.
    #[must_use]
    pub fn with_run(mut self, run_id: WorkflowRunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Filter for log queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFilter {
    /// Restrict to a single event type.
    pub event_type: Option<EventType>,
    /// Requested result cap; clamped to [`MAX_QUERY_LIMIT`].
    pub limit: Option<u32>,
}

impl LogFilter {
    /// Returns the effective result cap.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .min(MAX_QUERY_LIMIT)
    }
}

/// Errors from event-log storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventLogError {
    /// The underlying store rejected the operation.
    StorageFailed { reason: String },
}

impl fmt::Display for EventLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageFailed { reason } => write!(f, "event log storage failed: {reason}"),
        }
    }
}

impl std::error::Error for EventLogError {}

/// Storage contract for the event log.
///
/// Entries are append-only; the only deletion path is [`EventLog::prune_older_than`],
/// used by the reaper.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an entry.
    async fn append(&self, entry: LogEntry) -> Result<(), EventLogError>;

    /// Lists entries for a workflow, newest first.
    async fn list_for_workflow(
        &self,
        workflow_id: WorkflowId,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, EventLogError>;

    /// Lists entries for a run, newest first.
    async fn list_for_run(
        &self,
        run_id: WorkflowRunId,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, EventLogError>;

    /// Deletes entries created before the cutoff, returning the count removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventLogError>;
}

/// In-memory event log.
///
/// Backs tests and single-process deployments without a database.
#[derive(Default)]
pub struct InMemoryEventLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryEventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all entries in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    fn query<F>(&self, matches: F, filter: LogFilter) -> Vec<LogEntry>
    where
        F: Fn(&LogEntry) -> bool,
    {
        let entries = self.entries.lock().unwrap();
        let mut selected: Vec<LogEntry> = entries
            .iter()
            .filter(|e| matches(e))
            .filter(|e| {
                filter
                    .event_type
                    .is_none_or(|wanted| e.event_type == wanted)
            })
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        selected.truncate(filter.effective_limit() as usize);
        selected
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, entry: LogEntry) -> Result<(), EventLogError> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    async fn list_for_workflow(
        &self,
        workflow_id: WorkflowId,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        Ok(self.query(|e| e.workflow_id == Some(workflow_id), filter))
    }

    async fn list_for_run(
        &self,
        run_id: WorkflowRunId,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        Ok(self.query(|e| e.run_id == Some(run_id), filter))
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EventLogError> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}
