//! Workflow run records and their storage contract.
//!
//! One [`WorkflowRun`] row exists per execution attempt. The executor is the
//! only writer; a run becomes immutable once its status leaves `running`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{WorkflowId, WorkflowRunId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The executor is walking the step graph.
    Running,
    /// The run finished; every reached step succeeded.
    Success,
    /// The run raised; `error` carries the message.
    Failed,
}

impl RunStatus {
    /// Returns the snake_case name used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parses the storage name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true once the run can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// One entry of a run's execution log: what a step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepRecord {
    /// A condition step evaluated; `next` is the chosen target (absent when
    /// the run terminated here).
    Condition {
        /// The condition step id.
        step_id: String,
        /// Chosen next step id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
    },
    /// An action step executed.
    Action {
        /// The action step id.
        step_id: String,
        /// The resolved action id.
        action_id: String,
        /// `success` or `failed`.
        status: crate::action::ActionStatus,
        /// Short human-readable summary.
        detail: String,
    },
}

/// One execution instance of a workflow for one triggering event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier.
    pub id: WorkflowRunId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Current status.
    pub status: RunStatus,
    /// The full normalized detector payload, verbatim.
    pub trigger_data: JsonValue,
    /// Per-step result summaries.
    pub execution_log: Vec<StepRecord>,
    /// Queue attempts consumed when this run finished (0 on the first try).
    pub retry_count: u32,
    /// Failure message for failed runs.
    pub error: Option<String>,
    /// When the executor picked the job up.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Creates a running record for a dequeued job.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, trigger_data: JsonValue, retry_count: u32) -> Self {
        Self {
            id: WorkflowRunId::new(),
            workflow_id,
            status: RunStatus::Running,
            trigger_data,
            execution_log: Vec::new(),
            retry_count,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Marks the run successful.
    pub fn complete(&mut self, execution_log: Vec<StepRecord>) {
        self.status = RunStatus::Success;
        self.execution_log = execution_log;
        self.finished_at = Some(Utc::now());
    }

    /// Marks the run failed, keeping whatever partial log exists and
    /// counting the spent attempt.
    pub fn fail(&mut self, error: impl Into<String>, execution_log: Vec<StepRecord>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.execution_log = execution_log;
        self.retry_count += 1;
        self.finished_at = Some(Utc::now());
    }
}

/// Errors from run storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// The underlying store rejected the operation.
    StorageFailed { reason: String },
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageFailed { reason } => write!(f, "run storage failed: {reason}"),
        }
    }
}

impl std::error::Error for RunError {}

/// Storage contract for workflow runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persists a new run row.
    async fn create(&self, run: &WorkflowRun) -> Result<(), RunError>;

    /// Rewrites an existing run row.
    async fn update(&self, run: &WorkflowRun) -> Result<(), RunError>;

    /// Finds a run by id.
    async fn find(&self, id: WorkflowRunId) -> Result<Option<WorkflowRun>, RunError>;

    /// Lists recent runs for a workflow, newest first.
    async fn list_for_workflow(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RunError>;

    /// Deletes all runs of a workflow (cascade on workflow removal),
    /// returning the count removed.
    async fn delete_for_workflow(&self, workflow_id: WorkflowId) -> Result<u64, RunError>;
}

/// In-memory run store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryRunStore {
    rows: Arc<Mutex<HashMap<WorkflowRunId, WorkflowRun>>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all runs, unordered.
    #[must_use]
    pub fn all(&self) -> Vec<WorkflowRun> {
        self.rows.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: &WorkflowRun) -> Result<(), RunError> {
        self.rows.lock().unwrap().insert(run.id, run.clone());
        Ok(())
    }

    async fn update(&self, run: &WorkflowRun) -> Result<(), RunError> {
        self.rows.lock().unwrap().insert(run.id, run.clone());
        Ok(())
    }

    async fn find(&self, id: WorkflowRunId) -> Result<Option<WorkflowRun>, RunError> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn list_for_workflow(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RunError> {
        let rows = self.rows.lock().unwrap();
        let mut runs: Vec<WorkflowRun> = rows
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn delete_for_workflow(&self, workflow_id: WorkflowId) -> Result<u64, RunError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, r| r.workflow_id != workflow_id);
        Ok((before - rows.len()) as u64)
    }
}
