//! The in-process workflow service consumed by the CRUD collaborator.
//!
//! Owns the workflow lifecycle: create (validated, activated immediately),
//! activate/deactivate, update, remove (cascading runs and processed
//! triggers; log rows survive), plus the one-shot `test` execution and
//! log-query passthroughs. Deactivation is soft: in-flight runs complete,
//! pending jobs are purged from the queue.

use chrono::Utc;
use patchbay_core::{
    EventLog, EventLogError, EventType, InMemoryEventLog, LogEntry, LogFilter, UserId, WorkflowId,
    WorkflowRunId,
};
use patchbay_scheduler::EventSource;
use patchbay_workflow::{
    ActionRunner, Interpreter, JobQueue, ProcessedTriggerStore, RunStore, Step, StepRecord,
    StoreError, Workflow, WorkflowRun, WorkflowStore, WorkflowValidationError,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::sync::Arc;

/// A workflow definition as posted by the CRUD layer.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    /// Name, unique per user.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// The step graph.
    pub steps: Vec<Step>,
}

/// A partial update to a workflow.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowPatch {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// Replacement step graph.
    #[serde(default)]
    pub steps: Option<Vec<Step>>,
}

/// Errors surfaced to the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The step graph violates a structural invariant.
    Validation(WorkflowValidationError),
    /// Another workflow of this user already carries the name.
    NameTaken { name: String },
    /// The workflow does not exist or is not owned by the caller.
    NotFound,
    /// Storage or queue failure.
    Storage { reason: String },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "invalid workflow: {e}"),
            Self::NameTaken { name } => write!(f, "workflow name already in use: {name}"),
            Self::NotFound => write!(f, "workflow not found"),
            Self::Storage { reason } => write!(f, "storage failure: {reason}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<WorkflowValidationError> for ServiceError {
    fn from(e: WorkflowValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NameTaken { name } => Self::NameTaken { name },
            StoreError::NotFound => Self::NotFound,
            StoreError::StorageFailed { reason } => Self::Storage { reason },
        }
    }
}

impl From<EventLogError> for ServiceError {
    fn from(e: EventLogError) -> Self {
        Self::Storage {
            reason: e.to_string(),
        }
    }
}

/// The workflow lifecycle service.
pub struct WorkflowService {
    workflows: Arc<dyn WorkflowStore>,
    runs: Arc<dyn RunStore>,
    processed: Arc<dyn ProcessedTriggerStore>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventLog>,
    actions: Arc<dyn ActionRunner>,
    source: Arc<dyn EventSource>,
}

impl WorkflowService {
    /// Creates the service over its collaborators.
    #[must_use]
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        runs: Arc<dyn RunStore>,
        processed: Arc<dyn ProcessedTriggerStore>,
        queue: Arc<dyn JobQueue>,
        events: Arc<dyn EventLog>,
        actions: Arc<dyn ActionRunner>,
        source: Arc<dyn EventSource>,
    ) -> Self {
        Self {
            workflows,
            runs,
            processed,
            queue,
            events,
            actions,
            source,
        }
    }

    /// Creates and immediately activates a workflow.
    pub async fn create_workflow(
        &self,
        user_id: UserId,
        definition: WorkflowDefinition,
    ) -> Result<Workflow, ServiceError> {
        let workflow = Workflow::new(
            user_id,
            definition.name,
            definition.description,
            definition.steps,
        )?;
        self.workflows.create(&workflow).await?;

        self.log(&workflow, EventType::WorkflowCreated, json!({ "name": workflow.name }))
            .await;
        self.log(&workflow, EventType::WorkflowActivated, json!({}))
            .await;

        tracing::info!(workflow_id = %workflow.id, name = workflow.name, "workflow created");
        Ok(workflow)
    }

    /// Activates a workflow, re-deriving its polling interval.
    pub async fn activate(&self, id: WorkflowId, user_id: UserId) -> Result<(), ServiceError> {
        let mut workflow = self.owned(id, user_id).await?;
        workflow.is_active = true;
        workflow.refresh_polling_interval();
        self.workflows.update(&workflow).await?;

        self.log(&workflow, EventType::WorkflowActivated, json!({}))
            .await;
        Ok(())
    }

    /// Deactivates a workflow and purges its pending jobs.
    ///
    /// Soft: in-flight runs complete.
    pub async fn deactivate(&self, id: WorkflowId, user_id: UserId) -> Result<(), ServiceError> {
        let workflow = self.owned(id, user_id).await?;
        self.workflows.set_active(workflow.id, false).await?;

        match self.queue.remove_jobs_for(workflow.id).await {
            Ok(removed) if removed > 0 => {
                tracing::info!(workflow_id = %workflow.id, removed, "purged pending jobs");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(workflow_id = %workflow.id, error = %e, "failed to purge jobs");
            }
        }

        self.log(&workflow, EventType::WorkflowDeactivated, json!({}))
            .await;
        Ok(())
    }

    /// Lists the caller's workflows.
    pub async fn find_all(&self, user_id: UserId) -> Result<Vec<Workflow>, ServiceError> {
        Ok(self.workflows.list_for_user(user_id).await?)
    }

    /// Finds one workflow, scoped to the caller.
    pub async fn find_one(
        &self,
        id: WorkflowId,
        user_id: UserId,
    ) -> Result<Workflow, ServiceError> {
        self.owned(id, user_id).await
    }

    /// Applies a patch, re-validating and re-deriving the polling interval.
    pub async fn update(
        &self,
        id: WorkflowId,
        user_id: UserId,
        patch: WorkflowPatch,
    ) -> Result<Workflow, ServiceError> {
        let mut workflow = self.owned(id, user_id).await?;

        if let Some(name) = patch.name {
            workflow.name = name;
        }
        if let Some(description) = patch.description {
            workflow.description = description;
        }
        if let Some(steps) = patch.steps {
            workflow.steps = steps;
        }
        workflow.validate()?;
        workflow.refresh_polling_interval();
        workflow.updated_at = Utc::now();

        self.workflows.update(&workflow).await?;
        Ok(workflow)
    }

    /// Removes a workflow: deactivate, purge jobs, cascade-delete runs and
    /// processed triggers. Log rows survive with nulled backreferences.
    pub async fn remove(&self, id: WorkflowId, user_id: UserId) -> Result<(), ServiceError> {
        let workflow = self.owned(id, user_id).await?;

        self.workflows.set_active(workflow.id, false).await?;
        if let Err(e) = self.queue.remove_jobs_for(workflow.id).await {
            tracing::warn!(workflow_id = %workflow.id, error = %e, "failed to purge jobs");
        }
        self.log(&workflow, EventType::WorkflowDeactivated, json!({}))
            .await;

        if let Err(e) = self.runs.delete_for_workflow(workflow.id).await {
            return Err(ServiceError::Storage {
                reason: e.to_string(),
            });
        }
        if let Err(e) = self.processed.delete_for_workflow(workflow.id).await {
            return Err(ServiceError::Storage {
                reason: e.to_string(),
            });
        }
        self.workflows.delete(workflow.id).await?;

        tracing::info!(workflow_id = %workflow.id, "workflow removed");
        Ok(())
    }

    /// Executes a definition once without persistence.
    ///
    /// Uses `sample` as the trigger payload when given; otherwise runs the
    /// detector once and takes the newest candidate, falling back to an
    /// empty payload. Nothing is written: no run row, no processed trigger,
    /// no event-log entries.
    pub async fn test(
        &self,
        user_id: UserId,
        definition: WorkflowDefinition,
        sample: Option<JsonValue>,
    ) -> Result<Vec<StepRecord>, ServiceError> {
        let workflow = Workflow::new(
            user_id,
            definition.name,
            definition.description,
            definition.steps,
        )?;

        let payload = match sample {
            Some(sample) => sample,
            None => {
                let trigger = workflow.trigger_step().ok_or(ServiceError::Validation(
                    WorkflowValidationError::NoTrigger,
                ))?;
                match self.source.detect(user_id, trigger).await {
                    Ok(events) if !events.is_empty() => events[0].data.clone(),
                    Ok(_) => json!({ "trigger": {} }),
                    Err(e) => {
                        tracing::debug!(error = %e, "test detection failed, using empty payload");
                        json!({ "trigger": {} })
                    }
                }
            }
        };

        // A throwaway event sink keeps test runs out of the persistent log.
        let interpreter = Interpreter::new(self.actions.clone(), Arc::new(InMemoryEventLog::new()));
        let records = interpreter
            .execute(user_id, &workflow.steps, &payload, workflow.id, None)
            .await
            .map_err(|e| ServiceError::Storage {
                reason: e.to_string(),
            })?;
        Ok(records)
    }

    /// Log entries for a workflow, ownership-checked.
    pub async fn logs_for_workflow(
        &self,
        user_id: UserId,
        id: WorkflowId,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, ServiceError> {
        let workflow = self.owned(id, user_id).await?;
        Ok(self.events.list_for_workflow(workflow.id, filter).await?)
    }

    /// Log entries for a run, ownership-checked through its workflow.
    pub async fn logs_for_run(
        &self,
        user_id: UserId,
        run_id: WorkflowRunId,
        filter: LogFilter,
    ) -> Result<Vec<LogEntry>, ServiceError> {
        let run = self
            .runs
            .find(run_id)
            .await
            .map_err(|e| ServiceError::Storage {
                reason: e.to_string(),
            })?
            .ok_or(ServiceError::NotFound)?;
        self.owned(run.workflow_id, user_id).await?;
        Ok(self.events.list_for_run(run_id, filter).await?)
    }

    /// Recent runs for a workflow, ownership-checked.
    pub async fn runs_for_workflow(
        &self,
        user_id: UserId,
        id: WorkflowId,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, ServiceError> {
        let workflow = self.owned(id, user_id).await?;
        self.runs
            .list_for_workflow(workflow.id, limit)
            .await
            .map_err(|e| ServiceError::Storage {
                reason: e.to_string(),
            })
    }

    async fn owned(&self, id: WorkflowId, user_id: UserId) -> Result<Workflow, ServiceError> {
        self.workflows
            .find_for_user(id, user_id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    async fn log(&self, workflow: &Workflow, event_type: EventType, details: JsonValue) {
        let entry = LogEntry::new(event_type, details)
            .with_user(workflow.user_id)
            .with_workflow(workflow.id);
        if let Err(e) = self.events.append(entry).await {
            tracing::warn!(error = %e, "failed to append event log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_core::AppName;
    use patchbay_scheduler::StaticEventSource;
    use patchbay_workflow::{
        ActionStep, InMemoryJobQueue, InMemoryProcessedTriggerStore, InMemoryRunStore,
        InMemoryWorkflowStore, Job, MockActionRunner, TriggerStep,
    };
    use serde_json::Map;

    struct Harness {
        service: WorkflowService,
        workflows: Arc<InMemoryWorkflowStore>,
        runs: Arc<InMemoryRunStore>,
        processed: Arc<InMemoryProcessedTriggerStore>,
        queue: Arc<InMemoryJobQueue>,
        events: Arc<InMemoryEventLog>,
    }

    fn harness() -> Harness {
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let processed = Arc::new(InMemoryProcessedTriggerStore::new());
        let queue = Arc::new(InMemoryJobQueue::default());
        let events = Arc::new(InMemoryEventLog::new());

        let service = WorkflowService::new(
            workflows.clone(),
            runs.clone(),
            processed.clone(),
            queue.clone(),
            events.clone(),
            Arc::new(MockActionRunner::succeeding()),
            Arc::new(StaticEventSource::new(Vec::new())),
        );
        Harness {
            service,
            workflows,
            runs,
            processed,
            queue,
            events,
        }
    }

    fn definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.into(),
            description: String::new(),
            steps: vec![
                Step::Trigger(TriggerStep {
                    id: "1".into(),
                    app_name: AppName::Gmail,
                    trigger_id: "new_email".into(),
                    config: Map::new(),
                    next: None,
                }),
                Step::Action(ActionStep {
                    id: "2".into(),
                    app_name: AppName::Slack,
                    action_id: Some("send_channel_message".into()),
                    config: Map::new(),
                    next: None,
                }),
            ],
        }
    }

    #[tokio::test]
    async fn create_activates_and_logs() {
        let h = harness();
        let user = UserId::new();

        let workflow = h.service.create_workflow(user, definition("inbox")).await.unwrap();
        assert!(workflow.is_active);
        assert_eq!(workflow.polling_interval_seconds, 60);

        let types: Vec<EventType> = h.events.entries().iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::WorkflowCreated));
        assert!(types.contains(&EventType::WorkflowActivated));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let h = harness();
        let user = UserId::new();
        h.service.create_workflow(user, definition("inbox")).await.unwrap();

        let err = h
            .service
            .create_workflow(user, definition("inbox"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NameTaken { .. }));
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected() {
        let h = harness();
        let mut bad = definition("broken");
        bad.steps.remove(0); // drop the trigger

        let err = h.service.create_workflow(UserId::new(), bad).await.unwrap_err();
        assert_eq!(
            err,
            ServiceError::Validation(WorkflowValidationError::NoTrigger)
        );
    }

    #[tokio::test]
    async fn deactivation_purges_pending_jobs() {
        let h = harness();
        let user = UserId::new();
        let workflow = h.service.create_workflow(user, definition("inbox")).await.unwrap();

        // Two jobs waiting for this workflow.
        for _ in 0..2 {
            h.queue
                .enqueue(Job::new(workflow.id, user, json!({})))
                .await
                .unwrap();
        }
        assert_eq!(h.queue.waiting_count(), 2);

        h.service.deactivate(workflow.id, user).await.unwrap();

        let stored = h.workflows.find(workflow.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(h.queue.waiting_count(), 0);

        let types: Vec<EventType> = h.events.entries().iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::WorkflowDeactivated));
    }

    #[tokio::test]
    async fn remove_cascades_runs_and_processed_triggers() {
        let h = harness();
        let user = UserId::new();
        let workflow = h.service.create_workflow(user, definition("inbox")).await.unwrap();

        h.runs
            .create(&WorkflowRun::new(workflow.id, json!({}), 0))
            .await
            .unwrap();
        h.processed
            .record(patchbay_workflow::ProcessedTrigger::new(
                workflow.id,
                "new_email",
                "m1",
                json!({}),
            ))
            .await
            .unwrap();

        h.service.remove(workflow.id, user).await.unwrap();

        assert!(h.workflows.find(workflow.id).await.unwrap().is_none());
        assert!(h.runs.all().is_empty());
        assert!(h.processed.is_empty());
        // The event trail survives removal.
        assert!(!h.events.entries().is_empty());
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let h = harness();
        let owner = UserId::new();
        let workflow = h.service.create_workflow(owner, definition("inbox")).await.unwrap();

        let stranger = UserId::new();
        assert_eq!(
            h.service.find_one(workflow.id, stranger).await.unwrap_err(),
            ServiceError::NotFound
        );
        assert_eq!(
            h.service.deactivate(workflow.id, stranger).await.unwrap_err(),
            ServiceError::NotFound
        );
    }

    #[tokio::test]
    async fn update_revalidates_and_rederives_interval() {
        let h = harness();
        let user = UserId::new();
        let workflow = h.service.create_workflow(user, definition("inbox")).await.unwrap();
        assert_eq!(workflow.polling_interval_seconds, 60);

        // Swap the trigger to Slack: interval becomes 30 s.
        let mut steps = workflow.steps.clone();
        if let Step::Trigger(t) = &mut steps[0] {
            t.app_name = AppName::Slack;
            t.trigger_id = "new_channel_message".into();
        }
        let updated = h
            .service
            .update(
                workflow.id,
                user,
                WorkflowPatch {
                    steps: Some(steps),
                    ..WorkflowPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.polling_interval_seconds, 30);
    }

    #[tokio::test]
    async fn test_executes_without_persistence() {
        let h = harness();
        let user = UserId::new();

        let records = h
            .service
            .test(
                user,
                definition("dry run"),
                Some(json!({ "trigger": { "from": "a@x.com" } })),
            )
            .await
            .unwrap();

        assert_eq!(records.len(), 1); // the action record
        // Nothing persisted anywhere.
        assert!(h.runs.all().is_empty());
        assert!(h.processed.is_empty());
        assert!(h.events.entries().is_empty());
        assert!(h.workflows.list_for_user(user).await.unwrap().is_empty());
    }
}
