//! The executor (C8): a bounded worker pool that drives runs.
//!
//! Each worker loops: lease a job, open a run row, walk the step graph,
//! record the outcome. Success inserts the processed-trigger marker (a
//! duplicate insert is benign) and advances the workflow's poll clock.
//! Failures write a failed run and go back to the queue only when the error
//! is retryable; after the retry budget the job is terminal.

use crate::dedup::{ProcessedTrigger, ProcessedTriggerStore};
use crate::interpreter::Interpreter;
use crate::queue::{FailureDisposition, JobQueue, LeasedJob, QueueError};
use crate::run::{RunStore, WorkflowRun};
use crate::store::{UserStore, WorkflowStore};
use chrono::Utc;
use patchbay_core::{EventLog, EventType, LogEntry, WorkflowId};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long a worker blocks on an empty queue before checking again.
const FETCH_WAIT: Duration = Duration::from_secs(1);

/// What to do with an event whose job exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalFailurePolicy {
    /// Leave the event unprocessed. It may re-fire on a later poll while it
    /// is still among the newest unprocessed candidates.
    #[default]
    Skip,
    /// Mark the event processed so it can never re-fire.
    Record,
}

impl FromStr for TerminalFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "record" => Ok(Self::Record),
            other => Err(format!("unknown terminal-failure policy: {other}")),
        }
    }
}

/// Executor tuning.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Policy for terminally failed jobs.
    pub on_terminal_failure: TerminalFailurePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            on_terminal_failure: TerminalFailurePolicy::Skip,
        }
    }
}

/// The worker pool.
pub struct Executor {
    queue: Arc<dyn JobQueue>,
    workflows: Arc<dyn WorkflowStore>,
    users: Arc<dyn UserStore>,
    runs: Arc<dyn RunStore>,
    processed: Arc<dyn ProcessedTriggerStore>,
    interpreter: Arc<Interpreter>,
    events: Arc<dyn EventLog>,
    config: ExecutorConfig,
}

impl Executor {
    /// Creates an executor over its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        workflows: Arc<dyn WorkflowStore>,
        users: Arc<dyn UserStore>,
        runs: Arc<dyn RunStore>,
        processed: Arc<dyn ProcessedTriggerStore>,
        interpreter: Arc<Interpreter>,
        events: Arc<dyn EventLog>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            workflows,
            users,
            runs,
            processed,
            interpreter,
            events,
            config,
        }
    }

    /// Spawns the worker pool; the returned handles live for the engine's
    /// lifetime.
    #[must_use]
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency)
            .map(|worker| {
                let executor = Arc::clone(self);
                tokio::spawn(async move { executor.worker_loop(worker).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize) {
        tracing::info!(worker, "executor worker started");
        loop {
            match self.queue.fetch(FETCH_WAIT).await {
                Ok(Some(lease)) => self.process(lease).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker, error = %e, "job fetch failed");
                    tokio::time::sleep(FETCH_WAIT).await;
                }
            }
        }
    }

    /// Leases and processes at most one job; returns whether one was
    /// processed. Drives tests and drain-style shutdown.
    pub async fn process_next(&self, wait: Duration) -> Result<bool, QueueError> {
        match self.queue.fetch(wait).await? {
            Some(lease) => {
                self.process(lease).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, lease: LeasedJob) {
        let job = lease.job.clone();
        let attempts_made = lease.attempts_made;

        let workflow = match self.workflows.find(job.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                self.fail_without_run(lease, "workflow no longer exists").await;
                return;
            }
            Err(e) => {
                self.requeue_on_infra_error(lease, &e.to_string()).await;
                return;
            }
        };
        let user = match self.users.find(job.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.fail_without_run(lease, "owning user no longer exists").await;
                return;
            }
            Err(e) => {
                self.requeue_on_infra_error(lease, &e.to_string()).await;
                return;
            }
        };

        let mut run = WorkflowRun::new(workflow.id, job.trigger_data.clone(), attempts_made);
        if let Err(e) = self.runs.create(&run).await {
            self.requeue_on_infra_error(lease, &e.to_string()).await;
            return;
        }

        self.log(
            EventType::WorkflowExecutionStarted,
            json!({ "attempt": attempts_made }),
            &run,
            &workflow,
        )
        .await;

        // Scheduler-wrapped payloads nest the interpreter view under `data`;
        // directly-constructed payloads are passed as-is.
        let payload = job
            .trigger_data
            .get("data")
            .cloned()
            .unwrap_or_else(|| job.trigger_data.clone());

        let result = self
            .interpreter
            .execute(user.id, &workflow.steps, &payload, workflow.id, Some(run.id))
            .await;

        match result {
            Ok(records) => {
                let steps = records.len();
                run.complete(records);
                if let Err(e) = self.runs.update(&run).await {
                    tracing::warn!(run_id = %run.id, error = %e, "failed to persist run result");
                }
                if let Err(e) = self.workflows.touch_last_run(workflow.id, Utc::now()).await {
                    tracing::warn!(workflow_id = %workflow.id, error = %e, "failed to advance poll clock");
                }
                self.record_processed(workflow.id, &job.trigger_data).await;
                self.log(
                    EventType::WorkflowExecutionCompleted,
                    json!({ "attempt": attempts_made, "steps": steps }),
                    &run,
                    &workflow,
                )
                .await;
                if let Err(e) = self.queue.complete(&lease).await {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to ack completed job");
                }
            }
            Err(err) => {
                let message = err.to_string();
                run.fail(message.clone(), err.records().to_vec());
                if let Err(e) = self.runs.update(&run).await {
                    tracing::warn!(run_id = %run.id, error = %e, "failed to persist run failure");
                }
                self.log(
                    EventType::WorkflowExecutionFailed,
                    json!({ "attempt": attempts_made, "error": message }),
                    &run,
                    &workflow,
                )
                .await;

                match self.queue.fail(lease, &message, err.is_retryable()).await {
                    Ok(FailureDisposition::Retrying { delay }) => {
                        tracing::info!(job_id = %job.id, ?delay, "job scheduled for retry");
                    }
                    Ok(FailureDisposition::Terminal) => {
                        tracing::warn!(job_id = %job.id, error = %message, "job terminally failed");
                        if self.config.on_terminal_failure == TerminalFailurePolicy::Record {
                            self.record_processed(workflow.id, &job.trigger_data).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "failed to report job failure");
                    }
                }
            }
        }
    }

    /// Marks the job's event as processed, tolerating duplicates.
    async fn record_processed(&self, workflow_id: WorkflowId, trigger_data: &JsonValue) {
        let (Some(trigger_type), Some(external_id)) = (
            trigger_data["trigger_id"].as_str(),
            trigger_data["external_id"].as_str(),
        ) else {
            // Directly-constructed payloads carry no external identity.
            return;
        };

        let row = ProcessedTrigger::new(
            workflow_id,
            trigger_type,
            external_id,
            trigger_data.clone(),
        );
        match self.processed.record(row).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(external_id, "processed-trigger row already present");
            }
            Err(e) => {
                tracing::warn!(external_id, error = %e, "failed to record processed trigger");
            }
        }
    }

    /// Terminal failure for jobs whose workflow or user vanished; no run row
    /// can reference them.
    async fn fail_without_run(&self, lease: LeasedJob, reason: &str) {
        let job = lease.job.clone();
        tracing::warn!(job_id = %job.id, workflow_id = %job.workflow_id, reason, "dropping job");

        let entry = LogEntry::new(
            EventType::WorkflowExecutionFailed,
            json!({ "error": reason, "job_id": job.id.to_string() }),
        )
        .with_user(job.user_id)
        .with_workflow(job.workflow_id);
        if let Err(e) = self.events.append(entry).await {
            tracing::warn!(error = %e, "failed to append event log entry");
        }

        if let Err(e) = self.queue.fail(lease, reason, false).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to report job failure");
        }
    }

    /// Storage hiccups are transient: put the job back under the retry
    /// policy without consuming a run.
    async fn requeue_on_infra_error(&self, lease: LeasedJob, reason: &str) {
        let job_id = lease.job.id;
        tracing::warn!(%job_id, reason, "infrastructure error, requeueing job");
        if let Err(e) = self.queue.fail(lease, reason, true).await {
            tracing::warn!(%job_id, error = %e, "failed to requeue job");
        }
    }

    async fn log(
        &self,
        event_type: EventType,
        details: JsonValue,
        run: &WorkflowRun,
        workflow: &crate::definition::Workflow,
    ) {
        let entry = LogEntry::new(event_type, details)
            .with_user(workflow.user_id)
            .with_workflow(workflow.id)
            .with_run(run.id);
        if let Err(e) = self.events.append(entry).await {
            tracing::warn!(error = %e, "failed to append event log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionOutcome, MockActionRunner};
    use crate::dedup::InMemoryProcessedTriggerStore;
    use crate::definition::Workflow;
    use crate::queue::{InMemoryJobQueue, Job, RetryPolicy};
    use crate::run::{InMemoryRunStore, RunStatus};
    use crate::step::{ActionStep, ConditionClause, ConditionStep, Step, TriggerStep};
    use crate::store::{InMemoryUserStore, InMemoryWorkflowStore};
    use patchbay_core::{AppName, InMemoryEventLog, User, UserId};
    use patchbay_integration::ApiError;
    use serde_json::Map;

    struct Harness {
        executor: Executor,
        queue: Arc<InMemoryJobQueue>,
        runs: Arc<InMemoryRunStore>,
        processed: Arc<InMemoryProcessedTriggerStore>,
        workflows: Arc<InMemoryWorkflowStore>,
        events: Arc<InMemoryEventLog>,
        workflow: Workflow,
        user: User,
    }

    fn steps() -> Vec<Step> {
        vec![
            Step::Trigger(TriggerStep {
                id: "1".into(),
                app_name: AppName::Gmail,
                trigger_id: "new_email".into(),
                config: Map::new(),
                next: None,
            }),
            Step::Condition(ConditionStep {
                id: "2".into(),
                conditions: vec![ConditionClause {
                    predicate: Some("{{trigger.from}} contains '@important.com'".into()),
                    then: Some("3".into()),
                    otherwise: None,
                }],
            }),
            Step::Action(ActionStep {
                id: "3".into(),
                app_name: AppName::Slack,
                action_id: Some("send_channel_message".into()),
                config: Map::new(),
                next: None,
            }),
        ]
    }

    async fn harness(runner: MockActionRunner, config: ExecutorConfig) -> Harness {
        let queue = Arc::new(InMemoryJobQueue::new(RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        }));
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let users = Arc::new(InMemoryUserStore::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let processed = Arc::new(InMemoryProcessedTriggerStore::new());
        let events = Arc::new(InMemoryEventLog::new());

        let user = User::new("owner@example.com", "Owner");
        users.insert(user.clone());
        let workflow = Workflow::new(user.id, "gmail to slack", "", steps()).unwrap();
        workflows.create(&workflow).await.unwrap();

        let interpreter = Arc::new(Interpreter::new(Arc::new(runner), events.clone()));
        let executor = Executor::new(
            queue.clone(),
            workflows.clone(),
            users,
            runs.clone(),
            processed.clone(),
            interpreter,
            events.clone(),
            config,
        );

        Harness {
            executor,
            queue,
            runs,
            processed,
            workflows,
            events,
            workflow,
            user,
        }
    }

    fn wrapped_job(h: &Harness, external_id: &str, from: &str) -> Job {
        Job::new(
            h.workflow.id,
            h.user.id,
            json!({
                "trigger_id": "new_email",
                "external_id": external_id,
                "data": {"trigger": {"id": external_id, "from": from, "subject": "Hi"}}
            }),
        )
    }

    #[tokio::test]
    async fn happy_path_records_run_and_processed_trigger() {
        let h = harness(MockActionRunner::succeeding(), ExecutorConfig::default()).await;
        h.queue
            .enqueue(wrapped_job(&h, "m1", "a@important.com"))
            .await
            .unwrap();

        assert!(h.executor.process_next(Duration::from_millis(50)).await.unwrap());

        let runs = h.runs.all();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].execution_log.len(), 2);
        assert_eq!(runs[0].retry_count, 0);
        assert!(runs[0].finished_at.is_some());

        // Processed marker exists; a second identical candidate is filtered.
        let unprocessed = h
            .processed
            .filter_unprocessed(h.workflow.id, "new_email", vec!["m1".into()])
            .await
            .unwrap();
        assert!(unprocessed.is_empty());

        // The poll clock advanced.
        let workflow = h.workflows.find(h.workflow.id).await.unwrap().unwrap();
        assert!(workflow.last_run_at.is_some());

        let types: Vec<_> = h.events.entries().iter().map(|e| e.event_type).collect();
        assert!(types.contains(&patchbay_core::EventType::WorkflowExecutionStarted));
        assert!(types.contains(&patchbay_core::EventType::WorkflowExecutionCompleted));
    }

    #[tokio::test]
    async fn transient_failure_retries_and_then_succeeds() {
        let h = harness(
            MockActionRunner::scripted(vec![
                Err(ApiError::Transient {
                    reason: "timeout".into(),
                }),
                Ok(ActionOutcome::success("second try", None)),
            ]),
            ExecutorConfig::default(),
        )
        .await;
        h.queue
            .enqueue(wrapped_job(&h, "m1", "a@important.com"))
            .await
            .unwrap();

        // Attempt 0 fails, attempt 1 succeeds after the backoff delay.
        assert!(h.executor.process_next(Duration::from_millis(50)).await.unwrap());
        assert!(h.executor.process_next(Duration::from_secs(1)).await.unwrap());

        let mut runs = h.runs.all();
        runs.sort_by_key(|r| r.retry_count);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].retry_count, 1);
        assert_eq!(runs[1].status, RunStatus::Success);

        // Processed exactly once.
        let unprocessed = h
            .processed
            .filter_unprocessed(h.workflow.id, "new_email", vec!["m1".into()])
            .await
            .unwrap();
        assert!(unprocessed.is_empty());
    }

    #[tokio::test]
    async fn retry_budget_caps_run_rows_at_three() {
        let h = harness(
            MockActionRunner::failing(ApiError::Transient {
                reason: "always down".into(),
            }),
            ExecutorConfig::default(),
        )
        .await;
        h.queue
            .enqueue(wrapped_job(&h, "m1", "a@important.com"))
            .await
            .unwrap();

        while h.executor.process_next(Duration::from_millis(100)).await.unwrap() {}

        let runs = h.runs.all();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.status == RunStatus::Failed));

        // Default policy leaves the event unprocessed.
        let unprocessed = h
            .processed
            .filter_unprocessed(h.workflow.id, "new_email", vec!["m1".into()])
            .await
            .unwrap();
        assert_eq!(unprocessed.len(), 1);

        // The terminally failed job is retained for inspection.
        assert_eq!(h.queue.failed_jobs().len(), 1);
    }

    #[tokio::test]
    async fn record_policy_marks_terminal_failures_processed() {
        let h = harness(
            MockActionRunner::failing(ApiError::Transient {
                reason: "always down".into(),
            }),
            ExecutorConfig {
                on_terminal_failure: TerminalFailurePolicy::Record,
                ..ExecutorConfig::default()
            },
        )
        .await;
        h.queue
            .enqueue(wrapped_job(&h, "m1", "a@important.com"))
            .await
            .unwrap();

        while h.executor.process_next(Duration::from_millis(100)).await.unwrap() {}

        let unprocessed = h
            .processed
            .filter_unprocessed(h.workflow.id, "new_email", vec!["m1".into()])
            .await
            .unwrap();
        assert!(unprocessed.is_empty());
    }

    #[tokio::test]
    async fn non_retryable_failure_consumes_one_attempt() {
        let h = harness(
            MockActionRunner::failing(ApiError::NotFound {
                resource: "channel".into(),
            }),
            ExecutorConfig::default(),
        )
        .await;
        h.queue
            .enqueue(wrapped_job(&h, "m1", "a@important.com"))
            .await
            .unwrap();

        assert!(h.executor.process_next(Duration::from_millis(50)).await.unwrap());
        // No redelivery.
        assert!(!h.executor.process_next(Duration::from_millis(50)).await.unwrap());

        let runs = h.runs.all();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_processed_row_is_benign() {
        let h = harness(MockActionRunner::succeeding(), ExecutorConfig::default()).await;
        h.processed
            .record(ProcessedTrigger::new(
                h.workflow.id,
                "new_email",
                "m1",
                json!({}),
            ))
            .await
            .unwrap();

        h.queue
            .enqueue(wrapped_job(&h, "m1", "a@important.com"))
            .await
            .unwrap();
        assert!(h.executor.process_next(Duration::from_millis(50)).await.unwrap());

        let runs = h.runs.all();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn missing_workflow_is_terminal_without_a_run() {
        let h = harness(MockActionRunner::succeeding(), ExecutorConfig::default()).await;
        let job = Job::new(
            patchbay_core::WorkflowId::new(),
            h.user.id,
            json!({"trigger_id": "new_email", "external_id": "m1", "data": {}}),
        );
        h.queue.enqueue(job).await.unwrap();

        assert!(h.executor.process_next(Duration::from_millis(50)).await.unwrap());
        assert!(h.runs.all().is_empty());
        assert_eq!(h.queue.failed_jobs().len(), 1);
    }

    #[tokio::test]
    async fn direct_payload_skips_processed_marker() {
        let h = harness(MockActionRunner::succeeding(), ExecutorConfig::default()).await;
        // Directly-constructed payload: no wrapper, no external identity.
        let job = Job::new(
            h.workflow.id,
            h.user.id,
            json!({"trigger": {"from": "a@important.com"}}),
        );
        h.queue.enqueue(job).await.unwrap();

        assert!(h.executor.process_next(Duration::from_millis(50)).await.unwrap());
        let runs = h.runs.all();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert!(h.processed.is_empty());
    }
}
