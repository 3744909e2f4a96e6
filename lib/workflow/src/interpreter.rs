//! The step interpreter (C9).
//!
//! Walks a workflow's step graph for one triggering event. The walk begins at
//! the trigger step's declared `next`, falling back to the conventional step
//! id `"2"`; a missing start step terminates with an empty log. Conditions
//! choose the next step, actions are terminal.

use crate::action::{ActionRunner, ActionStatus};
use crate::condition::evaluate_predicate;
use crate::run::StepRecord;
use crate::step::{ConditionStep, Step};
use patchbay_core::{EventLog, EventType, LogEntry, UserId, WorkflowId, WorkflowRunId};
use patchbay_integration::ApiError;
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Start step used when the trigger does not declare one.
pub const FALLBACK_START_STEP: &str = "2";

/// A raised execution failure, carrying the partial log.
#[derive(Debug, Clone)]
pub enum ExecutionError {
    /// An action raised a transport or provider error.
    Action {
        /// The failing step.
        step_id: String,
        /// Step records accumulated before the failure.
        records: Vec<StepRecord>,
        /// The classified failure.
        source: ApiError,
    },
}

impl ExecutionError {
    /// Step records accumulated before the failure.
    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        match self {
            Self::Action { records, .. } => records,
        }
    }

    /// Whether the queue should retry the job.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Action { source, .. } => source.is_retryable(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action { step_id, source, .. } => {
                write!(f, "action step {step_id} failed: {source}")
            }
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Walks workflow step graphs.
pub struct Interpreter {
    actions: Arc<dyn ActionRunner>,
    events: Arc<dyn EventLog>,
}

impl Interpreter {
    /// Creates an interpreter over an action runner and the event log.
    #[must_use]
    pub fn new(actions: Arc<dyn ActionRunner>, events: Arc<dyn EventLog>) -> Self {
        Self { actions, events }
    }

    /// Executes the step graph for one triggering event, returning the
    /// per-step execution log.
    pub async fn execute(
        &self,
        user_id: UserId,
        steps: &[Step],
        trigger_data: &JsonValue,
        workflow_id: WorkflowId,
        run_id: Option<WorkflowRunId>,
    ) -> Result<Vec<StepRecord>, ExecutionError> {
        let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id(), s)).collect();

        let start_id = steps
            .iter()
            .find_map(|s| match s {
                Step::Trigger(t) => t.next.as_deref(),
                _ => None,
            })
            .unwrap_or(FALLBACK_START_STEP);

        let Some(mut current) = by_id.get(start_id).copied() else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        // Conditions are pure over a fixed payload, so revisiting a step can
        // only loop forever; terminate instead.
        let mut visited: HashSet<&str> = HashSet::new();

        loop {
            if !visited.insert(current.id()) {
                tracing::warn!(step_id = current.id(), "step revisited, terminating walk");
                break;
            }

            match current {
                Step::Condition(condition) => {
                    let next = choose_branch(condition, trigger_data);
                    records.push(StepRecord::Condition {
                        step_id: condition.id.clone(),
                        next: next.clone(),
                    });

                    let Some(next_id) = next else { break };
                    match by_id.get(next_id.as_str()) {
                        Some(step) => current = step,
                        None => break,
                    }
                }
                Step::Action(action) => {
                    let action_id = action.effective_action_id().to_string();
                    self.log(
                        EventType::ActionStarted,
                        json!({ "step_id": action.id, "action_id": action_id }),
                        user_id,
                        workflow_id,
                        run_id,
                    )
                    .await;

                    match self.actions.run(user_id, action, trigger_data).await {
                        Ok(outcome) => {
                            let event = match outcome.status {
                                ActionStatus::Success => EventType::ActionCompleted,
                                ActionStatus::Failed => EventType::ActionFailed,
                            };
                            self.log(
                                event,
                                json!({
                                    "step_id": action.id,
                                    "action_id": action_id,
                                    "detail": outcome.detail,
                                }),
                                user_id,
                                workflow_id,
                                run_id,
                            )
                            .await;

                            records.push(StepRecord::Action {
                                step_id: action.id.clone(),
                                action_id,
                                status: outcome.status,
                                detail: outcome.detail,
                            });
                            // Actions are terminal.
                            break;
                        }
                        Err(source) => {
                            self.log(
                                EventType::ActionFailed,
                                json!({
                                    "step_id": action.id,
                                    "action_id": action_id,
                                    "error": source.to_string(),
                                    "kind": source.kind(),
                                }),
                                user_id,
                                workflow_id,
                                run_id,
                            )
                            .await;

                            return Err(ExecutionError::Action {
                                step_id: action.id.clone(),
                                records,
                                source,
                            });
                        }
                    }
                }
                // A trigger mid-walk has nothing to execute.
                Step::Trigger(_) => break,
            }
        }

        Ok(records)
    }

    async fn log(
        &self,
        event_type: EventType,
        details: JsonValue,
        user_id: UserId,
        workflow_id: WorkflowId,
        run_id: Option<WorkflowRunId>,
    ) {
        let mut entry = LogEntry::new(event_type, details)
            .with_user(user_id)
            .with_workflow(workflow_id);
        if let Some(run_id) = run_id {
            entry = entry.with_run(run_id);
        }
        if let Err(e) = self.events.append(entry).await {
            tracing::warn!(error = %e, "failed to append event log entry");
        }
    }
}

/// Evaluates a condition's clauses in order: first matching `if` wins; the
/// first `else` clause catches the rest; otherwise the run terminates here.
fn choose_branch(condition: &ConditionStep, trigger_data: &JsonValue) -> Option<String> {
    for clause in &condition.conditions {
        if let Some(predicate) = &clause.predicate
            && evaluate_predicate(predicate, trigger_data)
        {
            return clause.then.clone();
        }
    }
    condition
        .conditions
        .iter()
        .find_map(|clause| clause.otherwise.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionOutcome, MockActionRunner};
    use crate::step::{ActionStep, ConditionClause, TriggerStep};
    use patchbay_core::{AppName, InMemoryEventLog};
    use serde_json::Map;

    fn trigger(next: Option<&str>) -> Step {
        Step::Trigger(TriggerStep {
            id: "1".into(),
            app_name: AppName::Gmail,
            trigger_id: "new_email".into(),
            config: Map::new(),
            next: next.map(str::to_string),
        })
    }

    fn condition(id: &str, predicate: &str, then: Option<&str>, otherwise: Option<&str>) -> Step {
        let mut conditions = vec![ConditionClause {
            predicate: Some(predicate.into()),
            then: then.map(str::to_string),
            otherwise: None,
        }];
        if let Some(target) = otherwise {
            conditions.push(ConditionClause {
                predicate: None,
                then: None,
                otherwise: Some(target.into()),
            });
        }
        Step::Condition(ConditionStep {
            id: id.into(),
            conditions,
        })
    }

    fn action(id: &str) -> Step {
        Step::Action(ActionStep {
            id: id.into(),
            app_name: AppName::Slack,
            action_id: Some("send_channel_message".into()),
            config: Map::new(),
            next: None,
        })
    }

    fn payload(from: &str) -> JsonValue {
        json!({"trigger": {"from": from, "subject": "Hi"}})
    }

    fn interpreter(runner: MockActionRunner) -> (Interpreter, Arc<InMemoryEventLog>) {
        let events = Arc::new(InMemoryEventLog::new());
        (Interpreter::new(Arc::new(runner), events.clone()), events)
    }

    #[tokio::test]
    async fn condition_routes_to_action() {
        let steps = vec![
            trigger(None),
            condition("2", "{{trigger.from}} contains '@important.com'", Some("3"), None),
            action("3"),
        ];
        let (interpreter, events) = interpreter(MockActionRunner::succeeding());

        let records = interpreter
            .execute(
                UserId::new(),
                &steps,
                &payload("a@important.com"),
                WorkflowId::new(),
                Some(WorkflowRunId::new()),
            )
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            StepRecord::Condition {
                step_id: "2".into(),
                next: Some("3".into())
            }
        );
        match &records[1] {
            StepRecord::Action { step_id, status, .. } => {
                assert_eq!(step_id, "3");
                assert_eq!(*status, ActionStatus::Success);
            }
            other => panic!("expected action record, got {other:?}"),
        }

        let types: Vec<EventType> = events.entries().iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::ActionStarted));
        assert!(types.contains(&EventType::ActionCompleted));
    }

    #[tokio::test]
    async fn unmatched_condition_without_else_terminates() {
        let steps = vec![
            trigger(None),
            condition("2", "{{trigger.from}} contains '@important.com'", Some("3"), None),
            action("3"),
        ];
        let runner = MockActionRunner::succeeding();
        let events = Arc::new(InMemoryEventLog::new());
        let runner = Arc::new(runner);
        let interpreter = Interpreter::new(runner.clone(), events);

        let records = interpreter
            .execute(
                UserId::new(),
                &steps,
                &payload("b@other.com"),
                WorkflowId::new(),
                None,
            )
            .await
            .unwrap();

        // Only the condition entry; the action never ran.
        assert_eq!(
            records,
            vec![StepRecord::Condition {
                step_id: "2".into(),
                next: None
            }]
        );
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn else_branch_catches_unmatched_predicates() {
        let steps = vec![
            trigger(None),
            condition("2", "{{trigger.from}} contains '@important.com'", Some("3"), Some("4")),
            action("3"),
            action("4"),
        ];
        let runner = Arc::new(MockActionRunner::succeeding());
        let interpreter = Interpreter::new(runner.clone(), Arc::new(InMemoryEventLog::new()));

        interpreter
            .execute(
                UserId::new(),
                &steps,
                &payload("b@other.com"),
                WorkflowId::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(runner.calls(), vec!["4".to_string()]);
    }

    #[tokio::test]
    async fn missing_start_step_yields_empty_log() {
        let steps = vec![trigger(None), action("9")];
        let (interpreter, _) = interpreter(MockActionRunner::succeeding());

        let records = interpreter
            .execute(
                UserId::new(),
                &steps,
                &payload("a@x.com"),
                WorkflowId::new(),
                None,
            )
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn trigger_next_overrides_the_start_convention() {
        let steps = vec![trigger(Some("9")), action("9")];
        let runner = Arc::new(MockActionRunner::succeeding());
        let interpreter = Interpreter::new(runner.clone(), Arc::new(InMemoryEventLog::new()));

        interpreter
            .execute(
                UserId::new(),
                &steps,
                &payload("a@x.com"),
                WorkflowId::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(runner.calls(), vec!["9".to_string()]);
    }

    #[tokio::test]
    async fn transport_failure_raises_with_partial_log() {
        let steps = vec![
            trigger(None),
            condition("2", "{{trigger.from}} contains '@important.com'", Some("3"), None),
            action("3"),
        ];
        let (interpreter, events) = interpreter(MockActionRunner::failing(ApiError::Transient {
            reason: "timeout".into(),
        }));

        let err = interpreter
            .execute(
                UserId::new(),
                &steps,
                &payload("a@important.com"),
                WorkflowId::new(),
                Some(WorkflowRunId::new()),
            )
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.records().len(), 1); // the condition entry survived
        let types: Vec<EventType> = events.entries().iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::ActionFailed));
    }

    #[tokio::test]
    async fn config_failure_completes_without_raising() {
        let steps = vec![trigger(None), condition("2", "{{trigger.from}} contains 'a'", Some("3"), None), action("3")];
        let (interpreter, events) = interpreter(MockActionRunner::scripted(vec![Ok(
            ActionOutcome::failed("send_channel_message requires 'channel'"),
        )]));

        let records = interpreter
            .execute(
                UserId::new(),
                &steps,
                &payload("a@x.com"),
                WorkflowId::new(),
                None,
            )
            .await
            .unwrap();

        match &records[1] {
            StepRecord::Action { status, detail, .. } => {
                assert_eq!(*status, ActionStatus::Failed);
                assert!(detail.contains("requires 'channel'"));
            }
            other => panic!("expected action record, got {other:?}"),
        }
        let types: Vec<EventType> = events.entries().iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::ActionFailed));
    }

    #[tokio::test]
    async fn self_referencing_condition_terminates() {
        let steps = vec![
            trigger(None),
            condition("2", "{{trigger.from}} contains 'a'", Some("2"), None),
            action("3"),
        ];
        let (interpreter, _) = interpreter(MockActionRunner::succeeding());

        let records = interpreter
            .execute(
                UserId::new(),
                &steps,
                &payload("a@x.com"),
                WorkflowId::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
