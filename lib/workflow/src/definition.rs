//! The workflow record and its structural validation.

use crate::condition::parse_predicate;
use crate::step::{Step, TriggerStep};
use chrono::{DateTime, Utc};
use patchbay_core::{UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A user-owned directed graph of steps: exactly one trigger, optional
/// conditions, one or more actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: WorkflowId,
    /// The owning user.
    pub user_id: UserId,
    /// Name, unique per user.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Whether the scheduler polls this workflow.
    pub is_active: bool,
    /// Poll cadence, derived from the trigger's app at activation. Zero
    /// means push-based (never polled).
    pub polling_interval_seconds: u64,
    /// Wall clock of the last poll that enqueued or attempted to enqueue.
    pub last_run_at: Option<DateTime<Utc>>,
    /// The ordered step list.
    pub steps: Vec<Step>,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// When the workflow was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Creates an active workflow, deriving the polling interval from the
    /// trigger step's app.
    ///
    /// # Errors
    ///
    /// Returns an error when the step graph violates a structural invariant.
    pub fn new(
        user_id: UserId,
        name: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Self, WorkflowValidationError> {
        validate_steps(&steps)?;
        let now = Utc::now();
        let polling_interval_seconds = derive_polling_interval(&steps);
        Ok(Self {
            id: WorkflowId::new(),
            user_id,
            name: name.into(),
            description: description.into(),
            is_active: true,
            polling_interval_seconds,
            last_run_at: None,
            steps,
            created_at: now,
            updated_at: now,
        })
    }

    /// Returns the trigger step.
    ///
    /// Validation guarantees exactly one exists.
    #[must_use]
    pub fn trigger_step(&self) -> Option<&TriggerStep> {
        self.steps.iter().find_map(|s| match s {
            Step::Trigger(t) => Some(t),
            _ => None,
        })
    }

    /// Re-validates the current step graph.
    pub fn validate(&self) -> Result<(), WorkflowValidationError> {
        validate_steps(&self.steps)
    }

    /// Re-derives the polling interval from the trigger's app.
    pub fn refresh_polling_interval(&mut self) {
        self.polling_interval_seconds = derive_polling_interval(&self.steps);
    }
}

/// Derives the poll cadence from the trigger step's app; 60 s when no
/// trigger is present (validation rejects that shape anyway).
#[must_use]
pub fn derive_polling_interval(steps: &[Step]) -> u64 {
    steps
        .iter()
        .find_map(|s| match s {
            Step::Trigger(t) => Some(t.app_name.polling_interval_seconds()),
            _ => None,
        })
        .unwrap_or(60)
}

/// Structural invariant violations in a step graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowValidationError {
    /// No trigger step.
    NoTrigger,
    /// More than one trigger step.
    MultipleTriggers,
    /// No action step.
    NoAction,
    /// Two steps share an id.
    DuplicateStepId { id: String },
    /// A `then`/`else`/`next` target names a step that does not exist.
    UnknownTarget { step_id: String, target: String },
    /// A condition predicate does not match `{{path}} op 'literal'`.
    MalformedPredicate { step_id: String, predicate: String },
    /// A condition clause carries neither `if` nor `else`.
    EmptyClause { step_id: String },
}

impl fmt::Display for WorkflowValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTrigger => write!(f, "workflow has no trigger step"),
            Self::MultipleTriggers => write!(f, "workflow has more than one trigger step"),
            Self::NoAction => write!(f, "workflow has no action step"),
            Self::DuplicateStepId { id } => write!(f, "duplicate step id: {id}"),
            Self::UnknownTarget { step_id, target } => {
                write!(f, "step {step_id} targets unknown step {target}")
            }
            Self::MalformedPredicate { step_id, predicate } => {
                write!(f, "step {step_id} has malformed predicate: {predicate}")
            }
            Self::EmptyClause { step_id } => {
                write!(f, "step {step_id} has a clause with neither if nor else")
            }
        }
    }
}

impl std::error::Error for WorkflowValidationError {}

fn validate_steps(steps: &[Step]) -> Result<(), WorkflowValidationError> {
    let mut trigger_count = 0usize;
    let mut action_count = 0usize;
    let mut ids: HashSet<&str> = HashSet::new();

    for step in steps {
        if !ids.insert(step.id()) {
            return Err(WorkflowValidationError::DuplicateStepId {
                id: step.id().to_string(),
            });
        }
        match step {
            Step::Trigger(_) => trigger_count += 1,
            Step::Action(_) => action_count += 1,
            Step::Condition(_) => {}
        }
    }

    match trigger_count {
        0 => return Err(WorkflowValidationError::NoTrigger),
        1 => {}
        _ => return Err(WorkflowValidationError::MultipleTriggers),
    }
    if action_count == 0 {
        return Err(WorkflowValidationError::NoAction);
    }

    // Every branch target must resolve to an existing step id or be null.
    let check_target = |step_id: &str, target: &Option<String>| {
        if let Some(target) = target
            && !ids.contains(target.as_str())
        {
            return Err(WorkflowValidationError::UnknownTarget {
                step_id: step_id.to_string(),
                target: target.clone(),
            });
        }
        Ok(())
    };

    for step in steps {
        match step {
            Step::Trigger(t) => check_target(&t.id, &t.next)?,
            Step::Action(a) => check_target(&a.id, &a.next)?,
            Step::Condition(c) => {
                for clause in &c.conditions {
                    if clause.predicate.is_none() && clause.otherwise.is_none() {
                        return Err(WorkflowValidationError::EmptyClause {
                            step_id: c.id.clone(),
                        });
                    }
                    if let Some(predicate) = &clause.predicate
                        && parse_predicate(predicate).is_none()
                    {
                        return Err(WorkflowValidationError::MalformedPredicate {
                            step_id: c.id.clone(),
                            predicate: predicate.clone(),
                        });
                    }
                    check_target(&c.id, &clause.then)?;
                    check_target(&c.id, &clause.otherwise)?;
                }
            }
        }
    }

    Ok(())
}
