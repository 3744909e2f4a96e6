//! Workflow engine for the patchbay platform.
//!
//! This crate provides the core workflow execution machinery:
//!
//! - **Step Model**: tagged trigger/condition/action steps with free-form
//!   config maps and typed views at execution time
//! - **Definitions**: the workflow record and its structural validation
//! - **Templates**: `{{path.with.dots}}` substitution against trigger payloads
//! - **Interpreter**: the step-graph walk with condition evaluation
//! - **Actions**: the closed catalog of supported third-party actions
//! - **Runs**: per-execution records and their storage contract
//! - **Dedup**: the processed-trigger set that makes external events fire at
//!   most once per workflow
//! - **Queue**: the durable job queue decoupling detection from execution,
//!   with in-memory and NATS JetStream backends
//! - **Executor**: the bounded worker pool that drives runs to completion

pub mod action;
pub mod condition;
pub mod dedup;
pub mod definition;
pub mod executor;
pub mod interpreter;
pub mod nats;
pub mod queue;
pub mod run;
pub mod step;
pub mod store;
pub mod template;

pub use action::{ActionOutcome, ActionRunner, ActionStatus, DispatcherActions, MockActionRunner};
pub use condition::{ConditionOp, ParsedPredicate};
pub use dedup::{DedupError, InMemoryProcessedTriggerStore, ProcessedTrigger, ProcessedTriggerStore};
pub use definition::{Workflow, WorkflowValidationError};
pub use executor::{Executor, ExecutorConfig, TerminalFailurePolicy};
pub use interpreter::{ExecutionError, Interpreter};
pub use queue::{
    FailureDisposition, InMemoryJobQueue, Job, JobQueue, LeasedJob, QueueError, RetryPolicy,
};
pub use run::{InMemoryRunStore, RunError, RunStatus, RunStore, StepRecord, WorkflowRun};
pub use step::{ActionStep, ConditionClause, ConditionStep, Step, TriggerStep};
pub use store::{
    InMemoryUserStore, InMemoryWorkflowStore, StoreError, UserStore, WorkflowStore,
};
