//! Postgres repositories behind the engine's storage traits.
//!
//! Schema migrations are owned by an external collaborator; the expected
//! tables are:
//!
//! - `users(id, email, display_name, created_at)`
//! - `credentials(id, user_id, app, access_token, refresh_token, expires_at,
//!   metadata, created_at, updated_at)` with UNIQUE `(user_id, app)`
//! - `workflows(id, user_id, name, description, is_active,
//!   polling_interval_seconds, last_run_at, steps, created_at, updated_at)`
//!   with UNIQUE `(user_id, name)`
//! - `workflow_runs(id, workflow_id, status, trigger_data, execution_log,
//!   retry_count, error, started_at, finished_at)`
//! - `processed_triggers(workflow_id, trigger_type, external_id, metadata,
//!   processed_at)` with UNIQUE `(workflow_id, trigger_type, external_id)`
//! - `event_log(id, event_type, details, user_id, workflow_id, run_id,
//!   created_at)`; `run_id` is `ON DELETE SET NULL` so log rows survive run
//!   deletion
//!
//! User deletion cascades through credentials, workflows, runs and processed
//! triggers via foreign keys.

pub mod credential;
pub mod event_log;
pub mod processed_trigger;
pub mod user;
pub mod workflow;
pub mod workflow_run;

pub use credential::PgCredentialStore;
pub use event_log::PgEventLog;
pub use processed_trigger::PgProcessedTriggerStore;
pub use user::PgUserStore;
pub use workflow::PgWorkflowStore;
pub use workflow_run::PgRunStore;

/// Formats a decode failure the way the repositories report them.
pub(crate) fn decode_error(context: &str, detail: impl std::fmt::Display) -> String {
    format!("{context}: {detail}")
}
