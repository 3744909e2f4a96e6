//! Core domain types for the patchbay automation engine.
//!
//! This crate holds the vocabulary shared by every other crate:
//!
//! - **Ids**: ULID-backed strongly-typed identifiers for all entities
//! - **Apps**: the closed set of supported third-party applications
//! - **Users**: the owner identity referenced by credentials and workflows
//! - **Event Log**: the append-only lifecycle trail and its storage contract

pub mod app;
pub mod event;
pub mod id;
pub mod user;

pub use app::AppName;
pub use event::{EventLog, EventLogError, EventType, InMemoryEventLog, LogEntry, LogFilter};
pub use id::{CredentialId, JobId, LogEntryId, ParseIdError, UserId, WorkflowId, WorkflowRunId};
pub use user::User;
