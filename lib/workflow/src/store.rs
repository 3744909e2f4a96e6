//! Storage contracts for workflows and users.
//!
//! The engine reads and mutates workflow rows through [`WorkflowStore`];
//! `last_run_at` gets a dedicated targeted write so a poll-clock update can
//! never clobber other columns. Users are read-only to the engine.

use crate::definition::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{User, UserId, WorkflowId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Errors from workflow/user storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another workflow of this user already carries the name.
    NameTaken { name: String },
    /// The row does not exist.
    NotFound,
    /// The underlying store rejected the operation.
    StorageFailed { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameTaken { name } => write!(f, "workflow name already in use: {name}"),
            Self::NotFound => write!(f, "row not found"),
            Self::StorageFailed { reason } => write!(f, "storage failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Storage contract for workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persists a new workflow; fails `NameTaken` when the (user, name) pair
    /// exists.
    async fn create(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Finds a workflow by id.
    async fn find(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError>;

    /// Finds a workflow by id, scoped to its owner.
    async fn find_for_user(
        &self,
        id: WorkflowId,
        user_id: UserId,
    ) -> Result<Option<Workflow>, StoreError>;

    /// Lists a user's workflows.
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Workflow>, StoreError>;

    /// Lists all active workflows (the scheduler's sweep set).
    async fn list_active(&self) -> Result<Vec<Workflow>, StoreError>;

    /// Rewrites a workflow row.
    async fn update(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Flips the active flag.
    async fn set_active(&self, id: WorkflowId, active: bool) -> Result<(), StoreError>;

    /// Targeted single-column write of `last_run_at`.
    async fn touch_last_run(&self, id: WorkflowId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Deletes the workflow row.
    async fn delete(&self, id: WorkflowId) -> Result<(), StoreError>;
}

/// Read-only user lookups.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Finds a user by id.
    async fn find(&self, id: UserId) -> Result<Option<User>, StoreError>;
}

/// In-memory workflow store.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    rows: Arc<Mutex<HashMap<WorkflowId, Workflow>>>,
}

impl InMemoryWorkflowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let name_taken = rows
            .values()
            .any(|w| w.user_id == workflow.user_id && w.name == workflow.name);
        if name_taken {
            return Err(StoreError::NameTaken {
                name: workflow.name.clone(),
            });
        }
        rows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn find(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn find_for_user(
        &self,
        id: WorkflowId,
        user_id: UserId,
    ) -> Result<Option<Workflow>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&id)
            .filter(|w| w.user_id == user_id)
            .cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Workflow>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut workflows: Vec<Workflow> = rows
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }

    async fn list_active(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut workflows: Vec<Workflow> =
            rows.values().filter(|w| w.is_active).cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }

    async fn update(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let name_taken = rows.values().any(|w| {
            w.id != workflow.id && w.user_id == workflow.user_id && w.name == workflow.name
        });
        if name_taken {
            return Err(StoreError::NameTaken {
                name: workflow.name.clone(),
            });
        }
        match rows.get_mut(&workflow.id) {
            Some(row) => {
                *row = workflow.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn set_active(&self, id: WorkflowId, active: bool) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) => {
                row.is_active = active;
                row.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn touch_last_run(&self, id: WorkflowId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) => {
                row.last_run_at = Some(at);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, id: WorkflowId) -> Result<(), StoreError> {
        match self.rows.lock().unwrap().remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }
}

/// In-memory user store.
#[derive(Default)]
pub struct InMemoryUserStore {
    rows: Arc<Mutex<HashMap<UserId, User>>>,
}

impl InMemoryUserStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a user row.
    pub fn insert(&self, user: User) {
        self.rows.lock().unwrap().insert(user.id, user);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{ActionStep, Step, TriggerStep};
    use patchbay_core::AppName;
    use serde_json::Map;

    fn workflow(user_id: UserId, name: &str) -> Workflow {
        Workflow::new(
            user_id,
            name,
            "",
            vec![
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
        )
        .expect("valid workflow")
    }

    #[tokio::test]
    async fn names_are_unique_per_user() {
        let store = InMemoryWorkflowStore::new();
        let user = UserId::new();
        store.create(&workflow(user, "inbox")).await.unwrap();

        let err = store.create(&workflow(user, "inbox")).await.unwrap_err();
        assert!(matches!(err, StoreError::NameTaken { .. }));

        // Another user may reuse the name.
        store.create(&workflow(UserId::new(), "inbox")).await.unwrap();
    }

    #[tokio::test]
    async fn list_active_excludes_deactivated() {
        let store = InMemoryWorkflowStore::new();
        let user = UserId::new();
        let wf = workflow(user, "a");
        store.create(&wf).await.unwrap();
        store.create(&workflow(user, "b")).await.unwrap();

        store.set_active(wf.id, false).await.unwrap();
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b");
    }

    #[tokio::test]
    async fn touch_last_run_only_moves_the_clock() {
        let store = InMemoryWorkflowStore::new();
        let user = UserId::new();
        let wf = workflow(user, "a");
        store.create(&wf).await.unwrap();

        let at = Utc::now();
        store.touch_last_run(wf.id, at).await.unwrap();

        let loaded = store.find(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_run_at, Some(at));
        assert_eq!(loaded.steps.len(), wf.steps.len());
        assert!(loaded.is_active);
    }

    #[tokio::test]
    async fn find_for_user_enforces_ownership() {
        let store = InMemoryWorkflowStore::new();
        let owner = UserId::new();
        let wf = workflow(owner, "a");
        store.create(&wf).await.unwrap();

        assert!(store.find_for_user(wf.id, owner).await.unwrap().is_some());
        assert!(
            store
                .find_for_user(wf.id, UserId::new())
                .await
                .unwrap()
                .is_none()
        );
    }
}
