//! The processed-trigger set (dedup store).
//!
//! A row per (workflow, trigger type, external id) marks an external event as
//! executed. The UNIQUE key makes [`ProcessedTriggerStore::record`]
//! idempotent: racing pollers or retried jobs insert once, every later
//! attempt is reported as a duplicate and ignored by callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::WorkflowId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Marker row for an already-executed external event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedTrigger {
    /// The workflow the event fired for.
    pub workflow_id: WorkflowId,
    /// Trigger type (e.g. `new_email`).
    pub trigger_type: String,
    /// Provider-assigned stable id.
    pub external_id: String,
    /// Opaque payload snapshot for inspection.
    pub metadata: JsonValue,
    /// When the event was recorded as processed.
    pub processed_at: DateTime<Utc>,
}

impl ProcessedTrigger {
    /// Creates a marker stamped now.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        trigger_type: impl Into<String>,
        external_id: impl Into<String>,
        metadata: JsonValue,
    ) -> Self {
        Self {
            workflow_id,
            trigger_type: trigger_type.into(),
            external_id: external_id.into(),
            metadata,
            processed_at: Utc::now(),
        }
    }
}

/// Errors from dedup storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupError {
    /// The underlying store rejected the operation.
    StorageFailed { reason: String },
}

impl fmt::Display for DedupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageFailed { reason } => write!(f, "dedup storage failed: {reason}"),
        }
    }
}

impl std::error::Error for DedupError {}

/// Storage contract for processed triggers (C5).
#[async_trait]
pub trait ProcessedTriggerStore: Send + Sync {
    /// Removes already-processed ids from `external_ids`, preserving input
    /// order.
    async fn filter_unprocessed(
        &self,
        workflow_id: WorkflowId,
        trigger_type: &str,
        external_ids: Vec<String>,
    ) -> Result<Vec<String>, DedupError>;

    /// Records an event as processed. Returns `false` when the row already
    /// existed (the benign duplicate case).
    async fn record(&self, row: ProcessedTrigger) -> Result<bool, DedupError>;

    /// Deletes all rows of a workflow (cascade on workflow removal).
    async fn delete_for_workflow(&self, workflow_id: WorkflowId) -> Result<u64, DedupError>;

    /// Deletes rows processed before the cutoff, returning the count removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DedupError>;
}

/// In-memory processed-trigger store.
#[derive(Default)]
pub struct InMemoryProcessedTriggerStore {
    rows: Arc<Mutex<HashMap<(WorkflowId, String, String), ProcessedTrigger>>>,
}

impl InMemoryProcessedTriggerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Returns whether the store holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl ProcessedTriggerStore for InMemoryProcessedTriggerStore {
    async fn filter_unprocessed(
        &self,
        workflow_id: WorkflowId,
        trigger_type: &str,
        external_ids: Vec<String>,
    ) -> Result<Vec<String>, DedupError> {
        let rows = self.rows.lock().unwrap();
        Ok(external_ids
            .into_iter()
            .filter(|id| {
                !rows.contains_key(&(workflow_id, trigger_type.to_string(), id.clone()))
            })
            .collect())
    }

    async fn record(&self, row: ProcessedTrigger) -> Result<bool, DedupError> {
        let key = (
            row.workflow_id,
            row.trigger_type.clone(),
            row.external_id.clone(),
        );
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, row);
        Ok(true)
    }

    async fn delete_for_workflow(&self, workflow_id: WorkflowId) -> Result<u64, DedupError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(wf, _, _), _| *wf != workflow_id);
        Ok((before - rows.len()) as u64)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DedupError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, row| row.processed_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn filter_drops_processed_ids_in_order() {
        let store = InMemoryProcessedTriggerStore::new();
        let workflow_id = WorkflowId::new();
        store
            .record(ProcessedTrigger::new(workflow_id, "new_email", "m2", json!({})))
            .await
            .unwrap();

        let unprocessed = store
            .filter_unprocessed(
                workflow_id,
                "new_email",
                vec!["m3".into(), "m2".into(), "m1".into()],
            )
            .await
            .unwrap();
        assert_eq!(unprocessed, vec!["m3".to_string(), "m1".to_string()]);
    }

    #[tokio::test]
    async fn record_is_idempotent() {
        let store = InMemoryProcessedTriggerStore::new();
        let workflow_id = WorkflowId::new();
        let row = ProcessedTrigger::new(workflow_id, "new_email", "m1", json!({}));

        assert!(store.record(row.clone()).await.unwrap());
        // Duplicate insert is caught and reported, not an error.
        assert!(!store.record(row).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn scoped_by_workflow_and_trigger_type() {
        let store = InMemoryProcessedTriggerStore::new();
        let wf_a = WorkflowId::new();
        let wf_b = WorkflowId::new();
        store
            .record(ProcessedTrigger::new(wf_a, "new_email", "m1", json!({})))
            .await
            .unwrap();

        // Same external id, other workflow: unprocessed.
        let other_wf = store
            .filter_unprocessed(wf_b, "new_email", vec!["m1".into()])
            .await
            .unwrap();
        assert_eq!(other_wf.len(), 1);

        // Same workflow, other trigger type: unprocessed.
        let other_type = store
            .filter_unprocessed(wf_a, "email_starred", vec!["m1".into()])
            .await
            .unwrap();
        assert_eq!(other_type.len(), 1);
    }

    #[tokio::test]
    async fn prune_honors_cutoff() {
        let store = InMemoryProcessedTriggerStore::new();
        let workflow_id = WorkflowId::new();
        let mut old = ProcessedTrigger::new(workflow_id, "new_email", "m1", json!({}));
        old.processed_at = Utc::now() - chrono::Duration::days(45);
        store.record(old).await.unwrap();
        store
            .record(ProcessedTrigger::new(workflow_id, "new_email", "m2", json!({})))
            .await
            .unwrap();

        let removed = store
            .prune_older_than(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }
}
