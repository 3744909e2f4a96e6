//! The log reaper (C11).
//!
//! Deletes event-log entries and processed-trigger rows older than the
//! retention horizon (30 days by default), once per 24 h.

use chrono::{Duration as ChronoDuration, Utc};
use patchbay_core::EventLog;
use patchbay_workflow::ProcessedTriggerStore;
use std::sync::Arc;
use std::time::Duration;

/// Default retention horizon in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Default reap cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Background retention sweep.
pub struct Reaper {
    events: Arc<dyn EventLog>,
    processed: Arc<dyn ProcessedTriggerStore>,
    retention: ChronoDuration,
    interval: Duration,
}

impl Reaper {
    /// Creates a reaper with the given retention horizon and cadence.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventLog>,
        processed: Arc<dyn ProcessedTriggerStore>,
        retention_days: u32,
        interval: Duration,
    ) -> Self {
        Self {
            events,
            processed,
            retention: ChronoDuration::days(i64::from(retention_days)),
            interval,
        }
    }

    /// Runs the reap loop forever.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, "log reaper started");
        loop {
            interval.tick().await;
            self.reap_once().await;
        }
    }

    /// Performs one retention sweep, returning (log entries, processed
    /// triggers) removed.
    pub async fn reap_once(&self) -> (u64, u64) {
        let cutoff = Utc::now() - self.retention;

        let logs_removed = match self.events.prune_older_than(cutoff).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "failed to prune event log");
                0
            }
        };
        let triggers_removed = match self.processed.prune_older_than(cutoff).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "failed to prune processed triggers");
                0
            }
        };

        if logs_removed > 0 || triggers_removed > 0 {
            tracing::info!(logs_removed, triggers_removed, "retention sweep complete");
        }
        (logs_removed, triggers_removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_core::{EventType, InMemoryEventLog, LogEntry, WorkflowId};
    use patchbay_workflow::{InMemoryProcessedTriggerStore, ProcessedTrigger};
    use serde_json::json;

    #[tokio::test]
    async fn reap_removes_only_rows_past_the_horizon() {
        let events = Arc::new(InMemoryEventLog::new());
        let processed = Arc::new(InMemoryProcessedTriggerStore::new());
        let workflow_id = WorkflowId::new();

        let mut stale = LogEntry::new(EventType::TriggerChecked, json!({}));
        stale.created_at = Utc::now() - ChronoDuration::days(31);
        events.append(stale).await.unwrap();
        events
            .append(LogEntry::new(EventType::TriggerChecked, json!({})))
            .await
            .unwrap();

        let mut old_row = ProcessedTrigger::new(workflow_id, "new_email", "m1", json!({}));
        old_row.processed_at = Utc::now() - ChronoDuration::days(31);
        processed.record(old_row).await.unwrap();
        processed
            .record(ProcessedTrigger::new(workflow_id, "new_email", "m2", json!({})))
            .await
            .unwrap();

        let reaper = Reaper::new(
            events.clone(),
            processed.clone(),
            DEFAULT_RETENTION_DAYS,
            DEFAULT_INTERVAL,
        );
        let (logs_removed, triggers_removed) = reaper.reap_once().await;

        assert_eq!(logs_removed, 1);
        assert_eq!(triggers_removed, 1);
        assert_eq!(events.entries().len(), 1);
        assert_eq!(processed.len(), 1);
    }
}
