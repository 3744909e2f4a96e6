//! The poll sweep (C6).
//!
//! A single periodic loop walks all active workflows sequentially. For each
//! due workflow it runs the trigger detector, filters candidates through the
//! dedup store, and appends at most one job (the newest unprocessed event).
//! The sweep runs inside the tick loop, so two sweeps can never overlap; a
//! sweep outlasting the tick delays the next one.
//!
//! `last_run_at` advances on every poll attempt, whether or not a job was
//! enqueued, and only ever forward.

use crate::detector::EventSource;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use patchbay_core::{EventLog, EventType, LogEntry};
use patchbay_workflow::{Job, JobQueue, ProcessedTriggerStore, Workflow, WorkflowStore};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Default sweep cadence.
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

/// The polling scheduler.
pub struct Poller {
    workflows: Arc<dyn WorkflowStore>,
    source: Arc<dyn EventSource>,
    processed: Arc<dyn ProcessedTriggerStore>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventLog>,
    tick: Duration,
}

impl Poller {
    /// Creates a poller over its collaborators.
    #[must_use]
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        source: Arc<dyn EventSource>,
        processed: Arc<dyn ProcessedTriggerStore>,
        queue: Arc<dyn JobQueue>,
        events: Arc<dyn EventLog>,
        tick: Duration,
    ) -> Self {
        Self {
            workflows,
            source,
            processed,
            queue,
            events,
            tick,
        }
    }

    /// Runs the sweep loop forever.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(tick = ?self.tick, "poll sweep started");
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    /// Performs one sweep over all active workflows.
    pub async fn sweep(&self) {
        let workflows = match self.workflows.list_active().await {
            Ok(workflows) => workflows,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load active workflows");
                return;
            }
        };

        for workflow in workflows {
            // Zero interval means push-based (webhooks); never polled.
            if workflow.polling_interval_seconds == 0 {
                continue;
            }
            if !is_due(&workflow, Utc::now()) {
                continue;
            }
            self.poll_workflow(&workflow).await;
        }
    }

    async fn poll_workflow(&self, workflow: &Workflow) {
        let Some(trigger) = workflow.trigger_step() else {
            tracing::warn!(workflow_id = %workflow.id, "active workflow has no trigger step");
            return;
        };
        let trigger_type = trigger.trigger_id.clone();

        // A trigger failure logs and yields no candidates; it does not fail
        // the sweep.
        let candidates = match self.source.detect(workflow.user_id, trigger).await {
            Ok(candidates) => {
                self.log(
                    workflow,
                    EventType::TriggerChecked,
                    json!({ "trigger_id": trigger_type, "candidates": candidates.len() }),
                )
                .await;
                candidates
            }
            Err(e) => {
                tracing::warn!(workflow_id = %workflow.id, error = %e, "trigger detection failed");
                self.log(
                    workflow,
                    EventType::TriggerChecked,
                    json!({ "trigger_id": trigger_type, "error": e.to_string() }),
                )
                .await;
                Vec::new()
            }
        };

        if candidates.is_empty() {
            self.touch(workflow).await;
            return;
        }

        let ids: Vec<String> = candidates.iter().map(|c| c.external_id.clone()).collect();
        let unprocessed: HashSet<String> = match self
            .processed
            .filter_unprocessed(workflow.id, &trigger_type, ids)
            .await
        {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                tracing::warn!(workflow_id = %workflow.id, error = %e, "dedup filter failed");
                self.touch(workflow).await;
                return;
            }
        };

        // Candidates are newest first; the first unprocessed one is the most
        // recent unprocessed event. Older unprocessed events wait for later
        // polls (or are superseded by newer ones).
        let Some(event) = candidates
            .iter()
            .find(|c| unprocessed.contains(&c.external_id))
        else {
            self.touch(workflow).await;
            return;
        };

        self.log(
            workflow,
            EventType::TriggerFired,
            json!({ "trigger_id": trigger_type, "external_id": event.external_id }),
        )
        .await;

        match serde_json::to_value(event) {
            Ok(trigger_data) => {
                let job = Job::new(workflow.id, workflow.user_id, trigger_data);
                if let Err(e) = self.queue.enqueue(job).await {
                    tracing::warn!(workflow_id = %workflow.id, error = %e, "failed to enqueue job");
                }
            }
            Err(e) => {
                tracing::warn!(workflow_id = %workflow.id, error = %e, "failed to encode job payload");
            }
        }

        // The attempt counts even when the enqueue failed.
        self.touch(workflow).await;
    }

    async fn touch(&self, workflow: &Workflow) {
        if let Err(e) = self.workflows.touch_last_run(workflow.id, Utc::now()).await {
            tracing::warn!(workflow_id = %workflow.id, error = %e, "failed to advance poll clock");
        }
    }

    async fn log(&self, workflow: &Workflow, event_type: EventType, details: serde_json::Value) {
        let entry = LogEntry::new(event_type, details)
            .with_user(workflow.user_id)
            .with_workflow(workflow.id);
        if let Err(e) = self.events.append(entry).await {
            tracing::warn!(error = %e, "failed to append event log entry");
        }
    }
}

/// Whether a workflow's next poll instant has arrived.
///
/// A null `last_run_at` fires immediately.
fn is_due(workflow: &Workflow, now: DateTime<Utc>) -> bool {
    match workflow.last_run_at {
        None => true,
        Some(last) => {
            let interval = ChronoDuration::seconds(workflow.polling_interval_seconds as i64);
            last + interval <= now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{StaticEventSource, TriggerKind};
    use patchbay_core::{AppName, InMemoryEventLog, UserId};
    use patchbay_workflow::{
        ActionStep, InMemoryJobQueue, InMemoryProcessedTriggerStore, InMemoryWorkflowStore,
        ProcessedTrigger, Step, TriggerStep,
    };
    use serde_json::Map;

    fn gmail_workflow(user_id: UserId, name: &str) -> Workflow {
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

    struct Harness {
        poller: Poller,
        workflows: Arc<InMemoryWorkflowStore>,
        processed: Arc<InMemoryProcessedTriggerStore>,
        queue: Arc<InMemoryJobQueue>,
        events: Arc<InMemoryEventLog>,
    }

    async fn harness(source: StaticEventSource, workflow: &Workflow) -> Harness {
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        workflows.create(workflow).await.unwrap();
        let processed = Arc::new(InMemoryProcessedTriggerStore::new());
        let queue = Arc::new(InMemoryJobQueue::default());
        let events = Arc::new(InMemoryEventLog::new());

        let poller = Poller::new(
            workflows.clone(),
            Arc::new(source),
            processed.clone(),
            queue.clone(),
            events.clone(),
            DEFAULT_TICK,
        );
        Harness {
            poller,
            workflows,
            processed,
            queue,
            events,
        }
    }

    fn email_event(external_id: &str, minutes_ago: i64) -> crate::detector::TriggerEvent {
        StaticEventSource::event(
            TriggerKind::NewEmail,
            external_id,
            Utc::now() - ChronoDuration::minutes(minutes_ago),
            json!({ "id": external_id, "from": "a@important.com", "subject": "Hi" }),
        )
    }

    #[tokio::test]
    async fn first_sweep_enqueues_the_newest_unprocessed_event() {
        let user = UserId::new();
        let workflow = gmail_workflow(user, "inbox");
        // Newest first, as detectors order them.
        let source = StaticEventSource::new(vec![email_event("m3", 1), email_event("m1", 30)]);
        let h = harness(source, &workflow).await;

        h.poller.sweep().await;

        assert_eq!(h.queue.waiting_count(), 1);
        let lease = h
            .queue
            .fetch(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.job.trigger_data["external_id"], "m3");
        assert_eq!(lease.job.trigger_data["data"]["trigger"]["from"], "a@important.com");

        // Poll clock advanced.
        let stored = h.workflows.find(workflow.id).await.unwrap().unwrap();
        assert!(stored.last_run_at.is_some());

        let types: Vec<EventType> = h.events.entries().iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::TriggerChecked));
        assert!(types.contains(&EventType::TriggerFired));
    }

    #[tokio::test]
    async fn processed_events_are_not_enqueued_again() {
        let user = UserId::new();
        let workflow = gmail_workflow(user, "inbox");
        let source = StaticEventSource::new(vec![email_event("m1", 1)]);
        let h = harness(source, &workflow).await;

        h.poller.sweep().await;
        assert_eq!(h.queue.waiting_count(), 1);
        h.queue.fetch(Duration::from_millis(10)).await.unwrap();

        // Simulate a completed run: the executor records the marker.
        h.processed
            .record(ProcessedTrigger::new(workflow.id, "new_email", "m1", json!({})))
            .await
            .unwrap();

        // Force the workflow due again and sweep with the same detector
        // output.
        h.workflows
            .touch_last_run(workflow.id, Utc::now() - ChronoDuration::minutes(5))
            .await
            .unwrap();
        h.poller.sweep().await;

        assert_eq!(h.queue.waiting_count(), 0);
    }

    #[tokio::test]
    async fn workflow_not_yet_due_is_skipped() {
        let user = UserId::new();
        let workflow = gmail_workflow(user, "inbox");
        let source = StaticEventSource::new(vec![email_event("m1", 1)]);
        let h = harness(source, &workflow).await;

        // Just polled: gmail interval is 60 s.
        h.workflows
            .touch_last_run(workflow.id, Utc::now())
            .await
            .unwrap();
        h.poller.sweep().await;

        assert_eq!(h.queue.waiting_count(), 0);
    }

    #[tokio::test]
    async fn empty_detector_output_still_advances_the_clock() {
        let user = UserId::new();
        let workflow = gmail_workflow(user, "inbox");
        let h = harness(StaticEventSource::new(Vec::new()), &workflow).await;

        let before = Utc::now();
        h.poller.sweep().await;

        let stored = h.workflows.find(workflow.id).await.unwrap().unwrap();
        let last_run = stored.last_run_at.expect("clock advanced");
        assert!(last_run >= before);
        assert_eq!(h.queue.waiting_count(), 0);
    }

    #[tokio::test]
    async fn poll_clock_advances_on_every_due_sweep() {
        let user = UserId::new();
        let workflow = gmail_workflow(user, "inbox");
        let h = harness(StaticEventSource::new(Vec::new()), &workflow).await;

        h.poller.sweep().await;
        let first = h
            .workflows
            .find(workflow.id)
            .await
            .unwrap()
            .unwrap()
            .last_run_at
            .unwrap();

        // Force due and sweep again; the clock lands at the new sweep time.
        h.workflows
            .touch_last_run(workflow.id, first - ChronoDuration::minutes(5))
            .await
            .unwrap();
        h.poller.sweep().await;
        let second = h
            .workflows
            .find(workflow.id)
            .await
            .unwrap()
            .unwrap()
            .last_run_at
            .unwrap();

        assert!(second >= first);
    }

    #[tokio::test]
    async fn is_due_logic() {
        let user = UserId::new();
        let mut workflow = gmail_workflow(user, "inbox");
        let now = Utc::now();

        // Never polled: due immediately.
        assert!(is_due(&workflow, now));

        // Polled 10 s ago with a 60 s interval: not due.
        workflow.last_run_at = Some(now - ChronoDuration::seconds(10));
        assert!(!is_due(&workflow, now));

        // Polled 2 min ago: due.
        workflow.last_run_at = Some(now - ChronoDuration::minutes(2));
        assert!(is_due(&workflow, now));
    }
}
