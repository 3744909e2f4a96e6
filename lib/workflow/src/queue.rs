//! The durable job queue contract and its in-memory backend.
//!
//! The queue decouples detection from execution: the scheduler appends at
//! most one job per poll, workers pull with bounded concurrency. Per job the
//! retry policy allows 3 attempts with exponential backoff from a 1 s base
//! (retries at 1 s, 2 s, 4 s). Completed jobs are evicted; terminally failed
//! jobs are retained for inspection. Delivery is at-least-once; the dedup
//! store makes duplicate execution safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{JobId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A unit of work: execute one workflow for one triggering event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,
    /// The workflow to execute.
    pub workflow_id: WorkflowId,
    /// The owning user.
    pub user_id: UserId,
    /// The full normalized detector payload.
    pub trigger_data: JsonValue,
}

impl Job {
    /// Creates a job for a detected event.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, user_id: UserId, trigger_data: JsonValue) -> Self {
        Self {
            id: JobId::new(),
            workflow_id,
            user_id,
            trigger_data,
        }
    }
}

/// A job leased to a worker, with its delivery history.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The job payload.
    pub job: Job,
    /// Attempts completed before this lease (0 on the first delivery).
    pub attempts_made: u32,
}

/// Retry policy applied per job.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts before a job is terminal.
    pub max_attempts: u32,
    /// Backoff base; attempt n retries after `base * 2^(n-1)`.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Returns the delay before the next delivery after `attempts_made`
    /// failed attempts.
    #[must_use]
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.backoff_base * 2u32.pow(exponent)
    }

    /// Returns the backoff schedule as a list, one delay per retry.
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.delay_for(n)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The job will be redelivered after `delay`.
    Retrying { delay: Duration },
    /// The job is terminally failed and will not be redelivered.
    Terminal,
}

/// Errors from queue backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Failed to reach the backend.
    ConnectionFailed { message: String },
    /// Failed to append a job.
    PublishFailed { message: String },
    /// Failed to pull or acknowledge a job.
    FetchFailed { message: String },
    /// Payload could not be encoded or decoded.
    Serialization { message: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "queue connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "job publish failed: {message}"),
            Self::FetchFailed { message } => write!(f, "job fetch failed: {message}"),
            Self::Serialization { message } => {
                write!(f, "job serialization failed: {message}")
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// The durable FIFO queue contract (C7).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Appends a job.
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Leases the next job, waiting up to `wait` when none is ready.
    async fn fetch(&self, wait: Duration) -> Result<Option<LeasedJob>, QueueError>;

    /// Acknowledges a finished job; it is evicted from the queue.
    async fn complete(&self, lease: &LeasedJob) -> Result<(), QueueError>;

    /// Reports a failed job. Retryable failures go back on the queue per the
    /// retry policy; non-retryable ones (and exhausted jobs) are terminal.
    async fn fail(
        &self,
        lease: LeasedJob,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, QueueError>;

    /// Removes waiting and delayed jobs for a workflow (deactivation),
    /// returning the count removed. In-flight jobs finish normally.
    async fn remove_jobs_for(&self, workflow_id: WorkflowId) -> Result<u64, QueueError>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<LeasedJob>,
    delayed: Vec<(DateTime<Utc>, LeasedJob)>,
    failed: Vec<(Job, String)>,
}

/// In-memory job queue.
///
/// Single-process FIFO with the full retry policy; backs tests and
/// deployments without a queue backend. Not durable across restarts.
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    policy: RetryPolicy,
}

impl InMemoryJobQueue {
    /// Creates an empty queue with the given retry policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            policy,
        }
    }

    /// Number of jobs waiting or delayed.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.ready.len() + state.delayed.len()
    }

    /// Terminally failed jobs, retained for inspection.
    #[must_use]
    pub fn failed_jobs(&self) -> Vec<(Job, String)> {
        self.state.lock().unwrap().failed.clone()
    }

    /// Promotes due delayed jobs, then pops the next ready job. Returns the
    /// job (if any) and the wall-clock of the earliest still-delayed job.
    fn try_pop(&self) -> (Option<LeasedJob>, Option<DateTime<Utc>>) {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        let mut still_delayed = Vec::with_capacity(state.delayed.len());
        let mut now_ready = Vec::new();
        for (due, lease) in state.delayed.drain(..) {
            if due <= now {
                now_ready.push(lease);
            } else {
                still_delayed.push((due, lease));
            }
        }
        state.delayed = still_delayed;
        for lease in now_ready {
            state.ready.push_back(lease);
        }

        let next_due = state.delayed.iter().map(|(due, _)| *due).min();
        (state.ready.pop_front(), next_due)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.state.lock().unwrap().ready.push_back(LeasedJob {
            job,
            attempts_made: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn fetch(&self, wait: Duration) -> Result<Option<LeasedJob>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let (job, next_due) = self.try_pop();
            if let Some(job) = job {
                return Ok(Some(job));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Sleep until the deadline, the next delayed job, or a new
            // enqueue, whichever comes first.
            let sleep_until = match next_due {
                Some(due) => {
                    let until_due = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    deadline.min(now + until_due)
                }
                None => deadline,
            };
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(sleep_until) => {}
            }
        }
    }

    async fn complete(&self, _lease: &LeasedJob) -> Result<(), QueueError> {
        // The lease was removed from the queue at fetch time; completion
        // evicts it by simply not re-adding it.
        Ok(())
    }

    async fn fail(
        &self,
        lease: LeasedJob,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, QueueError> {
        let attempts_made = lease.attempts_made + 1;

        if !retryable || attempts_made >= self.policy.max_attempts {
            self.state
                .lock()
                .unwrap()
                .failed
                .push((lease.job, error.to_string()));
            return Ok(FailureDisposition::Terminal);
        }

        let delay = self.policy.delay_for(attempts_made);
        let due = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        self.state.lock().unwrap().delayed.push((
            due,
            LeasedJob {
                job: lease.job,
                attempts_made,
            },
        ));
        self.notify.notify_one();
        Ok(FailureDisposition::Retrying { delay })
    }

    async fn remove_jobs_for(&self, workflow_id: WorkflowId) -> Result<u64, QueueError> {
        let mut state = self.state.lock().unwrap();
        let before = state.ready.len() + state.delayed.len();
        state.ready.retain(|l| l.job.workflow_id != workflow_id);
        state.delayed.retain(|(_, l)| l.job.workflow_id != workflow_id);
        Ok((before - state.ready.len() - state.delayed.len()) as u64)
    }
}
