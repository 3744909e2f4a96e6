//! NATS JetStream backend for the job queue.
//!
//! Jobs are published to a work-queue stream under a per-workflow subject
//! (`workflow.jobs.<workflow_id>`), so removing a deactivated workflow's
//! pending jobs is a subject purge. The consumer's `max_deliver` and
//! `backoff` encode the retry policy; a non-retryable failure terminates the
//! message explicitly.

use crate::queue::{FailureDisposition, Job, JobQueue, LeasedJob, QueueError, RetryPolicy};
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_nats::jetstream::consumer::PullConsumer;
use async_trait::async_trait;
use futures::StreamExt;
use patchbay_core::{JobId, WorkflowId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Subject prefix for job messages.
const JOBS_SUBJECT_PREFIX: &str = "workflow.jobs";

/// Stream name for jobs.
const JOBS_STREAM_NAME: &str = "WORKFLOW_JOBS";

/// Durable consumer name shared by the worker pool.
const WORKERS_CONSUMER_NAME: &str = "workflow-workers";

/// How long a leased job may run before redelivery.
const ACK_WAIT: Duration = Duration::from_secs(120);

/// Configuration for the NATS-backed queue.
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name (defaults to WORKFLOW_JOBS).
    pub stream_name: Option<String>,
    /// Per-job retry policy.
    pub retry: RetryPolicy,
}

impl NatsQueueConfig {
    /// Creates a config with the default stream name and retry policy.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: None,
            retry: RetryPolicy::default(),
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(JOBS_STREAM_NAME)
    }
}

/// JetStream-backed durable job queue.
pub struct NatsJobQueue {
    jetstream: jetstream::Context,
    consumer: PullConsumer,
    config: NatsQueueConfig,
    /// Leased messages awaiting ack, keyed by job id.
    pending: Mutex<HashMap<JobId, jetstream::Message>>,
}

impl NatsJobQueue {
    /// Connects and ensures the stream and durable consumer exist.
    pub async fn new(config: NatsQueueConfig) -> Result<Self, QueueError> {
        let client = async_nats::connect(&config.url).await.map_err(|e| {
            QueueError::ConnectionFailed {
                message: e.to_string(),
            }
        })?;
        let jetstream = jetstream::new(client);

        let stream_config = jetstream::stream::Config {
            name: config.stream().to_string(),
            subjects: vec![format!("{JOBS_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };
        let stream = jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to create jobs stream: {e}"),
            })?;

        let consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(WORKERS_CONSUMER_NAME.to_string()),
            ack_wait: ACK_WAIT,
            max_deliver: i64::from(config.retry.max_attempts),
            backoff: config.retry.schedule(),
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(WORKERS_CONSUMER_NAME, consumer_config)
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to create workers consumer: {e}"),
            })?;

        Ok(Self {
            jetstream,
            consumer,
            config,
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn job_subject(workflow_id: WorkflowId) -> String {
        format!("{JOBS_SUBJECT_PREFIX}.{workflow_id}")
    }

    fn take_pending(&self, job_id: JobId) -> Option<jetstream::Message> {
        self.pending.lock().unwrap().remove(&job_id)
    }
}

#[async_trait]
impl JobQueue for NatsJobQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let subject = Self::job_subject(job.workflow_id);
        let bytes = serde_json::to_vec(&job).map_err(|e| QueueError::Serialization {
            message: e.to_string(),
        })?;

        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| QueueError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| QueueError::PublishFailed {
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn fetch(&self, wait: Duration) -> Result<Option<LeasedJob>, QueueError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| QueueError::FetchFailed {
                message: e.to_string(),
            })?;

        let Some(message) = messages.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| QueueError::FetchFailed {
            message: e.to_string(),
        })?;

        let job: Job =
            serde_json::from_slice(&message.payload).map_err(|e| QueueError::Serialization {
                message: e.to_string(),
            })?;

        // JetStream counts deliveries from 1.
        let attempts_made = message
            .info()
            .map(|info| info.delivered.saturating_sub(1) as u32)
            .unwrap_or(0);

        let lease = LeasedJob {
            job,
            attempts_made,
        };
        self.pending.lock().unwrap().insert(lease.job.id, message);
        Ok(Some(lease))
    }

    async fn complete(&self, lease: &LeasedJob) -> Result<(), QueueError> {
        let Some(message) = self.take_pending(lease.job.id) else {
            return Ok(());
        };
        message.ack().await.map_err(|e| QueueError::FetchFailed {
            message: format!("ack failed: {e}"),
        })
    }

    async fn fail(
        &self,
        lease: LeasedJob,
        _error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition, QueueError> {
        let attempts_made = lease.attempts_made + 1;
        let terminal = !retryable || attempts_made >= self.config.retry.max_attempts;

        let Some(message) = self.take_pending(lease.job.id) else {
            // Lease lost (e.g. ack window elapsed); JetStream will redeliver
            // on its own schedule.
            return Ok(if terminal {
                FailureDisposition::Terminal
            } else {
                FailureDisposition::Retrying {
                    delay: self.config.retry.delay_for(attempts_made),
                }
            });
        };

        if terminal {
            message
                .ack_with(AckKind::Term)
                .await
                .map_err(|e| QueueError::FetchFailed {
                    message: format!("term failed: {e}"),
                })?;
            return Ok(FailureDisposition::Terminal);
        }

        let delay = self.config.retry.delay_for(attempts_made);
        message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| QueueError::FetchFailed {
                message: format!("nak failed: {e}"),
            })?;
        Ok(FailureDisposition::Retrying { delay })
    }

    async fn remove_jobs_for(&self, workflow_id: WorkflowId) -> Result<u64, QueueError> {
        let stream = self
            .jetstream
            .get_stream(self.config.stream())
            .await
            .map_err(|e| QueueError::FetchFailed {
                message: format!("failed to get stream: {e}"),
            })?;

        let response = stream
            .purge()
            .filter(&Self::job_subject(workflow_id))
            .await
            .map_err(|e| QueueError::FetchFailed {
                message: format!("purge failed: {e}"),
            })?;

        Ok(response.purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_subject_embeds_the_workflow_id() {
        let workflow_id = WorkflowId::new();
        let subject = NatsJobQueue::job_subject(workflow_id);
        assert!(subject.starts_with("workflow.jobs.wf_"));
        assert!(subject.ends_with(&workflow_id.as_ulid().to_string()));
    }

    #[test]
    fn config_defaults() {
        let config = NatsQueueConfig::new("nats://localhost:4222");
        assert_eq!(config.stream(), JOBS_STREAM_NAME);
        assert_eq!(config.retry.max_attempts, 3);
    }
}
