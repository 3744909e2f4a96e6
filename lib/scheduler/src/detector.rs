//! Trigger detectors (C4).
//!
//! Per trigger type, a detector fetches the latest provider items through
//! the dispatcher and normalizes them into [`TriggerEvent`]s. Every event
//! carries a stable external id (Gmail message id, Slack `ts`, GitHub
//! number/sha/comment id) and a flattened `trigger` payload for template
//! substitution. Candidates are sorted newest first so the first unprocessed
//! event after dedup filtering is the most recent one.
//!
//! A detector that lacks required config returns an empty list; that is not
//! a failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patchbay_core::{AppName, UserId};
use patchbay_integration::{ApiError, Dispatcher};
use patchbay_workflow::TriggerStep;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::str::FromStr;
use std::sync::Arc;

/// Gmail query applied when the workflow does not override it.
pub const DEFAULT_GMAIL_QUERY: &str = "is:unread newer_than:2d";

/// Gmail id-list cap per poll (hydration is further capped by the adapter).
pub const GMAIL_ID_CAP: u32 = 10;

/// Slack history fetch limit per poll.
pub const SLACK_MESSAGE_LIMIT: u32 = 10;

/// The closed set of trigger types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    NewEmail,
    EmailStarred,
    NewChannelMessage,
    NewIssue,
    PullRequestOpened,
    IssueCommented,
    CommitPushed,
}

impl TriggerKind {
    /// Returns the snake_case name used in step configs and dedup rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NewEmail => "new_email",
            Self::EmailStarred => "email_starred",
            Self::NewChannelMessage => "new_channel_message",
            Self::NewIssue => "new_issue",
            Self::PullRequestOpened => "pull_request_opened",
            Self::IssueCommented => "issue_commented",
            Self::CommitPushed => "commit_pushed",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_email" => Ok(Self::NewEmail),
            "email_starred" => Ok(Self::EmailStarred),
            "new_channel_message" => Ok(Self::NewChannelMessage),
            "new_issue" => Ok(Self::NewIssue),
            "pull_request_opened" => Ok(Self::PullRequestOpened),
            "issue_commented" => Ok(Self::IssueCommented),
            "commit_pushed" => Ok(Self::CommitPushed),
            _ => Err(()),
        }
    }
}

/// A normalized candidate event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// The trigger type that produced this event.
    pub trigger_id: String,
    /// Provider-assigned stable id, unique within (workflow, trigger type).
    pub external_id: String,
    /// Event timestamp used for newest-first ordering.
    pub timestamp: DateTime<Utc>,
    /// Payload for the interpreter; the flattened item lives under
    /// `trigger`.
    pub data: JsonValue,
}

impl TriggerEvent {
    fn new(kind: TriggerKind, external_id: String, timestamp: DateTime<Utc>, trigger: JsonValue) -> Self {
        Self {
            trigger_id: kind.as_str().to_string(),
            external_id,
            timestamp,
            data: json!({ "trigger": trigger }),
        }
    }
}

/// Seam between the poller and the detector routines.
///
/// The production implementation fetches through the dispatcher; tests swap
/// in [`StaticEventSource`].
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Produces candidate events for a workflow's trigger step, newest
    /// first.
    async fn detect(
        &self,
        user_id: UserId,
        trigger: &TriggerStep,
    ) -> Result<Vec<TriggerEvent>, ApiError>;
}

/// Production event source backed by the dispatcher.
pub struct DispatcherEventSource {
    dispatcher: Arc<Dispatcher>,
}

impl DispatcherEventSource {
    /// Creates an event source over the dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl EventSource for DispatcherEventSource {
    async fn detect(
        &self,
        user_id: UserId,
        trigger: &TriggerStep,
    ) -> Result<Vec<TriggerEvent>, ApiError> {
        detect(&self.dispatcher, user_id, trigger).await
    }
}

/// Fixed-output event source for tests.
pub struct StaticEventSource {
    events: Vec<TriggerEvent>,
}

impl StaticEventSource {
    /// Creates a source that always returns `events`.
    #[must_use]
    pub fn new(events: Vec<TriggerEvent>) -> Self {
        Self { events }
    }

    /// Builds an event the way detectors shape them.
    #[must_use]
    pub fn event(
        kind: TriggerKind,
        external_id: &str,
        timestamp: DateTime<Utc>,
        trigger: JsonValue,
    ) -> TriggerEvent {
        TriggerEvent::new(kind, external_id.to_string(), timestamp, trigger)
    }
}

#[async_trait]
impl EventSource for StaticEventSource {
    async fn detect(
        &self,
        _user_id: UserId,
        _trigger: &TriggerStep,
    ) -> Result<Vec<TriggerEvent>, ApiError> {
        Ok(self.events.clone())
    }
}

/// Runs the detector for a trigger step.
pub async fn detect(
    dispatcher: &Dispatcher,
    user_id: UserId,
    trigger: &TriggerStep,
) -> Result<Vec<TriggerEvent>, ApiError> {
    let Ok(kind) = trigger.trigger_id.parse::<TriggerKind>() else {
        tracing::debug!(trigger_id = trigger.trigger_id, "unknown trigger type");
        return Ok(Vec::new());
    };

    let config = &trigger.config;
    let mut events = match kind {
        TriggerKind::NewEmail => {
            let query = config_str(config, "query")
                .unwrap_or_else(|| DEFAULT_GMAIL_QUERY.to_string());
            fetch_emails(dispatcher, user_id, kind, &query).await?
        }
        TriggerKind::EmailStarred => {
            // User overrides are ignored; starred means starred.
            fetch_emails(dispatcher, user_id, kind, "is:starred").await?
        }
        TriggerKind::NewChannelMessage => {
            let Some(channel) = config_str(config, "channel") else {
                return Ok(Vec::new());
            };
            let result = dispatcher
                .call(
                    user_id,
                    AppName::Slack,
                    "fetchMessages",
                    json!({ "channel": channel, "limit": SLACK_MESSAGE_LIMIT }),
                )
                .await?;
            as_items(&result).iter().filter_map(map_channel_message).collect()
        }
        TriggerKind::NewIssue => {
            let Some((owner, repo)) = repo_config(config) else {
                return Ok(Vec::new());
            };
            let result = dispatcher
                .call(
                    user_id,
                    AppName::Github,
                    "listIssues",
                    json!({ "owner": owner, "repo": repo, "state": "open" }),
                )
                .await?;
            as_items(&result)
                .iter()
                // The issues endpoint includes pull requests.
                .filter(|item| item.get("pull_request").is_none())
                .filter_map(|item| map_issue(item, TriggerKind::NewIssue))
                .collect()
        }
        TriggerKind::PullRequestOpened => {
            let Some((owner, repo)) = repo_config(config) else {
                return Ok(Vec::new());
            };
            let result = dispatcher
                .call(
                    user_id,
                    AppName::Github,
                    "listPulls",
                    json!({ "owner": owner, "repo": repo, "state": "open" }),
                )
                .await?;
            as_items(&result)
                .iter()
                .filter_map(|item| map_issue(item, TriggerKind::PullRequestOpened))
                .collect()
        }
        TriggerKind::IssueCommented => {
            let Some((owner, repo)) = repo_config(config) else {
                return Ok(Vec::new());
            };
            let result = dispatcher
                .call(
                    user_id,
                    AppName::Github,
                    "listIssueComments",
                    json!({ "owner": owner, "repo": repo }),
                )
                .await?;
            as_items(&result).iter().filter_map(map_issue_comment).collect()
        }
        TriggerKind::CommitPushed => {
            let Some((owner, repo)) = repo_config(config) else {
                return Ok(Vec::new());
            };
            let mut args = json!({ "owner": owner, "repo": repo });
            if let Some(branch) = config_str(config, "branch") {
                args["branch"] = json!(branch);
            }
            let result = dispatcher
                .call(user_id, AppName::Github, "listCommits", args)
                .await?;
            as_items(&result).iter().filter_map(map_commit).collect()
        }
    };

    // Newest first, so the first unprocessed candidate after dedup filtering
    // is the most recent event.
    events.sort_by(|a: &TriggerEvent, b: &TriggerEvent| b.timestamp.cmp(&a.timestamp));
    Ok(events)
}

async fn fetch_emails(
    dispatcher: &Dispatcher,
    user_id: UserId,
    kind: TriggerKind,
    query: &str,
) -> Result<Vec<TriggerEvent>, ApiError> {
    let result = dispatcher
        .call(
            user_id,
            AppName::Gmail,
            "fetchMessages",
            json!({ "query": query, "maxResults": GMAIL_ID_CAP }),
        )
        .await?;
    Ok(as_items(&result)
        .iter()
        .filter_map(|item| map_email(item, kind))
        .collect())
}

fn map_email(item: &JsonValue, kind: TriggerKind) -> Option<TriggerEvent> {
    let id = item["id"].as_str()?.to_string();
    let timestamp = parse_timestamp(&item["timestamp"])?;
    let trigger = json!({
        "id": id.clone(),
        "threadId": item["thread_id"],
        "from": item["from"],
        "to": item["to"],
        "subject": item["subject"],
        "body": item["body"],
        "timestamp": timestamp.to_rfc3339(),
    });
    Some(TriggerEvent::new(kind, id, timestamp, trigger))
}

fn map_channel_message(item: &JsonValue) -> Option<TriggerEvent> {
    let ts = item["ts"].as_str()?.to_string();
    let timestamp = parse_timestamp(&item["timestamp"])?;
    let trigger = json!({
        "ts": ts.clone(),
        "channel": item["channel"],
        "user": item["user"],
        "text": item["text"],
        "timestamp": timestamp.to_rfc3339(),
    });
    Some(TriggerEvent::new(
        TriggerKind::NewChannelMessage,
        ts,
        timestamp,
        trigger,
    ))
}

fn map_issue(item: &JsonValue, kind: TriggerKind) -> Option<TriggerEvent> {
    let number = item["number"].as_u64()?;
    let timestamp = parse_timestamp(&item["created_at"])?;
    let trigger = json!({
        "number": number,
        "title": item["title"],
        "body": item["body"],
        "user": item["user"]["login"],
        "state": item["state"],
        "url": item["html_url"],
        "timestamp": timestamp.to_rfc3339(),
    });
    Some(TriggerEvent::new(kind, number.to_string(), timestamp, trigger))
}

fn map_issue_comment(item: &JsonValue) -> Option<TriggerEvent> {
    let id = item["id"].as_u64()?;
    let timestamp = parse_timestamp(&item["created_at"])?;
    let trigger = json!({
        "id": id,
        "issue_number": issue_number_from_url(item["issue_url"].as_str().unwrap_or_default()),
        "body": item["body"],
        "user": item["user"]["login"],
        "url": item["html_url"],
        "timestamp": timestamp.to_rfc3339(),
    });
    Some(TriggerEvent::new(
        TriggerKind::IssueCommented,
        id.to_string(),
        timestamp,
        trigger,
    ))
}

fn map_commit(item: &JsonValue) -> Option<TriggerEvent> {
    let sha = item["sha"].as_str()?.to_string();
    let timestamp = parse_timestamp(&item["commit"]["author"]["date"])?;
    let trigger = json!({
        "sha": sha.clone(),
        "message": item["commit"]["message"],
        "author": item["commit"]["author"]["name"],
        "url": item["html_url"],
        "timestamp": timestamp.to_rfc3339(),
    });
    Some(TriggerEvent::new(
        TriggerKind::CommitPushed,
        sha,
        timestamp,
        trigger,
    ))
}

fn as_items(value: &JsonValue) -> Vec<JsonValue> {
    value.as_array().cloned().unwrap_or_default()
}

fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn config_str(config: &serde_json::Map<String, JsonValue>, key: &str) -> Option<String> {
    match config.get(key) {
        Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn repo_config(config: &serde_json::Map<String, JsonValue>) -> Option<(String, String)> {
    Some((config_str(config, "owner")?, config_str(config, "repo")?))
}

fn issue_number_from_url(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.parse().ok()
}
