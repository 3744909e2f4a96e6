//! The closed catalog of supported actions.
//!
//! An action step's free-form config is turned into a typed dispatcher call
//! at execution time. Missing required fields are configuration-level
//! failures: they produce a `failed` outcome synchronously and never raise,
//! so the queue does not retry them. Transport and provider failures raise
//! through [`ActionRunner::run`] and follow the queue's retry policy.

use crate::step::ActionStep;
use crate::template::render;
use async_trait::async_trait;
use patchbay_core::{AppName, UserId};
use patchbay_integration::notify::Notifier;
use patchbay_integration::{ApiError, Dispatcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Outcome status of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// The call went through.
    Success,
    /// Configuration-level failure; the call was never made.
    Failed,
}

/// The result record every action returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Success or (config-level) failure.
    pub status: ActionStatus,
    /// Short human-readable summary.
    pub detail: String,
    /// Provider response, when a call was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
}

impl ActionOutcome {
    /// Creates a success outcome.
    #[must_use]
    pub fn success(detail: impl Into<String>, output: Option<JsonValue>) -> Self {
        Self {
            status: ActionStatus::Success,
            detail: detail.into(),
            output,
        }
    }

    /// Creates a config-level failure outcome.
    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failed,
            detail: detail.into(),
            output: None,
        }
    }
}

/// A fully-resolved dispatcher call derived from an action step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCall {
    /// Target app.
    pub app: AppName,
    /// Dispatcher method.
    pub method: &'static str,
    /// Method arguments, templates already substituted.
    pub args: JsonValue,
    /// Summary used on the success outcome.
    pub summary: String,
}

/// Seam between the interpreter and the integration layer.
///
/// The production implementation routes through the dispatcher; tests swap
/// in [`MockActionRunner`].
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Executes one action step against `trigger_data`.
    async fn run(
        &self,
        user_id: UserId,
        step: &ActionStep,
        trigger_data: &JsonValue,
    ) -> Result<ActionOutcome, ApiError>;
}

/// Production action runner backed by the dispatcher.
pub struct DispatcherActions {
    dispatcher: Arc<Dispatcher>,
    notifier: Arc<dyn Notifier>,
}

impl DispatcherActions {
    /// Creates a runner over the dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            dispatcher,
            notifier,
        }
    }
}

#[async_trait]
impl ActionRunner for DispatcherActions {
    async fn run(
        &self,
        user_id: UserId,
        step: &ActionStep,
        trigger_data: &JsonValue,
    ) -> Result<ActionOutcome, ApiError> {
        let call = match build_call(step, trigger_data) {
            Ok(call) => call,
            Err(detail) => return Ok(ActionOutcome::failed(detail)),
        };

        match self
            .dispatcher
            .call(user_id, call.app, call.method, call.args)
            .await
        {
            Ok(output) => Ok(ActionOutcome::success(call.summary, Some(output))),
            Err(e) => {
                if let ApiError::NotConnected { app } = e {
                    self.notifier.notify(user_id, app, &e.to_string()).await;
                }
                Err(e)
            }
        }
    }
}

/// Resolves an action step into a dispatcher call.
///
/// # Errors
///
/// Returns a human-readable detail string for configuration-level failures
/// (unknown action, missing required fields).
pub fn build_call(step: &ActionStep, trigger_data: &JsonValue) -> Result<ActionCall, String> {
    let action_id = step.effective_action_id();
    let config = &step.config;

    match action_id {
        "send_channel_message" => {
            let channel = require(config, action_id, "channel")?;
            let text = first_rendered(config, &["message", "text", "description"], trigger_data)
                .ok_or_else(|| format!("{action_id}: no message text configured"))?;
            Ok(ActionCall {
                app: AppName::Slack,
                method: "postMessage",
                args: json!({ "channel": channel, "text": text }),
                summary: format!("sent message to channel {channel}"),
            })
        }
        "send_dm" => {
            let text = first_rendered(config, &["text", "message"], trigger_data)
                .ok_or_else(|| format!("{action_id}: no message text configured"))?;
            let mut args = json!({ "text": text });
            if let Some(user) = raw_str(config, "userId").or_else(|| raw_str(config, "user_id")) {
                args["userId"] = json!(user);
            }
            Ok(ActionCall {
                app: AppName::Slack,
                method: "sendDm",
                args,
                summary: "sent direct message".to_string(),
            })
        }
        "update_message" => {
            let channel = require(config, action_id, "channel")?;
            let ts = require(config, action_id, "messageTs")?;
            let text = require(config, action_id, "text")?;
            Ok(ActionCall {
                app: AppName::Slack,
                method: "updateMessage",
                args: json!({ "channel": channel, "messageTs": ts, "text": text }),
                summary: format!("updated message {ts} in {channel}"),
            })
        }
        "add_reaction" => {
            let channel = require(config, action_id, "channel")?;
            let ts = require(config, action_id, "messageTs")?;
            let name = require(config, action_id, "reactionName")?;
            Ok(ActionCall {
                app: AppName::Slack,
                method: "addReaction",
                args: json!({ "channel": channel, "messageTs": ts, "reactionName": name }),
                summary: format!("added :{name}: to message {ts}"),
            })
        }
        "send_email" => {
            let to = require(config, action_id, "to")?;
            let subject = rendered(config, "subject", trigger_data).unwrap_or_default();
            let body = rendered(config, "body", trigger_data).unwrap_or_default();
            Ok(ActionCall {
                app: AppName::Gmail,
                method: "sendEmail",
                args: json!({ "to": to, "subject": subject, "body": body }),
                summary: format!("sent email to {to}"),
            })
        }
        "reply_to_email" => {
            let message_id = require_rendered(config, action_id, "messageId", trigger_data)?;
            let thread_id = require_rendered(config, action_id, "threadId", trigger_data)?;
            let body = rendered(config, "body", trigger_data).unwrap_or_default();
            let mut args = json!({
                "messageId": message_id,
                "threadId": thread_id,
                "body": body,
            });
            if let Some(subject) = rendered(config, "subject", trigger_data) {
                args["subject"] = json!(subject);
            }
            Ok(ActionCall {
                app: AppName::Gmail,
                method: "replyEmail",
                args,
                summary: format!("replied to message {message_id}"),
            })
        }
        "add_label_to_email" => {
            let message_id = require_rendered(config, action_id, "messageId", trigger_data)?;
            let labels = config
                .get("labelIds")
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| format!("{action_id} requires 'labelIds'"))?;
            Ok(ActionCall {
                app: AppName::Gmail,
                method: "addLabels",
                args: json!({ "messageId": message_id, "labelIds": labels }),
                summary: format!("labeled message {message_id}"),
            })
        }
        "star_email" => {
            let message_id = require_rendered(config, action_id, "messageId", trigger_data)?;
            Ok(ActionCall {
                app: AppName::Gmail,
                method: "addLabels",
                args: json!({ "messageId": message_id, "labelIds": ["STARRED"] }),
                summary: format!("starred message {message_id}"),
            })
        }
        "create_issue" => {
            let owner = require(config, action_id, "owner")?;
            let repo = require(config, action_id, "repo")?;
            let title = require_rendered(config, action_id, "title", trigger_data)?;
            let body = rendered(config, "body", trigger_data).unwrap_or_default();
            Ok(ActionCall {
                app: AppName::Github,
                method: "createIssue",
                args: json!({ "owner": owner, "repo": repo, "title": title, "body": body }),
                summary: format!("created issue in {owner}/{repo}"),
            })
        }
        "add_comment_to_issue" => {
            let owner = require(config, action_id, "owner")?;
            let repo = require(config, action_id, "repo")?;
            let number = require(config, action_id, "issue_number")?;
            let comment = require_rendered(config, action_id, "comment", trigger_data)?;
            Ok(ActionCall {
                app: AppName::Github,
                method: "addIssueComment",
                args: json!({
                    "owner": owner, "repo": repo,
                    "issue_number": number, "comment": comment,
                }),
                summary: format!("commented on {owner}/{repo}#{number}"),
            })
        }
        "close_issue" => {
            let owner = require(config, action_id, "owner")?;
            let repo = require(config, action_id, "repo")?;
            let number = require(config, action_id, "issue_number")?;
            Ok(ActionCall {
                app: AppName::Github,
                method: "closeIssue",
                args: json!({ "owner": owner, "repo": repo, "issue_number": number }),
                summary: format!("closed {owner}/{repo}#{number}"),
            })
        }
        "assign_issue" => {
            let owner = require(config, action_id, "owner")?;
            let repo = require(config, action_id, "repo")?;
            let number = require(config, action_id, "issue_number")?;
            let assignees = config
                .get("assignees")
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| format!("{action_id} requires 'assignees'"))?;
            Ok(ActionCall {
                app: AppName::Github,
                method: "assignIssue",
                args: json!({
                    "owner": owner, "repo": repo,
                    "issue_number": number, "assignees": assignees,
                }),
                summary: format!("assigned {owner}/{repo}#{number}"),
            })
        }
        "send_webhook" => {
            let url = require(config, action_id, "url")?;
            let payload = match config.get("payload") {
                Some(JsonValue::String(template)) => json!(render(template, trigger_data)),
                Some(other) => other.clone(),
                None => JsonValue::Null,
            };
            Ok(ActionCall {
                app: AppName::Webhook,
                method: "send",
                args: json!({ "url": url, "payload": payload }),
                summary: format!("delivered webhook to {url}"),
            })
        }
        other => Err(format!("unknown action: {other}")),
    }
}

fn raw_str(config: &Map<String, JsonValue>, key: &str) -> Option<String> {
    match config.get(key) {
        Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn require(config: &Map<String, JsonValue>, action_id: &str, key: &str) -> Result<String, String> {
    raw_str(config, key).ok_or_else(|| format!("{action_id} requires '{key}'"))
}

fn rendered(config: &Map<String, JsonValue>, key: &str, data: &JsonValue) -> Option<String> {
    raw_str(config, key).map(|template| render(&template, data))
}

fn require_rendered(
    config: &Map<String, JsonValue>,
    action_id: &str,
    key: &str,
    data: &JsonValue,
) -> Result<String, String> {
    rendered(config, key, data).ok_or_else(|| format!("{action_id} requires '{key}'"))
}

fn first_rendered(
    config: &Map<String, JsonValue>,
    keys: &[&str],
    data: &JsonValue,
) -> Option<String> {
    keys.iter().find_map(|key| rendered(config, key, data))
}

/// Scriptable action runner for tests.
///
/// Pops results from a script queue, falling back to a default outcome once
/// the script is exhausted. Records every step id it was asked to run.
pub struct MockActionRunner {
    script: Mutex<VecDeque<Result<ActionOutcome, ApiError>>>,
    fallback: Result<ActionOutcome, ApiError>,
    calls: Mutex<Vec<String>>,
}

impl MockActionRunner {
    /// A runner whose every call succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(ActionOutcome::success("ok", None)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A runner whose every call raises `error`.
    #[must_use]
    pub fn failing(error: ApiError) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Err(error),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A runner that plays `script` in order, then falls back to success.
    #[must_use]
    pub fn scripted(script: Vec<Result<ActionOutcome, ApiError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Ok(ActionOutcome::success("ok", None)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Step ids run so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionRunner for MockActionRunner {
    async fn run(
        &self,
        _user_id: UserId,
        step: &ActionStep,
        _trigger_data: &JsonValue,
    ) -> Result<ActionOutcome, ApiError> {
        self.calls.lock().unwrap().push(step.id.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => self.fallback.clone(),
        }
    }
}
