//! The step model: tagged trigger/condition/action records.
//!
//! Step `config` maps stay free-form; typed views are derived from them at
//! execution time with explicit validation. Step ids are plain strings unique
//! within their workflow; the conventional layout numbers them from `"1"`
//! (the trigger).

use patchbay_core::AppName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    /// The polling probe that starts runs.
    Trigger(TriggerStep),
    /// A single-predicate branch over the trigger payload.
    Condition(ConditionStep),
    /// A third-party API call.
    Action(ActionStep),
}

impl Step {
    /// Returns the step id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Trigger(s) => &s.id,
            Self::Condition(s) => &s.id,
            Self::Action(s) => &s.id,
        }
    }

    /// Returns the step type name used in logs.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Trigger(_) => "trigger",
            Self::Condition(_) => "condition",
            Self::Action(_) => "action",
        }
    }
}

/// The trigger step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerStep {
    /// Step id, unique within the workflow.
    pub id: String,
    /// App the trigger polls.
    pub app_name: AppName,
    /// Trigger type (e.g. `new_email`, `commit_pushed`).
    pub trigger_id: String,
    /// Free-form trigger config (`query`, `channel`, `owner`, `repo`, ...).
    #[serde(default)]
    pub config: Map<String, JsonValue>,
    /// Explicit first post-trigger step. When absent the interpreter falls
    /// back to the conventional `"2"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// A condition step: ordered clauses evaluated against the trigger payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    /// Step id, unique within the workflow.
    pub id: String,
    /// Ordered clauses; the first matching `if` wins, `else` catches the
    /// rest.
    pub conditions: Vec<ConditionClause>,
}

/// One clause of a condition step.
///
/// Either a predicate clause (`{ "if": "...", "then": "3" }`) or a fallback
/// clause (`{ "else": "4" }`). A `then`/`else` of `null` terminates the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionClause {
    /// Predicate template: `{{path}} <op> '<literal>'`.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Target step when the predicate matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    /// Fallback target when no predicate clause matched.
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<String>,
}

/// An action step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    /// Step id, unique within the workflow.
    pub id: String,
    /// App the action calls.
    pub app_name: AppName,
    /// Action from the closed catalog (e.g. `send_channel_message`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// Action-specific config; string values may carry `{{path}}` templates.
    #[serde(default)]
    pub config: Map<String, JsonValue>,
    /// Declared successor. Participates in closure validation; the
    /// interpreter treats actions as terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl ActionStep {
    /// Returns the action id, falling back to the app's default action when
    /// absent (tolerated for workflows saved before `action_id` existed).
    #[must_use]
    pub fn effective_action_id(&self) -> &str {
        match self.action_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => match self.app_name {
                AppName::Slack => "send_channel_message",
                AppName::Gmail => "send_email",
                AppName::Github => "create_issue",
                AppName::Webhook => "send_webhook",
            },
        }
    }
}
