//! Slack Web API adapter.
//!
//! Slack answers HTTP 200 with an `ok: false` envelope on failure; those are
//! classified by error string. Message `ts` values are preserved verbatim as
//! the stable external id, with the epoch-fractional value also converted to
//! a UTC instant.

use crate::adapter::ensure_success;
use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// Slack Web API base URL.
pub const SLACK_BASE_URL: &str = "https://slack.com/api";

/// A normalized Slack channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Slack `ts`; the stable external id for message triggers.
    pub ts: String,
    /// Channel the message was posted in.
    pub channel: String,
    /// Posting user id.
    pub user: String,
    /// Message text.
    pub text: String,
    /// `ts` converted to a UTC instant.
    pub timestamp: DateTime<Utc>,
}

/// Typed wrapper over the Slack Web API.
#[derive(Debug, Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    base_url: String,
}

impl SlackClient {
    /// Creates an adapter against the public Slack endpoint.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: SLACK_BASE_URL.to_string(),
        }
    }

    /// Overrides the base URL (test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get(
        &self,
        access_token: &str,
        method: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, ApiError> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await?;
        let body: JsonValue = ensure_success(response).await?.json().await?;
        check_envelope(body)
    }

    async fn post(
        &self,
        access_token: &str,
        method: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, ApiError> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await?;
        let body: JsonValue = ensure_success(response).await?.json().await?;
        check_envelope(body)
    }

    /// Fetches recent messages from a channel, preserving `ts`.
    pub async fn fetch_messages(
        &self,
        access_token: &str,
        channel: &str,
        limit: u32,
    ) -> Result<Vec<ChannelMessage>, ApiError> {
        let body = self
            .get(
                access_token,
                "conversations.history",
                &[("channel", channel), ("limit", &limit.to_string())],
            )
            .await?;

        let messages = body["messages"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| normalize_message(m, channel))
                    .collect()
            })
            .unwrap_or_default();
        Ok(messages)
    }

    /// Posts a message to a channel.
    pub async fn post_message(
        &self,
        access_token: &str,
        channel: &str,
        text: &str,
    ) -> Result<JsonValue, ApiError> {
        self.post(
            access_token,
            "chat.postMessage",
            json!({ "channel": channel, "text": text }),
        )
        .await
    }

    /// Sends a direct message by opening (or reusing) the DM conversation
    /// with `user_id`, then posting into it.
    pub async fn send_dm(
        &self,
        access_token: &str,
        user_id: &str,
        text: &str,
    ) -> Result<JsonValue, ApiError> {
        let opened = self
            .post(
                access_token,
                "conversations.open",
                json!({ "users": user_id }),
            )
            .await?;
        let channel = opened["channel"]["id"]
            .as_str()
            .ok_or_else(|| ApiError::ProviderError {
                message: "conversations.open returned no channel id".to_string(),
            })?
            .to_string();

        self.post_message(access_token, &channel, text).await
    }

    /// Updates an existing message.
    pub async fn update_message(
        &self,
        access_token: &str,
        channel: &str,
        ts: &str,
        text: &str,
    ) -> Result<JsonValue, ApiError> {
        self.post(
            access_token,
            "chat.update",
            json!({ "channel": channel, "ts": ts, "text": text }),
        )
        .await
    }

    /// Adds an emoji reaction to a message.
    pub async fn add_reaction(
        &self,
        access_token: &str,
        channel: &str,
        ts: &str,
        reaction_name: &str,
    ) -> Result<JsonValue, ApiError> {
        self.post(
            access_token,
            "reactions.add",
            json!({ "channel": channel, "timestamp": ts, "name": reaction_name }),
        )
        .await
    }

    /// Lists workspace channels.
    pub async fn list_channels(&self, access_token: &str) -> Result<JsonValue, ApiError> {
        self.get(access_token, "conversations.list", &[("limit", "200")])
            .await
    }

    /// Lists workspace members.
    pub async fn list_users(&self, access_token: &str) -> Result<JsonValue, ApiError> {
        self.get(access_token, "users.list", &[("limit", "200")]).await
    }

    /// Returns workspace metadata.
    pub async fn get_workspace_info(&self, access_token: &str) -> Result<JsonValue, ApiError> {
        self.get(access_token, "team.info", &[]).await
    }

    /// Returns the identity behind the token.
    pub async fn get_current_user(&self, access_token: &str) -> Result<JsonValue, ApiError> {
        self.get(access_token, "auth.test", &[]).await
    }
}

/// Rejects `ok: false` envelopes, classifying known-permanent errors.
fn check_envelope(body: JsonValue) -> Result<JsonValue, ApiError> {
    if body["ok"].as_bool() == Some(false) {
        let error = body["error"].as_str().unwrap_or("unknown_error").to_string();
        return Err(classify_error(&error));
    }
    Ok(body)
}

/// Maps Slack error strings onto the taxonomy.
///
/// Auth errors demand reauthorization, lookup errors are terminal, and
/// anything unrecognized stays a retryable provider error.
fn classify_error(error: &str) -> ApiError {
    match error {
        "invalid_auth" | "account_inactive" | "token_revoked" | "token_expired"
        | "not_authed" => ApiError::Unauthorized,
        "missing_scope" | "restricted_action" => ApiError::Forbidden,
        "channel_not_found" | "user_not_found" | "message_not_found" | "users_not_found" => {
            ApiError::NotFound {
                resource: error.to_string(),
            }
        }
        "ratelimited" | "rate_limited" => ApiError::RateLimited {
            retry_after_secs: None,
        },
        "invalid_arguments" | "invalid_args" | "no_text" | "msg_too_long"
        | "invalid_name" | "already_reacted" => ApiError::InvalidRequest {
            reason: error.to_string(),
        },
        _ => ApiError::ProviderError {
            message: error.to_string(),
        },
    }
}

fn normalize_message(message: &JsonValue, channel: &str) -> Option<ChannelMessage> {
    let ts = message["ts"].as_str()?.to_string();
    Some(ChannelMessage {
        timestamp: ts_to_datetime(&ts)?,
        ts,
        channel: channel.to_string(),
        user: message["user"].as_str().unwrap_or_default().to_string(),
        text: message["text"].as_str().unwrap_or_default().to_string(),
    })
}

/// Converts a Slack epoch-fractional `ts` ("1700000000.123456") to UTC.
fn ts_to_datetime(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    // Fractional part is microseconds; pad/truncate to exactly six digits.
    let micros: u32 = format!("{frac:0<6.6}").parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_conversion() {
        let dt = ts_to_datetime("1700000000.123456").unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_micros(), 123_456);
    }

    #[test]
    fn ts_conversion_without_fraction() {
        let dt = ts_to_datetime("1700000000").unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_micros(), 0);
    }

    #[test]
    fn envelope_ok_passes_through() {
        let body = json!({"ok": true, "channel": "C1"});
        assert!(check_envelope(body).is_ok());
    }

    #[test]
    fn envelope_auth_errors_map_to_unauthorized() {
        for error in ["invalid_auth", "token_revoked", "account_inactive"] {
            let body = json!({"ok": false, "error": error});
            assert_eq!(check_envelope(body).unwrap_err(), ApiError::Unauthorized);
        }
    }

    #[test]
    fn envelope_lookup_errors_are_terminal() {
        let body = json!({"ok": false, "error": "channel_not_found"});
        let err = check_envelope(body).unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn envelope_unknown_errors_stay_retryable() {
        let body = json!({"ok": false, "error": "fatal_error"});
        let err = check_envelope(body).unwrap_err();
        assert!(matches!(err, ApiError::ProviderError { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn message_normalization_preserves_ts() {
        let raw = json!({"ts": "1700000000.000100", "user": "U1", "text": "hi"});
        let message = normalize_message(&raw, "C1").unwrap();
        assert_eq!(message.ts, "1700000000.000100");
        assert_eq!(message.channel, "C1");
        assert_eq!(message.user, "U1");
        assert_eq!(message.timestamp.timestamp(), 1_700_000_000);
    }
}
