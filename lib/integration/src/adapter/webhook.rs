//! Outbound webhook adapter.
//!
//! Posts a JSON payload to a caller-supplied URL with a bounded timeout.
//! Slack-hosted incoming-webhook URLs expect `{"text": ...}`, so a raw string
//! payload aimed at one is wrapped on the way out.

use crate::adapter::ensure_success;
use crate::error::ApiError;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;

/// Default outbound webhook timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed wrapper over outbound webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl WebhookClient {
    /// Creates a webhook client with the default timeout.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Posts `payload` to `url`.
    ///
    /// Returns the delivery status and any JSON body the receiver answered
    /// with. Timeouts classify as transient.
    pub async fn send(&self, url: &str, payload: JsonValue) -> Result<JsonValue, ApiError> {
        let payload = adapt_payload(url, payload);

        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Transient {
                        reason: format!("webhook timed out after {:?}", self.timeout),
                    }
                } else {
                    ApiError::Transient {
                        reason: e.to_string(),
                    }
                }
            })?;

        let response = ensure_success(response).await?;
        let status = response.status().as_u16();
        let body: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
        Ok(json!({ "status_code": status, "response": body }))
    }
}

/// Returns whether `url` points at a Slack incoming webhook.
#[must_use]
pub fn is_slack_hosted(url: &str) -> bool {
    url.contains("hooks.slack.com")
}

/// Wraps raw string payloads for Slack-hosted receivers.
fn adapt_payload(url: &str, payload: JsonValue) -> JsonValue {
    match payload {
        JsonValue::String(text) if is_slack_hosted(url) => json!({ "text": text }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_hosted_detection() {
        assert!(is_slack_hosted("https://hooks.slack.com/services/T0/B0/XYZ"));
        assert!(!is_slack_hosted("https://example.com/hook"));
    }

    #[test]
    fn string_payload_wrapped_for_slack() {
        let adapted = adapt_payload(
            "https://hooks.slack.com/services/T0/B0/XYZ",
            json!("deploy done"),
        );
        assert_eq!(adapted, json!({"text": "deploy done"}));
    }

    #[test]
    fn object_payload_left_alone() {
        let payload = json!({"text": "hi", "blocks": []});
        let adapted = adapt_payload("https://hooks.slack.com/services/T0/B0/XYZ", payload.clone());
        assert_eq!(adapted, payload);
    }

    #[test]
    fn non_slack_string_payload_left_alone() {
        let adapted = adapt_payload("https://example.com/hook", json!("raw"));
        assert_eq!(adapted, json!("raw"));
    }
}
