//! Gmail REST v1 adapter.
//!
//! Message fetches are a list call followed by per-id detail fetches capped
//! at [`MESSAGE_HYDRATION_CAP`] per poll. Bodies are decoded from base64url,
//! preferring the text/plain part, and truncated to [`BODY_PREVIEW_CHARS`]
//! characters. Timestamps come from `internalDate`.

use crate::adapter::ensure_success;
use crate::error::ApiError;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// Gmail REST v1 base URL.
pub const GMAIL_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

/// Maximum per-id detail fetches per poll.
pub const MESSAGE_HYDRATION_CAP: usize = 5;

/// Maximum decoded body length kept on a normalized message.
pub const BODY_PREVIEW_CHARS: usize = 500;

/// A normalized Gmail message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Gmail message id; the stable external id for email triggers.
    pub id: String,
    /// Owning thread id.
    pub thread_id: String,
    /// `From` header.
    pub from: String,
    /// `To` header.
    pub to: String,
    /// `Subject` header.
    pub subject: String,
    /// Decoded plain-text body, truncated.
    pub body: String,
    /// Message `internalDate` as a UTC instant.
    pub timestamp: DateTime<Utc>,
}

/// Typed wrapper over the Gmail REST API.
#[derive(Debug, Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    base_url: String,
}

impl GmailClient {
    /// Creates an adapter against the public Gmail endpoint.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: GMAIL_BASE_URL.to_string(),
        }
    }

    /// Overrides the base URL (test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Lists message ids matching `query`, newest first per Gmail ordering.
    pub async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<String>, ApiError> {
        let url = format!("{}/users/me/messages", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("q", query), ("maxResults", &max_results.to_string())])
            .send()
            .await?;
        let body: JsonValue = ensure_success(response).await?.json().await?;

        let ids = body["messages"]
            .as_array()
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    /// Fetches one message in full and normalizes it.
    pub async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<EmailMessage, ApiError> {
        let url = format!("{}/users/me/messages/{message_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("format", "full")])
            .send()
            .await?;
        let body: JsonValue = ensure_success(response).await?.json().await?;
        Ok(normalize_message(&body))
    }

    /// Lists ids for `query` and hydrates the first
    /// [`MESSAGE_HYDRATION_CAP`] of them.
    pub async fn fetch_messages(
        &self,
        access_token: &str,
        query: &str,
        max_ids: u32,
    ) -> Result<Vec<EmailMessage>, ApiError> {
        let ids = self.list_message_ids(access_token, query, max_ids).await?;

        let mut messages = Vec::with_capacity(ids.len().min(MESSAGE_HYDRATION_CAP));
        for id in ids.iter().take(MESSAGE_HYDRATION_CAP) {
            messages.push(self.get_message(access_token, id).await?);
        }
        Ok(messages)
    }

    /// Sends a plain-text email.
    pub async fn send_email(
        &self,
        access_token: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<JsonValue, ApiError> {
        let raw = encode_rfc822(to, subject, body, None);
        let url = format!("{}/users/me/messages/send", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&json!({ "raw": raw }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Replies to a message, preserving the thread.
    ///
    /// Fetches the original's `From`, `Subject` and `Message-ID` headers (a
    /// bounded second call) to address the reply and set threading headers.
    pub async fn reply_to_email(
        &self,
        access_token: &str,
        message_id: &str,
        thread_id: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<JsonValue, ApiError> {
        let url = format!("{}/users/me/messages/{message_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "From"),
                ("metadataHeaders", "Subject"),
                ("metadataHeaders", "Message-ID"),
            ])
            .send()
            .await?;
        let original: JsonValue = ensure_success(response).await?.json().await?;

        let headers = &original["payload"]["headers"];
        let to = header_value(headers, "From").unwrap_or_default();
        let original_subject = header_value(headers, "Subject").unwrap_or_default();
        let subject = match subject {
            Some(s) => s.to_string(),
            None if original_subject.to_ascii_lowercase().starts_with("re:") => original_subject,
            None => format!("Re: {original_subject}"),
        };
        let rfc_message_id = header_value(headers, "Message-ID");

        let raw = encode_rfc822(&to, &subject, body, rfc_message_id.as_deref());
        let url = format!("{}/users/me/messages/send", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&json!({ "raw": raw, "threadId": thread_id }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Adds label ids to a message.
    pub async fn add_labels(
        &self,
        access_token: &str,
        message_id: &str,
        label_ids: &[String],
    ) -> Result<JsonValue, ApiError> {
        let url = format!("{}/users/me/messages/{message_id}/modify", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&json!({ "addLabelIds": label_ids }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Returns the account profile.
    pub async fn get_profile(&self, access_token: &str) -> Result<JsonValue, ApiError> {
        let url = format!("{}/users/me/profile", self.base_url);
        let response = self.http.get(&url).bearer_auth(access_token).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Lists the account's labels.
    pub async fn list_labels(&self, access_token: &str) -> Result<JsonValue, ApiError> {
        let url = format!("{}/users/me/labels", self.base_url);
        let response = self.http.get(&url).bearer_auth(access_token).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }
}

/// Builds a base64url-encoded RFC 822 message.
fn encode_rfc822(to: &str, subject: &str, body: &str, in_reply_to: Option<&str>) -> String {
    let mut message = String::new();
    message.push_str(&format!("To: {to}\r\n"));
    message.push_str(&format!("Subject: {subject}\r\n"));
    if let Some(reference) = in_reply_to {
        message.push_str(&format!("In-Reply-To: {reference}\r\n"));
        message.push_str(&format!("References: {reference}\r\n"));
    }
    message.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n");
    message.push_str(body);
    URL_SAFE_NO_PAD.encode(message)
}

/// Normalizes a full-format Gmail message resource.
fn normalize_message(resource: &JsonValue) -> EmailMessage {
    let headers = &resource["payload"]["headers"];
    let timestamp = resource["internalDate"]
        .as_str()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    EmailMessage {
        id: resource["id"].as_str().unwrap_or_default().to_string(),
        thread_id: resource["threadId"].as_str().unwrap_or_default().to_string(),
        from: header_value(headers, "From").unwrap_or_default(),
        to: header_value(headers, "To").unwrap_or_default(),
        subject: header_value(headers, "Subject").unwrap_or_default(),
        body: truncate_chars(&extract_body(&resource["payload"]), BODY_PREVIEW_CHARS),
        timestamp,
    }
}

/// Looks up a header by case-insensitive name.
fn header_value(headers: &JsonValue, name: &str) -> Option<String> {
    headers.as_array()?.iter().find_map(|h| {
        let header_name = h["name"].as_str()?;
        if header_name.eq_ignore_ascii_case(name) {
            h["value"].as_str().map(str::to_string)
        } else {
            None
        }
    })
}

/// Extracts the decoded body, preferring the text/plain part.
fn extract_body(payload: &JsonValue) -> String {
    if let Some(parts) = payload["parts"].as_array() {
        // Prefer a top-level text/plain part.
        for part in parts {
            if part["mimeType"].as_str() == Some("text/plain")
                && let Some(decoded) = decode_part(part)
            {
                return decoded;
            }
        }
        // Multipart/alternative may nest one level deeper.
        for part in parts {
            if let Some(nested) = part["parts"].as_array() {
                for inner in nested {
                    if inner["mimeType"].as_str() == Some("text/plain")
                        && let Some(decoded) = decode_part(inner)
                    {
                        return decoded;
                    }
                }
            }
        }
        // Fall back to the first decodable part.
        for part in parts {
            if let Some(decoded) = decode_part(part) {
                return decoded;
            }
        }
    }

    decode_part(payload).unwrap_or_default()
}

fn decode_part(part: &JsonValue) -> Option<String> {
    let data = part["body"]["data"].as_str()?;
    decode_base64url(data)
}

/// Decodes Gmail's base64url body data, tolerating padded and standard
/// alphabets.
fn decode_base64url(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .or_else(|_| STANDARD.decode(data))
        .ok()?;
    String::from_utf8(bytes).ok()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
