//! Per-app adapters over third-party HTTP APIs.
//!
//! Adapters are intentionally thin: each operation performs a single HTTP
//! call (or a short bounded sequence), translates the status code into an
//! [`ApiError`](crate::error::ApiError) kind, and returns a normalized shape.
//! Adapters are stateless and hold no credentials; the access token is an
//! argument on every call. Caching, token refresh and retry live above them
//! in the dispatcher.

pub mod github;
pub mod gmail;
pub mod slack;
pub mod webhook;

pub use github::GithubClient;
pub use gmail::{EmailMessage, GmailClient};
pub use slack::{ChannelMessage, SlackClient};
pub use webhook::WebhookClient;

use crate::error::ApiError;

/// Maps a non-success HTTP status to the error taxonomy.
///
/// 401 → `Unauthorized`, 403 → `Forbidden`, 404 → `NotFound`,
/// 429 → `RateLimited` (with retry-after when present), 5xx → `Transient`,
/// any other 4xx → `InvalidRequest`.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status.as_u16() {
        401 => Err(ApiError::Unauthorized),
        403 => Err(ApiError::Forbidden),
        404 => Err(ApiError::NotFound {
            resource: response.url().path().to_string(),
        }),
        429 => {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            Err(ApiError::RateLimited { retry_after_secs })
        }
        code if (500..600).contains(&code) => Err(ApiError::Transient {
            reason: format!("HTTP {status}"),
        }),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::InvalidRequest {
                reason: format!("HTTP {status}: {body}"),
            })
        }
    }
}
