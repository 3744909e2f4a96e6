//! The error taxonomy for third-party API calls.
//!
//! Every failure an adapter or the dispatcher can produce is classified into
//! one of these kinds. The executor consults [`ApiError::is_retryable`] to
//! decide whether a failed job goes back to the queue.

use patchbay_core::AppName;
use std::fmt;

/// A classified failure from the integration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No credential row exists for (user, app). Surfaced to the user as a
    /// request to connect the app; never retried.
    NotConnected { app: AppName },
    /// Token refresh failed, or the provider rejected a fresh token. The
    /// user has been notified; never retried.
    ReauthRequired { app: AppName },
    /// Provider returned 401.
    Unauthorized,
    /// Provider returned 403.
    Forbidden,
    /// Provider returned 404.
    NotFound { resource: String },
    /// Provider returned 429; carries retry-after when supplied.
    RateLimited { retry_after_secs: Option<u64> },
    /// Network failure, timeout or 5xx.
    Transient { reason: String },
    /// Any other 4xx, or bad configuration reaching the adapter.
    InvalidRequest { reason: String },
    /// HTTP 200 with an `ok: false` style envelope whose error is not known
    /// to be permanent.
    ProviderError { message: String },
    /// A bug in the engine.
    Internal { reason: String },
}

impl ApiError {
    /// Returns whether the queue should retry a job that failed with this
    /// error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient { .. } | Self::ProviderError { .. }
        )
    }

    /// Short machine-readable kind name for log details.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected { .. } => "not_connected",
            Self::ReauthRequired { .. } => "reauth_required",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient { .. } => "transient",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::ProviderError { .. } => "provider_error",
            Self::Internal { .. } => "internal",
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected { app } => {
                write!(f, "please connect your {app} account")
            }
            Self::ReauthRequired { app } => {
                write!(f, "{app} authorization expired, please reconnect")
            }
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::NotFound { resource } => write!(f, "not found: {resource}"),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::Transient { reason } => write!(f, "transient failure: {reason}"),
            Self::InvalidRequest { reason } => write!(f, "invalid request: {reason}"),
            Self::ProviderError { message } => write!(f, "provider error: {message}"),
            Self::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(
            ApiError::Transient {
                reason: "timeout".into()
            }
            .is_retryable()
        );
        assert!(
            ApiError::RateLimited {
                retry_after_secs: Some(30)
            }
            .is_retryable()
        );
        assert!(
            ApiError::ProviderError {
                message: "fatal_error".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn terminal_kinds() {
        assert!(!ApiError::NotConnected { app: AppName::Slack }.is_retryable());
        assert!(!ApiError::ReauthRequired { app: AppName::Gmail }.is_retryable());
        assert!(
            !ApiError::NotFound {
                resource: "channel".into()
            }
            .is_retryable()
        );
        assert!(
            !ApiError::InvalidRequest {
                reason: "missing field".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn not_connected_message_names_the_app() {
        let err = ApiError::NotConnected { app: AppName::Gmail };
        assert_eq!(err.to_string(), "please connect your gmail account");
    }
}
