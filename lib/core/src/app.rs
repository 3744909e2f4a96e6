//! The closed set of supported third-party applications.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A supported third-party application.
///
/// Workflows reference apps by name in their trigger and action steps; the
/// dispatcher routes calls to the matching adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppName {
    /// Gmail (Google Workspace mail).
    Gmail,
    /// Slack workspace messaging.
    Slack,
    /// GitHub repositories, issues and pull requests.
    Github,
    /// Generic outbound webhooks.
    Webhook,
}

impl AppName {
    /// Returns the canonical lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Slack => "slack",
            Self::Github => "github",
            Self::Webhook => "webhook",
        }
    }

    /// Returns the polling interval applied to workflows whose trigger
    /// belongs to this app.
    ///
    /// Webhook triggers are push-based and are never polled, expressed as a
    /// zero interval.
    #[must_use]
    pub const fn polling_interval_seconds(&self) -> u64 {
        match self {
            Self::Gmail => 60,
            Self::Slack => 30,
            Self::Github => 60,
            Self::Webhook => 0,
        }
    }

    /// Returns whether this app issues OAuth credentials.
    ///
    /// Webhook actions call caller-supplied URLs and need no stored tokens.
    #[must_use]
    pub const fn requires_credential(&self) -> bool {
        !matches!(self, Self::Webhook)
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an app name is not in the supported set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAppError {
    /// The rejected name.
    pub name: String,
}

impl fmt::Display for UnknownAppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown app: {}", self.name)
    }
}

impl std::error::Error for UnknownAppError {}

impl FromStr for AppName {
    type Err = UnknownAppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            "slack" => Ok(Self::Slack),
            "github" => Ok(Self::Github),
            "webhook" => Ok(Self::Webhook),
            _ => Err(UnknownAppError {
                name: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for app in [
            AppName::Gmail,
            AppName::Slack,
            AppName::Github,
            AppName::Webhook,
        ] {
            let parsed: AppName = app.as_str().parse().expect("should parse");
            assert_eq!(parsed, app);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        let parsed: AppName = "GitHub".parse().expect("should parse");
        assert_eq!(parsed, AppName::Github);
    }

    #[test]
    fn unknown_app_is_rejected() {
        let result: Result<AppName, _> = "jira".parse();
        assert!(result.is_err());
    }

    #[test]
    fn polling_intervals() {
        assert_eq!(AppName::Gmail.polling_interval_seconds(), 60);
        assert_eq!(AppName::Slack.polling_interval_seconds(), 30);
        assert_eq!(AppName::Github.polling_interval_seconds(), 60);
        assert_eq!(AppName::Webhook.polling_interval_seconds(), 0);
    }

    #[test]
    fn webhook_needs_no_credential() {
        assert!(!AppName::Webhook.requires_credential());
        assert!(AppName::Slack.requires_credential());
    }

    #[test]
    fn serde_uses_lowercase() {
        let json = serde_json::to_string(&AppName::Github).expect("serialize");
        assert_eq!(json, "\"github\"");
    }
}
