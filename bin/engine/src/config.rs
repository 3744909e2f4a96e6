//! Centralized engine configuration.
//!
//! Strongly-typed configuration loaded via the `config` crate from
//! environment variables with a `__` separator, e.g.
//! `PROVIDERS__GOOGLE__CLIENT_ID` or `SCHEDULER__TICK_SECONDS`.

use patchbay_integration::oauth::{
    GITHUB_TOKEN_URL, GOOGLE_TOKEN_URL, ProviderConfig, ProviderRegistry, SLACK_TOKEN_URL,
};
use patchbay_workflow::TerminalFailurePolicy;
use serde::Deserialize;

/// Engine configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Queue backend configuration.
    #[serde(default)]
    pub nats: NatsConfig,

    /// OAuth provider credentials.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Scheduler cadences.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Event-log retention horizon in days.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    /// Executor tuning.
    #[serde(default)]
    pub executor: ExecutorSettings,

    /// Outbound webhook settings.
    #[serde(default)]
    pub webhook: WebhookSettings,
}

/// Queue backend connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub url: String,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
        }
    }
}

/// Per-provider OAuth client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Token endpoint override.
    #[serde(default)]
    pub token_url: Option<String>,
}

impl ProviderSettings {
    fn into_provider(self, default_token_url: &str) -> ProviderConfig {
        ProviderConfig::new(
            self.client_id,
            self.client_secret,
            self.token_url
                .unwrap_or_else(|| default_token_url.to_string()),
        )
    }
}

/// OAuth provider credentials for token refresh.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    /// Google (Gmail) OAuth client.
    #[serde(default)]
    pub google: Option<ProviderSettings>,
    /// Slack OAuth client.
    #[serde(default)]
    pub slack: Option<ProviderSettings>,
    /// GitHub OAuth client.
    #[serde(default)]
    pub github: Option<ProviderSettings>,
}

impl ProvidersConfig {
    /// Builds the dispatcher's provider registry, filling in each
    /// provider's public token endpoint where not overridden.
    #[must_use]
    pub fn into_registry(self) -> ProviderRegistry {
        ProviderRegistry {
            google: self.google.map(|p| p.into_provider(GOOGLE_TOKEN_URL)),
            slack: self.slack.map(|p| p.into_provider(SLACK_TOKEN_URL)),
            github: self.github.map(|p| p.into_provider(GITHUB_TOKEN_URL)),
        }
    }
}

/// Scheduler cadences.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Poll sweep tick in seconds.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Reaper cadence in seconds.
    #[serde(default = "default_reaper_interval_seconds")]
    pub reaper_interval_seconds: u64,
}

fn default_tick_seconds() -> u64 {
    30
}

fn default_reaper_interval_seconds() -> u64 {
    24 * 60 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            reaper_interval_seconds: default_reaper_interval_seconds(),
        }
    }
}

fn default_log_retention_days() -> u32 {
    30
}

/// Executor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    /// Concurrent workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// What to do with events whose job exhausted its retries.
    #[serde(default)]
    pub on_terminal_failure: TerminalFailurePolicy,
}

fn default_concurrency() -> usize {
    5
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            on_terminal_failure: TerminalFailurePolicy::default(),
        }
    }
}

/// Outbound webhook settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    /// Per-request timeout in seconds.
    #[serde(default = "default_webhook_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_webhook_timeout_seconds() -> u64 {
    10
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_webhook_timeout_seconds(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_seconds, 30);
        assert_eq!(config.reaper_interval_seconds, 86_400);
    }

    #[test]
    fn executor_defaults() {
        let settings = ExecutorSettings::default();
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.on_terminal_failure, TerminalFailurePolicy::Skip);
    }

    #[test]
    fn webhook_default_timeout() {
        assert_eq!(WebhookSettings::default().timeout_seconds, 10);
    }

    #[test]
    fn provider_registry_fills_public_token_urls() {
        let providers = ProvidersConfig {
            google: Some(ProviderSettings {
                client_id: "gid".into(),
                client_secret: "gsecret".into(),
                token_url: None,
            }),
            slack: None,
            github: Some(ProviderSettings {
                client_id: "hid".into(),
                client_secret: "hsecret".into(),
                token_url: Some("https://example.test/token".into()),
            }),
        };

        let registry = providers.into_registry();
        assert_eq!(
            registry.google.as_ref().map(|p| p.token_url.as_str()),
            Some(GOOGLE_TOKEN_URL)
        );
        assert_eq!(
            registry.github.as_ref().map(|p| p.token_url.as_str()),
            Some("https://example.test/token")
        );
        assert!(registry.slack.is_none());
    }
}
