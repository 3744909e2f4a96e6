//! The integration dispatcher (C3).
//!
//! Single entry point for every third-party call the engine makes. On each
//! call, in order:
//!
//! 1. load the credential (absent → `NotConnected`)
//! 2. refresh the access token in place when expired, recording
//!    `token_refreshed`; refresh failure notifies the user and fails
//!    `ReauthRequired`
//! 3. serve cacheable read-only methods from the TTL cache
//! 4. route to the adapter
//! 5. store cacheable results
//!
//! A 401/403 on a token that was just loaded or refreshed also maps to
//! `ReauthRequired`: retrying cannot help, the user has to reconnect.

use crate::adapter::webhook::DEFAULT_TIMEOUT;
use crate::adapter::{GithubClient, GmailClient, SlackClient, WebhookClient};
use crate::cache::{CacheKey, ResponseCache, cache_ttl};
use crate::credential::{Credential, CredentialStore};
use crate::error::ApiError;
use crate::notify::Notifier;
use crate::oauth::{ProviderRegistry, refresh_access_token};
use chrono::Utc;
use patchbay_core::{AppName, EventLog, EventType, LogEntry, UserId};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;

/// Default transport timeout for SaaS API calls.
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes (user, app, method, args) calls to adapters with credential
/// resolution, transparent refresh and read-through caching.
pub struct Dispatcher {
    credentials: Arc<dyn CredentialStore>,
    providers: ProviderRegistry,
    cache: ResponseCache,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventLog>,
    gmail: GmailClient,
    slack: SlackClient,
    github: GithubClient,
    webhook: WebhookClient,
}

impl Dispatcher {
    /// Creates a dispatcher over the given collaborators.
    ///
    /// The cache and the HTTP client are process-wide resources owned here;
    /// pass clones of the same [`ResponseCache`] to share it.
    #[must_use]
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        providers: ProviderRegistry,
        cache: ResponseCache,
        notifier: Arc<dyn Notifier>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            gmail: GmailClient::new(http.clone()),
            slack: SlackClient::new(http.clone()),
            github: GithubClient::new(http.clone()),
            webhook: WebhookClient::new(http).with_timeout(DEFAULT_TIMEOUT),
            credentials,
            providers,
            cache,
            notifier,
            events,
        }
    }

    /// Overrides the outbound webhook timeout.
    #[must_use]
    pub fn with_webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook = self.webhook.with_timeout(timeout);
        self
    }

    /// Calls `method` on `app` on behalf of `user_id`.
    pub async fn call(
        &self,
        user_id: UserId,
        app: AppName,
        method: &str,
        args: JsonValue,
    ) -> Result<JsonValue, ApiError> {
        // Webhooks carry their target in the args and need no credential.
        if app == AppName::Webhook {
            return self.route_webhook(method, &args).await;
        }

        let credential = self
            .credentials
            .load(user_id, app)
            .await
            .map_err(|e| ApiError::Internal {
                reason: e.to_string(),
            })?
            .ok_or(ApiError::NotConnected { app })?;

        let credential = self.ensure_fresh(credential).await?;

        if let Some(ttl) = cache_ttl(app, method) {
            let key = CacheKey {
                app,
                user_id,
                method: method.to_string(),
            };
            if let Some(hit) = self.cache.get(&key) {
                tracing::debug!(%app, method, "cache hit");
                return Ok(hit);
            }

            let result = match self.route(&credential, app, method, &args).await {
                Err(ApiError::Unauthorized | ApiError::Forbidden) => {
                    return Err(self.reauth_required(user_id, app).await);
                }
                other => other?,
            };
            self.cache.put(key, result.clone(), ttl);
            return Ok(result);
        }

        match self.route(&credential, app, method, &args).await {
            Err(ApiError::Unauthorized | ApiError::Forbidden) => {
                Err(self.reauth_required(user_id, app).await)
            }
            other => other,
        }
    }

    /// Refreshes the access token when expired, writing the new token back
    /// through the store.
    async fn ensure_fresh(&self, credential: Credential) -> Result<Credential, ApiError> {
        if !credential.is_expired(Utc::now()) {
            return Ok(credential);
        }

        let user_id = credential.user_id;
        let app = credential.app;
        tracing::debug!(%user_id, %app, "access token expired, refreshing");

        let Some(provider) = self.providers.for_app(app) else {
            tracing::warn!(%app, "token expired but no provider configured");
            return Err(self.reauth_required(user_id, app).await);
        };
        let Some(refresh_token) = credential.refresh_token.as_deref() else {
            return Err(self.reauth_required(user_id, app).await);
        };

        match refresh_access_token(provider, refresh_token).await {
            Ok(refreshed) => {
                self.credentials
                    .update_access(user_id, app, &refreshed.access_token, refreshed.expires_at)
                    .await
                    .map_err(|e| ApiError::Internal {
                        reason: e.to_string(),
                    })?;

                let entry = LogEntry::new(
                    EventType::TokenRefreshed,
                    json!({ "app": app.as_str() }),
                )
                .with_user(user_id);
                if let Err(e) = self.events.append(entry).await {
                    tracing::warn!(error = %e, "failed to record token refresh");
                }

                Ok(Credential {
                    access_token: refreshed.access_token,
                    expires_at: refreshed.expires_at,
                    refresh_token: refreshed
                        .refresh_token
                        .or(credential.refresh_token.clone()),
                    ..credential
                })
            }
            Err(e) => {
                tracing::warn!(%user_id, %app, error = %e, "token refresh failed");
                Err(self.reauth_required(user_id, app).await)
            }
        }
    }

    async fn reauth_required(&self, user_id: UserId, app: AppName) -> ApiError {
        self.notifier
            .notify(
                user_id,
                app,
                &format!("your {app} connection expired, please reconnect it"),
            )
            .await;
        ApiError::ReauthRequired { app }
    }

    async fn route(
        &self,
        credential: &Credential,
        app: AppName,
        method: &str,
        args: &JsonValue,
    ) -> Result<JsonValue, ApiError> {
        let token = credential.access_token.as_str();
        match app {
            AppName::Gmail => self.route_gmail(token, method, args).await,
            AppName::Slack => self.route_slack(credential, method, args).await,
            AppName::Github => self.route_github(token, method, args).await,
            AppName::Webhook => self.route_webhook(method, args).await,
        }
    }

    async fn route_gmail(
        &self,
        token: &str,
        method: &str,
        args: &JsonValue,
    ) -> Result<JsonValue, ApiError> {
        match method {
            "listMessages" => {
                let query = optional_str(args, "query").unwrap_or_default();
                let max = optional_u64(args, "maxResults").unwrap_or(10) as u32;
                let ids = self.gmail.list_message_ids(token, &query, max).await?;
                Ok(json!(ids))
            }
            "fetchMessages" => {
                let query = optional_str(args, "query").unwrap_or_default();
                let max = optional_u64(args, "maxResults").unwrap_or(10) as u32;
                let messages = self.gmail.fetch_messages(token, &query, max).await?;
                to_json(&messages)
            }
            "getMessage" => {
                let id = require_str(args, "messageId")?;
                let message = self.gmail.get_message(token, &id).await?;
                to_json(&message)
            }
            "sendEmail" => {
                let to = require_str(args, "to")?;
                let subject = optional_str(args, "subject").unwrap_or_default();
                let body = optional_str(args, "body").unwrap_or_default();
                self.gmail.send_email(token, &to, &subject, &body).await
            }
            "replyEmail" => {
                let message_id = require_str(args, "messageId")?;
                let thread_id = require_str(args, "threadId")?;
                let subject = optional_str(args, "subject");
                let body = optional_str(args, "body").unwrap_or_default();
                self.gmail
                    .reply_to_email(token, &message_id, &thread_id, subject.as_deref(), &body)
                    .await
            }
            "addLabels" => {
                let message_id = require_str(args, "messageId")?;
                let labels = string_list(args, "labelIds")?;
                self.gmail.add_labels(token, &message_id, &labels).await
            }
            "getProfile" => self.gmail.get_profile(token).await,
            "listLabels" => self.gmail.list_labels(token).await,
            _ => Err(unknown_method(AppName::Gmail, method)),
        }
    }

    async fn route_slack(
        &self,
        credential: &Credential,
        method: &str,
        args: &JsonValue,
    ) -> Result<JsonValue, ApiError> {
        let token = credential.access_token.as_str();
        match method {
            "fetchMessages" => {
                let channel = require_str(args, "channel")?;
                let limit = optional_u64(args, "limit").unwrap_or(10) as u32;
                let messages = self.slack.fetch_messages(token, &channel, limit).await?;
                to_json(&messages)
            }
            "postMessage" => {
                let channel = require_str(args, "channel")?;
                let text = require_str(args, "text")?;
                self.slack.post_message(token, &channel, &text).await
            }
            "sendDm" => {
                let text = require_str(args, "text")?;
                let user = optional_str(args, "userId")
                    .or_else(|| optional_str(args, "user_id"))
                    .or_else(|| installing_user(credential))
                    .ok_or_else(|| ApiError::InvalidRequest {
                        reason: "sendDm needs a target user and none was found".to_string(),
                    })?;
                self.slack.send_dm(token, &user, &text).await
            }
            "updateMessage" => {
                let channel = require_str(args, "channel")?;
                let ts = require_str(args, "messageTs")?;
                let text = require_str(args, "text")?;
                self.slack.update_message(token, &channel, &ts, &text).await
            }
            "addReaction" => {
                let channel = require_str(args, "channel")?;
                let ts = require_str(args, "messageTs")?;
                let name = require_str(args, "reactionName")?;
                self.slack.add_reaction(token, &channel, &ts, &name).await
            }
            "listChannels" => self.slack.list_channels(token).await,
            "listUsers" => self.slack.list_users(token).await,
            "getWorkspaceInfo" => self.slack.get_workspace_info(token).await,
            "getCurrentUser" => self.slack.get_current_user(token).await,
            _ => Err(unknown_method(AppName::Slack, method)),
        }
    }

    async fn route_github(
        &self,
        token: &str,
        method: &str,
        args: &JsonValue,
    ) -> Result<JsonValue, ApiError> {
        match method {
            "listIssues" => {
                let (owner, repo) = repo_args(args)?;
                let state = optional_str(args, "state").unwrap_or_else(|| "open".to_string());
                let issues = self.github.list_issues(token, &owner, &repo, &state).await?;
                Ok(json!(issues))
            }
            "listPulls" => {
                let (owner, repo) = repo_args(args)?;
                let state = optional_str(args, "state").unwrap_or_else(|| "open".to_string());
                let pulls = self.github.list_pulls(token, &owner, &repo, &state).await?;
                Ok(json!(pulls))
            }
            "listIssueComments" => {
                let (owner, repo) = repo_args(args)?;
                let comments = self.github.list_issue_comments(token, &owner, &repo).await?;
                Ok(json!(comments))
            }
            "listCommits" => {
                let (owner, repo) = repo_args(args)?;
                let branch = optional_str(args, "branch");
                let commits = self
                    .github
                    .list_commits(token, &owner, &repo, branch.as_deref())
                    .await?;
                Ok(json!(commits))
            }
            "createIssue" => {
                let (owner, repo) = repo_args(args)?;
                let title = require_str(args, "title")?;
                let body = optional_str(args, "body").unwrap_or_default();
                self.github
                    .create_issue(token, &owner, &repo, &title, &body)
                    .await
            }
            "addIssueComment" => {
                let (owner, repo) = repo_args(args)?;
                let number = require_u64(args, "issue_number")?;
                let comment = require_str(args, "comment")?;
                self.github
                    .add_issue_comment(token, &owner, &repo, number, &comment)
                    .await
            }
            "closeIssue" => {
                let (owner, repo) = repo_args(args)?;
                let number = require_u64(args, "issue_number")?;
                self.github.close_issue(token, &owner, &repo, number).await
            }
            "assignIssue" => {
                let (owner, repo) = repo_args(args)?;
                let number = require_u64(args, "issue_number")?;
                let assignees = string_list(args, "assignees")?;
                self.github
                    .assign_issue(token, &owner, &repo, number, &assignees)
                    .await
            }
            "listRepos" => self.github.list_repos(token).await,
            "getCurrentUser" => self.github.get_current_user(token).await,
            _ => Err(unknown_method(AppName::Github, method)),
        }
    }

    async fn route_webhook(&self, method: &str, args: &JsonValue) -> Result<JsonValue, ApiError> {
        match method {
            "send" => {
                let url = require_str(args, "url")?;
                let payload = args.get("payload").cloned().unwrap_or(JsonValue::Null);
                self.webhook.send(&url, payload).await
            }
            _ => Err(unknown_method(AppName::Webhook, method)),
        }
    }
}

/// Resolves the installing Slack user from credential metadata.
fn installing_user(credential: &Credential) -> Option<String> {
    credential.metadata["authed_user"]["id"]
        .as_str()
        .map(str::to_string)
}

fn unknown_method(app: AppName, method: &str) -> ApiError {
    ApiError::InvalidRequest {
        reason: format!("unknown {app} method: {method}"),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal {
        reason: e.to_string(),
    })
}

fn require_str(args: &JsonValue, key: &str) -> Result<String, ApiError> {
    optional_str(args, key).ok_or_else(|| ApiError::InvalidRequest {
        reason: format!("missing required argument: {key}"),
    })
}

fn optional_str(args: &JsonValue, key: &str) -> Option<String> {
    match &args[key] {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn optional_u64(args: &JsonValue, key: &str) -> Option<u64> {
    match &args[key] {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn require_u64(args: &JsonValue, key: &str) -> Result<u64, ApiError> {
    optional_u64(args, key).ok_or_else(|| ApiError::InvalidRequest {
        reason: format!("missing or non-numeric argument: {key}"),
    })
}

/// Accepts a JSON array of strings or a comma-separated string.
fn string_list(args: &JsonValue, key: &str) -> Result<Vec<String>, ApiError> {
    match &args[key] {
        JsonValue::Array(items) => Ok(items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()),
        JsonValue::String(s) if !s.is_empty() => {
            Ok(s.split(',').map(|part| part.trim().to_string()).collect())
        }
        _ => Err(ApiError::InvalidRequest {
            reason: format!("missing required argument: {key}"),
        }),
    }
}

fn repo_args(args: &JsonValue) -> Result<(String, String), ApiError> {
    Ok((require_str(args, "owner")?, require_str(args, "repo")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::credential::{InMemoryCredentialStore, TokenSet};
    use crate::notify::InMemoryNotifier;
    use chrono::Duration as ChronoDuration;
    use patchbay_core::InMemoryEventLog;

    fn dispatcher_with(
        credentials: Arc<InMemoryCredentialStore>,
        notifier: Arc<InMemoryNotifier>,
    ) -> Dispatcher {
        Dispatcher::new(
            credentials,
            ProviderRegistry::default(),
            ResponseCache::new(),
            notifier,
            Arc::new(InMemoryEventLog::new()),
        )
    }

    #[tokio::test]
    async fn missing_credential_fails_not_connected() {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let dispatcher = dispatcher_with(credentials, notifier);

        let err = dispatcher
            .call(UserId::new(), AppName::Slack, "listChannels", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::NotConnected { app: AppName::Slack });
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_the_adapter() {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let user = UserId::new();
        credentials
            .save(
                user,
                AppName::Slack,
                TokenSet {
                    access_token: "tok".into(),
                    refresh_token: None,
                    expires_at: None,
                    metadata: JsonValue::Null,
                },
            )
            .await
            .unwrap();

        let notifier = Arc::new(InMemoryNotifier::new());
        let dispatcher = dispatcher_with(credentials, notifier);

        // Pre-populate the cache; no Slack server is running, so reaching the
        // adapter would fail.
        dispatcher.cache.put(
            CacheKey {
                app: AppName::Slack,
                user_id: user,
                method: "listChannels".into(),
            },
            json!({"ok": true, "channels": []}),
            ChronoDuration::minutes(5),
        );

        let result = dispatcher
            .call(user, AppName::Slack, "listChannels", json!({}))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_requires_reauth() {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let user = UserId::new();
        credentials
            .save(
                user,
                AppName::Gmail,
                TokenSet {
                    access_token: "tok".into(),
                    refresh_token: None,
                    expires_at: Some(Utc::now() - ChronoDuration::minutes(5)),
                    metadata: JsonValue::Null,
                },
            )
            .await
            .unwrap();

        let notifier = Arc::new(InMemoryNotifier::new());
        let dispatcher = dispatcher_with(credentials, notifier.clone());

        let err = dispatcher
            .call(user, AppName::Gmail, "getProfile", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::ReauthRequired { app: AppName::Gmail });

        // The user got exactly one notice.
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].2.contains("reconnect"));
    }

    #[tokio::test]
    async fn unknown_method_is_invalid_request() {
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let user = UserId::new();
        credentials
            .save(
                user,
                AppName::Github,
                TokenSet {
                    access_token: "tok".into(),
                    refresh_token: None,
                    expires_at: None,
                    metadata: JsonValue::Null,
                },
            )
            .await
            .unwrap();

        let dispatcher = dispatcher_with(credentials, Arc::new(InMemoryNotifier::new()));
        let err = dispatcher
            .call(user, AppName::Github, "mergePull", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest { .. }));
    }

    #[test]
    fn installing_user_comes_from_metadata() {
        let now = Utc::now();
        let credential = Credential {
            id: patchbay_core::CredentialId::new(),
            user_id: UserId::new(),
            app: AppName::Slack,
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: None,
            metadata: json!({"authed_user": {"id": "U777"}}),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(installing_user(&credential).as_deref(), Some("U777"));
    }

    #[test]
    fn string_list_accepts_array_and_csv() {
        let args = json!({"labelIds": ["STARRED", "IMPORTANT"]});
        assert_eq!(
            string_list(&args, "labelIds").unwrap(),
            vec!["STARRED", "IMPORTANT"]
        );

        let args = json!({"labelIds": "STARRED, IMPORTANT"});
        assert_eq!(
            string_list(&args, "labelIds").unwrap(),
            vec!["STARRED", "IMPORTANT"]
        );
    }

    #[test]
    fn numeric_args_accept_strings() {
        let args = json!({"issue_number": "42"});
        assert_eq!(require_u64(&args, "issue_number").unwrap(), 42);

        let args = json!({"issue_number": 42});
        assert_eq!(require_u64(&args, "issue_number").unwrap(), 42);
    }
}
