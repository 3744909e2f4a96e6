//! GitHub REST v3 adapter.
//!
//! All requests carry `Accept: application/vnd.github+json` and a User-Agent
//! (GitHub rejects anonymous agents). List operations expose the sort
//! direction the caller asks for; detectors request newest-first.

use crate::adapter::ensure_success;
use crate::error::ApiError;
use serde_json::{Value as JsonValue, json};

/// GitHub REST base URL.
pub const GITHUB_BASE_URL: &str = "https://api.github.com";

/// Accept header for the REST v3 JSON media type.
pub const GITHUB_ACCEPT: &str = "application/vnd.github+json";

const USER_AGENT: &str = "patchbay-engine";

/// Typed wrapper over the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
}

impl GithubClient {
    /// Creates an adapter against the public GitHub endpoint.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: GITHUB_BASE_URL.to_string(),
        }
    }

    /// Overrides the base URL (test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str, access_token: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
    }

    async fn get_json(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, ApiError> {
        let response = self
            .request(reqwest::Method::GET, path, access_token)
            .query(query)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Lists issues for a repository, newest first.
    ///
    /// GitHub's issues endpoint includes pull requests; callers that want
    /// issues only must drop entries carrying a `pull_request` key.
    pub async fn list_issues(
        &self,
        access_token: &str,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<JsonValue>, ApiError> {
        let path = format!("/repos/{owner}/{repo}/issues");
        let body = self
            .get_json(
                access_token,
                &path,
                &[("state", state), ("sort", "created"), ("direction", "desc")],
            )
            .await?;
        Ok(into_array(body))
    }

    /// Lists pull requests for a repository, newest first.
    pub async fn list_pulls(
        &self,
        access_token: &str,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<JsonValue>, ApiError> {
        let path = format!("/repos/{owner}/{repo}/pulls");
        let body = self
            .get_json(
                access_token,
                &path,
                &[("state", state), ("sort", "created"), ("direction", "desc")],
            )
            .await?;
        Ok(into_array(body))
    }

    /// Lists issue comments across a repository, newest first.
    pub async fn list_issue_comments(
        &self,
        access_token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<JsonValue>, ApiError> {
        let path = format!("/repos/{owner}/{repo}/issues/comments");
        let body = self
            .get_json(
                access_token,
                &path,
                &[("sort", "created"), ("direction", "desc")],
            )
            .await?;
        Ok(into_array(body))
    }

    /// Lists commits, optionally restricted to a branch. GitHub returns
    /// newest first.
    pub async fn list_commits(
        &self,
        access_token: &str,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
    ) -> Result<Vec<JsonValue>, ApiError> {
        let path = format!("/repos/{owner}/{repo}/commits");
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(branch) = branch {
            query.push(("sha", branch));
        }
        let body = self.get_json(access_token, &path, &query).await?;
        Ok(into_array(body))
    }

    /// Creates an issue.
    pub async fn create_issue(
        &self,
        access_token: &str,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<JsonValue, ApiError> {
        let path = format!("/repos/{owner}/{repo}/issues");
        let response = self
            .request(reqwest::Method::POST, &path, access_token)
            .json(&json!({ "title": title, "body": body }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Comments on an issue.
    pub async fn add_issue_comment(
        &self,
        access_token: &str,
        owner: &str,
        repo: &str,
        issue_number: u64,
        comment: &str,
    ) -> Result<JsonValue, ApiError> {
        let path = format!("/repos/{owner}/{repo}/issues/{issue_number}/comments");
        let response = self
            .request(reqwest::Method::POST, &path, access_token)
            .json(&json!({ "body": comment }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Closes an issue.
    pub async fn close_issue(
        &self,
        access_token: &str,
        owner: &str,
        repo: &str,
        issue_number: u64,
    ) -> Result<JsonValue, ApiError> {
        let path = format!("/repos/{owner}/{repo}/issues/{issue_number}");
        let response = self
            .request(reqwest::Method::PATCH, &path, access_token)
            .json(&json!({ "state": "closed" }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Assigns users to an issue.
    pub async fn assign_issue(
        &self,
        access_token: &str,
        owner: &str,
        repo: &str,
        issue_number: u64,
        assignees: &[String],
    ) -> Result<JsonValue, ApiError> {
        let path = format!("/repos/{owner}/{repo}/issues/{issue_number}/assignees");
        let response = self
            .request(reqwest::Method::POST, &path, access_token)
            .json(&json!({ "assignees": assignees }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Lists repositories visible to the token.
    pub async fn list_repos(&self, access_token: &str) -> Result<JsonValue, ApiError> {
        self.get_json(access_token, "/user/repos", &[("per_page", "100")])
            .await
    }

    /// Returns the authenticated user.
    pub async fn get_current_user(&self, access_token: &str) -> Result<JsonValue, ApiError> {
        self.get_json(access_token, "/user", &[]).await
    }
}

fn into_array(body: JsonValue) -> Vec<JsonValue> {
    match body {
        JsonValue::Array(items) => items,
        _ => Vec::new(),
    }
}
