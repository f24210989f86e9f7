//! Backend-neutral Issue/PR/permission operations over Git hosting services.
//!
//! The [`GitToolAdapter`] trait is the boundary the Git-write tools call
//! through. Two HTTP backends are provided, GitHub REST v3 and Forgejo
//! (Gitea-compatible), plus an in-process mock that fabricates
//! deterministic results for tests and offline use.
//!
//! Success responses are normalized to [`GitOpSuccess`]
//! (`{service, owner, repo, number, url}`); failures carry one of the
//! adapter error kinds (`auth`, `not_found`, `conflict`, `rate_limited`,
//! `network`, `unknown`) so callers never see backend-specific error bodies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::docullm::clients::http_pool::get_shared_http_client;
use crate::docullm::error::{CoreError, ErrorKind};
use crate::docullm::prompt_builder::GitService;

/// Request deadline for Git-host calls.
const GIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials for one Git hosting service.
#[derive(Debug, Clone, Default)]
pub struct GitCredentials {
    /// Personal access token / API token.
    pub token: Option<String>,
    /// Username for basic auth (Forgejo only).
    pub username: Option<String>,
    /// Password for basic auth (Forgejo only).
    pub password: Option<String>,
}

impl GitCredentials {
    /// Token-only credentials.
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Whether any usable credential is present.
    pub fn is_usable(&self) -> bool {
        self.token.is_some() || (self.username.is_some() && self.password.is_some())
    }
}

/// Inputs for `create_issue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRequest {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Issue title.
    pub title: String,
    /// Issue body (Markdown).
    #[serde(default)]
    pub body: String,
    /// Labels to attach.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Users to assign.
    #[serde(default)]
    pub assignees: Vec<String>,
}

/// Inputs for `create_pull_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRequest {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// PR title.
    pub title: String,
    /// PR body (Markdown).
    #[serde(default)]
    pub body: String,
    /// Source branch.
    pub head: String,
    /// Target branch.
    pub base: String,
}

/// Normalized success shape for issue/PR creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitOpSuccess {
    /// Which backend served the call.
    pub service: GitService,
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Issue or PR number.
    pub number: u64,
    /// Browser URL of the created resource.
    pub url: String,
}

/// Normalized permission report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryPermissions {
    /// Which backend served the call.
    pub service: GitService,
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Administrative access.
    pub admin: bool,
    /// Write access.
    pub push: bool,
    /// Read access.
    pub pull: bool,
}

/// Backend-neutral write operations on a Git hosting service.
#[async_trait]
pub trait GitToolAdapter: Send + Sync {
    /// Open an issue.
    async fn create_issue(&self, request: &IssueRequest) -> Result<GitOpSuccess, CoreError>;

    /// Open a pull request.
    async fn create_pull_request(
        &self,
        request: &PullRequestRequest,
    ) -> Result<GitOpSuccess, CoreError>;

    /// Report the authenticated caller's permissions on a repository.
    async fn check_permissions(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<RepositoryPermissions, CoreError>;

    /// Which service this adapter talks to.
    fn service(&self) -> GitService;
}

/// Build the adapter for a service.
///
/// Forgejo requires a configured base URL; GitHub defaults to the public
/// API host but accepts an override for GitHub-compatible deployments.
pub fn adapter_for(
    service: GitService,
    credentials: GitCredentials,
    forgejo_base_url: Option<&str>,
    github_base_url: Option<&str>,
) -> Result<Arc<dyn GitToolAdapter>, CoreError> {
    match service {
        GitService::Github => {
            let mut adapter = GitHubAdapter::new(credentials);
            if let Some(base) = github_base_url {
                adapter = adapter.with_base_url(base);
            }
            Ok(Arc::new(adapter))
        }
        GitService::Forgejo => match forgejo_base_url {
            Some(base) => Ok(Arc::new(ForgejoAdapter::new(base, credentials))),
            None => Err(CoreError::new(
                ErrorKind::InvalidRequest,
                "forgejo service requires FORGEJO_BASE_URL",
            )),
        },
        GitService::Mock => Ok(Arc::new(MockGitAdapter::new())),
    }
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

/// GitHub REST v3 backend (host-configurable for compatible deployments).
pub struct GitHubAdapter {
    http: reqwest::Client,
    base_url: String,
    credentials: GitCredentials,
}

impl GitHubAdapter {
    /// Adapter against `https://api.github.com`.
    pub fn new(credentials: GitCredentials) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            base_url: "https://api.github.com".to_string(),
            credentials,
        }
    }

    /// Override the API host.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn repo_url(&self, owner: &str, repo: &str, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.base_url,
            urlencoding::encode(owner),
            urlencoding::encode(repo),
            suffix
        )
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, CoreError> {
        match &self.credentials.token {
            Some(token) => Ok(builder.header("Authorization", format!("token {}", token))),
            None => Err(CoreError::new(
                ErrorKind::Auth,
                "github operations require a token",
            )),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, CoreError> {
        let builder = self
            .http
            .post(url)
            .timeout(GIT_REQUEST_TIMEOUT)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "docullm")
            .json(body);
        let resp = self
            .authorize(builder)?
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorKind::Network, "git host unreachable").with_source(e))?;
        read_json_response(resp).await
    }
}

#[async_trait]
impl GitToolAdapter for GitHubAdapter {
    async fn create_issue(&self, request: &IssueRequest) -> Result<GitOpSuccess, CoreError> {
        let url = self.repo_url(&request.owner, &request.repo, "/issues");
        let body = serde_json::json!({
            "title": request.title,
            "body": request.body,
            "labels": request.labels,
            "assignees": request.assignees,
        });
        let json = self.post_json(&url, &body).await?;
        parse_created(GitService::Github, &request.owner, &request.repo, &json)
    }

    async fn create_pull_request(
        &self,
        request: &PullRequestRequest,
    ) -> Result<GitOpSuccess, CoreError> {
        let url = self.repo_url(&request.owner, &request.repo, "/pulls");
        let body = serde_json::json!({
            "title": request.title,
            "body": request.body,
            "head": request.head,
            "base": request.base,
        });
        let json = self.post_json(&url, &body).await?;
        parse_created(GitService::Github, &request.owner, &request.repo, &json)
    }

    async fn check_permissions(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<RepositoryPermissions, CoreError> {
        let url = self.repo_url(owner, repo, "");
        let builder = self
            .http
            .get(&url)
            .timeout(GIT_REQUEST_TIMEOUT)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "docullm");
        let resp = self
            .authorize(builder)?
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorKind::Network, "git host unreachable").with_source(e))?;
        let json = read_json_response(resp).await?;
        Ok(parse_permissions(GitService::Github, owner, repo, &json))
    }

    fn service(&self) -> GitService {
        GitService::Github
    }
}

// ---------------------------------------------------------------------------
// Forgejo (Gitea-compatible)
// ---------------------------------------------------------------------------

/// Forgejo backend; identical request/response surface at this boundary.
pub struct ForgejoAdapter {
    http: reqwest::Client,
    base_url: String,
    credentials: GitCredentials,
}

impl ForgejoAdapter {
    /// Adapter against a Forgejo deployment, e.g. `https://codeberg.org`.
    pub fn new(base_url: &str, credentials: GitCredentials) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn repo_url(&self, owner: &str, repo: &str, suffix: &str) -> String {
        format!(
            "{}/api/v1/repos/{}/{}{}",
            self.base_url,
            urlencoding::encode(owner),
            urlencoding::encode(repo),
            suffix
        )
    }

    /// Token auth when available, basic auth otherwise.
    fn authorize(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, CoreError> {
        if let Some(token) = &self.credentials.token {
            return Ok(builder.header("Authorization", format!("token {}", token)));
        }
        match (&self.credentials.username, &self.credentials.password) {
            (Some(user), Some(pass)) => Ok(builder.basic_auth(user, Some(pass))),
            _ => Err(CoreError::new(
                ErrorKind::Auth,
                "forgejo operations require a token or username/password",
            )),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, CoreError> {
        let builder = self
            .http
            .post(url)
            .timeout(GIT_REQUEST_TIMEOUT)
            .header("User-Agent", "docullm")
            .json(body);
        let resp = self
            .authorize(builder)?
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorKind::Network, "git host unreachable").with_source(e))?;
        read_json_response(resp).await
    }
}

#[async_trait]
impl GitToolAdapter for ForgejoAdapter {
    async fn create_issue(&self, request: &IssueRequest) -> Result<GitOpSuccess, CoreError> {
        let url = self.repo_url(&request.owner, &request.repo, "/issues");
        let body = serde_json::json!({
            "title": request.title,
            "body": request.body,
            // Forgejo expects label ids, not names; names are resolved by the
            // caller when needed, so plain creates omit them.
            "assignees": request.assignees,
        });
        let json = self.post_json(&url, &body).await?;
        parse_created(GitService::Forgejo, &request.owner, &request.repo, &json)
    }

    async fn create_pull_request(
        &self,
        request: &PullRequestRequest,
    ) -> Result<GitOpSuccess, CoreError> {
        let url = self.repo_url(&request.owner, &request.repo, "/pulls");
        let body = serde_json::json!({
            "title": request.title,
            "body": request.body,
            "head": request.head,
            "base": request.base,
        });
        let json = self.post_json(&url, &body).await?;
        parse_created(GitService::Forgejo, &request.owner, &request.repo, &json)
    }

    async fn check_permissions(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<RepositoryPermissions, CoreError> {
        let url = self.repo_url(owner, repo, "");
        let builder = self
            .http
            .get(&url)
            .timeout(GIT_REQUEST_TIMEOUT)
            .header("User-Agent", "docullm");
        let resp = self
            .authorize(builder)?
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorKind::Network, "git host unreachable").with_source(e))?;
        let json = read_json_response(resp).await?;
        Ok(parse_permissions(GitService::Forgejo, owner, repo, &json))
    }

    fn service(&self) -> GitService {
        GitService::Forgejo
    }
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// In-process backend with fabricated, deterministic results.
pub struct MockGitAdapter {
    counter: AtomicU64,
}

impl MockGitAdapter {
    /// Mock starting at issue/PR number 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Mock whose first fabricated number is `first_number`.
    pub fn starting_at(first_number: u64) -> Self {
        Self {
            counter: AtomicU64::new(first_number.saturating_sub(1)),
        }
    }

    fn next_number(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for MockGitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitToolAdapter for MockGitAdapter {
    async fn create_issue(&self, request: &IssueRequest) -> Result<GitOpSuccess, CoreError> {
        let number = self.next_number();
        Ok(GitOpSuccess {
            service: GitService::Mock,
            owner: request.owner.clone(),
            repo: request.repo.clone(),
            number,
            url: format!(
                "https://mock.example/{}/{}/issues/{}",
                request.owner, request.repo, number
            ),
        })
    }

    async fn create_pull_request(
        &self,
        request: &PullRequestRequest,
    ) -> Result<GitOpSuccess, CoreError> {
        let number = self.next_number();
        Ok(GitOpSuccess {
            service: GitService::Mock,
            owner: request.owner.clone(),
            repo: request.repo.clone(),
            number,
            url: format!(
                "https://mock.example/{}/{}/pulls/{}",
                request.owner, request.repo, number
            ),
        })
    }

    async fn check_permissions(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<RepositoryPermissions, CoreError> {
        Ok(RepositoryPermissions {
            service: GitService::Mock,
            owner: owner.to_string(),
            repo: repo.to_string(),
            admin: true,
            push: true,
            pull: true,
        })
    }

    fn service(&self) -> GitService {
        GitService::Mock
    }
}

// ---------------------------------------------------------------------------
// Shared parsing
// ---------------------------------------------------------------------------

async fn read_json_response(resp: reqwest::Response) -> Result<serde_json::Value, CoreError> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| CoreError::new(ErrorKind::Network, "failed to read git host response").with_source(e))?;
    if !status.is_success() {
        return Err(classify_git_status(status, &text));
    }
    serde_json::from_str(&text)
        .map_err(|e| CoreError::new(ErrorKind::Unknown, "git host returned invalid JSON").with_source(e))
}

fn classify_git_status(status: reqwest::StatusCode, body: &str) -> CoreError {
    let kind = match status.as_u16() {
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::NotFound,
        409 | 422 => ErrorKind::Conflict,
        429 => ErrorKind::RateLimited,
        _ => ErrorKind::Unknown,
    };
    let detail: String = body.chars().take(200).collect();
    CoreError::new(kind, format!("HTTP {}: {}", status, detail))
}

fn parse_created(
    service: GitService,
    owner: &str,
    repo: &str,
    json: &serde_json::Value,
) -> Result<GitOpSuccess, CoreError> {
    let number = json
        .get("number")
        .and_then(|n| n.as_u64())
        .ok_or_else(|| CoreError::new(ErrorKind::Unknown, "git host response missing number"))?;
    let url = json
        .get("html_url")
        .or_else(|| json.get("url"))
        .and_then(|u| u.as_str())
        .unwrap_or("")
        .to_string();
    Ok(GitOpSuccess {
        service,
        owner: owner.to_string(),
        repo: repo.to_string(),
        number,
        url,
    })
}

fn parse_permissions(
    service: GitService,
    owner: &str,
    repo: &str,
    json: &serde_json::Value,
) -> RepositoryPermissions {
    let perms = json.get("permissions");
    let flag = |name: &str| {
        perms
            .and_then(|p| p.get(name))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    RepositoryPermissions {
        service,
        owner: owner.to_string(),
        repo: repo.to_string(),
        admin: flag("admin"),
        push: flag("push"),
        pull: flag("pull"),
    }
}
