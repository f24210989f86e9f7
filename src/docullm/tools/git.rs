//! Git-write tools: issue creation, PR creation, permission checks.
//!
//! These handlers dispatch into the [`GitToolAdapter`] for the requested
//! service. They are side-effecting (registering them marks the turn
//! uncacheable) and they only register at all when Git credentials are
//! configured or can arrive with the request.
//!
//! Credential precedence (most specific wins): a `token` inside the tool
//! arguments overrides the per-request token (which the orchestrator injects
//! into the arguments), which overrides the ambient configuration held in
//! [`GitToolSettings`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::docullm::error::{CoreError, ErrorKind};
use crate::docullm::function_registry::{FunctionDefinition, FunctionHandler};
use crate::docullm::git_adapter::{
    adapter_for, GitCredentials, GitToolAdapter, IssueRequest, MockGitAdapter, PullRequestRequest,
};
use crate::docullm::prompt_builder::GitService;

/// Ambient Git configuration the tools fall back to.
#[derive(Clone)]
pub struct GitToolSettings {
    /// Service used when neither arguments nor repository context name one.
    pub default_service: GitService,
    /// Ambient GitHub token.
    pub github_token: Option<String>,
    /// Override for GitHub-compatible API hosts.
    pub github_base_url: Option<String>,
    /// Forgejo deployment base URL.
    pub forgejo_base_url: Option<String>,
    /// Ambient Forgejo credentials.
    pub forgejo_credentials: GitCredentials,
    /// Shared in-process mock backend (one instance per process so numbers
    /// are sequential across calls).
    pub mock_adapter: Arc<MockGitAdapter>,
}

impl Default for GitToolSettings {
    fn default() -> Self {
        Self {
            default_service: GitService::Mock,
            github_token: None,
            github_base_url: None,
            forgejo_base_url: None,
            forgejo_credentials: GitCredentials::default(),
            mock_adapter: Arc::new(MockGitAdapter::new()),
        }
    }
}

impl GitToolSettings {
    /// Whether any backend could be used with the current configuration
    /// (the mock always can).
    pub fn has_usable_credentials(&self) -> bool {
        self.default_service == GitService::Mock
            || self.github_token.is_some()
            || self.forgejo_credentials.is_usable()
    }

    /// Resolve the adapter for a call: arguments first, then the default
    /// service; an argument-supplied token beats the ambient one.
    fn resolve_adapter(&self, arguments: &Value) -> Result<Arc<dyn GitToolAdapter>, CoreError> {
        let service = match arguments["service_type"].as_str() {
            Some(name) => GitService::parse(name).ok_or_else(|| {
                CoreError::new(
                    ErrorKind::InvalidArguments,
                    format!("unknown service_type: {}", name),
                )
            })?,
            None => self.default_service,
        };

        if service == GitService::Mock {
            return Ok(self.mock_adapter.clone() as Arc<dyn GitToolAdapter>);
        }

        let arg_token = arguments["token"].as_str().map(|s| s.to_string());
        let credentials = match service {
            GitService::Github => GitCredentials {
                token: arg_token.or_else(|| self.github_token.clone()),
                ..GitCredentials::default()
            },
            GitService::Forgejo => {
                let mut creds = self.forgejo_credentials.clone();
                if let Some(token) = arg_token {
                    creds.token = Some(token);
                }
                creds
            }
            GitService::Mock => unreachable!("handled above"),
        };

        adapter_for(
            service,
            credentials,
            self.forgejo_base_url.as_deref(),
            self.github_base_url.as_deref(),
        )
    }
}

fn required_str(arguments: &Value, key: &str) -> Result<String, CoreError> {
    arguments[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            CoreError::new(
                ErrorKind::InvalidArguments,
                format!("missing required argument: {}", key),
            )
        })
}

fn string_list(arguments: &Value, key: &str) -> Vec<String> {
    arguments[key]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn with_ok(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert("ok".to_string(), Value::Bool(true));
            Value::Object(map)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

struct CreateIssueHandler {
    settings: GitToolSettings,
}

#[async_trait]
impl FunctionHandler for CreateIssueHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        let adapter = self.settings.resolve_adapter(&arguments)?;
        let request = IssueRequest {
            owner: required_str(&arguments, "owner")?,
            repo: required_str(&arguments, "repo")?,
            title: required_str(&arguments, "title")?,
            body: arguments["body"].as_str().unwrap_or("").to_string(),
            labels: string_list(&arguments, "labels"),
            assignees: string_list(&arguments, "assignees"),
        };
        let created = adapter.create_issue(&request).await?;
        Ok(with_ok(serde_json::to_value(created).unwrap_or(Value::Null)))
    }
}

struct CreatePullRequestHandler {
    settings: GitToolSettings,
}

#[async_trait]
impl FunctionHandler for CreatePullRequestHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        let adapter = self.settings.resolve_adapter(&arguments)?;
        let request = PullRequestRequest {
            owner: required_str(&arguments, "owner")?,
            repo: required_str(&arguments, "repo")?,
            title: required_str(&arguments, "title")?,
            body: arguments["body"].as_str().unwrap_or("").to_string(),
            head: required_str(&arguments, "head")?,
            base: required_str(&arguments, "base")?,
        };
        let created = adapter.create_pull_request(&request).await?;
        Ok(with_ok(serde_json::to_value(created).unwrap_or(Value::Null)))
    }
}

struct CheckPermissionsHandler {
    settings: GitToolSettings,
}

#[async_trait]
impl FunctionHandler for CheckPermissionsHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        let adapter = self.settings.resolve_adapter(&arguments)?;
        let owner = required_str(&arguments, "owner")?;
        let repo = required_str(&arguments, "repo")?;
        let report = adapter.check_permissions(&owner, &repo).await?;
        Ok(with_ok(serde_json::to_value(report).unwrap_or(Value::Null)))
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

fn common_properties() -> Value {
    serde_json::json!({
        "owner": {"type": "string", "description": "Repository owner; defaults to the current repository context"},
        "repo": {"type": "string", "description": "Repository name; defaults to the current repository context"},
        "service_type": {
            "type": "string",
            "enum": ["github", "forgejo", "mock"],
            "description": "Git hosting service; defaults to the configured service"
        },
        "token": {"type": "string", "description": "Credential override for this call"}
    })
}

fn merge_properties(mut base: Value, extra: Value) -> Value {
    if let (Some(base_map), Some(extra_map)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_map {
            base_map.insert(k.clone(), v.clone());
        }
    }
    base
}

/// The three Git-write tool definitions bound to `settings`.
pub fn definitions(settings: &GitToolSettings) -> Vec<FunctionDefinition> {
    vec![
        FunctionDefinition::new(
            "create_git_issue",
            "Open an issue on the repository the user is looking at (or an explicitly named one).",
            Arc::new(CreateIssueHandler {
                settings: settings.clone(),
            }),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": merge_properties(common_properties(), serde_json::json!({
                "title": {"type": "string", "description": "Issue title"},
                "body": {"type": "string", "description": "Issue body in Markdown"},
                "labels": {"type": "array", "items": {"type": "string"}},
                "assignees": {"type": "array", "items": {"type": "string"}}
            })),
            "required": ["title"]
        }))
        .side_effecting()
        .requires_git_credentials(),
        FunctionDefinition::new(
            "create_git_pull_request",
            "Open a pull request from an existing branch.",
            Arc::new(CreatePullRequestHandler {
                settings: settings.clone(),
            }),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": merge_properties(common_properties(), serde_json::json!({
                "title": {"type": "string", "description": "Pull request title"},
                "body": {"type": "string", "description": "Pull request body in Markdown"},
                "head": {"type": "string", "description": "Source branch"},
                "base": {"type": "string", "description": "Target branch"}
            })),
            "required": ["title", "head", "base"]
        }))
        .side_effecting()
        .requires_git_credentials(),
        FunctionDefinition::new(
            "check_git_repository_permissions",
            "Report the authenticated user's permissions on a repository.",
            Arc::new(CheckPermissionsHandler {
                settings: settings.clone(),
            }),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": common_properties(),
            "required": []
        }))
        .side_effecting()
        .requires_git_credentials(),
    ]
}
