//! Environment-driven configuration for the orchestration core.
//!
//! [`CoreConfig::from_env`] reads the recognized keys into a plain struct;
//! helpers then assemble the provider client, the tool catalog, and the
//! orchestrator settings from it. Nothing here parses config files; the
//! embedding application owns that concern.
//!
//! | Key | Effect |
//! |---|---|
//! | `DEFAULT_LLM_PROVIDER` | `openai` (default) or `mock` |
//! | `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_MODEL` | Remote-chat provider |
//! | `DEFAULT_GIT_SERVICE` | `github` / `forgejo` / `mock` (default `mock`) |
//! | `GITHUB_TOKEN`, `GITHUB_BASE_URL` | GitHub credentials / compatible host |
//! | `FORGEJO_BASE_URL`, `FORGEJO_TOKEN`, `FORGEJO_USERNAME`, `FORGEJO_PASSWORD` | Forgejo credentials |
//! | `ENABLE_GITHUB_TOOLS` | Register the Git-write tools (default true) |
//! | `MCP_TOOLS_ENABLED` | Comma list restricting registered tool names |
//! | `LLM_CACHE_TTL_SECONDS`, `LLM_CACHE_MAX_ENTRIES` | Cache tuning |
//! | `LLM_MAX_TOOL_ITERATIONS` | Tool-loop bound |

use std::sync::Arc;
use std::time::Duration;

use crate::docullm::cache::{ResponseCache, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use crate::docullm::client_wrapper::LLMClient;
use crate::docullm::clients::mock::MockClient;
use crate::docullm::clients::remote_chat::RemoteChatClient;
use crate::docullm::error::{CoreError, ErrorKind};
use crate::docullm::function_registry::FunctionRegistry;
use crate::docullm::git_adapter::GitCredentials;
use crate::docullm::orchestrator::{
    OrchestratorSettings, QueryOrchestrator, DEFAULT_MAX_TOOL_ITERATIONS,
};
use crate::docullm::prompt_builder::GitService;
use crate::docullm::tools::{register_builtins, GitToolSettings, ToolCatalogOptions};

/// Which provider serves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// The remote OpenAI-compatible endpoint.
    Openai,
    /// The deterministic in-process mock.
    Mock,
}

/// Typed view of the recognized environment keys.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Active provider.
    pub provider: ProviderKind,
    /// API key for the remote provider.
    pub openai_api_key: Option<String>,
    /// Base-URL override for the remote provider.
    pub openai_base_url: Option<String>,
    /// Model the remote provider defaults to.
    pub openai_model: String,
    /// Default Git service for the write tools.
    pub default_git_service: GitService,
    /// Ambient GitHub token.
    pub github_token: Option<String>,
    /// GitHub-compatible API host override.
    pub github_base_url: Option<String>,
    /// Forgejo deployment base URL.
    pub forgejo_base_url: Option<String>,
    /// Ambient Forgejo token.
    pub forgejo_token: Option<String>,
    /// Forgejo basic-auth username.
    pub forgejo_username: Option<String>,
    /// Forgejo basic-auth password.
    pub forgejo_password: Option<String>,
    /// Whether the Git-write tools register at startup.
    pub enable_git_tools: bool,
    /// Restriction on registered tool names.
    pub tools_allowed: Option<Vec<String>>,
    /// Cache entry TTL.
    pub cache_ttl: Duration,
    /// Cache capacity.
    pub cache_max_entries: usize,
    /// Tool-loop bound.
    pub max_tool_iterations: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Mock,
            openai_api_key: None,
            openai_base_url: None,
            openai_model: "gpt-4.1-mini".to_string(),
            default_git_service: GitService::Mock,
            github_token: None,
            github_base_url: None,
            forgejo_base_url: None,
            forgejo_token: None,
            forgejo_username: None,
            forgejo_password: None,
            enable_git_tools: true,
            tools_allowed: None,
            cache_ttl: DEFAULT_TTL,
            cache_max_entries: DEFAULT_MAX_ENTRIES,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }
}

impl CoreConfig {
    /// Read the environment into a config.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            provider: match env_str("DEFAULT_LLM_PROVIDER").as_deref() {
                Some("mock") => ProviderKind::Mock,
                Some(_) => ProviderKind::Openai,
                None => defaults.provider,
            },
            openai_api_key: env_str("OPENAI_API_KEY"),
            openai_base_url: env_str("OPENAI_BASE_URL"),
            openai_model: env_str("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            default_git_service: env_str("DEFAULT_GIT_SERVICE")
                .as_deref()
                .and_then(GitService::parse)
                .unwrap_or(defaults.default_git_service),
            github_token: env_str("GITHUB_TOKEN"),
            github_base_url: env_str("GITHUB_BASE_URL"),
            forgejo_base_url: env_str("FORGEJO_BASE_URL"),
            forgejo_token: env_str("FORGEJO_TOKEN"),
            forgejo_username: env_str("FORGEJO_USERNAME"),
            forgejo_password: env_str("FORGEJO_PASSWORD"),
            enable_git_tools: env_bool("ENABLE_GITHUB_TOOLS").unwrap_or(defaults.enable_git_tools),
            tools_allowed: env_str("MCP_TOOLS_ENABLED").map(|list| {
                list.split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            }),
            cache_ttl: env_str("LLM_CACHE_TTL_SECONDS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            cache_max_entries: env_str("LLM_CACHE_MAX_ENTRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cache_max_entries),
            max_tool_iterations: env_str("LLM_MAX_TOOL_ITERATIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_tool_iterations),
        }
    }

    /// Construct the active provider client.
    pub fn build_client(&self) -> Result<Arc<dyn LLMClient>, CoreError> {
        match self.provider {
            ProviderKind::Mock => Ok(Arc::new(MockClient::new())),
            ProviderKind::Openai => {
                let key = self.openai_api_key.as_deref().ok_or_else(|| {
                    CoreError::new(
                        ErrorKind::InvalidRequest,
                        "OPENAI_API_KEY is required for the openai provider",
                    )
                })?;
                let client = match self.openai_base_url.as_deref() {
                    Some(base) => {
                        RemoteChatClient::new_with_base_url(key, &self.openai_model, base)
                    }
                    None => RemoteChatClient::new(key, &self.openai_model),
                };
                Ok(Arc::new(client))
            }
        }
    }

    /// Ambient credentials for a Git service.
    pub fn git_credentials_for(&self, service: GitService) -> GitCredentials {
        match service {
            GitService::Github => GitCredentials {
                token: self.github_token.clone(),
                ..GitCredentials::default()
            },
            GitService::Forgejo => GitCredentials {
                token: self.forgejo_token.clone(),
                username: self.forgejo_username.clone(),
                password: self.forgejo_password.clone(),
            },
            GitService::Mock => GitCredentials::default(),
        }
    }

    /// The Git-tool settings derived from this config.
    pub fn git_tool_settings(&self) -> GitToolSettings {
        GitToolSettings {
            default_service: self.default_git_service,
            github_token: self.github_token.clone(),
            github_base_url: self.github_base_url.clone(),
            forgejo_base_url: self.forgejo_base_url.clone(),
            forgejo_credentials: self.git_credentials_for(GitService::Forgejo),
            ..GitToolSettings::default()
        }
    }

    /// Build the fully-wired orchestrator: provider client, tool catalog,
    /// cache, and settings.
    pub fn build_orchestrator(&self) -> Result<QueryOrchestrator, CoreError> {
        let client = self.build_client()?;

        let git = self.git_tool_settings();
        let git_credentials_present = git.has_usable_credentials();
        let mut registry = FunctionRegistry::new();
        register_builtins(
            &mut registry,
            &ToolCatalogOptions {
                enable_git_tools: self.enable_git_tools,
                allowed_names: self.tools_allowed.clone(),
                git,
            },
        )?;

        let cache = Arc::new(ResponseCache::new(self.cache_max_entries, self.cache_ttl));
        let settings = OrchestratorSettings {
            max_tool_iterations: self.max_tool_iterations,
            git_credentials_present,
            ..OrchestratorSettings::default()
        };

        Ok(QueryOrchestrator::new(client, Arc::new(registry))
            .with_cache(cache)
            .with_settings(settings))
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
