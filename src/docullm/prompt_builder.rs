//! Context-aware system-prompt composition.
//!
//! The builder turns a repository context, optional document metadata, and
//! the (optionally embedded) document body into the single system message
//! that opens a provider request. Template selection and rendering are
//! delegated to [`crate::templates::TemplateStore`]; this module owns the
//! variable bag and the document-embedding policy.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::docullm::client_wrapper::Message;
use crate::docullm::error::CoreError;
use crate::docullm::templates::TemplateStore;

/// Which Git hosting service a repository lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitService {
    /// GitHub (or a GitHub-compatible host).
    Github,
    /// Forgejo (Gitea-compatible API).
    Forgejo,
    /// The in-process mock backend.
    Mock,
}

impl GitService {
    /// The lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            GitService::Github => "github",
            GitService::Forgejo => "forgejo",
            GitService::Mock => "mock",
        }
    }

    /// Parse a lowercase service name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "github" => Some(GitService::Github),
            "forgejo" => Some(GitService::Forgejo),
            "mock" => Some(GitService::Mock),
            _ => None,
        }
    }
}

/// What the user is currently looking at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryContext {
    /// Hosting service.
    pub service: GitService,
    /// Repository owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Git ref; the repository's default branch when absent.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    /// Path of the document currently open, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_path: Option<String>,
}

impl RepositoryContext {
    /// `owner/repo` shorthand used in prompts and adapter paths.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Kind of document being discussed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Markdown,
    Html,
    Text,
}

/// Metadata about the current document, as produced by the fetch layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document kind.
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    /// Last-modified timestamp when the host reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Document title, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Parsed front matter, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontmatter: Option<serde_json::Value>,
}

/// Default ceiling (in bytes) for embedding the document body verbatim.
pub const DEFAULT_CONTENT_EMBED_CAP: usize = 24 * 1024;

/// Inputs to one system-message build.
pub struct PromptInputs<'a> {
    /// Explicit template id, when the caller names one.
    pub template_id: Option<&'a str>,
    /// Repository the conversation is about.
    pub repository_context: Option<&'a RepositoryContext>,
    /// Metadata for the current document.
    pub document_metadata: Option<&'a DocumentMetadata>,
    /// Raw body of the current document.
    pub document_content: Option<&'a str>,
    /// Whether to embed the body (subject to the size cap).
    pub include_content: bool,
}

/// Composes system messages from templates plus context.
pub struct SystemPromptBuilder {
    templates: Arc<TemplateStore>,
    content_cap: usize,
}

impl SystemPromptBuilder {
    /// Builder over the given template store with the default embed cap.
    pub fn new(templates: Arc<TemplateStore>) -> Self {
        Self {
            templates,
            content_cap: DEFAULT_CONTENT_EMBED_CAP,
        }
    }

    /// Override the document-embed ceiling.
    pub fn with_content_cap(mut self, cap: usize) -> Self {
        self.content_cap = cap;
        self
    }

    /// Build the system message, or `None` when there is nothing to say.
    ///
    /// With no template id and no repository context the request proceeds
    /// without a system message. An unknown template id or a rendering
    /// failure surfaces as `template_error`.
    pub fn build(&self, inputs: &PromptInputs<'_>) -> Result<Option<Message>, CoreError> {
        if inputs.template_id.is_none()
            && inputs.repository_context.is_none()
            && inputs.document_content.is_none()
        {
            return Ok(None);
        }

        let current_path = inputs
            .repository_context
            .and_then(|ctx| ctx.current_path.as_deref());
        // A document body with no repository framing gets the bare persona,
        // which has no required variables.
        let template = if inputs.template_id.is_none() && inputs.repository_context.is_none() {
            self.templates.select(Some("minimal_qa"), None)?
        } else {
            self.templates.select(inputs.template_id, current_path)?
        };

        let mut vars: HashMap<String, String> = HashMap::new();
        if let Some(ctx) = inputs.repository_context {
            vars.insert("repository".to_string(), ctx.full_name());
            vars.insert("service".to_string(), ctx.service.as_str().to_string());
            if let Some(ref_name) = &ctx.ref_name {
                vars.insert("ref".to_string(), ref_name.clone());
            }
            if let Some(path) = &ctx.current_path {
                vars.insert("current_path".to_string(), path.clone());
            }
        }

        vars.insert(
            "document_context".to_string(),
            document_context_line(inputs.document_metadata),
        );
        vars.insert(
            "document_content_section".to_string(),
            self.document_content_section(inputs.document_content, inputs.include_content),
        );

        let rendered = self.templates.render(template.id, &vars)?;
        Ok(Some(Message::system(rendered)))
    }

    /// Either a delimited embed of the document or a short pointer string.
    fn document_content_section(&self, content: Option<&str>, include: bool) -> String {
        let content = match content {
            Some(c) if !c.is_empty() => c,
            _ => return String::new(),
        };
        if include && content.len() <= self.content_cap {
            format!(
                "\n--- CURRENT DOCUMENT ---\n{}\n--- END DOCUMENT ---\n",
                content
            )
        } else {
            format!(
                "\nThe current document is {} bytes and is not embedded here; \
                 use the document tools to inspect it.\n",
                content.len()
            )
        }
    }
}

/// One-line description of the document derived from its metadata.
fn document_context_line(metadata: Option<&DocumentMetadata>) -> String {
    let metadata = match metadata {
        Some(m) => m,
        None => return String::new(),
    };
    let kind = match metadata.doc_type {
        DocumentType::Markdown => "Markdown",
        DocumentType::Html => "HTML",
        DocumentType::Text => "plain-text",
    };
    let mut line = match &metadata.title {
        Some(title) => format!("\nThe current document is a {} file titled \"{}\".", kind, title),
        None => format!("\nThe current document is a {} file.", kind),
    };
    if let Some(ts) = metadata.last_modified {
        line.push_str(&format!(" Last modified {}.", ts.format("%Y-%m-%d")));
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_ctx() -> RepositoryContext {
        RepositoryContext {
            service: GitService::Github,
            owner: "octo".to_string(),
            repo: "hello".to_string(),
            ref_name: Some("main".to_string()),
            current_path: Some("docs/guide.md".to_string()),
        }
    }

    fn builder() -> SystemPromptBuilder {
        SystemPromptBuilder::new(Arc::new(TemplateStore::builtin()))
    }

    #[test]
    fn no_inputs_no_system_message() {
        let result = builder()
            .build(&PromptInputs {
                template_id: None,
                repository_context: None,
                document_metadata: None,
                document_content: None,
                include_content: false,
            })
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn repository_context_renders_default_template() {
        let ctx = repo_ctx();
        let msg = builder()
            .build(&PromptInputs {
                template_id: None,
                repository_context: Some(&ctx),
                document_metadata: None,
                document_content: None,
                include_content: false,
            })
            .unwrap()
            .expect("system message expected");
        assert!(msg.content.contains("octo/hello"));
    }

    #[test]
    fn small_document_is_embedded_with_delimiters() {
        let ctx = repo_ctx();
        let msg = builder()
            .build(&PromptInputs {
                template_id: None,
                repository_context: Some(&ctx),
                document_metadata: None,
                document_content: Some("# Guide\n\nIntro."),
                include_content: true,
            })
            .unwrap()
            .unwrap();
        assert!(msg.content.contains("--- CURRENT DOCUMENT ---"));
        assert!(msg.content.contains("# Guide"));
    }

    #[test]
    fn oversized_document_becomes_a_pointer() {
        let ctx = repo_ctx();
        let big = "x".repeat(64);
        let msg = SystemPromptBuilder::new(Arc::new(TemplateStore::builtin()))
            .with_content_cap(16)
            .build(&PromptInputs {
                template_id: None,
                repository_context: Some(&ctx),
                document_metadata: None,
                document_content: Some(&big),
                include_content: true,
            })
            .unwrap()
            .unwrap();
        assert!(!msg.content.contains("xxxx"));
        assert!(msg.content.contains("64 bytes"));
    }

    #[test]
    fn include_content_false_yields_pointer() {
        let ctx = repo_ctx();
        let msg = builder()
            .build(&PromptInputs {
                template_id: None,
                repository_context: Some(&ctx),
                document_metadata: None,
                document_content: Some("short"),
                include_content: false,
            })
            .unwrap()
            .unwrap();
        assert!(!msg.content.contains("--- CURRENT DOCUMENT ---"));
        assert!(msg.content.contains("5 bytes"));
    }

    #[test]
    fn metadata_title_appears_in_prompt() {
        let ctx = repo_ctx();
        let meta = DocumentMetadata {
            doc_type: DocumentType::Markdown,
            last_modified: None,
            title: Some("User Guide".to_string()),
            frontmatter: None,
        };
        let msg = builder()
            .build(&PromptInputs {
                template_id: None,
                repository_context: Some(&ctx),
                document_metadata: Some(&meta),
                document_content: None,
                include_content: false,
            })
            .unwrap()
            .unwrap();
        assert!(msg.content.contains("User Guide"));
    }

    #[test]
    fn readme_context_uses_specialist_template() {
        let mut ctx = repo_ctx();
        ctx.current_path = Some("README.md".to_string());
        let msg = builder()
            .build(&PromptInputs {
                template_id: None,
                repository_context: Some(&ctx),
                document_metadata: None,
                document_content: None,
                include_content: false,
            })
            .unwrap()
            .unwrap();
        assert!(msg.content.contains("documentation specialist"));
    }

    #[test]
    fn git_service_serde_round_trip() {
        for service in [GitService::Github, GitService::Forgejo, GitService::Mock] {
            let json = serde_json::to_string(&service).unwrap();
            let back: GitService = serde_json::from_str(&json).unwrap();
            assert_eq!(back, service);
            assert_eq!(GitService::parse(service.as_str()), Some(service));
        }
    }
}
