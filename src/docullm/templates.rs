//! Named prompt templates with typed variable substitution.
//!
//! Templates use `{name}` placeholders resolved from a string-keyed bag.
//! Each template declares which variables are required (rendering fails
//! without them) and which are optional (substituted with an empty string
//! when absent). The built-in catalog covers the documentation-assistant
//! personas; selection falls back from an explicit id to a match on the
//! current document path, then to the default template.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use docullm::templates::TemplateStore;
//!
//! let store = TemplateStore::builtin();
//! let mut vars = HashMap::new();
//! vars.insert("repository".to_string(), "octocat/hello".to_string());
//! vars.insert("document_content_section".to_string(), String::new());
//! let rendered = store.render("documentation_assistant", &vars).unwrap();
//! assert!(rendered.contains("octocat/hello"));
//! ```

use std::collections::HashMap;

use serde::Serialize;

use crate::docullm::error::CoreError;

/// Default template id used when neither the caller nor path matching picks one.
pub const DEFAULT_TEMPLATE_ID: &str = "documentation_assistant";

/// A prompt template and its variable contract.
#[derive(Debug, Clone)]
pub struct Template {
    /// Stable identifier, e.g. `"documentation_specialist"`.
    pub id: &'static str,
    /// Short human description served by the template catalog endpoint.
    pub description: &'static str,
    /// Template body with `{name}` placeholders.
    pub text: &'static str,
    /// Variables that must be present in the bag.
    pub required_variables: &'static [&'static str],
    /// Variables substituted with `""` when absent.
    pub optional_variables: &'static [&'static str],
}

/// Catalog metadata returned by `GET /llm/templates`.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    /// Template id.
    pub id: String,
    /// Human description.
    pub description: String,
    /// Required variable names.
    pub required_variables: Vec<String>,
    /// Optional variable names.
    pub optional_variables: Vec<String>,
}

const BUILTIN_TEMPLATES: &[Template] = &[
    Template {
        id: "documentation_assistant",
        description: "General assistant for questions about a repository's documents",
        text: "You are a documentation assistant for the repository {repository}.\n\
               Answer questions about the repository's Markdown documents accurately and \
               concisely, citing document sections when helpful. When a change to the \
               documentation is warranted you may use the available tools to analyze \
               documents or open issues and pull requests on the user's behalf.\n\
               {document_context}{document_content_section}",
        required_variables: &["repository"],
        optional_variables: &["document_context", "document_content_section"],
    },
    Template {
        id: "documentation_specialist",
        description: "Specialist persona for README and project-overview documents",
        text: "You are a documentation specialist reviewing {current_path} in the \
               repository {repository}.\n\
               This document introduces the project; prioritize clarity for first-time \
               readers, completeness of setup instructions, and accuracy of examples. \
               Use the document-analysis tools before proposing structural changes.\n\
               {document_context}{document_content_section}",
        required_variables: &["repository", "current_path"],
        optional_variables: &["document_context", "document_content_section"],
    },
    Template {
        id: "code_documentation",
        description: "Persona for documents that describe source code or APIs",
        text: "You are an API documentation assistant for {repository}, currently \
               looking at {current_path}.\n\
               Keep explanations precise: reference function and type names exactly as \
               they appear, and prefer short code examples over prose.\n\
               {document_context}{document_content_section}",
        required_variables: &["repository", "current_path"],
        optional_variables: &["document_context", "document_content_section"],
    },
    Template {
        id: "minimal_qa",
        description: "Bare question-answering persona with no repository framing",
        text: "You are a helpful assistant answering questions about documentation.\n\
               {document_content_section}",
        required_variables: &[],
        optional_variables: &["document_content_section"],
    },
];

/// Static catalog of named templates.
pub struct TemplateStore {
    templates: Vec<Template>,
}

impl TemplateStore {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        Self {
            templates: BUILTIN_TEMPLATES.to_vec(),
        }
    }

    /// Look up a template by id.
    pub fn get(&self, id: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// Catalog metadata for every template.
    pub fn catalog(&self) -> Vec<TemplateInfo> {
        self.templates
            .iter()
            .map(|t| TemplateInfo {
                id: t.id.to_string(),
                description: t.description.to_string(),
                required_variables: t.required_variables.iter().map(|s| s.to_string()).collect(),
                optional_variables: t.optional_variables.iter().map(|s| s.to_string()).collect(),
            })
            .collect()
    }

    /// Pick a template id: explicit id wins, then the current document path,
    /// then the default.
    ///
    /// README-like paths select the documentation specialist; source-code
    /// paths select the API persona.
    pub fn select(&self, template_id: Option<&str>, current_path: Option<&str>) -> Result<&Template, CoreError> {
        if let Some(id) = template_id {
            return self
                .get(id)
                .ok_or_else(|| CoreError::template(format!("unknown template id: {}", id)));
        }
        if let Some(path) = current_path {
            let file_name = path.rsplit('/').next().unwrap_or(path);
            let lower = file_name.to_ascii_lowercase();
            if lower.starts_with("readme") {
                return Ok(self.get("documentation_specialist").unwrap_or(&self.templates[0]));
            }
            if is_source_path(&lower) {
                return Ok(self.get("code_documentation").unwrap_or(&self.templates[0]));
            }
        }
        self.get(DEFAULT_TEMPLATE_ID)
            .ok_or_else(|| CoreError::template("default template missing from catalog"))
    }

    /// Render `id` against the variable bag.
    ///
    /// Missing required variables fail with `template_error`; missing
    /// optional variables substitute as the empty string. Placeholders not
    /// declared by the template also fail, so typos in templates surface
    /// during tests rather than as literal braces in prompts.
    pub fn render(&self, id: &str, vars: &HashMap<String, String>) -> Result<String, CoreError> {
        let template = self
            .get(id)
            .ok_or_else(|| CoreError::template(format!("unknown template id: {}", id)))?;
        render_template(template, vars)
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::builtin()
    }
}

fn is_source_path(lower_file_name: &str) -> bool {
    const SOURCE_SUFFIXES: &[&str] = &[".rs", ".py", ".ts", ".js", ".go", ".java", ".c", ".cpp", ".h"];
    SOURCE_SUFFIXES.iter().any(|s| lower_file_name.ends_with(s))
}

/// Substitute `{name}` placeholders in `template.text` from `vars`.
fn render_template(template: &Template, vars: &HashMap<String, String>) -> Result<String, CoreError> {
    for required in template.required_variables {
        if !vars.contains_key(*required) {
            return Err(CoreError::template(format!(
                "template '{}' requires variable '{}'",
                template.id, required
            )));
        }
    }

    let mut out = String::with_capacity(template.text.len());
    let mut rest = template.text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            CoreError::template(format!("template '{}' has an unclosed placeholder", template.id))
        })?;
        let name = &after[..close];
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                if !template.optional_variables.contains(&name) {
                    return Err(CoreError::template(format!(
                        "template '{}' references undeclared variable '{}'",
                        template.id, name
                    )));
                }
                // Optional and absent: substitute nothing.
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
