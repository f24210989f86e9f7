//! Built-in tool catalog.
//!
//! [`register_builtins`] wires the document-analysis, feedback, and Git-write
//! tools into a [`FunctionRegistry`] at startup. `MCP_TOOLS_ENABLED` (the
//! `allowed_names` filter) restricts the catalog by name; `ENABLE_GITHUB_TOOLS`
//! (the `enable_git_tools` flag) gates the side-effecting Git tools entirely.

pub mod document;
pub mod feedback;
pub mod git;

use crate::docullm::error::CoreError;
use crate::docullm::function_registry::{FunctionDefinition, FunctionRegistry};

pub use git::GitToolSettings;

/// Which built-ins to register.
#[derive(Clone, Default)]
pub struct ToolCatalogOptions {
    /// Register the Git-write tools.
    pub enable_git_tools: bool,
    /// When set, only tools whose names appear here register.
    pub allowed_names: Option<Vec<String>>,
    /// Ambient configuration for the Git tools.
    pub git: GitToolSettings,
}

/// Register the built-in tool catalog.
pub fn register_builtins(
    registry: &mut FunctionRegistry,
    options: &ToolCatalogOptions,
) -> Result<(), CoreError> {
    let mut catalog: Vec<FunctionDefinition> = Vec::new();
    catalog.extend(document::definitions());
    catalog.extend(feedback::definitions());
    if options.enable_git_tools {
        catalog.extend(git::definitions(&options.git));
    }

    for def in catalog {
        if let Some(allowed) = &options.allowed_names {
            if !allowed.iter().any(|name| name == &def.name) {
                continue;
            }
        }
        registry.register(def)?;
    }
    Ok(())
}
