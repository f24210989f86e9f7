//! Tool/function registry and safe invocation.
//!
//! Tools are registered once at startup as [`FunctionDefinition`]s: a name,
//! a description, a JSON-Schema parameter document, and an async handler.
//! The registry is treated as read-only afterwards: the orchestrator takes
//! an `Arc<FunctionRegistry>` snapshot and exposes the schemas to the
//! provider as [`ToolDefinition`]s.
//!
//! [`FunctionRegistry::call`] never panics and never returns `Err` to the
//! tool loop: argument-validation failures, unknown tools, timeouts, and
//! handler errors all become a structured
//! `{"ok": false, "error_kind": ..., "message": ...}` JSON value so the
//! model can see what went wrong and decide the next step.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use docullm::function_registry::{FunctionDefinition, FunctionHandler, FunctionRegistry};
//! use docullm::error::CoreError;
//! use async_trait::async_trait;
//!
//! struct WordCount;
//!
//! #[async_trait]
//! impl FunctionHandler for WordCount {
//!     async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, CoreError> {
//!         let text = args["text"].as_str().unwrap_or("");
//!         Ok(serde_json::json!({"words": text.split_whitespace().count()}))
//!     }
//! }
//!
//! let mut registry = FunctionRegistry::new();
//! registry.register(
//!     FunctionDefinition::new("word_count", "Counts words in a string", Arc::new(WordCount))
//!         .with_parameters_schema(serde_json::json!({
//!             "type": "object",
//!             "properties": {"text": {"type": "string"}},
//!             "required": ["text"]
//!         })),
//! ).unwrap();
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::docullm::client_wrapper::ToolDefinition;
use crate::docullm::error::{CoreError, ErrorKind};

/// Default per-call handler deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Async callable behind a registered function.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// Run the tool. `arguments` has already been validated against the
    /// function's parameter schema. The returned value must be
    /// JSON-serializable data (it is forwarded to the model verbatim).
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError>;
}

/// A registered callable tool.
#[derive(Clone)]
pub struct FunctionDefinition {
    /// Registry-unique name matching `^[A-Za-z_][A-Za-z0-9_-]{0,63}$`.
    pub name: String,
    /// Description surfaced to the model.
    pub description: String,
    /// JSON-Schema object fragment describing the parameters.
    pub parameters_schema: Value,
    /// Whether invoking this tool mutates external state (disables response
    /// caching for the enclosing turn).
    pub side_effecting: bool,
    /// Whether this tool needs Git credentials to be useful; tools with this
    /// flag are only exposed to the model when credentials are resolvable.
    pub requires_git_credentials: bool,
    handler: Arc<dyn FunctionHandler>,
}

impl FunctionDefinition {
    /// Define a pure function with an empty (accept-anything-object) schema.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn FunctionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: serde_json::json!({"type": "object", "properties": {}}),
            side_effecting: false,
            requires_git_credentials: false,
            handler,
        }
    }

    /// Attach the JSON-Schema parameter document.
    pub fn with_parameters_schema(mut self, schema: Value) -> Self {
        self.parameters_schema = schema;
        self
    }

    /// Mark the function as side-effecting.
    pub fn side_effecting(mut self) -> Self {
        self.side_effecting = true;
        self
    }

    /// Mark the function as requiring Git credentials.
    pub fn requires_git_credentials(mut self) -> Self {
        self.requires_git_credentials = true;
        self
    }

    /// The provider-facing schema record for this function.
    pub fn to_tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.parameters_schema.clone(),
        }
    }
}

/// Registry of callable tools, built at startup and read-only afterwards.
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionDefinition>,
    call_timeout: Duration,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Empty registry with the default per-call timeout.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call handler deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Register a function. Fails on an invalid name or a name collision.
    pub fn register(&mut self, def: FunctionDefinition) -> Result<(), CoreError> {
        if !valid_function_name(&def.name) {
            return Err(CoreError::invalid_request(format!(
                "invalid function name: {:?}",
                def.name
            )));
        }
        if self.functions.contains_key(&def.name) {
            return Err(CoreError::invalid_request(format!(
                "function already registered: {}",
                def.name
            )));
        }
        self.functions.insert(def.name.clone(), def);
        Ok(())
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.get(name)
    }

    /// All registered definitions, name-sorted for deterministic exposure.
    pub fn definitions(&self) -> Vec<&FunctionDefinition> {
        let mut defs: Vec<&FunctionDefinition> = self.functions.values().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Provider-facing schema records, name-sorted.
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.definitions()
            .into_iter()
            .map(|d| d.to_tool_definition())
            .collect()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Invoke a function by name with JSON arguments.
    ///
    /// Always returns a JSON value. Failures are reported in-band:
    ///
    /// - unknown name → `{"ok": false, "error_kind": "tool_not_found", ...}`
    /// - schema violation → `error_kind = "invalid_arguments"` and the
    ///   handler is never invoked
    /// - deadline exceeded → `error_kind = "tool_timeout"`
    /// - handler error → `error_kind = "tool_execution"` (or the handler's
    ///   own kind when it reports one)
    pub async fn call(&self, name: &str, arguments: Value) -> Value {
        let def = match self.functions.get(name) {
            Some(def) => def,
            None => {
                return failure_value(ErrorKind::ToolNotFound, format!("no such tool: {}", name));
            }
        };

        if let Err(err) = validate_arguments(&def.parameters_schema, &arguments) {
            return failure_value(ErrorKind::InvalidArguments, err);
        }

        match tokio::time::timeout(self.call_timeout, def.handler.invoke(arguments)).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("tool '{}' failed: {}", name, err);
                }
                let kind = match err.kind {
                    // Registry-level kinds pass through; anything else is a
                    // handler failure.
                    ErrorKind::Auth
                    | ErrorKind::NotFound
                    | ErrorKind::Conflict
                    | ErrorKind::RateLimited
                    | ErrorKind::Network
                    | ErrorKind::InvalidArguments => err.kind,
                    _ => ErrorKind::ToolExecution,
                };
                failure_value(kind, err.message)
            }
            Err(_) => failure_value(
                ErrorKind::ToolTimeout,
                format!("tool '{}' exceeded {:?}", name, self.call_timeout),
            ),
        }
    }
}

/// Structured failure payload fed back to the model.
pub fn failure_value(kind: ErrorKind, message: impl Into<String>) -> Value {
    serde_json::json!({
        "ok": false,
        "error_kind": kind.as_str(),
        "message": message.into(),
    })
}

/// `^[A-Za-z_][A-Za-z0-9_-]{0,63}$`
fn valid_function_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    if name.len() > 64 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Argument validation
// ---------------------------------------------------------------------------

/// Validate `arguments` against a JSON-Schema object fragment.
///
/// Supports the subset the tool catalog uses: top-level `type: object`,
/// `required` keys, per-property `type` checks (string / number / integer /
/// boolean / array / object), `enum` membership, and `items.type` for
/// arrays. Unknown keywords are ignored.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    if !arguments.is_object() {
        return Err("arguments must be a JSON object".to_string());
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if arguments.get(key).is_none() {
                return Err(format!("missing required argument: {}", key));
            }
        }
    }

    let properties = match schema.get("properties").and_then(|p| p.as_object()) {
        Some(props) => props,
        None => return Ok(()),
    };

    for (key, prop_schema) in properties {
        let value = match arguments.get(key) {
            Some(v) if !v.is_null() => v,
            _ => continue,
        };
        if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
            if !value_matches_type(value, expected) {
                return Err(format!(
                    "argument '{}' must be of type {}",
                    key, expected
                ));
            }
            if expected == "array" {
                if let Some(item_type) = prop_schema
                    .get("items")
                    .and_then(|i| i.get("type"))
                    .and_then(|t| t.as_str())
                {
                    for (idx, item) in value.as_array().into_iter().flatten().enumerate() {
                        if !value_matches_type(item, item_type) {
                            return Err(format!(
                                "argument '{}[{}]' must be of type {}",
                                key, idx, item_type
                            ));
                        }
                    }
                }
            }
        }
        if let Some(allowed) = prop_schema.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(format!(
                    "argument '{}' must be one of {}",
                    key,
                    serde_json::to_string(allowed).unwrap_or_default()
                ));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl FunctionHandler for Echo {
        async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
            Ok(serde_json::json!({"echo": arguments}))
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl FunctionHandler for Counting {
        async fn invoke(&self, _arguments: Value) -> Result<Value, CoreError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    struct Slow;

    #[async_trait]
    impl FunctionHandler for Slow {
        async fn invoke(&self, _arguments: Value) -> Result<Value, CoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct Failing;

    #[async_trait]
    impl FunctionHandler for Failing {
        async fn invoke(&self, _arguments: Value) -> Result<Value, CoreError> {
            Err(CoreError::new(ErrorKind::ToolExecution, "boom"))
        }
    }

    fn schema_with_required_text() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"},
                "count": {"type": "integer"},
                "mode": {"type": "string", "enum": ["fast", "thorough"]},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["text"]
        })
    }

    #[test]
    fn register_rejects_collisions_and_bad_names() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(FunctionDefinition::new("echo", "echoes", Arc::new(Echo)))
            .unwrap();
        assert!(registry
            .register(FunctionDefinition::new("echo", "dup", Arc::new(Echo)))
            .is_err());
        assert!(registry
            .register(FunctionDefinition::new("1bad", "leading digit", Arc::new(Echo)))
            .is_err());
        assert!(registry
            .register(FunctionDefinition::new("", "empty", Arc::new(Echo)))
            .is_err());
        assert!(registry
            .register(FunctionDefinition::new("has space", "space", Arc::new(Echo)))
            .is_err());
        let long = "x".repeat(65);
        assert!(registry
            .register(FunctionDefinition::new(long, "too long", Arc::new(Echo)))
            .is_err());
    }

    #[test]
    fn list_is_name_sorted() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(FunctionDefinition::new("zeta", "z", Arc::new(Echo)))
            .unwrap();
        registry
            .register(FunctionDefinition::new("alpha", "a", Arc::new(Echo)))
            .unwrap();
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[tokio::test]
    async fn call_unknown_tool_reports_tool_not_found() {
        let registry = FunctionRegistry::new();
        let result = registry.call("ghost", serde_json::json!({})).await;
        assert_eq!(result["ok"], false);
        assert_eq!(result["error_kind"], "tool_not_found");
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_handler() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut registry = FunctionRegistry::new();
        registry
            .register(
                FunctionDefinition::new("counting", "counts", Arc::new(Counting(invocations.clone())))
                    .with_parameters_schema(schema_with_required_text()),
            )
            .unwrap();

        // Missing required key.
        let result = registry.call("counting", serde_json::json!({})).await;
        assert_eq!(result["error_kind"], "invalid_arguments");

        // Wrong type.
        let result = registry
            .call("counting", serde_json::json!({"text": 5}))
            .await;
        assert_eq!(result["error_kind"], "invalid_arguments");

        // Enum violation.
        let result = registry
            .call("counting", serde_json::json!({"text": "x", "mode": "sloppy"}))
            .await;
        assert_eq!(result["error_kind"], "invalid_arguments");

        // Bad array item type.
        let result = registry
            .call("counting", serde_json::json!({"text": "x", "tags": ["a", 1]}))
            .await;
        assert_eq!(result["error_kind"], "invalid_arguments");

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_arguments_invoke_the_handler() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(
                FunctionDefinition::new("echo", "echoes", Arc::new(Echo))
                    .with_parameters_schema(schema_with_required_text()),
            )
            .unwrap();
        let result = registry
            .call(
                "echo",
                serde_json::json!({"text": "hi", "count": 2, "mode": "fast", "tags": ["a"]}),
            )
            .await;
        assert_eq!(result["echo"]["text"], "hi");
    }

    #[tokio::test]
    async fn handler_timeout_is_reported_in_band() {
        let mut registry =
            FunctionRegistry::new().with_call_timeout(Duration::from_millis(10));
        registry
            .register(FunctionDefinition::new("slow", "sleeps", Arc::new(Slow)))
            .unwrap();
        let result = registry.call("slow", serde_json::json!({})).await;
        assert_eq!(result["ok"], false);
        assert_eq!(result["error_kind"], "tool_timeout");
    }

    #[tokio::test]
    async fn handler_error_is_reported_in_band() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(FunctionDefinition::new("failing", "fails", Arc::new(Failing)))
            .unwrap();
        let result = registry.call("failing", serde_json::json!({})).await;
        assert_eq!(result["ok"], false);
        assert_eq!(result["error_kind"], "tool_execution");
        assert_eq!(result["message"], "boom");
    }

    #[test]
    fn name_pattern_accepts_underscore_and_dash() {
        assert!(valid_function_name("_private"));
        assert!(valid_function_name("create_git_issue"));
        assert!(valid_function_name("a-b-c"));
        assert!(!valid_function_name("-leading-dash"));
        assert!(!valid_function_name("emoji🙂"));
    }
}
