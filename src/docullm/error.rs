//! Error kinds shared across the orchestration core.
//!
//! Every fallible operation in the crate surfaces a [`CoreError`]: an
//! [`ErrorKind`] from a closed set, a human-readable message, and an optional
//! underlying cause. The kind is what callers (and the HTTP layer) branch on;
//! the message is for logs and for the model when a tool result is reported
//! back to it.
//!
//! # Example
//!
//! ```rust
//! use docullm::error::{CoreError, ErrorKind};
//!
//! let err = CoreError::new(ErrorKind::ToolNotFound, "no such tool: frobnicate");
//! assert_eq!(err.kind.as_str(), "tool_not_found");
//! assert!(!err.kind.is_transient());
//! ```

use std::error::Error;
use std::fmt;

/// The closed set of error kinds surfaced by the core.
///
/// Wire names (as returned by [`ErrorKind::as_str`]) are snake_case and are
/// what HTTP error bodies, tool-failure results, and SSE error frames carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or incomplete request input; rejected before any provider call.
    InvalidRequest,
    /// Template lookup or rendering failed (unknown id, missing required variable).
    TemplateError,
    /// The message list cannot fit the provider context even after optimization.
    ContextOverflow,
    /// The provider did not answer (or stream a chunk) within the deadline.
    ProviderTimeout,
    /// The provider returned 429 / asked us to back off.
    ProviderRateLimited,
    /// The provider is unreachable or returned a 5xx.
    ProviderUnavailable,
    /// The provider answered with something we could not interpret, or a
    /// non-retryable 4xx.
    ProviderProtocol,
    /// A tool call named a function that is not registered.
    ToolNotFound,
    /// Tool arguments failed schema validation; the handler was never invoked.
    InvalidArguments,
    /// A tool handler exceeded its per-call deadline.
    ToolTimeout,
    /// A tool handler ran and failed.
    ToolExecution,
    /// The tool-iteration budget ran out while the model still wanted tools.
    PartialToolLoop,
    /// Internal cache failure; never fatal to a turn.
    CacheError,
    /// The streaming client stopped reading; the upstream call was cancelled.
    ClientGone,
    /// Git host rejected the credentials.
    Auth,
    /// Git host says the repository (or resource) does not exist.
    NotFound,
    /// Git host reports a conflicting or unprocessable write.
    Conflict,
    /// Git host rate limit hit.
    RateLimited,
    /// Transport-level failure talking to a Git host.
    Network,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// The snake_case wire name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::TemplateError => "template_error",
            ErrorKind::ContextOverflow => "context_overflow",
            ErrorKind::ProviderTimeout => "provider_timeout",
            ErrorKind::ProviderRateLimited => "provider_rate_limited",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::ProviderProtocol => "provider_protocol",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::PartialToolLoop => "partial_tool_loop",
            ErrorKind::CacheError => "cache_error",
            ErrorKind::ClientGone => "client_gone",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether the orchestrator should retry a provider call that failed
    /// with this kind (timeouts, rate limits, 5xx, connection resets).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderTimeout
                | ErrorKind::ProviderRateLimited
                | ErrorKind::ProviderUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-wide error: a kind, a message, and an optional cause.
#[derive(Debug)]
pub struct CoreError {
    /// Which of the closed error kinds this is.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Underlying error, when one exists.
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl CoreError {
    /// Build an error from a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for an `invalid_request` error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// Shorthand for a `template_error`.
    pub fn template(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TemplateError, message)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_snake_case() {
        assert_eq!(ErrorKind::InvalidArguments.as_str(), "invalid_arguments");
        assert_eq!(ErrorKind::ClientGone.as_str(), "client_gone");
        assert_eq!(ErrorKind::ProviderRateLimited.as_str(), "provider_rate_limited");
    }

    #[test]
    fn transiency_split() {
        assert!(ErrorKind::ProviderTimeout.is_transient());
        assert!(ErrorKind::ProviderUnavailable.is_transient());
        assert!(ErrorKind::ProviderRateLimited.is_transient());
        assert!(!ErrorKind::ProviderProtocol.is_transient());
        assert!(!ErrorKind::InvalidRequest.is_transient());
    }

    #[test]
    fn display_carries_kind_and_message() {
        let err = CoreError::new(ErrorKind::Auth, "bad token");
        assert_eq!(err.to_string(), "auth: bad token");
    }
}
