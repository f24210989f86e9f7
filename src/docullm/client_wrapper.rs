//! Shared primitives for provider-agnostic LLM clients.
//!
//! Applications interact with the core through the [`LLMClient`] trait and
//! the lightweight data types defined in this module. The trait abstracts
//! over concrete providers (the remote OpenAI-compatible client, the
//! deterministic mock) while the supporting structs describe chat messages,
//! tool calls, streaming deltas, and token accounting.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use docullm::client_wrapper::{LLMClient, Message, QueryOptions};
//! use docullm::clients::remote_chat::RemoteChatClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPENAI_API_KEY")?;
//!     let client = RemoteChatClient::new(&key, "gpt-4.1-mini");
//!
//!     let response = client
//!         .query(&[Message::user("Who are you?")], &QueryOptions::default(), &[])
//!         .await?;
//!
//!     println!("Assistant: {}", response.message.content);
//!     Ok(())
//! }
//! ```

use std::convert::TryFrom;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};

use crate::docullm::error::CoreError;
use crate::docullm::token_counter;

/// A single tool call requested by the model in a function-calling response.
///
/// Providers assign an opaque [`id`](ToolCall::id) to each call so that the
/// tool result can be correlated back in a follow-up `Role::Tool` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned call id, e.g. `"call_abc123"`. Unique within a turn.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the model for this call.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema passed to the model along with a chat request.
///
/// Serialized as an OpenAI-compatible `tools` array entry
/// (`{"type":"function","function":{...}}`) before transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the API `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the model to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// A system-authored message that primes or constrains assistant behaviour.
    System,
    /// A user-authored message.
    User,
    /// An assistant-authored message (model responses).
    Assistant,
    /// A tool-result message correlating with a prior assistant [`ToolCall`].
    ///
    /// Serializes as `{"role":"tool","tool_call_id":"<call_id>","content":"..."}`
    /// in the OpenAI wire format. The call id is part of the variant so a tool
    /// message without one cannot be constructed.
    Tool {
        /// Id of the [`ToolCall`] this message answers.
        call_id: String,
    },
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    pub prompt_tokens: usize,
    /// Generated/output tokens billed by the provider.
    pub completion_tokens: usize,
    /// Convenience total equal to `prompt_tokens + completion_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another usage record into this one (used across tool-loop round-trips).
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A single message in a conversation.
///
/// The `tool_calls` field is non-empty only on assistant messages returned by
/// a provider that selected one or more tools. Content is stored as
/// `Arc<str>` so histories can be cheaply cloned by the orchestrator's
/// per-turn working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body. May be empty on an assistant message carrying tool calls.
    pub content: Arc<str>,
    /// Tool calls requested by the assistant.
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    /// Build a system message.
    pub fn system(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::System,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::User,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Build a plain assistant message.
    pub fn assistant(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Build an assistant message that carries tool calls and no content.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: Arc::from(""),
            tool_calls,
        }
    }

    /// Build a tool-result message answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// True for assistant messages that request at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        matches!(self.role, Role::Assistant) && !self.tool_calls.is_empty()
    }
}

/// Wire form of [`Message`]: what HTTP request bodies, cache fingerprints,
/// and provider payload builders see.
///
/// Deserialization enforces the data-model invariants: a `tool` message must
/// carry a non-empty `tool_call_id`, `tool_calls` appear only on `assistant`
/// messages, and an assistant message must have content or tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// `system`, `user`, `assistant`, or `tool`.
    pub role: String,
    /// Message body; omitted for assistant messages that only carry tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Set when `role == "tool"`: which call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that request tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        let (role, tool_call_id) = match msg.role {
            Role::System => ("system".to_string(), None),
            Role::User => ("user".to_string(), None),
            Role::Assistant => ("assistant".to_string(), None),
            Role::Tool { call_id } => ("tool".to_string(), Some(call_id)),
        };
        let content = if msg.content.is_empty() && !msg.tool_calls.is_empty() {
            None
        } else {
            Some(msg.content.as_ref().to_string())
        };
        WireMessage {
            role,
            content,
            tool_call_id,
            tool_calls: if msg.tool_calls.is_empty() {
                None
            } else {
                Some(msg.tool_calls)
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = CoreError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let tool_calls = wire.tool_calls.unwrap_or_default();
        let content = wire.content.unwrap_or_default();
        match wire.role.as_str() {
            "system" => Ok(Message::system(content)),
            "user" => Ok(Message::user(content)),
            "assistant" => {
                if content.is_empty() && tool_calls.is_empty() {
                    return Err(CoreError::invalid_request(
                        "assistant message must carry content or tool_calls",
                    ));
                }
                Ok(Message {
                    role: Role::Assistant,
                    content: Arc::from(content.as_str()),
                    tool_calls,
                })
            }
            "tool" => {
                if !tool_calls.is_empty() {
                    return Err(CoreError::invalid_request(
                        "tool_calls are only valid on assistant messages",
                    ));
                }
                match wire.tool_call_id {
                    Some(id) if !id.is_empty() => Ok(Message::tool_result(id, content)),
                    _ => Err(CoreError::invalid_request(
                        "tool message requires a non-empty tool_call_id",
                    )),
                }
            }
            other => Err(CoreError::invalid_request(format!(
                "unknown message role: {}",
                other
            ))),
        }
    }
}

/// Per-request tuning knobs forwarded to the provider.
///
/// Only fields that influence the model's output participate in cache
/// fingerprints (see [`crate::cache`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Model override; the client's configured model is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Completion-token ceiling for one provider round-trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Git token supplied with the request; overrides ambient configuration
    /// for the Git-write tools (tool arguments override both).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_token: Option<String>,
}

/// The result of one provider round-trip.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// The assistant message (content and/or tool calls).
    pub message: Message,
    /// Token accounting for this round-trip.
    pub usage: TokenUsage,
    /// Model identifier the provider reports having used.
    pub model: String,
}

/// Static description of what a provider can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Largest request (in estimated tokens) the provider accepts.
    pub max_context: usize,
    /// Whether native function calling is supported.
    pub supports_tools: bool,
    /// Whether `stream_query` yields incremental deltas.
    pub supports_streaming: bool,
    /// Model identifiers this client will accept.
    pub supported_models: Vec<String>,
}

/// One increment of a streamed provider response.
///
/// Tool-call fragments are buffered inside the client; a single assembled
/// [`StreamDelta::ToolCalls`] is yielded right before [`StreamDelta::End`].
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// An incremental piece of assistant text, in provider order.
    Text(String),
    /// The assembled tool calls for this round-trip, if the model chose any.
    ToolCalls(Vec<ToolCall>),
    /// Stream finished.
    End {
        /// Provider finish reason (e.g. `"stop"`, `"tool_calls"`).
        finish_reason: Option<String>,
        /// Usage for the round-trip when the provider reports it.
        usage: Option<TokenUsage>,
    },
}

/// Type alias for a stream of deltas compatible with `Send` executors.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, CoreError>> + Send>>;

/// Trait-driven abstraction over a concrete LLM provider.
///
/// Implementations translate core requests into the provider-specific wire
/// format and return responses in a uniform shape. The abstraction
/// deliberately excludes conversation bookkeeping and retries; both live in
/// [`crate::orchestrator`]. All implementations must be thread-safe
/// (`Send + Sync`) so they can be shared between async tasks.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Send a full request/response chat completion.
    ///
    /// `messages` must already include any system priming message. `tools`
    /// carries the [`ToolDefinition`]s exposed for this turn; pass an empty
    /// slice to disable function calling.
    async fn query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
        tools: &[ToolDefinition],
    ) -> Result<ProviderResponse, CoreError>;

    /// Request a streaming response from the provider.
    ///
    /// The returned stream yields [`StreamDelta::Text`] items in provider
    /// order, at most one [`StreamDelta::ToolCalls`], and exactly one
    /// [`StreamDelta::End`] on success.
    async fn stream_query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
        tools: &[ToolDefinition],
    ) -> Result<DeltaStream, CoreError>;

    /// Static capability record for this provider.
    fn capabilities(&self) -> Capabilities;

    /// Token estimate used for history budgeting against this provider.
    fn count_tokens(&self, text: &str) -> usize {
        token_counter::estimate_tokens(text)
    }

    /// Stable identifier (e.g. `"openai"`, `"mock"`) used in responses and
    /// cache fingerprints.
    fn provider_id(&self) -> &str;

    /// The model identifier requests default to.
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_tool_pairing() {
        let call = ToolCall {
            id: "call_1".to_string(),
            name: "analyze_document_quality".to_string(),
            arguments: serde_json::json!({"content": "# T"}),
        };
        let assistant = Message::assistant_tool_calls(vec![call.clone()]);
        let json = serde_json::to_string(&assistant).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_calls, vec![call]);
        assert!(back.content.is_empty());

        let result = Message::tool_result("call_1", "{\"ok\":true}");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"tool_call_id\":\"call_1\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::Tool { call_id: "call_1".to_string() });
    }

    #[test]
    fn tool_message_without_call_id_is_rejected() {
        let err = serde_json::from_str::<Message>(r#"{"role":"tool","content":"x"}"#)
            .expect_err("orphan tool message must not deserialize");
        assert!(err.to_string().contains("tool_call_id"));
    }

    #[test]
    fn assistant_with_neither_content_nor_calls_is_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"role":"assistant"}"#).is_err());
    }

    #[test]
    fn tool_calls_on_non_assistant_message_are_rejected() {
        let raw = r#"{"role":"tool","tool_call_id":"c1","content":"x","tool_calls":[{"id":"c2","name":"f","arguments":{}}]}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.accumulate(&TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        });
        assert_eq!(total.total_tokens, 20);
        assert_eq!(total.prompt_tokens, 13);
    }
}
