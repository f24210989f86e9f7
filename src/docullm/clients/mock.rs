//! Deterministic in-process provider for tests and offline development.
//!
//! The mock replies are keyed off the last user message. With no script
//! installed it echoes that message back; the convention
//! `please call tool <name>` makes it emit a single tool call so the tool
//! loop can be exercised end to end. Scripted steps allow fixed replies
//! (with `{last_user}` substitution), explicit tool calls, delays, and
//! errors, consumed in order; when the script runs out the fallback
//! behaviour applies again.
//!
//! # Example
//!
//! ```rust
//! use docullm::clients::mock::{MockClient, MockStep};
//!
//! let client = MockClient::new().with_script(vec![
//!     MockStep::CallTool {
//!         name: "analyze_document_quality".to_string(),
//!         arguments: serde_json::json!({"content": "# Title"}),
//!     },
//!     MockStep::Reply("Quality grade: C".to_string()),
//! ]);
//! # drop(client);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::docullm::client_wrapper::{
    Capabilities, DeltaStream, LLMClient, Message, ProviderResponse, QueryOptions, Role,
    StreamDelta, TokenUsage, ToolCall, ToolDefinition,
};
use crate::docullm::error::{CoreError, ErrorKind};
use crate::docullm::streaming::ReceiverStream;
use crate::docullm::token_counter::{estimate_history_tokens, estimate_tokens};

/// Prefix that triggers a tool call in the unscripted fallback.
pub const CALL_TOOL_PREFIX: &str = "please call tool ";

/// Size (in characters) of the text deltas the mock streams.
const STREAM_CHUNK_CHARS: usize = 8;

/// One scripted provider round-trip.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Reply with this text; `{last_user}` is replaced by the last user
    /// message content.
    Reply(String),
    /// Emit one tool call.
    CallTool {
        /// Function name to request.
        name: String,
        /// Arguments to pass.
        arguments: serde_json::Value,
    },
    /// Emit several tool calls in a single assistant turn.
    CallTools(Vec<(String, serde_json::Value)>),
    /// Fail the round-trip with this kind.
    Fail(ErrorKind, String),
    /// Sleep, then process the next step as part of the same round-trip.
    Delay(Duration),
}

/// Fallback behaviour once the script is exhausted.
#[derive(Debug, Clone)]
enum Fallback {
    /// Echo the last user message (honouring [`CALL_TOOL_PREFIX`]).
    Echo,
    /// Always emit the same tool call (for loop-bound tests).
    AlwaysToolCall(String, serde_json::Value),
}

/// Deterministic scripted provider.
pub struct MockClient {
    script: Mutex<VecDeque<MockStep>>,
    fallback: Fallback,
    call_count: AtomicUsize,
    call_id_counter: AtomicUsize,
    max_context: usize,
}

impl MockClient {
    /// Mock with no script: echoes the last user message.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Fallback::Echo,
            call_count: AtomicUsize::new(0),
            call_id_counter: AtomicUsize::new(0),
            max_context: 8_192,
        }
    }

    /// Install a script consumed one step per round-trip.
    pub fn with_script(self, steps: Vec<MockStep>) -> Self {
        {
            let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
            script.extend(steps);
        }
        self
    }

    /// After the script is exhausted, keep emitting the same tool call.
    pub fn with_perpetual_tool_call(
        mut self,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        self.fallback = Fallback::AlwaysToolCall(name.into(), arguments);
        self
    }

    /// Override the advertised context window.
    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.max_context = max_context;
        self
    }

    /// Number of provider round-trips served so far.
    pub fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn next_call_id(&self) -> String {
        format!("call_{}", self.call_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn last_user_content(messages: &[Message]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_ref().to_string())
            .unwrap_or_default()
    }

    fn fallback_message(&self, last_user: &str) -> Message {
        match &self.fallback {
            Fallback::AlwaysToolCall(name, arguments) => {
                Message::assistant_tool_calls(vec![ToolCall {
                    id: self.next_call_id(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }])
            }
            Fallback::Echo => {
                if let Some(rest) = last_user.strip_prefix(CALL_TOOL_PREFIX) {
                    let name = rest.split_whitespace().next().unwrap_or("").to_string();
                    Message::assistant_tool_calls(vec![ToolCall {
                        id: self.next_call_id(),
                        name,
                        arguments: serde_json::json!({}),
                    }])
                } else {
                    Message::assistant(last_user)
                }
            }
        }
    }

    /// Resolve the next round-trip: sleeps through `Delay` steps, then
    /// produces the assistant message or a scripted failure.
    async fn next_message(&self, messages: &[Message]) -> Result<Message, CoreError> {
        let last_user = Self::last_user_content(messages);
        loop {
            let step = {
                let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
                script.pop_front()
            };
            return match step {
                Some(MockStep::Delay(duration)) => {
                    tokio::time::sleep(duration).await;
                    continue;
                }
                Some(MockStep::Reply(template)) => {
                    Ok(Message::assistant(template.replace("{last_user}", &last_user)))
                }
                Some(MockStep::CallTool { name, arguments }) => {
                    Ok(Message::assistant_tool_calls(vec![ToolCall {
                        id: self.next_call_id(),
                        name,
                        arguments,
                    }]))
                }
                Some(MockStep::CallTools(calls)) => {
                    Ok(Message::assistant_tool_calls(
                        calls
                            .into_iter()
                            .map(|(name, arguments)| ToolCall {
                                id: self.next_call_id(),
                                name,
                                arguments,
                            })
                            .collect(),
                    ))
                }
                Some(MockStep::Fail(kind, message)) => Err(CoreError::new(kind, message)),
                None => Ok(self.fallback_message(&last_user)),
            };
        }
    }

    fn usage_for(&self, messages: &[Message], reply: &Message) -> TokenUsage {
        let prompt_tokens = estimate_history_tokens(messages);
        let completion_tokens = estimate_tokens(reply.content.as_ref());
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMClient for MockClient {
    async fn query(
        &self,
        messages: &[Message],
        _options: &QueryOptions,
        _tools: &[ToolDefinition],
    ) -> Result<ProviderResponse, CoreError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let message = self.next_message(messages).await?;
        let usage = self.usage_for(messages, &message);
        Ok(ProviderResponse {
            message,
            usage,
            model: self.model_name().to_string(),
        })
    }

    async fn stream_query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
        tools: &[ToolDefinition],
    ) -> Result<DeltaStream, CoreError> {
        let response = self.query(messages, options, tools).await?;
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamDelta, CoreError>>(32);

        tokio::spawn(async move {
            let content = response.message.content.as_ref().to_string();
            let chars: Vec<char> = content.chars().collect();
            for chunk in chars.chunks(STREAM_CHUNK_CHARS) {
                let piece: String = chunk.iter().collect();
                if tx.send(Ok(StreamDelta::Text(piece))).await.is_err() {
                    return;
                }
            }
            let finish_reason = if response.message.tool_calls.is_empty() {
                Some("stop".to_string())
            } else {
                if tx
                    .send(Ok(StreamDelta::ToolCalls(response.message.tool_calls.clone())))
                    .await
                    .is_err()
                {
                    return;
                }
                Some("tool_calls".to_string())
            };
            let _ = tx
                .send(Ok(StreamDelta::End {
                    finish_reason,
                    usage: Some(response.usage),
                }))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_context: self.max_context,
            supports_tools: true,
            supports_streaming: true,
            supported_models: vec![self.model_name().to_string()],
        }
    }

    fn provider_id(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "mock-1"
    }
}
