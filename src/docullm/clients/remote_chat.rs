//! Remote chat-completion provider speaking the OpenAI-compatible wire format.
//!
//! Posts to `{base_url}/chat/completions` with an
//! `Authorization: Bearer {api_key}` header. Compatible with OpenAI and with
//! any endpoint that mirrors its request/response surface (proxies,
//! self-hosted gateways).
//!
//! # Message serialization
//!
//! | [`Role`] variant | Wire representation |
//! |---|---|
//! | `System` | `{"role":"system","content":"..."}` |
//! | `User` | `{"role":"user","content":"..."}` |
//! | `Assistant` with tool_calls | `{"role":"assistant","content":null,"tool_calls":[...]}` |
//! | `Assistant` without tool_calls | `{"role":"assistant","content":"..."}` |
//! | `Tool { call_id }` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |
//!
//! Streaming uses chunked reads of `data:` lines. Text deltas are forwarded
//! as they arrive; tool-call fragments are accumulated per index and yielded
//! as one assembled list when the provider signals `[DONE]`. There are no
//! retries at this layer; the orchestrator owns retry policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::docullm::client_wrapper::{
    Capabilities, DeltaStream, LLMClient, Message, ProviderResponse, QueryOptions, Role,
    StreamDelta, TokenUsage, ToolCall, ToolDefinition,
};
use crate::docullm::clients::http_pool::get_shared_http_client;
use crate::docullm::error::{CoreError, ErrorKind};
use crate::docullm::streaming::ReceiverStream;

/// Default non-streaming request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default idle deadline between streamed chunks.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_CONTEXT: usize = 128_000;

/// Client for OpenAI-compatible chat-completion endpoints.
pub struct RemoteChatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    provider_id: String,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
    max_context: usize,
    supported_models: Vec<String>,
}

impl RemoteChatClient {
    /// Client against the default OpenAI endpoint.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    /// Client against a custom OpenAI-compatible base URL (no trailing slash
    /// needed; one is stripped if present).
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            provider_id: "openai".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            max_context: DEFAULT_MAX_CONTEXT,
            supported_models: vec![model.to_string()],
        }
    }

    /// Override the non-streaming request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the idle deadline between streamed chunks.
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Override the advertised context window.
    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.max_context = max_context;
        self
    }

    /// Declare additional model identifiers this endpoint accepts.
    pub fn with_supported_models(mut self, models: Vec<String>) -> Self {
        self.supported_models = models;
        self
    }

    fn effective_model<'a>(&'a self, options: &'a QueryOptions) -> &'a str {
        options.model.as_deref().unwrap_or(&self.model)
    }

    fn request_body(
        &self,
        messages: &[Message],
        options: &QueryOptions,
        tools: &[ToolDefinition],
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.effective_model(options),
            "messages": wire_messages(messages),
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wire_tools(tools));
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LLMClient for RemoteChatClient {
    async fn query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
        tools: &[ToolDefinition],
    ) -> Result<ProviderResponse, CoreError> {
        let body = self.request_body(messages, options, tools, false);
        let url = self.endpoint();

        let resp = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e).with_source(e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            CoreError::new(ErrorKind::ProviderProtocol, "failed to read response body")
                .with_source(e)
        })?;

        if !status.is_success() {
            if log::log_enabled!(log::Level::Error) {
                log::error!("remote chat: HTTP {} from {}: {}", status, url, text);
            }
            return Err(classify_status(status, &text));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            CoreError::new(ErrorKind::ProviderProtocol, "response is not valid JSON")
                .with_source(e)
        })?;

        let message = parse_choice_message(&parsed)?;
        let usage = parse_usage(&parsed).unwrap_or_default();
        let model = parsed
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_else(|| self.effective_model(options))
            .to_string();

        Ok(ProviderResponse {
            message,
            usage,
            model,
        })
    }

    async fn stream_query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
        tools: &[ToolDefinition],
    ) -> Result<DeltaStream, CoreError> {
        let body = self.request_body(messages, options, tools, true);
        let url = self.endpoint();

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e).with_source(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if log::log_enabled!(log::Level::Error) {
                log::error!("remote chat stream: HTTP {} from {}: {}", status, url, text);
            }
            return Err(classify_status(status, &text));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamDelta, CoreError>>(32);
        let idle_timeout = self.stream_idle_timeout;

        tokio::spawn(async move {
            let mut resp = resp;
            let mut line_buffer = String::new();
            let mut assembler = ToolCallAssembler::default();
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<TokenUsage> = None;
            let mut done = false;

            loop {
                let chunk = match tokio::time::timeout(idle_timeout, resp.chunk()).await {
                    Ok(Ok(Some(chunk))) => chunk,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        let _ = tx
                            .send(Err(CoreError::new(
                                ErrorKind::ProviderUnavailable,
                                "stream read failed",
                            )
                            .with_source(e)))
                            .await;
                        return;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(Err(CoreError::new(
                                ErrorKind::ProviderTimeout,
                                format!("no stream chunk within {:?}", idle_timeout),
                            )))
                            .await;
                        return;
                    }
                };

                line_buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = line_buffer.find('\n') {
                    let line = line_buffer[..newline].trim().to_string();
                    line_buffer.drain(..=newline);
                    if line.is_empty() {
                        continue;
                    }
                    let data = match line.strip_prefix("data: ") {
                        Some(data) => data,
                        None => continue,
                    };
                    if data == "[DONE]" {
                        done = true;
                        continue;
                    }
                    let json: serde_json::Value = match serde_json::from_str(data) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if let Some(u) = parse_usage(&json) {
                        usage = Some(u);
                    }
                    let choice = match json.get("choices").and_then(|c| c.get(0)) {
                        Some(choice) => choice,
                        None => continue,
                    };
                    if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                        finish_reason = Some(reason.to_string());
                    }
                    let delta = match choice.get("delta") {
                        Some(delta) => delta,
                        None => continue,
                    };
                    if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                        if !content.is_empty()
                            && tx.send(Ok(StreamDelta::Text(content.to_string()))).await.is_err()
                        {
                            // Consumer went away; stop reading.
                            return;
                        }
                    }
                    if let Some(fragments) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                        assembler.absorb(fragments);
                    }
                }
                if done {
                    break;
                }
            }

            let tool_calls = assembler.finish();
            if !tool_calls.is_empty() {
                if finish_reason.as_deref() == Some("stop") || finish_reason.is_none() {
                    finish_reason = Some("tool_calls".to_string());
                }
                if tx.send(Ok(StreamDelta::ToolCalls(tool_calls))).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamDelta::End {
                    finish_reason,
                    usage,
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
            supported_models: self.supported_models.clone(),
        }
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Wire codec
// ---------------------------------------------------------------------------

/// Serialize messages to the OpenAI wire format.
pub(crate) fn wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| match &msg.role {
            Role::System => serde_json::json!({
                "role": "system",
                "content": msg.content.as_ref(),
            }),
            Role::User => serde_json::json!({
                "role": "user",
                "content": msg.content.as_ref(),
            }),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": msg.content.as_ref(),
                    })
                } else {
                    let tool_calls: Vec<serde_json::Value> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": serde_json::to_string(&tc.arguments)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            })
                        })
                        .collect();
                    serde_json::json!({
                        "role": "assistant",
                        "content": serde_json::Value::Null,
                        "tool_calls": tool_calls,
                    })
                }
            }
            Role::Tool { call_id } => serde_json::json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": msg.content.as_ref(),
            }),
        })
        .collect()
}

/// Serialize tool definitions to the OpenAI `tools` array.
pub(crate) fn wire_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                },
            })
        })
        .collect()
}

/// Extract `choices[0].message` as a core [`Message`].
fn parse_choice_message(parsed: &serde_json::Value) -> Result<Message, CoreError> {
    let choice_msg = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| {
            CoreError::new(ErrorKind::ProviderProtocol, "no choices in response")
        })?;

    let content = choice_msg
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("");

    let tool_calls: Vec<ToolCall> = choice_msg
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let id = tc
                        .get("id")
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .unwrap_or_else(generated_call_id);
                    let arguments = match func.get("arguments") {
                        Some(serde_json::Value::String(s)) => serde_json::from_str(s)
                            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
                        Some(v) => v.clone(),
                        None => serde_json::Value::Object(serde_json::Map::new()),
                    };
                    Some(ToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    if tool_calls.is_empty() {
        Ok(Message::assistant(content))
    } else {
        let mut message = Message::assistant_tool_calls(tool_calls);
        if !content.is_empty() {
            message.content = Arc::from(content);
        }
        Ok(message)
    }
}

/// Extract `usage` as [`TokenUsage`], if present.
fn parse_usage(parsed: &serde_json::Value) -> Option<TokenUsage> {
    let usage = parsed.get("usage")?;
    if usage.is_null() {
        return None;
    }
    let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64())? as usize;
    let completion = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: usage
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .map(|t| t as usize)
            .unwrap_or(prompt + completion),
    })
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> CoreError {
    let kind = if status.as_u16() == 429 {
        ErrorKind::ProviderRateLimited
    } else if status.as_u16() == 408 {
        ErrorKind::ProviderTimeout
    } else if status.is_server_error() {
        ErrorKind::ProviderUnavailable
    } else {
        ErrorKind::ProviderProtocol
    };
    let detail: String = body.chars().take(200).collect();
    CoreError::new(kind, format!("HTTP {}: {}", status, detail))
}

fn classify_transport_error(error: &reqwest::Error) -> CoreError {
    if error.is_timeout() {
        CoreError::new(ErrorKind::ProviderTimeout, "provider request timed out")
    } else {
        CoreError::new(ErrorKind::ProviderUnavailable, "provider unreachable")
    }
}

/// Substitute id for providers that omit one on a tool call.
fn generated_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Accumulates streamed tool-call fragments keyed by choice index.
///
/// The function name arrives once in the first fragment; argument text is
/// appended across fragments and parsed when the stream closes.
#[derive(Default)]
struct ToolCallAssembler {
    partial: HashMap<usize, (String, String, String)>, // (id, name, arguments text)
}

impl ToolCallAssembler {
    fn absorb(&mut self, fragments: &[serde_json::Value]) {
        for fragment in fragments {
            let index = fragment
                .get("index")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let entry = self
                .partial
                .entry(index)
                .or_insert_with(|| (String::new(), String::new(), String::new()));
            if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
                entry.0 = id.to_string();
            }
            if let Some(func) = fragment.get("function") {
                if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                    entry.1 = name.to_string();
                }
                if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                    entry.2.push_str(args);
                }
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        let mut indices: Vec<usize> = self.partial.keys().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .filter_map(|idx| {
                let (id, name, args_text) = self.partial.get(&idx)?.clone();
                if name.is_empty() {
                    return None;
                }
                let arguments = serde_json::from_str(&args_text)
                    .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                Some(ToolCall {
                    id: if id.is_empty() { generated_call_id() } else { id },
                    name,
                    arguments,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_map_every_role() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::assistant_tool_calls(vec![ToolCall {
                id: "call_1".to_string(),
                name: "f".to_string(),
                arguments: serde_json::json!({"a": 1}),
            }]),
            Message::tool_result("call_1", "{\"ok\":true}"),
        ];
        let wire = wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[2]["content"], "hello");
        assert!(wire[3]["content"].is_null());
        assert_eq!(wire[3]["tool_calls"][0]["function"]["name"], "f");
        // Arguments travel as a JSON-encoded string.
        assert_eq!(wire[3]["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
        assert_eq!(wire[4]["role"], "tool");
        assert_eq!(wire[4]["tool_call_id"], "call_1");
    }

    #[test]
    fn wire_tools_wrap_function_schemas() {
        let tools = [ToolDefinition {
            name: "analyze_document_quality".to_string(),
            description: "grades a document".to_string(),
            parameters_schema: serde_json::json!({"type": "object"}),
        }];
        let wire = wire_tools(&tools);
        assert_eq!(wire[0]["type"], "function");
        assert_eq!(wire[0]["function"]["name"], "analyze_document_quality");
    }

    #[test]
    fn parse_choice_extracts_tool_calls_with_string_arguments() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "f", "arguments": "{\"x\": 2}"}
                    }]
                }
            }]
        });
        let msg = parse_choice_message(&body).unwrap();
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].arguments["x"], 2);
    }

    #[test]
    fn parse_choice_without_choices_is_a_protocol_error() {
        let err = parse_choice_message(&serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderProtocol);
    }

    #[test]
    fn assembler_joins_fragments_in_index_order() {
        let mut assembler = ToolCallAssembler::default();
        assembler.absorb(&[
            serde_json::json!({"index": 1, "id": "call_b", "function": {"name": "beta", "arguments": "{\"b\""}}),
            serde_json::json!({"index": 0, "id": "call_a", "function": {"name": "alpha", "arguments": "{}"}}),
        ]);
        assembler.absorb(&[serde_json::json!({"index": 1, "function": {"arguments": ": 2}"}})]);
        let calls = assembler.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "alpha");
        assert_eq!(calls[1].name, "beta");
        assert_eq!(calls[1].arguments["b"], 2);
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "").kind,
            ErrorKind::ProviderRateLimited
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY, "").kind,
            ErrorKind::ProviderUnavailable
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_REQUEST, "").kind,
            ErrorKind::ProviderProtocol
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::REQUEST_TIMEOUT, "").kind,
            ErrorKind::ProviderTimeout
        );
    }

    #[test]
    fn usage_parsing_tolerates_missing_total() {
        let parsed = serde_json::json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3}});
        let usage = parse_usage(&parsed).unwrap();
        assert_eq!(usage.total_tokens, 10);
        assert!(parse_usage(&serde_json::json!({})).is_none());
    }
}
