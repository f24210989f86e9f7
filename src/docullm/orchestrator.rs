//! End-to-end driver for one conversational turn.
//!
//! The orchestrator owns the full pipeline: build the system message, trim
//! the history to the provider's context budget, consult the response cache,
//! call the provider (with retries on transient failures), run the bounded
//! tool loop, and hand back an [`LLMResponse`]. For streamed turns it
//! forwards token deltas through the [`crate::streaming`] event channel
//! while driving the same loop.
//!
//! # Turn anatomy (non-streaming)
//!
//! ```text
//! validate → system message → [system?] + history + user(prompt)
//!          → optimize (token budget)
//!          → cache lookup (skipped for side-effecting tool sets)
//!          → provider query ──► no tool_calls ──► finalize + cache
//!                │ tool_calls
//!                ▼
//!          execute batch (ordered) → append tool results → re-query
//!          (at most max_tool_iterations times; then partial_tool_loop)
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::docullm::cache::{fingerprint, ResponseCache};
use crate::docullm::client_wrapper::{
    LLMClient, Message, ProviderResponse, QueryOptions, Role, StreamDelta, TokenUsage, ToolCall,
    ToolDefinition,
};
use crate::docullm::error::{CoreError, ErrorKind};
use crate::docullm::function_registry::FunctionRegistry;
use crate::docullm::history;
use crate::docullm::prompt_builder::{
    DocumentMetadata, PromptInputs, RepositoryContext, SystemPromptBuilder,
};
use crate::docullm::streaming::StreamEvent;
use crate::docullm::templates::TemplateStore;
use crate::docullm::token_counter::estimate_history_tokens;

/// Default bound on tool-loop iterations.
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 5;

/// Hard ceiling on the per-request iteration override.
const MAX_TOOL_ITERATIONS_CEILING: usize = 16;

/// What one turn asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The user's prompt for this turn.
    pub prompt: String,
    /// Prior conversation, owned by the caller across turns.
    #[serde(default)]
    pub history: Vec<Message>,
    /// What the user is looking at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_context: Option<RepositoryContext>,
    /// Metadata of the current document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_metadata: Option<DocumentMetadata>,
    /// Body of the current document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_content: Option<String>,
    /// Explicit template selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Whether registered tools are exposed to the model this turn.
    #[serde(default = "default_true")]
    pub tools_enabled: bool,
    /// Provider tuning knobs.
    #[serde(default)]
    pub options: QueryOptions,
    /// Per-request override of the tool-loop bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_iterations: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            history: Vec::new(),
            repository_context: None,
            document_metadata: None,
            document_content: None,
            template_id: None,
            tools_enabled: true,
            options: QueryOptions::default(),
            max_tool_iterations: None,
        }
    }
}

/// What the optimizer and tool loop did to the turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryOptimizationInfo {
    /// Whether history trimming dropped anything.
    pub was_optimized: bool,
    /// Message count before trimming.
    pub original_count: usize,
    /// Message count after trimming.
    pub optimized_count: usize,
    /// True when the tool-iteration budget ran out with calls outstanding.
    pub partial_tool_loop: bool,
}

/// One executed tool call and its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    /// Id of the originating tool call.
    pub tool_call_id: String,
    /// Function name.
    pub name: String,
    /// The JSON result fed back to the model.
    pub result: serde_json::Value,
}

/// The finalized result of one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMResponse {
    /// Terminal assistant text.
    pub content: String,
    /// Model that produced it.
    pub model: String,
    /// Provider id (`openai`, `mock`, ...).
    pub provider: String,
    /// Token accounting summed across every provider round-trip of the turn.
    pub usage: TokenUsage,
    /// Every tool call executed during the turn, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Results of those calls, aligned with `tool_calls`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_execution_results: Vec<ToolExecutionRecord>,
    /// The finalized (trimmed, tool-paired) per-turn message list.
    #[serde(default)]
    pub optimized_conversation_history: Vec<Message>,
    /// Trim and tool-loop bookkeeping.
    #[serde(default)]
    pub history_optimization_info: HistoryOptimizationInfo,
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Default tool-loop bound when the request does not override it.
    pub max_tool_iterations: usize,
    /// Retries after the first provider attempt, on transient failures only.
    pub retry_attempts: usize,
    /// Base backoff delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Trailing messages the optimizer always keeps.
    pub preserve_recent_n: usize,
    /// Whether the document body is embedded into the system message.
    pub include_document_content: bool,
    /// Whether ambient Git credentials exist (request options may still
    /// supply a token when this is false).
    pub git_credentials_present: bool,
    /// How long a streamed event may wait on a stalled consumer before the
    /// turn is cancelled with `client_gone`.
    pub client_stall_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            retry_attempts: 2,
            retry_base_delay: Duration::from_millis(200),
            preserve_recent_n: history::DEFAULT_PRESERVE_RECENT,
            include_document_content: true,
            git_credentials_present: false,
            client_stall_timeout: Duration::from_secs(30),
        }
    }
}

/// The per-process query driver.
///
/// Shared state is limited to the provider client, the (read-only after
/// startup) function registry, and the response cache; everything else is
/// per-turn.
pub struct QueryOrchestrator {
    client: Arc<dyn LLMClient>,
    registry: Arc<FunctionRegistry>,
    cache: Arc<ResponseCache>,
    templates: Arc<TemplateStore>,
    prompt_builder: SystemPromptBuilder,
    settings: OrchestratorSettings,
}

impl QueryOrchestrator {
    /// Orchestrator with the built-in templates, a default cache, and
    /// default settings.
    pub fn new(client: Arc<dyn LLMClient>, registry: Arc<FunctionRegistry>) -> Self {
        let templates = Arc::new(TemplateStore::builtin());
        Self {
            client,
            registry,
            cache: Arc::new(ResponseCache::default()),
            prompt_builder: SystemPromptBuilder::new(templates.clone()),
            templates,
            settings: OrchestratorSettings::default(),
        }
    }

    /// Replace the response cache.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the template store.
    pub fn with_templates(mut self, templates: Arc<TemplateStore>) -> Self {
        self.prompt_builder = SystemPromptBuilder::new(templates.clone());
        self.templates = templates;
        self
    }

    /// Replace the tuning knobs.
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The template store (for the catalog endpoint).
    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// The active provider's capability record.
    pub fn capabilities(&self) -> crate::docullm::client_wrapper::Capabilities {
        self.client.capabilities()
    }

    /// The shared response cache.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    // -----------------------------------------------------------------------
    // Non-streaming turn
    // -----------------------------------------------------------------------

    /// Run one non-streaming turn.
    pub async fn query(&self, request: &QueryRequest) -> Result<LLMResponse, CoreError> {
        let prepared = self.prepare(request)?;
        let Prepared {
            mut messages,
            mut info,
            tools,
            cache_eligible,
            max_iterations,
        } = prepared;

        let cache_key = if cache_eligible {
            let key = fingerprint(
                self.client.provider_id(),
                request.options.model.as_deref().unwrap_or(self.client.model_name()),
                &messages,
                &request.options,
                &tools,
            );
            if let Some(hit) = self.cache.get(&key) {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("cache hit for turn fingerprint {}", &key[..12]);
                }
                return Ok(hit);
            }
            Some(key)
        } else {
            None
        };

        let mut usage = TokenUsage::default();
        let mut executed_calls: Vec<ToolCall> = Vec::new();
        let mut records: Vec<ToolExecutionRecord> = Vec::new();

        let mut response = self
            .call_provider(&messages, &request.options, &tools)
            .await?;
        usage.accumulate(&response.usage);

        let mut iterations = 0;
        while response.message.has_tool_calls() {
            if iterations >= max_iterations {
                info.partial_tool_loop = true;
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!(
                        "tool loop stopped after {} iterations with calls outstanding",
                        iterations
                    );
                }
                break;
            }
            iterations += 1;

            let calls = response.message.tool_calls.clone();
            messages.push(response.message.clone());
            let batch = self.execute_batch(&calls, request).await;
            for (call, result) in batch {
                messages.push(Message::tool_result(&call.id, result.to_string()));
                records.push(ToolExecutionRecord {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    result,
                });
                executed_calls.push(call);
            }

            response = self
                .call_provider(&messages, &request.options, &tools)
                .await?;
            usage.accumulate(&response.usage);
        }

        // A dangling assistant-with-tool_calls message is not appended: the
        // finalized history must pair every requested call with a result.
        if !info.partial_tool_loop {
            messages.push(response.message.clone());
        }

        let result = LLMResponse {
            content: response.message.content.as_ref().to_string(),
            model: response.model,
            provider: self.client.provider_id().to_string(),
            usage,
            tool_calls: executed_calls,
            tool_execution_results: records,
            optimized_conversation_history: messages,
            history_optimization_info: info,
        };

        if let Some(key) = cache_key {
            self.cache.put(&key, result.clone());
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Streaming turn
    // -----------------------------------------------------------------------

    /// Run one streamed turn, forwarding events through `events`.
    ///
    /// The caller observes a single event sequence spanning every provider
    /// round-trip, with [`StreamEvent::TurnBoundary`] between round-trips and
    /// exactly one terminal event. The cache is never consulted: a stream
    /// always reflects a live provider call. The finalized response is also
    /// returned for callers that want it after the stream closes.
    pub async fn stream(
        &self,
        request: &QueryRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<LLMResponse, CoreError> {
        match self.stream_inner(request, &events).await {
            Ok(response) => {
                let _ = events.send(StreamEvent::Done).await;
                Ok(response)
            }
            Err(err) => {
                if err.kind != ErrorKind::ClientGone {
                    let _ = events
                        .send(StreamEvent::Error {
                            kind: err.kind,
                            message: err.message.clone(),
                        })
                        .await;
                }
                Err(err)
            }
        }
    }

    async fn stream_inner(
        &self,
        request: &QueryRequest,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<LLMResponse, CoreError> {
        let prepared = self.prepare(request)?;
        let Prepared {
            mut messages,
            mut info,
            tools,
            cache_eligible: _,
            max_iterations,
        } = prepared;

        let mut usage = TokenUsage::default();
        let mut executed_calls: Vec<ToolCall> = Vec::new();
        let mut records: Vec<ToolExecutionRecord> = Vec::new();
        let mut iterations = 0;
        let mut final_content = String::new();
        let model = request
            .options
            .model
            .clone()
            .unwrap_or_else(|| self.client.model_name().to_string());

        loop {
            let mut delta_stream = self
                .open_stream(&messages, &request.options, &tools)
                .await?;

            let mut round_text = String::new();
            let mut pending_calls: Vec<ToolCall> = Vec::new();

            while let Some(delta) = delta_stream.next().await {
                match delta? {
                    StreamDelta::Text(piece) => {
                        round_text.push_str(&piece);
                        // Erroring out here drops the delta stream, which
                        // cancels the upstream provider call.
                        self.forward(events, StreamEvent::Text(piece)).await?;
                    }
                    StreamDelta::ToolCalls(calls) => pending_calls = calls,
                    StreamDelta::End {
                        usage: round_usage, ..
                    } => {
                        if let Some(round_usage) = round_usage {
                            usage.accumulate(&round_usage);
                        }
                    }
                }
            }

            if pending_calls.is_empty() {
                final_content = round_text.clone();
                messages.push(Message::assistant(&round_text));
                break;
            }

            if iterations >= max_iterations {
                info.partial_tool_loop = true;
                final_content = round_text;
                break;
            }
            iterations += 1;

            let mut assistant = Message::assistant_tool_calls(pending_calls.clone());
            if !round_text.is_empty() {
                assistant.content = Arc::from(round_text.as_str());
            }
            messages.push(assistant);

            for call in &pending_calls {
                self.forward(
                    events,
                    StreamEvent::ToolCallStarted {
                        id: call.id.clone(),
                        name: call.name.clone(),
                    },
                )
                .await?;
            }
            let batch = self.execute_batch(&pending_calls, request).await;
            for (call, result) in batch {
                self.forward(
                    events,
                    StreamEvent::ToolCallCompleted {
                        id: call.id.clone(),
                        name: call.name.clone(),
                    },
                )
                .await?;
                messages.push(Message::tool_result(&call.id, result.to_string()));
                records.push(ToolExecutionRecord {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    result,
                });
                executed_calls.push(call);
            }

            self.forward(events, StreamEvent::TurnBoundary).await?;
        }

        Ok(LLMResponse {
            content: final_content,
            model,
            provider: self.client.provider_id().to_string(),
            usage,
            tool_calls: executed_calls,
            tool_execution_results: records,
            optimized_conversation_history: messages,
            history_optimization_info: info,
        })
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    fn prepare(&self, request: &QueryRequest) -> Result<Prepared, CoreError> {
        validate_request(request)?;

        let system = self.prompt_builder.build(&PromptInputs {
            template_id: request.template_id.as_deref(),
            repository_context: request.repository_context.as_ref(),
            document_metadata: request.document_metadata.as_ref(),
            document_content: request.document_content.as_deref(),
            include_content: self.settings.include_document_content,
        })?;

        let mut messages: Vec<Message> = Vec::with_capacity(request.history.len() + 2);
        if let Some(system) = system {
            messages.push(system);
        }
        messages.extend(request.history.iter().cloned());
        messages.push(Message::user(&request.prompt));

        let max_context = self.client.capabilities().max_context;
        // Leave headroom for estimator drift against the provider tokenizer.
        let budget = max_context.saturating_sub(max_context / 16);
        let (optimized, summary) =
            history::optimize(&messages, budget, self.settings.preserve_recent_n);

        if estimate_history_tokens(&optimized) > max_context {
            return Err(CoreError::new(
                ErrorKind::ContextOverflow,
                format!(
                    "history does not fit the provider context of {} tokens even after optimization",
                    max_context
                ),
            ));
        }

        let tools = self.select_tools(request);
        let side_effecting = tools
            .iter()
            .any(|t| {
                self.registry
                    .get(&t.name)
                    .map(|def| def.side_effecting)
                    .unwrap_or(false)
            });

        let max_iterations = request
            .max_tool_iterations
            .unwrap_or(self.settings.max_tool_iterations);

        Ok(Prepared {
            messages: optimized,
            info: HistoryOptimizationInfo {
                was_optimized: summary.was_optimized,
                original_count: summary.original_count,
                optimized_count: summary.optimized_count,
                partial_tool_loop: false,
            },
            tools,
            cache_eligible: !side_effecting,
            max_iterations,
        })
    }

    /// Registry snapshot filtered by the request's capability surface.
    fn select_tools(&self, request: &QueryRequest) -> Vec<ToolDefinition> {
        if !request.tools_enabled {
            return Vec::new();
        }
        let credentials_present =
            self.settings.git_credentials_present || request.options.git_token.is_some();
        self.registry
            .definitions()
            .into_iter()
            .filter(|def| !def.requires_git_credentials || credentials_present)
            .map(|def| def.to_tool_definition())
            .collect()
    }

    async fn call_provider(
        &self,
        messages: &[Message],
        options: &QueryOptions,
        tools: &[ToolDefinition],
    ) -> Result<ProviderResponse, CoreError> {
        let mut attempt = 0usize;
        loop {
            match self.client.query(messages, options, tools).await {
                Ok(response) => return Ok(response),
                Err(err) if err.kind.is_transient() && attempt < self.settings.retry_attempts => {
                    let delay = self.settings.retry_base_delay * 2u32.pow(attempt as u32);
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!(
                            "provider call failed ({}), retrying in {:?} (attempt {}/{})",
                            err,
                            delay,
                            attempt + 1,
                            self.settings.retry_attempts
                        );
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Push one event to the stream consumer, bounding how long a stalled
    /// client can hold the turn.
    async fn forward(
        &self,
        events: &mpsc::Sender<StreamEvent>,
        event: StreamEvent,
    ) -> Result<(), CoreError> {
        match tokio::time::timeout(self.settings.client_stall_timeout, events.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CoreError::new(
                ErrorKind::ClientGone,
                "stream consumer went away",
            )),
            Err(_) => Err(CoreError::new(
                ErrorKind::ClientGone,
                "stream consumer stalled",
            )),
        }
    }

    async fn open_stream(
        &self,
        messages: &[Message],
        options: &QueryOptions,
        tools: &[ToolDefinition],
    ) -> Result<crate::docullm::client_wrapper::DeltaStream, CoreError> {
        let mut attempt = 0usize;
        loop {
            match self.client.stream_query(messages, options, tools).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.kind.is_transient() && attempt < self.settings.retry_attempts => {
                    let delay = self.settings.retry_base_delay * 2u32.pow(attempt as u32);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute one batch of tool calls.
    ///
    /// Calls run concurrently; results are returned in the order of the
    /// originating calls regardless of completion order, so turns are
    /// reproducible.
    async fn execute_batch(
        &self,
        calls: &[ToolCall],
        request: &QueryRequest,
    ) -> Vec<(ToolCall, serde_json::Value)> {
        let futures: Vec<_> = calls
            .iter()
            .map(|call| {
                let arguments = self.augment_arguments(call, request);
                async move {
                    let result = self.registry.call(&call.name, arguments).await;
                    (call.clone(), result)
                }
            })
            .collect();
        futures_util::future::join_all(futures).await
    }

    /// Fill in contextual defaults the model may omit: owner/repo/service
    /// from the repository context and the per-request Git token. Explicit
    /// arguments always win.
    fn augment_arguments(&self, call: &ToolCall, request: &QueryRequest) -> serde_json::Value {
        let needs_context = self
            .registry
            .get(&call.name)
            .map(|def| def.requires_git_credentials)
            .unwrap_or(false);
        if !needs_context {
            return call.arguments.clone();
        }

        let mut arguments = call.arguments.clone();
        let map = match arguments.as_object_mut() {
            Some(map) => map,
            None => return call.arguments.clone(),
        };
        if let Some(ctx) = &request.repository_context {
            map.entry("owner".to_string())
                .or_insert_with(|| serde_json::Value::String(ctx.owner.clone()));
            map.entry("repo".to_string())
                .or_insert_with(|| serde_json::Value::String(ctx.repo.clone()));
            map.entry("service_type".to_string())
                .or_insert_with(|| serde_json::Value::String(ctx.service.as_str().to_string()));
        }
        if let Some(token) = &request.options.git_token {
            map.entry("token".to_string())
                .or_insert_with(|| serde_json::Value::String(token.clone()));
        }
        arguments
    }
}

struct Prepared {
    messages: Vec<Message>,
    info: HistoryOptimizationInfo,
    tools: Vec<ToolDefinition>,
    cache_eligible: bool,
    max_iterations: usize,
}

pub(crate) fn validate_request(request: &QueryRequest) -> Result<(), CoreError> {
    if request.prompt.trim().is_empty() {
        return Err(CoreError::invalid_request("prompt must not be empty"));
    }
    if let Some(max) = request.max_tool_iterations {
        if max > MAX_TOOL_ITERATIONS_CEILING {
            return Err(CoreError::invalid_request(format!(
                "max_tool_iterations must be <= {}",
                MAX_TOOL_ITERATIONS_CEILING
            )));
        }
    }
    validate_history(&request.history)
}

/// Reject histories that violate the assistant/tool pairing invariants.
fn validate_history(history: &[Message]) -> Result<(), CoreError> {
    let mut open_call_ids: Vec<String> = Vec::new();
    for message in history {
        match &message.role {
            Role::Assistant if message.has_tool_calls() => {
                open_call_ids = message.tool_calls.iter().map(|c| c.id.clone()).collect();
            }
            Role::Tool { call_id } => {
                match open_call_ids.iter().position(|id| id == call_id) {
                    Some(pos) => {
                        open_call_ids.remove(pos);
                    }
                    None => {
                        return Err(CoreError::invalid_request(format!(
                            "tool message references unknown tool_call_id: {}",
                            call_id
                        )));
                    }
                }
            }
            _ => {
                open_call_ids.clear();
            }
        }
    }
    Ok(())
}
