//! Streaming pipeline events and SSE framing.
//!
//! A streamed turn is a bounded channel of [`StreamEvent`]s with exactly one
//! producer (the orchestrator driving the provider stream) and one consumer
//! (the SSE writer). Events serialize to the `data:` frame payloads of the
//! stream endpoint:
//!
//! - `{"text": "..."}`: incremental assistant text
//! - `{"tool_call_started": true, "id": "...", "name": "..."}`
//! - `{"tool_call_completed": true, "id": "...", "name": "..."}`
//! - `{"turn_boundary": true}`: separates provider round-trips
//! - `{"error": true, "kind": "...", "message": "..."}`
//! - `{"done": true}`: exactly once, at the very end of a successful turn

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::Stream;
use tokio::sync::mpsc;

use crate::docullm::error::ErrorKind;

/// Default bound of the per-turn event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One event of a streamed turn.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental piece of assistant text, in provider order.
    Text(String),
    /// A tool call is about to execute.
    ToolCallStarted {
        /// Tool-call id from the assistant message.
        id: String,
        /// Registered function name.
        name: String,
    },
    /// A tool call finished (successfully or not; failures are part of the
    /// tool result the model sees, not of this event).
    ToolCallCompleted {
        /// Tool-call id from the assistant message.
        id: String,
        /// Registered function name.
        name: String,
    },
    /// Sentinel between provider round-trips of the same turn.
    TurnBoundary,
    /// Terminal error; the HTTP status is already 200 by this point.
    Error {
        /// Error kind wire name.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
    /// Terminal success marker.
    Done,
}

impl StreamEvent {
    /// The JSON payload carried in the `data:` frame.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StreamEvent::Text(text) => serde_json::json!({ "text": text }),
            StreamEvent::ToolCallStarted { id, name } => serde_json::json!({
                "tool_call_started": true, "id": id, "name": name,
            }),
            StreamEvent::ToolCallCompleted { id, name } => serde_json::json!({
                "tool_call_completed": true, "id": id, "name": name,
            }),
            StreamEvent::TurnBoundary => serde_json::json!({ "turn_boundary": true }),
            StreamEvent::Error { kind, message } => serde_json::json!({
                "error": true, "kind": kind.as_str(), "message": message,
            }),
            StreamEvent::Done => serde_json::json!({ "done": true }),
        }
    }

    /// The full SSE frame, terminated by the blank line.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}

/// Create the bounded event channel for one streamed turn.
pub fn event_channel() -> (mpsc::Sender<StreamEvent>, EventStream) {
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    (tx, ReceiverStream { receiver: rx })
}

/// [`Stream`] adapter over the consumer half of a bounded channel.
///
/// Used both for turn events (see [`EventStream`]) and for provider delta
/// streams produced by reader tasks.
pub struct ReceiverStream<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> ReceiverStream<T> {
    /// Wrap the consumer half of a channel.
    pub fn new(receiver: mpsc::Receiver<T>) -> Self {
        Self { receiver }
    }
}

impl<T> Stream for ReceiverStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// The consumer half of a turn's event channel.
pub type EventStream = ReceiverStream<StreamEvent>;
