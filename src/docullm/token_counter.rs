//! Approximate token accounting for budget decisions.
//!
//! The history optimizer and the orchestrator only need a cheap, monotone
//! estimate: one token per four characters of content, plus a small fixed
//! overhead per message for the role and framing. Providers may bill with a
//! different tokenizer; the estimate is used for trimming decisions only,
//! never for billing.

use crate::docullm::client_wrapper::Message;

/// Fixed per-message overhead covering the role tag and wire framing.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Additional overhead charged per tool call carried on a message.
const TOOL_CALL_OVERHEAD_TOKENS: usize = 8;

/// Estimate the number of tokens in a string (one per 4 characters, minimum 1).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Estimate the number of tokens a single message contributes to a request.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut total = MESSAGE_OVERHEAD_TOKENS + estimate_tokens(message.content.as_ref());
    for call in &message.tool_calls {
        total += TOOL_CALL_OVERHEAD_TOKENS
            + estimate_tokens(&call.name)
            + estimate_tokens(&call.arguments.to_string());
    }
    total
}

/// Estimate the total token footprint of a message list.
pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docullm::client_wrapper::{Message, ToolCall};

    #[test]
    fn string_estimate_is_monotone_under_concatenation() {
        let a = "documentation assistant";
        let b = " answers questions about markdown";
        let joined = format!("{}{}", a, b);
        assert!(estimate_tokens(&joined) >= estimate_tokens(a));
        assert!(estimate_tokens(&joined) >= estimate_tokens(b));
    }

    #[test]
    fn empty_string_still_costs_one_token() {
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn tool_calls_increase_message_estimate() {
        let plain = Message::assistant("done");
        let with_call = Message::assistant_tool_calls(vec![ToolCall {
            id: "call_0".to_string(),
            name: "extract_document_topics".to_string(),
            arguments: serde_json::json!({"content": "# Title"}),
        }]);
        assert!(estimate_message_tokens(&with_call) > estimate_message_tokens(&plain));
    }

    #[test]
    fn history_estimate_sums_messages() {
        let msgs = vec![Message::user("hello"), Message::assistant("hi there")];
        assert_eq!(
            estimate_history_tokens(&msgs),
            estimate_message_tokens(&msgs[0]) + estimate_message_tokens(&msgs[1])
        );
    }
}
