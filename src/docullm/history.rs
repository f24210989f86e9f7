//! Conversation-history trimming against a token budget.
//!
//! Given a message list and a budget, [`optimize`] returns a trimmed list
//! that keeps the leading system message and the most recent messages, and
//! drops middle messages oldest-first until the estimate fits. An assistant
//! message that carries tool calls forms one indivisible unit together with
//! the tool-result messages that answer it: the unit is dropped or kept
//! whole, never split, so the trimmed history never contains an orphan tool
//! message.
//!
//! The operation is idempotent: optimizing an already-optimized history is a
//! no-op for the same budget.

use crate::docullm::client_wrapper::{Message, Role};
use crate::docullm::token_counter::{estimate_history_tokens, estimate_message_tokens};

/// Default number of trailing messages always kept.
pub const DEFAULT_PRESERVE_RECENT: usize = 4;

/// Summary of what the optimizer did to one history.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct OptimizationSummary {
    /// Whether anything was dropped (or the budget could not be met).
    pub was_optimized: bool,
    /// Message count before trimming.
    pub original_count: usize,
    /// Message count after trimming.
    pub optimized_count: usize,
}

/// Trim `messages` so its token estimate fits `max_tokens`.
///
/// Policy, in order:
/// 1. the first system message (if any) is always kept;
/// 2. the last `preserve_recent_n` messages are always kept (the protected
///    tail is widened so it never begins in the middle of a tool unit);
/// 3. middle units are dropped oldest-first until the estimate fits;
/// 4. if everything droppable is gone and the budget is still exceeded, the
///    minimal set is returned with `was_optimized = true`.
pub fn optimize(
    messages: &[Message],
    max_tokens: usize,
    preserve_recent_n: usize,
) -> (Vec<Message>, OptimizationSummary) {
    let original_count = messages.len();
    if estimate_history_tokens(messages) <= max_tokens {
        return (
            messages.to_vec(),
            OptimizationSummary {
                was_optimized: false,
                original_count,
                optimized_count: original_count,
            },
        );
    }

    let units = group_units(messages);

    // Index of the unit holding the first system message, if any.
    let system_unit = units.iter().position(|u| {
        matches!(messages[u.start].role, Role::System)
    });

    // Protected tail: the smallest unit suffix covering the last
    // `preserve_recent_n` messages.
    let tail_message_start = original_count.saturating_sub(preserve_recent_n);
    let tail_unit_start = units
        .iter()
        .position(|u| u.end > tail_message_start)
        .unwrap_or(units.len());

    let mut keep: Vec<bool> = vec![true; units.len()];
    let mut budget_used: usize = units.iter().map(|u| u.tokens).sum();

    for (idx, unit) in units.iter().enumerate() {
        if budget_used <= max_tokens {
            break;
        }
        if Some(idx) == system_unit || idx >= tail_unit_start {
            continue;
        }
        keep[idx] = false;
        budget_used -= unit.tokens;
    }

    let mut trimmed = Vec::new();
    for (idx, unit) in units.iter().enumerate() {
        if keep[idx] {
            trimmed.extend_from_slice(&messages[unit.start..unit.end]);
        }
    }

    let optimized_count = trimmed.len();
    (
        trimmed,
        OptimizationSummary {
            was_optimized: true,
            original_count,
            optimized_count,
        },
    )
}

/// A droppable slice of the history: either a single message, or an
/// assistant-with-tool_calls message plus the tool results that answer it.
struct Unit {
    start: usize,
    end: usize,
    tokens: usize,
}

fn group_units(messages: &[Message]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let start = i;
        let mut end = i + 1;
        if messages[i].has_tool_calls() {
            // Absorb the contiguous run of tool messages answering this call.
            while end < messages.len() && matches!(messages[end].role, Role::Tool { .. }) {
                end += 1;
            }
        }
        let tokens = messages[start..end].iter().map(estimate_message_tokens).sum();
        units.push(Unit { start, end, tokens });
        i = end;
    }
    units
}
