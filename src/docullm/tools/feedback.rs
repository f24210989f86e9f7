//! Feedback and conversation-analysis tools.
//!
//! Pure helpers the model can call to reflect on the conversation so far:
//! a structural summary, a sentiment snapshot, and improvement suggestions
//! for the document under discussion.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::docullm::error::CoreError;
use crate::docullm::function_registry::{FunctionDefinition, FunctionHandler};

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "helpful", "clear", "thanks", "thank", "perfect", "excellent", "useful",
    "nice", "works", "solved",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "wrong", "confusing", "unclear", "broken", "error", "missing", "outdated", "stale",
    "useless", "frustrating", "fails",
];

/// Messages as the feedback tools accept them: `{role, content}` pairs.
fn parse_transcript(arguments: &Value) -> Vec<(String, String)> {
    arguments["messages"]
        .as_array()
        .map(|msgs| {
            msgs.iter()
                .filter_map(|m| {
                    let role = m.get("role")?.as_str()?.to_string();
                    let content = m.get("content")?.as_str()?.to_string();
                    Some((role, content))
                })
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// summarize_conversation
// ---------------------------------------------------------------------------

/// Structural summary of a transcript: message counts, opening question,
/// and the dominant keywords of the user's side.
pub fn summarize_conversation(transcript: &[(String, String)]) -> Value {
    let user_messages: Vec<&str> = transcript
        .iter()
        .filter(|(role, _)| role == "user")
        .map(|(_, content)| content.as_str())
        .collect();
    let assistant_count = transcript.iter().filter(|(r, _)| r == "assistant").count();

    let opening = user_messages.first().map(|s| truncate(s, 160));
    let latest = user_messages.last().map(|s| truncate(s, 160));

    let joined = user_messages.join("\n");
    let topics = super::document::extract_document_topics(&joined, 5);

    serde_json::json!({
        "ok": true,
        "message_count": transcript.len(),
        "user_message_count": user_messages.len(),
        "assistant_message_count": assistant_count,
        "opening_question": opening,
        "latest_question": latest,
        "user_topics": topics["topics"],
    })
}

// ---------------------------------------------------------------------------
// conversation_sentiment
// ---------------------------------------------------------------------------

/// Lexicon-based sentiment snapshot of the user's messages.
pub fn conversation_sentiment(transcript: &[(String, String)]) -> Value {
    let mut positive = 0usize;
    let mut negative = 0usize;
    for (role, content) in transcript {
        if role != "user" {
            continue;
        }
        for raw in content.split_whitespace() {
            let word: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if POSITIVE_WORDS.contains(&word.as_str()) {
                positive += 1;
            } else if NEGATIVE_WORDS.contains(&word.as_str()) {
                negative += 1;
            }
        }
    }

    let total = positive + negative;
    let score = if total == 0 {
        0.0
    } else {
        (positive as f64 - negative as f64) / total as f64
    };
    let label = if score > 0.2 {
        "positive"
    } else if score < -0.2 {
        "negative"
    } else {
        "neutral"
    };

    serde_json::json!({
        "ok": true,
        "sentiment": label,
        "score": score,
        "positive_signals": positive,
        "negative_signals": negative,
    })
}

// ---------------------------------------------------------------------------
// generate_improvement_suggestions
// ---------------------------------------------------------------------------

/// Heuristic improvement suggestions for a document.
///
/// `focus` narrows the checks: `structure`, `clarity`, or `examples`.
pub fn generate_improvement_suggestions(content: &str, focus: Option<&str>) -> Value {
    let mut suggestions: Vec<String> = Vec::new();
    let lines: Vec<&str> = content.lines().collect();
    let wants = |area: &str| focus.is_none() || focus == Some(area);

    if wants("structure") {
        let first_non_empty = lines.iter().find(|l| !l.trim().is_empty());
        if first_non_empty.map(|l| !l.trim_start().starts_with("# ")).unwrap_or(true) {
            suggestions.push("Start the document with a single top-level `#` title.".to_string());
        }
        let heading_count = lines.iter().filter(|l| l.trim_start().starts_with('#')).count();
        if heading_count < 2 && content.split_whitespace().count() > 150 {
            suggestions.push(
                "Break the body into sections with `##` headings so readers can scan it.".to_string(),
            );
        }
    }

    if wants("clarity") {
        let long_paragraphs = content
            .split("\n\n")
            .filter(|p| p.split_whitespace().count() > 120)
            .count();
        if long_paragraphs > 0 {
            suggestions.push(format!(
                "Split {} paragraph(s) of over 120 words into shorter ones.",
                long_paragraphs
            ));
        }
        if content.contains("TODO") || content.contains("TBD") {
            suggestions.push("Resolve the TODO/TBD markers before publishing.".to_string());
        }
    }

    if wants("examples") {
        if !content.contains("```") {
            suggestions.push("Add at least one fenced code example.".to_string());
        }
        if !content.contains("](") {
            suggestions.push("Link to related documents or external references.".to_string());
        }
    }

    serde_json::json!({
        "ok": true,
        "focus": focus,
        "suggestion_count": suggestions.len(),
        "suggestions": suggestions,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut)
}

// ---------------------------------------------------------------------------
// Handlers and definitions
// ---------------------------------------------------------------------------

struct SummarizeHandler;

#[async_trait]
impl FunctionHandler for SummarizeHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        Ok(summarize_conversation(&parse_transcript(&arguments)))
    }
}

struct SentimentHandler;

#[async_trait]
impl FunctionHandler for SentimentHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        Ok(conversation_sentiment(&parse_transcript(&arguments)))
    }
}

struct SuggestionsHandler;

#[async_trait]
impl FunctionHandler for SuggestionsHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        let content = arguments["content"].as_str().unwrap_or("");
        let focus = arguments["focus"].as_str();
        Ok(generate_improvement_suggestions(content, focus))
    }
}

const TRANSCRIPT_SCHEMA_PROPERTIES: &str = r#"{
    "messages": {
        "type": "array",
        "description": "The conversation as {role, content} objects",
        "items": {"type": "object"}
    }
}"#;

/// The three feedback/analysis tool definitions.
pub fn definitions() -> Vec<FunctionDefinition> {
    let transcript_properties: Value =
        serde_json::from_str(TRANSCRIPT_SCHEMA_PROPERTIES).unwrap_or_else(|_| serde_json::json!({}));
    vec![
        FunctionDefinition::new(
            "summarize_conversation",
            "Summarize the conversation so far: counts, opening question, dominant user topics.",
            Arc::new(SummarizeHandler),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": transcript_properties.clone(),
            "required": ["messages"]
        })),
        FunctionDefinition::new(
            "conversation_sentiment",
            "Estimate the sentiment of the user's messages (positive / neutral / negative).",
            Arc::new(SentimentHandler),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": transcript_properties,
            "required": ["messages"]
        })),
        FunctionDefinition::new(
            "generate_improvement_suggestions",
            "Suggest concrete improvements for a document, optionally focused on structure, clarity, or examples.",
            Arc::new(SuggestionsHandler),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The document text to review"},
                "focus": {
                    "type": "string",
                    "enum": ["structure", "clarity", "examples"],
                    "description": "Restrict suggestions to one area"
                }
            },
            "required": ["content"]
        })),
    ]
}
