//! Document analysis tools: quality grading, topic extraction, completeness.
//!
//! All three tools are pure: they derive their results from the document
//! text passed in the arguments and touch nothing outside the process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::docullm::error::CoreError;
use crate::docullm::function_registry::{FunctionDefinition, FunctionHandler};

/// Words ignored by topic extraction.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "if",
    "in", "into", "is", "it", "its", "not", "of", "on", "or", "that", "the", "their", "then",
    "there", "these", "this", "to", "was", "we", "were", "which", "will", "with", "you", "your",
];

// ---------------------------------------------------------------------------
// analyze_document_quality
// ---------------------------------------------------------------------------

/// Grade a document on readability, structure, and completeness.
///
/// `metrics` restricts the computed dimensions; all three by default.
/// Scores are 0–100; the overall grade maps the mean score to A–F.
pub fn analyze_document_quality(content: &str, metrics: &[String]) -> Value {
    let all = ["readability", "structure", "completeness"];
    let selected: Vec<&str> = if metrics.is_empty() {
        all.to_vec()
    } else {
        all.iter()
            .copied()
            .filter(|m| metrics.iter().any(|s| s == m))
            .collect()
    };

    let stats = DocumentStats::gather(content);
    let mut scores = serde_json::Map::new();
    let mut sum = 0u32;

    for metric in &selected {
        let score = match *metric {
            "readability" => stats.readability_score(),
            "structure" => stats.structure_score(),
            "completeness" => stats.completeness_score(),
            _ => 0,
        };
        sum += u32::from(score);
        scores.insert(metric.to_string(), Value::from(score));
    }

    let mean = if selected.is_empty() {
        0
    } else {
        (sum / selected.len() as u32) as u8
    };

    serde_json::json!({
        "ok": true,
        "grade": grade_for(mean),
        "overall_score": mean,
        "scores": scores,
        "statistics": {
            "word_count": stats.word_count,
            "sentence_count": stats.sentence_count,
            "heading_count": stats.heading_count,
            "code_block_count": stats.code_block_count,
            "link_count": stats.link_count,
        },
    })
}

struct DocumentStats {
    word_count: usize,
    sentence_count: usize,
    heading_count: usize,
    code_block_count: usize,
    link_count: usize,
    avg_sentence_words: f64,
    long_word_ratio: f64,
    has_title: bool,
    has_intro: bool,
}

impl DocumentStats {
    fn gather(content: &str) -> Self {
        let words: Vec<&str> = content.split_whitespace().collect();
        let word_count = words.len();
        let long_words = words.iter().filter(|w| w.len() > 12).count();
        let sentence_count = content
            .split(|c| c == '.' || c == '!' || c == '?')
            .filter(|s| s.split_whitespace().count() > 1)
            .count()
            .max(1);

        let lines: Vec<&str> = content.lines().collect();
        let heading_count = lines.iter().filter(|l| l.trim_start().starts_with('#')).count();
        let code_block_count = lines.iter().filter(|l| l.trim_start().starts_with("```")).count() / 2;
        let link_count = content.matches("](").count();

        let has_title = lines
            .iter()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim_start().starts_with("# "))
            .unwrap_or(false);
        // An intro is a non-heading paragraph within the first few lines.
        let has_intro = lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .take(4)
            .any(|l| !l.trim_start().starts_with('#'));

        Self {
            word_count,
            sentence_count,
            heading_count,
            code_block_count,
            link_count,
            avg_sentence_words: word_count as f64 / sentence_count as f64,
            long_word_ratio: if word_count == 0 {
                0.0
            } else {
                long_words as f64 / word_count as f64
            },
            has_title,
            has_intro,
        }
    }

    /// Penalizes very long sentences and a high ratio of long words.
    fn readability_score(&self) -> u8 {
        if self.word_count == 0 {
            return 0;
        }
        let mut score = 100.0;
        if self.avg_sentence_words > 20.0 {
            score -= (self.avg_sentence_words - 20.0) * 2.5;
        }
        score -= self.long_word_ratio * 120.0;
        score.clamp(0.0, 100.0) as u8
    }

    /// Rewards a title, section headings, and illustrative content.
    fn structure_score(&self) -> u8 {
        let mut score = 0u32;
        if self.has_title {
            score += 30;
        }
        if self.heading_count > 1 {
            score += 30;
        } else if self.heading_count == 1 {
            score += 15;
        }
        if self.code_block_count > 0 {
            score += 20;
        }
        if self.link_count > 0 {
            score += 20;
        }
        score.min(100) as u8
    }

    /// Rewards an introduction and enough body to be useful.
    fn completeness_score(&self) -> u8 {
        let mut score = 0u32;
        if self.has_intro {
            score += 30;
        }
        score += match self.word_count {
            0..=49 => 10,
            50..=199 => 40,
            _ => 50,
        };
        if self.heading_count >= 2 {
            score += 20;
        }
        score.min(100) as u8
    }
}

fn grade_for(score: u8) -> &'static str {
    match score {
        90..=100 => "A",
        75..=89 => "B",
        60..=74 => "C",
        40..=59 => "D",
        _ => "F",
    }
}

// ---------------------------------------------------------------------------
// extract_document_topics
// ---------------------------------------------------------------------------

/// Frequency-ranked topical keywords; heading words weigh double.
pub fn extract_document_topics(content: &str, n: usize) -> Value {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for line in content.lines() {
        let weight = if line.trim_start().starts_with('#') { 2 } else { 1 };
        for raw in line.split_whitespace() {
            let word: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if word.len() < 3 || STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            *counts.entry(word).or_insert(0) += weight;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(n);

    serde_json::json!({
        "ok": true,
        "topics": ranked
            .into_iter()
            .map(|(word, count)| serde_json::json!({"topic": word, "weight": count}))
            .collect::<Vec<Value>>(),
    })
}

// ---------------------------------------------------------------------------
// check_document_completeness
// ---------------------------------------------------------------------------

/// Expected sections per document template type.
fn expected_sections(template_type: &str) -> &'static [&'static str] {
    match template_type {
        "api" => &["overview", "parameters", "returns", "examples", "errors"],
        "tutorial" => &["prerequisites", "introduction", "steps", "summary"],
        _ => &["installation", "usage", "examples", "license"], // readme
    }
}

/// Check which expected sections a document actually carries.
pub fn check_document_completeness(content: &str, template_type: &str) -> Value {
    let headings: Vec<String> = content
        .lines()
        .filter(|l| l.trim_start().starts_with('#'))
        .map(|l| l.trim_start_matches('#').trim().to_lowercase())
        .collect();

    let expected = expected_sections(template_type);
    let mut present = Vec::new();
    let mut missing = Vec::new();
    for section in expected {
        if headings.iter().any(|h| h.contains(section)) {
            present.push(*section);
        } else {
            missing.push(*section);
        }
    }

    let score = if expected.is_empty() {
        100
    } else {
        (present.len() * 100 / expected.len()) as u8
    };

    serde_json::json!({
        "ok": true,
        "template_type": template_type,
        "present_sections": present,
        "missing_sections": missing,
        "completeness_score": score,
    })
}

// ---------------------------------------------------------------------------
// Handlers and definitions
// ---------------------------------------------------------------------------

struct AnalyzeQualityHandler;

#[async_trait]
impl FunctionHandler for AnalyzeQualityHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        let content = arguments["content"].as_str().unwrap_or("");
        let metrics: Vec<String> = arguments["metrics"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(analyze_document_quality(content, &metrics))
    }
}

struct ExtractTopicsHandler;

#[async_trait]
impl FunctionHandler for ExtractTopicsHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        let content = arguments["content"].as_str().unwrap_or("");
        let n = arguments["n"].as_u64().unwrap_or(5).clamp(1, 25) as usize;
        Ok(extract_document_topics(content, n))
    }
}

struct CheckCompletenessHandler;

#[async_trait]
impl FunctionHandler for CheckCompletenessHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, CoreError> {
        let content = arguments["content"].as_str().unwrap_or("");
        let template_type = arguments["template_type"].as_str().unwrap_or("readme");
        Ok(check_document_completeness(content, template_type))
    }
}

/// The three document-analysis tool definitions.
pub fn definitions() -> Vec<FunctionDefinition> {
    vec![
        FunctionDefinition::new(
            "analyze_document_quality",
            "Grade a document's readability, structure, and completeness (0-100 scores and an A-F grade).",
            Arc::new(AnalyzeQualityHandler),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The document text to analyze"},
                "metrics": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Subset of [readability, structure, completeness]; all when omitted"
                }
            },
            "required": ["content"]
        })),
        FunctionDefinition::new(
            "extract_document_topics",
            "Extract the top topical keywords from a document, weighting headings double.",
            Arc::new(ExtractTopicsHandler),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The document text to analyze"},
                "n": {"type": "integer", "description": "Number of topics to return (default 5)"}
            },
            "required": ["content"]
        })),
        FunctionDefinition::new(
            "check_document_completeness",
            "Check a document for the sections expected of its template type (readme, api, tutorial).",
            Arc::new(CheckCompletenessHandler),
        )
        .with_parameters_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The document text to check"},
                "template_type": {
                    "type": "string",
                    "enum": ["readme", "api", "tutorial"],
                    "description": "Which section checklist to apply (default readme)"
                }
            },
            "required": ["content"]
        })),
    ]
}
