//! Response cache keyed by a fingerprint of the inputs.
//!
//! Finalized, deterministic responses are memoized under a SHA-256 hash of
//! `(provider_id, model, normalized_messages, relevant_options, tool_schemas)`.
//! Normalization canonicalizes the JSON (objects serialized with sorted keys)
//! and collapses whitespace in message content, so the fingerprint is stable
//! across process restarts and cosmetic request differences.
//!
//! The cache is bounded (LRU eviction, default 1024 entries) and each entry
//! carries an expiry. Expired entries are dropped lazily on access; callers
//! that want eager reclamation can run [`ResponseCache::sweep`].
//!
//! The cache must never be consulted for streaming turns or for turns whose
//! tool set contains a side-effecting handler; that policy lives in the
//! orchestrator; this module only provides the mechanism.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::docullm::client_wrapper::{Message, QueryOptions, ToolDefinition, WireMessage};
use crate::docullm::orchestrator::LLMResponse;

/// Default maximum number of cached responses.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Default time-to-live for a cached response.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    response: LLMResponse,
    expires_at: Instant,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups that returned a live entry.
    pub hits: u64,
    /// Lookups that found nothing (or only an expired entry).
    pub misses: u64,
    /// Entries currently resident.
    pub entries: usize,
}

/// Bounded LRU + TTL cache for finalized [`LLMResponse`]s.
///
/// A single shared instance lives per process; internal mutation is
/// serialized behind one mutex (reads and writes are both short).
pub struct ResponseCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    /// Build a cache with the given capacity and entry TTL.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint, dropping the entry if it has expired.
    pub fn get(&self, fingerprint: &str) -> Option<LLMResponse> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let expired = match inner.get(fingerprint) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.pop(fingerprint);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response under its fingerprint with the cache's default TTL.
    pub fn put(&self, fingerprint: &str, response: LLMResponse) {
        self.put_with_ttl(fingerprint, response, self.ttl);
    }

    /// Store a response under its fingerprint with an explicit TTL.
    ///
    /// When two concurrent misses race on the same fingerprint, the later
    /// writer must not replace a fresher entry: an existing live entry whose
    /// expiry is at or beyond the incoming one is left in place.
    pub fn put_with_ttl(&self, fingerprint: &str, response: LLMResponse, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = inner.peek(fingerprint) {
            if existing.expires_at >= expires_at {
                return;
            }
        }
        inner.put(
            fingerprint.to_string(),
            CacheEntry {
                response,
                expires_at,
            },
        );
    }

    /// Eagerly remove every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            inner.pop(&key);
        }
    }

    /// Snapshot of hit/miss counters and resident entry count.
    pub fn stats(&self) -> CacheStats {
        let entries = match self.inner.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}

// ---------------------------------------------------------------------------
// Fingerprinting
// ---------------------------------------------------------------------------

/// Compute the cache fingerprint for a fully-assembled provider request.
///
/// The hash input is a canonical JSON document: object keys sorted, message
/// content whitespace-collapsed, options reduced to the fields that influence
/// the model output.
pub fn fingerprint(
    provider_id: &str,
    model: &str,
    messages: &[Message],
    options: &QueryOptions,
    tools: &[ToolDefinition],
) -> String {
    let normalized_messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|msg| {
            let mut wire = serde_json::to_value(WireMessage::from(msg.clone()))
                .unwrap_or(serde_json::Value::Null);
            if let Some(content) = wire.get_mut("content") {
                if let Some(text) = content.as_str() {
                    *content = serde_json::Value::String(collapse_whitespace(text));
                }
            }
            wire
        })
        .collect();

    let relevant_options = serde_json::json!({
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
    });

    let tool_schemas: Vec<serde_json::Value> = tools
        .iter()
        .map(|t| serde_json::to_value(t).unwrap_or(serde_json::Value::Null))
        .collect();

    let document = serde_json::json!({
        "provider": provider_id,
        "model": model,
        "messages": normalized_messages,
        "options": relevant_options,
        "tools": tool_schemas,
    });

    let mut canonical = String::new();
    write_canonical(&document, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Collapse runs of whitespace into single spaces and trim the ends.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Serialize a JSON value with object keys in sorted order.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docullm::client_wrapper::Message;

    fn sample_response(content: &str) -> LLMResponse {
        LLMResponse {
            content: content.to_string(),
            ..LLMResponse::default()
        }
    }

    #[test]
    fn whitespace_differences_do_not_change_fingerprint() {
        let opts = QueryOptions::default();
        let a = fingerprint("mock", "m", &[Message::user("what   is\nREST?")], &opts, &[]);
        let b = fingerprint("mock", "m", &[Message::user("what is REST?")], &opts, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn model_and_provider_participate_in_fingerprint() {
        let opts = QueryOptions::default();
        let msgs = [Message::user("hi")];
        let a = fingerprint("mock", "m1", &msgs, &opts, &[]);
        let b = fingerprint("mock", "m2", &msgs, &opts, &[]);
        let c = fingerprint("openai", "m1", &msgs, &opts, &[]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tool_schemas_participate_in_fingerprint() {
        let opts = QueryOptions::default();
        let msgs = [Message::user("hi")];
        let tool = ToolDefinition {
            name: "extract_document_topics".to_string(),
            description: "topics".to_string(),
            parameters_schema: serde_json::json!({"type": "object"}),
        };
        let bare = fingerprint("mock", "m", &msgs, &opts, &[]);
        let with_tool = fingerprint("mock", "m", &msgs, &opts, &[tool]);
        assert_ne!(bare, with_tool);
    }

    #[test]
    fn get_put_round_trip_and_hit_accounting() {
        let cache = ResponseCache::new(8, Duration::from_secs(60));
        assert!(cache.get("fp").is_none());
        cache.put("fp", sample_response("cached"));
        let hit = cache.get("fp").expect("entry should be live");
        assert_eq!(hit.content, "cached");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn expired_entries_are_dropped_on_access() {
        let cache = ResponseCache::new(8, Duration::from_millis(0));
        cache.put("fp", sample_response("stale"));
        assert!(cache.get("fp").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn lru_eviction_bounds_capacity() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.put("a", sample_response("a"));
        cache.put("b", sample_response("b"));
        cache.put("c", sample_response("c"));
        assert_eq!(cache.stats().entries, 2);
        assert!(cache.get("a").is_none(), "oldest entry should be evicted");
    }

    #[test]
    fn later_writer_does_not_replace_fresher_entry() {
        let cache = ResponseCache::new(8, Duration::from_secs(60));
        cache.put_with_ttl("fp", sample_response("fresh"), Duration::from_secs(60));
        // A straggling writer whose entry would expire sooner loses the race.
        cache.put_with_ttl("fp", sample_response("stale"), Duration::from_secs(1));
        assert_eq!(cache.get("fp").unwrap().content, "fresh");
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let cache = ResponseCache::new(8, Duration::from_millis(0));
        cache.put("a", sample_response("a"));
        cache.put("b", sample_response("b"));
        cache.sweep();
        assert_eq!(cache.stats().entries, 0);
    }
}
