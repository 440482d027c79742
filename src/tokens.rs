//! Token estimation and context-window resolution.
//!
//! Provides tiktoken-like token counting without external dependencies, and
//! resolves the context-window size advertised for a given model identifier.
//!
//! # Accuracy
//!
//! This is an *estimator*, not an exact counter. It only needs to be
//! monotone in input length, since every threshold that consumes it is
//! expressed as a fraction of the context window. The authoritative count
//! reported by upstream always wins when available (see `sse.rs`).

use serde_json::Value;
use std::collections::HashMap;

/// Estimate token count for a single piece of text content.
///
/// Multi-factor heuristic: base estimate from character count (~4 chars per
/// token for English), adjusted for whitespace, punctuation, digit, and
/// newline density.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let char_count = text.chars().count();
    let whitespace_count = text.chars().filter(|c| c.is_whitespace()).count();
    let punctuation_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();
    let digit_count = text.chars().filter(|c| c.is_ascii_digit()).count();
    let newline_count = text.chars().filter(|c| *c == '\n').count();

    let base_tokens = char_count as f64 / 4.0;
    let word_adjustment = whitespace_count as f64 * 0.3;
    let punct_adjustment = punctuation_count as f64 * 0.5;
    let digit_adjustment = digit_count as f64 * 0.3;
    let newline_adjustment = newline_count as f64 * 0.2;

    let estimate =
        base_tokens + word_adjustment + punct_adjustment + digit_adjustment + newline_adjustment;

    (estimate.ceil() as u32).max(1)
}

/// Estimate tokens for a raw JSON value (used before a request body has
/// been parsed into individual messages).
pub fn estimate_json_tokens(json: &Value) -> u32 {
    let text = json.to_string();
    let base = estimate_tokens(&text);
    (base as f64 * 1.15).ceil() as u32
}

/// A single observed conversation message: role, a bounded preview of its
/// text content, and a token estimate — the shape `ConversationState`
/// stores in its `messages` list (spec.md §3).
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub role: String,
    pub content_preview: String,
    pub tokens: u32,
}

const PREVIEW_MAX_CHARS: usize = 200;
/// Fixed structural overhead added per message on top of its raw content
/// estimate (role wrapper, message boundary tokens).
const PER_MESSAGE_OVERHEAD: u32 = 4;

/// Build a `MessageRef` from a role and its flattened text content.
pub fn message_ref(role: &str, text: &str) -> MessageRef {
    let preview: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
    MessageRef {
        role: role.to_string(),
        content_preview: preview,
        tokens: estimate_tokens(text) + PER_MESSAGE_OVERHEAD,
    }
}

/// Sum token estimates across a message list. Used as the fallback when
/// upstream doesn't report authoritative usage (DESIGN.md Open Question b).
pub fn estimate_message_tokens(messages: &[MessageRef]) -> u32 {
    messages.iter().map(|m| m.tokens).sum()
}

/// Default per-model-family context windows, including the `"tiny"` mock
/// model the test scenarios drive (spec.md §8, Scenario A).
fn default_model_windows() -> HashMap<&'static str, u32> {
    HashMap::from([
        ("tiny", 100),
        ("claude-3-opus", 200_000),
        ("claude-3-sonnet", 200_000),
        ("claude-3-haiku", 200_000),
        ("claude-3-5-sonnet", 200_000),
        ("claude-3-5-haiku", 200_000),
        ("claude-3-7-sonnet", 200_000),
        ("claude-opus-4", 200_000),
        ("claude-sonnet-4", 200_000),
        ("gpt-4o", 128_000),
        ("gpt-4-turbo", 128_000),
        ("gpt-4", 8_192),
        ("gpt-3.5-turbo", 16_385),
    ])
}

/// Conservative fallback window for unrecognized models.
const UNKNOWN_MODEL_WINDOW: u32 = 100_000;

/// Resolves the context-window size for a model identifier against a table
/// of known family prefixes, falling back to a conservative default. The
/// table is built from configuration so deployments can register custom
/// families without a code change.
#[derive(Debug, Clone)]
pub struct ModelWindows {
    windows: HashMap<String, u32>,
}

impl ModelWindows {
    /// Build the table from built-in defaults, extended/overridden by
    /// configured entries.
    pub fn new(overrides: HashMap<String, u32>) -> Self {
        let mut windows: HashMap<String, u32> = default_model_windows()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        windows.extend(overrides);
        Self { windows }
    }

    /// Resolve a model identifier by longest registered family-prefix
    /// match (e.g. `"claude-3-5-sonnet-20241022"` matches the
    /// `"claude-3-5-sonnet"` family), falling back to a conservative
    /// default when nothing matches.
    pub fn context_window_for(&self, model: &str) -> u32 {
        self.windows
            .iter()
            .filter(|(family, _)| model.starts_with(family.as_str()))
            .max_by_key(|(family, _)| family.len())
            .map(|(_, window)| *window)
            .unwrap_or(UNKNOWN_MODEL_WINDOW)
    }
}

impl Default for ModelWindows {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn simple_word() {
        let tokens = estimate_tokens("Hello");
        assert!((1..=3).contains(&tokens));
    }

    #[test]
    fn estimate_is_monotone_in_length() {
        let short = estimate_tokens("hello");
        let longer = estimate_tokens("hello there, this is a much longer sentence indeed");
        assert!(longer > short);
    }

    #[test]
    fn json_tokens() {
        let json = serde_json::json!({"name": "test", "value": 123});
        let tokens = estimate_json_tokens(&json);
        assert!((8..=25).contains(&tokens));
    }

    #[test]
    fn message_tokens_sum_with_overhead() {
        let messages = vec![message_ref("user", "hi"), message_ref("assistant", "hello")];
        let total = estimate_message_tokens(&messages);
        assert_eq!(total, messages[0].tokens + messages[1].tokens);
        assert!(total >= 2 * PER_MESSAGE_OVERHEAD);
    }

    #[test]
    fn preview_is_truncated() {
        let long_text: String = "a".repeat(1000);
        let msg = message_ref("user", &long_text);
        assert_eq!(msg.content_preview.chars().count(), PREVIEW_MAX_CHARS);
    }

    #[test]
    fn tiny_model_resolves_to_100() {
        let windows = ModelWindows::default();
        assert_eq!(windows.context_window_for("tiny"), 100);
    }

    #[test]
    fn unknown_model_resolves_to_conservative_default() {
        let windows = ModelWindows::default();
        assert_eq!(
            windows.context_window_for("some-made-up-model-9000"),
            UNKNOWN_MODEL_WINDOW
        );
    }

    #[test]
    fn known_family_prefix_matches() {
        let windows = ModelWindows::default();
        assert_eq!(
            windows.context_window_for("claude-3-5-sonnet-20241022"),
            200_000
        );
    }

    #[test]
    fn overrides_extend_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert("my-custom-model".to_string(), 42_000);
        let windows = ModelWindows::new(overrides);
        assert_eq!(windows.context_window_for("my-custom-model-v1"), 42_000);
        assert_eq!(windows.context_window_for("tiny"), 100);
    }
}
