//! Token count estimation for spans whose provider did not report usage.
//!
//! Provider-reported counts are always preferred; these functions only fill
//! gaps. An exact per-model tokenizer is used when one is registered for the
//! span's model, otherwise a whitespace split serves as a rough heuristic.
//! Every estimate carries an [`EstimateSource`] so downstream consumers can
//! tell exact counts from guesses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Chat framing overhead added per message
pub const TOKENS_PER_MESSAGE: u64 = 3;
/// Extra framing when a message carries a `name`
pub const TOKENS_PER_NAME: u64 = 1;
/// Tokens priming the assistant reply
pub const TOKENS_FOR_REPLY: u64 = 3;
/// Only the first messages of a long conversation are considered
pub const MAX_MESSAGES: usize = 50;

/// Counts tokens for one model family
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;

    /// Returns the tokenizer name for debugging.
    fn name(&self) -> &str;
}

/// Whitespace-split heuristic, used when no exact tokenizer applies
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn name(&self) -> &str {
        "whitespace"
    }
}

/// How a token count was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimateSource {
    #[serde(rename = "exact-tokenizer")]
    ExactTokenizer,
    #[serde(rename = "heuristic")]
    Heuristic,
}

impl EstimateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactTokenizer => "exact-tokenizer",
            Self::Heuristic => "heuristic",
        }
    }
}

impl fmt::Display for EstimateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub tokens: u64,
    pub source: EstimateSource,
}

/// Model-prefix keyed set of exact tokenizers.
///
/// Lookup tries the exact model name first, then the longest registered
/// prefix, so `gpt-4o-2024-08-06` resolves through a `gpt-4o` entry.
#[derive(Clone, Default)]
pub struct TokenizerRegistry {
    entries: Vec<(String, Arc<dyn Tokenizer>)>,
}

impl TokenizerRegistry {
    /// Empty registry: every estimate uses the heuristic
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tokenizers compiled into this build.
    ///
    /// With the `tiktoken` feature this covers the OpenAI GPT-4 / GPT-4o /
    /// GPT-3.5 families; without it the registry is empty.
    pub fn with_builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "tiktoken")]
        bpe::register_builtin(&mut registry);
        registry
    }

    /// Registers `tokenizer` for models named `model_prefix` or starting with it
    pub fn register(&mut self, model_prefix: impl Into<String>, tokenizer: Arc<dyn Tokenizer>) {
        let prefix = model_prefix.into();
        self.entries.retain(|(existing, _)| *existing != prefix);
        self.entries.push((prefix, tokenizer));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the exact tokenizer for `model`, if any
    pub fn resolve(&self, model: Option<&str>) -> Option<&dyn Tokenizer> {
        let model = model.map(str::trim).filter(|m| !m.is_empty())?;

        if let Some((_, tokenizer)) = self.entries.iter().find(|(prefix, _)| prefix == model) {
            return Some(tokenizer.as_ref());
        }

        self.entries
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, tokenizer)| tokenizer.as_ref())
    }
}

impl fmt::Debug for TokenizerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(prefix, t)| (prefix, t.name())))
            .finish()
    }
}

/// One chat message, reduced to the fields that cost tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Parses a JSON array of chat messages.
///
/// Non-object entries are skipped and non-string content is stringified.
/// Returns `None` for anything that is not a non-empty array.
pub fn parse_messages(json: &str) -> Option<Vec<ChatMessage>> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    messages_from_value(&value)
}

/// Like [`parse_messages`], for an already parsed JSON value
pub fn messages_from_value(value: &serde_json::Value) -> Option<Vec<ChatMessage>> {
    use serde_json::Value;

    let items = value.as_array().filter(|items| !items.is_empty())?;

    let messages = items
        .iter()
        .take(MAX_MESSAGES)
        .filter_map(Value::as_object)
        .map(|obj| {
            let text = |key: &str| match obj.get(key) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            };
            ChatMessage {
                role: text("role").unwrap_or_default(),
                content: text("content").unwrap_or_default(),
                name: text("name").filter(|n| !n.is_empty()),
            }
        })
        .collect();
    Some(messages)
}

/// Estimates tokens in a flat string
pub fn estimate_text(text: &str, model: Option<&str>, registry: &TokenizerRegistry) -> TokenEstimate {
    if text.is_empty() {
        return TokenEstimate {
            tokens: 0,
            source: EstimateSource::Heuristic,
        };
    }
    match registry.resolve(model) {
        Some(tokenizer) => TokenEstimate {
            tokens: tokenizer.count_tokens(text) as u64,
            source: EstimateSource::ExactTokenizer,
        },
        None => TokenEstimate {
            tokens: WhitespaceTokenizer.count_tokens(text) as u64,
            source: EstimateSource::Heuristic,
        },
    }
}

/// Estimates prompt tokens of a chat request, framing overhead included.
///
/// Without an exact tokenizer the messages are flattened to `role: content`
/// lines and whitespace-counted; the fixed overheads are only meaningful for
/// exact counts and are skipped. Returns `None` for an empty conversation.
pub fn estimate_chat_prompt(
    messages: &[ChatMessage],
    model: Option<&str>,
    registry: &TokenizerRegistry,
) -> Option<TokenEstimate> {
    if messages.is_empty() {
        return None;
    }
    let messages = &messages[..messages.len().min(MAX_MESSAGES)];

    let Some(tokenizer) = registry.resolve(model) else {
        let flattened = flatten_messages(messages);
        return Some(TokenEstimate {
            tokens: WhitespaceTokenizer.count_tokens(&flattened) as u64,
            source: EstimateSource::Heuristic,
        });
    };

    let count = |text: &str| tokenizer.count_tokens(text) as u64;
    let mut total = 0;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        total += count(&message.role);
        total += count(&message.content);
        if let Some(name) = &message.name {
            total += TOKENS_PER_NAME + count(name);
        }
    }
    total += TOKENS_FOR_REPLY;

    Some(TokenEstimate {
        tokens: total,
        source: EstimateSource::ExactTokenizer,
    })
}

/// Renders messages as `role: content` lines, skipping messages with
/// neither a role nor content
pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| !(m.role.is_empty() && m.content.is_empty()))
        .map(|m| match (m.role.is_empty(), m.content.is_empty()) {
            (true, _) => m.content.clone(),
            (false, true) => m.role.clone(),
            (false, false) => format!("{}: {}", m.role, m.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(feature = "tiktoken")]
mod bpe {
    use super::{Tokenizer, TokenizerRegistry};
    use std::sync::Arc;

    /// Exact BPE token counts from `tiktoken-rs`
    pub struct BpeTokenizer {
        name: &'static str,
        bpe: tiktoken_rs::CoreBPE,
    }

    impl Tokenizer for BpeTokenizer {
        fn count_tokens(&self, text: &str) -> usize {
            self.bpe.encode_with_special_tokens(text).len()
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    pub(super) fn register_builtin(registry: &mut TokenizerRegistry) {
        match tiktoken_rs::o200k_base() {
            Ok(bpe) => {
                let tokenizer: Arc<dyn Tokenizer> = Arc::new(BpeTokenizer { name: "o200k_base", bpe });
                registry.register("gpt-4o", Arc::clone(&tokenizer));
                registry.register("gpt-4o-mini", tokenizer);
            }
            Err(err) => tracing::debug!(error = %err, "o200k_base encoding unavailable"),
        }

        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => {
                let tokenizer: Arc<dyn Tokenizer> = Arc::new(BpeTokenizer { name: "cl100k_base", bpe });
                registry.register("gpt-4", Arc::clone(&tokenizer));
                registry.register("gpt-3.5-turbo", tokenizer);
            }
            Err(err) => tracing::debug!(error = %err, "cl100k_base encoding unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts characters, so exact-path arithmetic is easy to check by hand
    struct CharTokenizer;

    impl Tokenizer for CharTokenizer {
        fn count_tokens(&self, text: &str) -> usize {
            text.chars().count()
        }

        fn name(&self) -> &str {
            "chars"
        }
    }

    fn char_registry() -> TokenizerRegistry {
        let mut registry = TokenizerRegistry::new();
        registry.register("test-model", Arc::new(CharTokenizer));
        registry
    }

    #[test]
    fn test_heuristic_text() {
        let registry = TokenizerRegistry::new();
        let estimate = estimate_text("the quick  brown\tfox", Some("gpt-4"), &registry);
        assert_eq!(estimate.tokens, 4);
        assert_eq!(estimate.source, EstimateSource::Heuristic);
    }

    #[test]
    fn test_empty_text_is_zero() {
        let estimate = estimate_text("", Some("test-model"), &char_registry());
        assert_eq!(estimate.tokens, 0);
        assert_eq!(estimate.source, EstimateSource::Heuristic);
    }

    #[test]
    fn test_exact_text_uses_registered_tokenizer() {
        let estimate = estimate_text("abcde", Some("test-model-v2"), &char_registry());
        assert_eq!(estimate.tokens, 5);
        assert_eq!(estimate.source, EstimateSource::ExactTokenizer);
    }

    #[test]
    fn test_resolve_prefers_longest_prefix() {
        let mut registry = TokenizerRegistry::new();
        registry.register("m", Arc::new(WhitespaceTokenizer));
        registry.register("model-x", Arc::new(CharTokenizer));

        assert_eq!(registry.resolve(Some("model-x-1")).unwrap().name(), "chars");
        assert_eq!(registry.resolve(Some("mistral")).unwrap().name(), "whitespace");
        assert!(registry.resolve(Some("other")).is_none());
        assert!(registry.resolve(None).is_none());
    }

    #[test]
    fn test_register_replaces_same_prefix() {
        let mut registry = TokenizerRegistry::new();
        registry.register("m", Arc::new(WhitespaceTokenizer));
        registry.register("m", Arc::new(CharTokenizer));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(Some("m")).unwrap().name(), "chars");
    }

    #[test]
    fn test_chat_exact_includes_overheads() {
        let messages = vec![
            ChatMessage::new("system", "be brief"),
            ChatMessage::new("user", "hi").with_name("bob"),
        ];
        let estimate = estimate_chat_prompt(&messages, Some("test-model"), &char_registry()).unwrap();

        // (3 + 6 + 8) + (3 + 4 + 2 + 1 + 3) + 3
        assert_eq!(estimate.tokens, 33);
        assert_eq!(estimate.source, EstimateSource::ExactTokenizer);
    }

    #[test]
    fn test_chat_heuristic_flattens() {
        let messages = vec![
            ChatMessage::new("system", "be brief"),
            ChatMessage::new("user", "what is rust"),
        ];
        let estimate = estimate_chat_prompt(&messages, Some("unknown"), &TokenizerRegistry::new()).unwrap();

        // "system: be brief\nuser: what is rust"
        assert_eq!(estimate.tokens, 7);
        assert_eq!(estimate.source, EstimateSource::Heuristic);
    }

    #[test]
    fn test_chat_empty_is_none() {
        assert!(estimate_chat_prompt(&[], None, &TokenizerRegistry::new()).is_none());
    }

    #[test]
    fn test_parse_messages() {
        let json = r#"[
            {"role": "user", "content": "hello", "name": "ann"},
            "not a message",
            {"role": "assistant", "content": [{"type": "text"}]},
            {"content": null}
        ]"#;
        let messages = parse_messages(json).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], ChatMessage::new("user", "hello").with_name("ann"));
        assert_eq!(messages[1].content, r#"[{"type":"text"}]"#);
        assert_eq!(messages[2], ChatMessage::new("", ""));
    }

    #[test]
    fn test_parse_messages_rejects_non_arrays() {
        assert!(parse_messages("{}").is_none());
        assert!(parse_messages("[]").is_none());
        assert!(parse_messages("[{\"role\": \"user\"").is_none());
    }

    #[test]
    fn test_parse_messages_caps_length() {
        let json = serde_json::to_string(
            &(0..80)
                .map(|i| serde_json::json!({"role": "user", "content": format!("m{i}")}))
                .collect::<Vec<_>>(),
        )
        .unwrap();
        assert_eq!(parse_messages(&json).unwrap().len(), MAX_MESSAGES);
    }

    #[test]
    fn test_flatten_keeps_role_of_empty_message() {
        let messages = vec![
            ChatMessage::new("user", "a"),
            ChatMessage::new("assistant", ""),
            ChatMessage::new("", "b"),
            ChatMessage::new("", ""),
        ];
        assert_eq!(flatten_messages(&messages), "user: a\nassistant\nb");

        // The role of the empty message still counts
        let estimate = estimate_chat_prompt(&messages, None, &TokenizerRegistry::new()).unwrap();
        assert_eq!(estimate.tokens, 4);
    }

    #[test]
    fn test_source_strings() {
        assert_eq!(EstimateSource::ExactTokenizer.as_str(), "exact-tokenizer");
        assert_eq!(EstimateSource::Heuristic.to_string(), "heuristic");
    }
}
