//! Fills in missing token counts on LLM spans.
//!
//! Counts reported by the provider are never overwritten. For each missing
//! field the stage estimates from the request or response text and tags the
//! field with how the estimate was made, so cost figures derived from it can
//! be told apart from billed usage.

use crate::keys;
use crate::span::{AttributeValue, Scalar, Span};
use crate::stage::{SpanStage, StageOutcome};
use crate::tokens::{
    estimate_chat_prompt, estimate_text, messages_from_value, parse_messages, ChatMessage,
    TokenEstimate, TokenizerRegistry,
};

/// Overall provenance written when the provider reported the counts
pub const SOURCE_PROVIDER: &str = "provider_usage";
/// Overall provenance when fields disagree on how they were obtained
pub const SOURCE_MIXED: &str = "mixed";

/// Enrichment stage estimating `llm.usage.*` token counts.
///
/// Must run before [`crate::cost_annotator::CostAnnotator`].
#[derive(Debug, Clone, Default)]
pub struct UsageEstimator {
    registry: TokenizerRegistry,
}

impl UsageEstimator {
    pub fn new(registry: TokenizerRegistry) -> Self {
        Self { registry }
    }

    /// Estimator backed by the tokenizers compiled into this build
    pub fn with_builtin() -> Self {
        Self::new(TokenizerRegistry::with_builtin())
    }

    pub fn registry(&self) -> &TokenizerRegistry {
        &self.registry
    }

    fn estimate_prompt(&self, span: &Span, model: Option<&str>) -> Option<TokenEstimate> {
        if let Some(messages) = span.attribute(keys::LLM_MESSAGES).and_then(messages_from_attribute) {
            if let Some(estimate) = estimate_chat_prompt(&messages, model, &self.registry) {
                return Some(estimate);
            }
        }

        let prompt = span
            .attribute(keys::LLM_PROMPT)
            .and_then(AttributeValue::as_str)?;
        Some(estimate_text(prompt, model, &self.registry))
    }

    fn estimate_completion(&self, span: &Span, model: Option<&str>) -> Option<TokenEstimate> {
        let completion = span
            .attribute(keys::LLM_COMPLETION)
            .and_then(AttributeValue::as_str)?;
        Some(estimate_text(completion, model, &self.registry))
    }
}

impl SpanStage for UsageEstimator {
    fn on_finalize(&self, span: &mut Span) -> StageOutcome {
        let has_prompt = has_prompt_tokens(span);
        let has_completion = has_completion_tokens(span);
        if has_prompt && has_completion {
            return StageOutcome::Continue;
        }

        let model = span
            .attribute(keys::LLM_MODEL)
            .and_then(AttributeValue::as_str)
            .map(str::to_owned);
        let model = model.as_deref();

        let mut wrote = false;
        if !has_prompt {
            if let Some(estimate) = self.estimate_prompt(span, model) {
                write_estimate(span, keys::USAGE_PROMPT_TOKENS, keys::USAGE_PROMPT_SOURCE, estimate);
                wrote = true;
            }
        }
        if !has_completion {
            if let Some(estimate) = self.estimate_completion(span, model) {
                write_estimate(
                    span,
                    keys::USAGE_COMPLETION_TOKENS,
                    keys::USAGE_COMPLETION_SOURCE,
                    estimate,
                );
                wrote = true;
            }
        }

        if wrote {
            resolve_overall_source(span);
        } else {
            tracing::debug!(span_name = %span.name, "no text to estimate token usage from");
        }
        StageOutcome::Continue
    }

    fn name(&self) -> &str {
        "usage_estimator"
    }
}

fn has_prompt_tokens(span: &Span) -> bool {
    span.has_attribute(keys::USAGE_PROMPT_TOKENS) || span.has_attribute(keys::USAGE_INPUT_TOKENS)
}

fn has_completion_tokens(span: &Span) -> bool {
    span.has_attribute(keys::USAGE_COMPLETION_TOKENS) || span.has_attribute(keys::USAGE_OUTPUT_TOKENS)
}

fn write_estimate(span: &mut Span, count_key: &str, source_key: &str, estimate: TokenEstimate) {
    let tokens = i64::try_from(estimate.tokens).unwrap_or(i64::MAX);
    span.set_attribute(count_key, tokens);
    span.set_attribute(source_key, estimate.source.as_str());
}

/// Accepts either a JSON string or an array whose elements are JSON objects
/// rendered as strings (the shape `AttributeValue::from_json` produces).
fn messages_from_attribute(value: &AttributeValue) -> Option<Vec<ChatMessage>> {
    match value {
        AttributeValue::String(json) => parse_messages(json),
        AttributeValue::Array(items) => {
            let parsed: Vec<serde_json::Value> = items
                .iter()
                .filter_map(|item| match item {
                    Scalar::String(json) => serde_json::from_str(json).ok(),
                    _ => None,
                })
                .collect();
            messages_from_value(&serde_json::Value::Array(parsed))
        }
        _ => None,
    }
}

/// Sets `llm.usage.source` after at least one field was estimated.
fn resolve_overall_source(span: &mut Span) {
    let existing = span
        .attribute(keys::USAGE_SOURCE)
        .and_then(AttributeValue::as_str)
        .map(str::to_owned);
    match existing.as_deref() {
        Some(SOURCE_PROVIDER) => {
            span.set_attribute(keys::USAGE_SOURCE, SOURCE_MIXED);
            return;
        }
        Some(_) => return,
        None => {}
    }

    let tag = |key: &str| {
        span.attribute(key)
            .and_then(AttributeValue::as_str)
            .map(str::to_owned)
    };
    let prompt = has_prompt_tokens(span).then(|| tag(keys::USAGE_PROMPT_SOURCE));
    let completion = has_completion_tokens(span).then(|| tag(keys::USAGE_COMPLETION_SOURCE));

    let overall = match (prompt, completion) {
        (Some(Some(p)), Some(Some(c))) if p == c => p,
        // Both present but tagged differently, or one came untagged from the provider
        (Some(_), Some(_)) => SOURCE_MIXED.to_owned(),
        (Some(Some(only)), None) | (None, Some(Some(only))) => only,
        _ => return,
    };
    span.set_attribute(keys::USAGE_SOURCE, overall);
}
