//! Attribute keys read and written by the enrichment stages.

/// Model identifier reported by the instrumentation
pub const LLM_MODEL: &str = "llm.model";
/// Flat prompt text
pub const LLM_PROMPT: &str = "llm.prompt";
/// Flat completion text
pub const LLM_COMPLETION: &str = "llm.completion";
/// JSON array of chat messages (`role`, `content`, optional `name`)
pub const LLM_MESSAGES: &str = "llm.messages";

pub const USAGE_PROMPT_TOKENS: &str = "llm.usage.prompt_tokens";
pub const USAGE_COMPLETION_TOKENS: &str = "llm.usage.completion_tokens";
/// Anthropic-style alias of [`USAGE_PROMPT_TOKENS`]
pub const USAGE_INPUT_TOKENS: &str = "llm.usage.input_tokens";
/// Anthropic-style alias of [`USAGE_COMPLETION_TOKENS`]
pub const USAGE_OUTPUT_TOKENS: &str = "llm.usage.output_tokens";

/// Overall provenance of the token counts
pub const USAGE_SOURCE: &str = "llm.usage.source";
pub const USAGE_PROMPT_SOURCE: &str = "llm.usage.prompt_source";
pub const USAGE_COMPLETION_SOURCE: &str = "llm.usage.completion_source";

pub const COST_USD: &str = "llm.cost.usd";
pub const COST_SOURCE: &str = "llm.cost.source";
pub const PRICING_SOURCE: &str = "llm.pricing.source";
pub const PRICING_MODEL_KEY: &str = "llm.pricing.model_key";
