//! Enrichment stage attaching a USD cost to LLM spans.

use crate::cost::{compute_cost, match_pricing};
use crate::keys;
use crate::pricing::{PricingSource, PricingTable};
use crate::span::{AttributeValue, Span};
use crate::stage::{SpanStage, StageOutcome};
use std::sync::{Arc, PoisonError, RwLock};

/// Cost provenance when no `llm.usage.source` is recorded
pub const COST_SOURCE_UNKNOWN: &str = "unknown";

/// Computes `llm.cost.usd` from the model and token counts on a span.
///
/// Spans that already carry a cost are left alone, so running the stage
/// twice is harmless. The pricing table can be swapped at runtime; spans
/// finalized afterwards price against the new table.
#[derive(Debug)]
pub struct CostAnnotator {
    pricing: RwLock<(Arc<PricingTable>, PricingSource)>,
}

impl CostAnnotator {
    pub fn new(table: PricingTable, source: PricingSource) -> Self {
        Self {
            pricing: RwLock::new((Arc::new(table), source)),
        }
    }

    /// Replaces the pricing table used for subsequent spans
    pub fn update_pricing(&self, table: PricingTable, source: PricingSource) {
        let mut pricing = self.pricing.write().unwrap_or_else(PoisonError::into_inner);
        *pricing = (Arc::new(table), source);
    }

    /// Snapshot of the current table and its provenance
    pub fn pricing(&self) -> (Arc<PricingTable>, PricingSource) {
        let pricing = self.pricing.read().unwrap_or_else(PoisonError::into_inner);
        (Arc::clone(&pricing.0), pricing.1)
    }
}

impl Default for CostAnnotator {
    fn default() -> Self {
        Self::new(PricingTable::defaults(), PricingSource::Default)
    }
}

impl SpanStage for CostAnnotator {
    fn on_finalize(&self, span: &mut Span) -> StageOutcome {
        if span.has_attribute(keys::COST_USD) {
            return StageOutcome::Continue;
        }

        let Some(model) = span
            .attribute(keys::LLM_MODEL)
            .and_then(AttributeValue::as_str)
            .map(str::to_owned)
        else {
            return StageOutcome::Continue;
        };

        let prompt = token_count(span, keys::USAGE_PROMPT_TOKENS, keys::USAGE_INPUT_TOKENS);
        let completion = token_count(span, keys::USAGE_COMPLETION_TOKENS, keys::USAGE_OUTPUT_TOKENS);
        let (Some(prompt), Some(completion)) = (prompt, completion) else {
            tracing::debug!(span_name = %span.name, model = %model, "token counts missing or invalid, skipping cost");
            return StageOutcome::Continue;
        };

        let (table, pricing_source) = self.pricing();
        let Some(cost) = compute_cost(&model, prompt, completion, &table) else {
            tracing::debug!(span_name = %span.name, model = %model, "no pricing for model");
            return StageOutcome::Continue;
        };
        let model_key = match_pricing(&model, &table).map(|(key, _)| key.to_owned());

        let cost_source = span
            .attribute(keys::USAGE_SOURCE)
            .and_then(AttributeValue::as_str)
            .unwrap_or(COST_SOURCE_UNKNOWN)
            .to_owned();

        span.set_attribute(keys::COST_USD, cost);
        span.set_attribute(keys::COST_SOURCE, cost_source);
        span.set_attribute(keys::PRICING_SOURCE, pricing_source.as_str());
        if let Some(model_key) = model_key {
            span.set_attribute(keys::PRICING_MODEL_KEY, model_key);
        }
        StageOutcome::Continue
    }

    fn name(&self) -> &str {
        "cost_annotator"
    }
}

/// Reads the first present of `primary` / `alias` as a non-negative count.
fn token_count(span: &Span, primary: &str, alias: &str) -> Option<u64> {
    let value = span.attribute(primary).or_else(|| span.attribute(alias))?;
    value.as_i64().and_then(|n| u64::try_from(n).ok())
}
