//! Cost calculation based on model pricing and token usage.
//!
//! Pure functions: no state, no I/O, same inputs always give the same cost.

use crate::pricing::{PricingEntry, PricingTable};

/// Finds the pricing entry for `model`.
///
/// Tried in order: exact key, lower-cased key, then the longest key that the
/// lower-cased model starts with. The prefix rule covers version-suffixed
/// identifiers, e.g. `claude-3-opus-20240229` prices as `claude-3-opus`.
pub fn match_pricing<'a>(model: &str, table: &'a PricingTable) -> Option<(&'a str, &'a PricingEntry)> {
    let model = model.trim();
    if model.is_empty() {
        return None;
    }

    if let Some(hit) = table.get_key_value(model) {
        return Some(hit);
    }

    let lowered = model.to_lowercase();
    if let Some(hit) = table.get_key_value(&lowered) {
        return Some(hit);
    }

    let mut best: Option<(&'a str, &'a PricingEntry)> = None;
    for (key, entry) in table.iter() {
        if !lowered.starts_with(&key.to_lowercase()) {
            continue;
        }
        // Strictly longer only, so ties keep the first key in table order
        if best.map_or(true, |(best_key, _)| key.len() > best_key.len()) {
            best = Some((key, entry));
        }
    }
    best
}

/// Computes the USD cost of a call, rounded to 6 decimal places.
///
/// Returns `None` when no pricing entry matches the model.
pub fn compute_cost(
    model: &str,
    prompt_tokens: u64,
    completion_tokens: u64,
    table: &PricingTable,
) -> Option<f64> {
    let (_, entry) = match_pricing(model, table)?;
    let prompt_cost = (prompt_tokens as f64 / 1000.0) * entry.prompt;
    let completion_cost = (completion_tokens as f64 / 1000.0) * entry.completion;
    Some(round6(prompt_cost + completion_cost))
}

/// Rounds to 6 decimal places (micro-dollar precision)
pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
