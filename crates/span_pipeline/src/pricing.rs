//! Model pricing tables and their layered loading.
//!
//! Prices change far more often than code, so the table is configuration:
//! built-in defaults, overlaid by a JSON document from the environment,
//! overlaid by an explicit override handed to the pipeline. The layer that
//! contributed last is recorded as the table's [`PricingSource`] and ends up
//! on every cost-annotated span.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Environment variable holding a JSON pricing overlay,
/// e.g. `{"my-model": {"prompt": 0.001, "completion": 0.002}}`.
pub const PRICING_ENV_VAR: &str = "SPAN_PIPELINE_PRICING_JSON";

/// Prices in USD per 1000 tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingEntry {
    /// Price per 1000 prompt (input) tokens
    pub prompt: f64,
    /// Price per 1000 completion (output) tokens
    pub completion: f64,
}

impl PricingEntry {
    pub const fn new(prompt: f64, completion: f64) -> Self {
        Self { prompt, completion }
    }
}

/// Which configuration layer produced a pricing table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    #[default]
    Default,
    Env,
    Override,
}

impl PricingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Env => "env",
            Self::Override => "override",
        }
    }
}

impl fmt::Display for PricingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping from model key to price.
///
/// Keys are matched against model names by [`crate::cost::match_pricing`],
/// so a key like `gpt-4o` also prices `gpt-4o-2024-08-06`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    entries: BTreeMap<String, PricingEntry>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in prices for common hosted models
    pub fn defaults() -> Self {
        [
            ("gpt-4", PricingEntry::new(0.03, 0.06)),
            ("gpt-4o", PricingEntry::new(0.005, 0.015)),
            ("gpt-4o-mini", PricingEntry::new(0.000_15, 0.000_6)),
            ("gpt-3.5-turbo", PricingEntry::new(0.001_5, 0.002)),
            ("claude-3-opus", PricingEntry::new(0.015, 0.075)),
            ("claude-3-sonnet", PricingEntry::new(0.003, 0.015)),
            ("claude-3-haiku", PricingEntry::new(0.000_25, 0.001_25)),
        ]
        .into_iter()
        .collect()
    }

    /// Parses a JSON object of `{"model": {"prompt": .., "completion": ..}}`
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: PricingEntry) -> Option<PricingEntry> {
        self.entries.insert(key.into(), entry)
    }

    pub fn get(&self, key: &str) -> Option<&PricingEntry> {
        self.entries.get(key)
    }

    /// Like [`PricingTable::get`], also returning the stored key
    pub fn get_key_value(&self, key: &str) -> Option<(&str, &PricingEntry)> {
        self.entries.get_key_value(key).map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PricingEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlays `other` on top of this table; entries in `other` win
    pub fn merge(&mut self, other: PricingTable) {
        self.entries.extend(other.entries);
    }

    /// Loads defaults, then [`PRICING_ENV_VAR`], then `override_table`.
    pub fn load(override_table: Option<PricingTable>) -> (Self, PricingSource) {
        let env_json = std::env::var(PRICING_ENV_VAR).ok();
        Self::load_layered(env_json.as_deref(), override_table)
    }

    /// Layering logic behind [`PricingTable::load`], without touching the
    /// process environment.
    ///
    /// An unparsable environment overlay is ignored with a warning; an empty
    /// override counts as no override.
    pub fn load_layered(
        env_json: Option<&str>,
        override_table: Option<PricingTable>,
    ) -> (Self, PricingSource) {
        let mut table = Self::defaults();
        let mut source = PricingSource::Default;

        if let Some(json) = env_json.map(str::trim).filter(|s| !s.is_empty()) {
            match Self::from_json_str(json) {
                Ok(env_table) => {
                    table.merge(env_table);
                    source = PricingSource::Env;
                }
                Err(err) => {
                    tracing::warn!(
                        env_var = PRICING_ENV_VAR,
                        error = %err,
                        "ignoring unparsable pricing overlay"
                    );
                }
            }
        }

        if let Some(override_table) = override_table.filter(|t| !t.is_empty()) {
            table.merge(override_table);
            source = PricingSource::Override;
        }

        (table, source)
    }
}

impl<K: Into<String>> FromIterator<(K, PricingEntry)> for PricingTable {
    fn from_iter<I: IntoIterator<Item = (K, PricingEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
