//! Configuration for pipeline construction.

use crate::batch_stage::BatchConfig;
use crate::drop_policy::DropPolicy;
use crate::error::ValidationError;
use crate::pricing::PricingTable;
use crate::rate_limiter::RateLimiterConfig;
use crate::span::AttributeLimits;
use serde::Deserialize;
use std::time::Duration;

/// Everything needed to build a [`crate::Pipeline`].
///
/// Deserializable from JSON; absent fields take their defaults, so `{}` is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Probability of keeping a new trace, within `[0.0, 1.0]`.
    ///
    /// Default: 1.0
    pub sample_rate: f64,

    /// Sustained admission rate for finished spans; unset means unlimited.
    ///
    /// Default: None
    pub max_spans_per_second: Option<f64>,

    /// How long a finalizing thread may wait for a rate limiter token.
    ///
    /// Default: 100
    pub max_block_ms: u64,

    /// Default: 5000
    pub max_queue_size: usize,

    /// Default: 512
    pub max_export_batch_size: usize,

    /// Interval between scheduled exports.
    ///
    /// Default: 5000
    pub schedule_delay_ms: u64,

    /// Default: `drop_oldest`
    pub drop_policy: DropPolicy,

    /// Register the usage estimator stage.
    ///
    /// Default: true
    pub estimate_usage: bool,

    /// Register the cost annotator stage.
    ///
    /// Default: true
    pub annotate_cost: bool,

    /// Register the logging stage.
    ///
    /// Default: false
    pub log_spans: bool,

    /// Limits for attribute values converted from JSON input.
    pub attribute_limits: AttributeLimits,

    /// Pricing entries that take precedence over the defaults and the
    /// environment overlay.
    pub pricing_override: Option<PricingTable>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            max_spans_per_second: None,
            max_block_ms: 100,
            max_queue_size: 5000,
            max_export_batch_size: 512,
            schedule_delay_ms: 5000,
            drop_policy: DropPolicy::default(),
            estimate_usage: true,
            annotate_cost: true,
            log_spans: false,
            attribute_limits: AttributeLimits::default(),
            pricing_override: None,
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges that the type system cannot express.
    ///
    /// A non-positive `max_spans_per_second` is accepted and disables limiting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ValidationError::SampleRate(self.sample_rate));
        }
        self.batch_config().validate()?;
        if self.attribute_limits.max_string_len == 0 {
            return Err(ValidationError::NonPositive {
                field: "attribute_limits.max_string_len",
            });
        }
        Ok(())
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_queue_size: self.max_queue_size,
            max_export_batch_size: self.max_export_batch_size,
            schedule_delay: Duration::from_millis(self.schedule_delay_ms),
            drop_policy: self.drop_policy,
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_spans_per_second: self.max_spans_per_second,
            max_block: Duration::from_millis(self.max_block_ms),
        }
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Sets the rate limit and the longest a caller may block for a token.
    pub fn with_rate_limit(mut self, max_spans_per_second: f64, max_block: Duration) -> Self {
        self.max_spans_per_second = Some(max_spans_per_second);
        self.max_block_ms = u64::try_from(max_block.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size;
        self
    }

    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    pub fn with_usage_estimation(mut self, enabled: bool) -> Self {
        self.estimate_usage = enabled;
        self
    }

    pub fn with_cost_annotation(mut self, enabled: bool) -> Self {
        self.annotate_cost = enabled;
        self
    }

    pub fn with_span_logging(mut self, enabled: bool) -> Self {
        self.log_spans = enabled;
        self
    }

    pub fn with_pricing_override(mut self, table: PricingTable) -> Self {
        self.pricing_override = Some(table);
        self
    }
}
