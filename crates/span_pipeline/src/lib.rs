//! Span Finalization Pipeline
//!
//! The tail end of a tracing SDK: takes a completed span, enriches it with
//! token usage and cost, applies rate limiting, and hands it to a bounded
//! queue that a background worker drains into an exporter in batches.
//!
//! ```text
//! finalize(span) ─► usage ─► cost ─► custom stages ─► rate limiter ─► queue ┄┄► worker ─► exporter
//!                   (synchronous, on the caller's thread)                      (Tokio task)
//! ```
//!
//! Finalization never fails. A span is either queued or dropped, and the
//! [`FinalizeOutcome`] says which and why. Delivery is at-most-once.
//!
//! # Example
//!
//! ```rust,ignore
//! use span_pipeline::{Pipeline, PipelineConfig, Span, SpanKind, StdoutExporter};
//! use std::sync::Arc;
//!
//! let pipeline = Pipeline::from_config(&PipelineConfig::default(), Arc::new(StdoutExporter::new(false)))?;
//! let span = Span::new(1, 1, 0, "chat", SpanKind::Client)
//!     .with_attribute("llm.model", "gpt-4o")
//!     .with_attribute("llm.prompt", "hello there");
//! pipeline.finalize(span);
//! pipeline.shutdown().await;
//! ```

mod invariants;

pub mod batch_stage;
pub mod config;
pub mod cost;
pub mod cost_annotator;
pub mod drop_policy;
pub mod error;
pub mod exporter;
pub mod keys;
pub mod logging_stage;
pub mod pipeline;
pub mod pricing;
pub mod rate_limiter;
pub mod sampler;
pub mod span;
pub mod stage;
pub mod tokens;
pub mod usage_estimator;

// Re-export main types
pub use batch_stage::{BatchConfig, BatchMetrics, BatchStage};
pub use config::PipelineConfig;
pub use cost::{compute_cost, match_pricing};
pub use cost_annotator::CostAnnotator;
pub use drop_policy::{Admission, DropPolicy};
pub use error::ValidationError;
pub use exporter::{ExportError, JsonFileExporter, NullExporter, SpanExporter, SpanExporterBoxed, StdoutExporter};
pub use logging_stage::LoggingStage;
pub use pipeline::{FinalizeOutcome, Pipeline, PipelineBuilder};
pub use pricing::{PricingEntry, PricingSource, PricingTable};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats, RateLimitingStage};
pub use sampler::Sampler;
pub use span::{AttributeLimits, AttributeValue, Scalar, Span, SpanBatch, SpanKind, SpanStatus};
pub use stage::{DropReason, SpanStage, StageOutcome};
pub use tokens::{Tokenizer, TokenizerRegistry};
pub use usage_estimator::UsageEstimator;
