//! The pipeline driver: runs finished spans through the stages in order.
//!
//! Stage order is fixed at build time:
//!
//! 1. usage estimator (so cost can see token counts)
//! 2. cost annotator
//! 3. custom stages, in registration order
//! 4. rate limiter
//! 5. batch stage (queue and background export)
//!
//! Everything up to the batch stage runs synchronously on the thread that
//! calls [`Pipeline::finalize`].

use crate::batch_stage::{BatchConfig, BatchMetrics, BatchStage};
use crate::config::PipelineConfig;
use crate::cost_annotator::CostAnnotator;
use crate::error::ValidationError;
use crate::exporter::SpanExporterBoxed;
use crate::logging_stage::LoggingStage;
use crate::pricing::{PricingSource, PricingTable};
use crate::rate_limiter::{RateLimiterConfig, RateLimiterStats, RateLimitingStage};
use crate::sampler::Sampler;
use crate::span::{AttributeLimits, Span};
use crate::stage::{DropReason, SpanStage, StageOutcome};
use crate::usage_estimator::UsageEstimator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// What happened to a finalized span
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Waiting in the queue for export
    Queued,
    /// Will never be exported
    Dropped(DropReason),
}

impl FinalizeOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Span finalization pipeline
pub struct Pipeline {
    stages: Vec<Arc<dyn SpanStage>>,
    batch: BatchStage,
    sampler: Sampler,
    attribute_limits: AttributeLimits,
    cost_annotator: Option<Arc<CostAnnotator>>,
    rate_limiter: Option<Arc<RateLimitingStage>>,
    shut_down: AtomicBool,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Builds the stages `config` asks for, exporting through `exporter`.
    ///
    /// Pricing is loaded from the defaults, the environment and the
    /// configured override. Must be called inside a Tokio runtime.
    pub fn from_config(
        config: &PipelineConfig,
        exporter: Arc<dyn SpanExporterBoxed>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;

        let mut builder = Self::builder()
            .sampler(Sampler::new(config.sample_rate)?)
            .batch_config(config.batch_config())
            .attribute_limits(config.attribute_limits);

        if config.estimate_usage {
            builder = builder.usage_estimator(UsageEstimator::with_builtin());
        }
        if config.annotate_cost {
            let (table, source) = PricingTable::load(config.pricing_override.clone());
            builder = builder.cost_annotator(CostAnnotator::new(table, source));
        }
        if config.log_spans {
            builder = builder.stage(LoggingStage::new());
        }
        if config.max_spans_per_second.is_some() {
            builder = builder.rate_limit(config.rate_limiter_config());
        }

        builder.build(exporter)
    }

    /// Runs a finished span through every stage and queues it for export.
    ///
    /// Never fails: the outcome only reports whether the span was queued. A
    /// span without an end time is ended now, and an unset status becomes `Ok`.
    pub fn finalize(&self, mut span: Span) -> FinalizeOutcome {
        if self.shut_down.load(Ordering::Acquire) {
            return FinalizeOutcome::Dropped(DropReason::ShutDown);
        }
        if !span.is_ended() {
            span.close();
            for stage in &self.stages {
                if stage.on_finalize(&mut span) == StageOutcome::Drop {
                    tracing::trace!(stage = stage.name(), span_name = %span.name, "span dropped by stage");
                    return FinalizeOutcome::Dropped(DropReason::Stage(stage.name().to_owned()));
                }
            }
        }

        match self.batch.enqueue(span) {
            Ok(()) => FinalizeOutcome::Queued,
            Err(reason) => FinalizeOutcome::Dropped(reason),
        }
    }

    /// Exports queued spans until the queue is empty or `timeout` elapses
    pub async fn force_flush(&self, timeout: Option<Duration>) -> bool {
        self.batch.force_flush(timeout).await
    }

    /// Flushes everything, shuts the exporter down and notifies every stage.
    ///
    /// Later calls are no-ops, and spans finalized afterwards are dropped.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.batch.shutdown().await;
        for stage in &self.stages {
            stage.shutdown();
        }
    }

    /// Swaps the pricing table; returns `false` without a cost annotator
    pub fn update_pricing(&self, table: PricingTable, source: PricingSource) -> bool {
        match &self.cost_annotator {
            Some(annotator) => {
                annotator.update_pricing(table, source);
                true
            }
            None => false,
        }
    }

    /// Sampler that span creators should consult at root-span creation
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Limits for converting JSON input with [`Span::set_json_attribute`]
    pub fn attribute_limits(&self) -> &AttributeLimits {
        &self.attribute_limits
    }

    pub fn rate_limiter_stats(&self) -> Option<RateLimiterStats> {
        self.rate_limiter.as_ref().map(|stage| stage.stats())
    }

    pub fn batch_metrics(&self) -> &BatchMetrics {
        self.batch.metrics()
    }

    /// Number of spans waiting for export
    pub fn queue_len(&self) -> usize {
        self.batch.queue_len()
    }

    /// Stage names in execution order, excluding the batch stage
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("batch", &self.batch)
            .field("sampler", &self.sampler)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Pipeline`]
#[derive(Default)]
pub struct PipelineBuilder {
    usage_estimator: Option<UsageEstimator>,
    cost_annotator: Option<CostAnnotator>,
    custom: Vec<Arc<dyn SpanStage>>,
    rate_limit: Option<RateLimiterConfig>,
    batch_config: BatchConfig,
    sampler: Sampler,
    attribute_limits: AttributeLimits,
    runtime: Option<Handle>,
}

impl PipelineBuilder {
    pub fn usage_estimator(mut self, estimator: UsageEstimator) -> Self {
        self.usage_estimator = Some(estimator);
        self
    }

    pub fn cost_annotator(mut self, annotator: CostAnnotator) -> Self {
        self.cost_annotator = Some(annotator);
        self
    }

    /// Adds a custom stage; custom stages run after cost annotation
    pub fn stage(mut self, stage: impl SpanStage + 'static) -> Self {
        self.custom.push(Arc::new(stage));
        self
    }

    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = config;
        self
    }

    pub fn sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn attribute_limits(mut self, limits: AttributeLimits) -> Self {
        self.attribute_limits = limits;
        self
    }

    /// Runtime for the export worker; defaults to the current one
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self, exporter: Arc<dyn SpanExporterBoxed>) -> Result<Pipeline, ValidationError> {
        self.batch_config.validate()?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ValidationError::NoRuntime)?,
        };

        let mut stages: Vec<Arc<dyn SpanStage>> = Vec::new();
        if let Some(estimator) = self.usage_estimator {
            stages.push(Arc::new(estimator));
        }
        let cost_annotator = self.cost_annotator.map(Arc::new);
        if let Some(annotator) = &cost_annotator {
            stages.push(Arc::clone(annotator) as Arc<dyn SpanStage>);
        }
        stages.extend(self.custom);
        let rate_limiter = self.rate_limit.map(|config| Arc::new(RateLimitingStage::new(config)));
        if let Some(limiter) = &rate_limiter {
            stages.push(Arc::clone(limiter) as Arc<dyn SpanStage>);
        }

        Ok(Pipeline {
            stages,
            batch: BatchStage::with_runtime(self.batch_config, exporter, &runtime),
            sampler: self.sampler,
            attribute_limits: self.attribute_limits,
            cost_annotator,
            rate_limiter,
            shut_down: AtomicBool::new(false),
        })
    }
}
