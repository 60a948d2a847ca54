//! The stage abstraction every finalization step implements.
//!
//! A finished span visits each registered stage in order. A stage may read
//! and mutate the span, and may stop it from travelling further by returning
//! [`StageOutcome::Drop`]. Stages never fail: anything that goes wrong inside
//! one is logged and the span continues unchanged.

/// What the pipeline should do with a span after a stage has seen it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Hand the span to the next stage
    Continue,
    /// Stop processing; the span is never exported
    Drop,
}

/// A single step of span finalization.
///
/// Implementations must be cheap and non-blocking unless they document
/// otherwise (the rate limiter may block for a bounded time), since they run
/// on the thread that finished the span.
pub trait SpanStage: Send + Sync {
    /// Processes one finished span
    fn on_finalize(&self, span: &mut crate::span::Span) -> StageOutcome;

    /// Returns the stage name used in logs and drop reasons
    fn name(&self) -> &str;

    /// Called once when the owning pipeline shuts down
    fn shutdown(&self) {}
}

/// Why a span never reached the exporter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The span was already finalized once
    AlreadyEnded,
    /// The named stage returned [`StageOutcome::Drop`]
    Stage(String),
    /// The trace was not sampled
    Unsampled,
    /// The queue was full and the drop policy rejected the span
    QueueFull,
    /// The pipeline has been shut down
    ShutDown,
}
