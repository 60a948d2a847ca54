use crate::keys;
use crate::span::{AttributeValue, Span};
use crate::stage::{SpanStage, StageOutcome};

/// Logs a one-line summary of every finalized span at `info` level.
///
/// Useful during local development when no exporter backend is running.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStage;

impl LoggingStage {
    pub fn new() -> Self {
        Self
    }
}

impl SpanStage for LoggingStage {
    fn on_finalize(&self, span: &mut Span) -> StageOutcome {
        let cost = span.attribute(keys::COST_USD).and_then(AttributeValue::as_f64);
        let trace_id = format!("{:032x}", span.trace_id);
        let span_id = format!("{:016x}", span.span_id);
        tracing::info!(
            trace_id = %trace_id,
            span_id = %span_id,
            span_name = %span.name,
            status = ?span.status(),
            duration_ns = span.duration_nanos(),
            attributes = span.attributes().len(),
            cost_usd = cost,
            "span finalized"
        );
        StageOutcome::Continue
    }

    fn name(&self) -> &str {
        "logging"
    }
}
