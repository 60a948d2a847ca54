//! # Span Finalization Pipeline Demo
//!
//! End-to-end run of the pipeline against a simulated backend.
//!
//! ## Features Demonstrated
//!
//! ### 1. Enrichment
//! - Token usage estimated from `llm.messages` / `llm.prompt` / `llm.completion`
//!   when the provider did not report it
//! - Cost annotation from the layered pricing table
//!
//! ### 2. Native Async Traits
//! - Custom `SpanExporter` implementation returning `impl Future<...> + Send`
//! - `SimulatedBackendExporter` with configurable failure rate and latency
//!
//! ### 3. Multi-Producer Workflow
//! - Plain OS threads calling `Pipeline::finalize` concurrently
//! - Head sampling on root spans, children inherit the decision
//!
//! ### 4. Admission Control
//! - Token-bucket rate limiting with a bounded block
//! - Bounded export queue with a drop policy
//!
//! ### 5. Graceful Shutdown
//! - Final flush of everything still queued
//! - Statistics dashboard
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (2 producers, 50 traces each)
//! cargo run -p span_pipeline --bin demo --release -- --quick
//!
//! # Full mode (8 producers, 250 traces each)
//! cargo run -p span_pipeline --bin demo --release
//!
//! # Log every exported span
//! RUST_LOG=span_pipeline=debug cargo run -p span_pipeline --bin demo -- --log-spans
//! ```

use rand::Rng;
use span_pipeline::keys;
use span_pipeline::{
    ExportError, FinalizeOutcome, Pipeline, PipelineConfig, Span, SpanBatch, SpanExporter, SpanKind,
    SpanStatus,
};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CUSTOM EXPORTER
// =============================================================================

/// A simulated backend that occasionally fails
struct SimulatedBackendExporter {
    failure_rate: f64,
    latency: Duration,
    attempts: AtomicU64,
    delivered_spans: AtomicU64,
    failures: AtomicU64,
    total_cost_micros: AtomicU64,
}

impl SimulatedBackendExporter {
    fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate,
            latency,
            attempts: AtomicU64::new(0),
            delivered_spans: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_cost_micros: AtomicU64::new(0),
        }
    }
}

impl SpanExporter for SimulatedBackendExporter {
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let fail = rand::thread_rng().gen::<f64>() < self.failure_rate;

        async move {
            tokio::time::sleep(self.latency).await;
            if fail {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(ExportError::Transport(format!(
                    "simulated backend failure (batch of {} spans)",
                    batch.len()
                )));
            }

            let cost_micros: u64 = batch
                .spans
                .iter()
                .filter_map(|span| span.attribute(keys::COST_USD).and_then(|v| v.as_f64()))
                .map(|usd| (usd * 1_000_000.0).round() as u64)
                .sum();
            self.total_cost_micros.fetch_add(cost_micros, Ordering::Relaxed);
            self.delivered_spans
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            Ok(())
        }
    }

    fn name(&self) -> &str {
        "simulated-backend"
    }
}

// =============================================================================
// SPAN GENERATION
// =============================================================================

const MODELS: [&str; 5] = [
    "gpt-4o-2024-08-06",
    "gpt-4o-mini",
    "claude-3-opus-20240229",
    "claude-3-haiku-20240307",
    "internal-llm-v2",
];

const PROMPTS: [&str; 4] = [
    "Summarize the quarterly report in three sentences",
    "Translate the following paragraph into French",
    "What is the capital of Australia",
    "Write a haiku about ring buffers",
];

/// One trace: a root request span and an LLM call underneath it.
///
/// Returns the spans child first, the order they would finish in.
fn generate_trace(pipeline: &Pipeline, trace_id: u128, rng: &mut impl Rng) -> [Span; 2] {
    let mut root = Span::new(trace_id, rng.gen(), 0, "handle_request", SpanKind::Server)
        .with_attribute("http.method", "POST")
        .with_attribute("http.route", "/v1/assist");
    let sampled = pipeline.sampler().sample_root(&mut root);

    let model = MODELS[rng.gen_range(0..MODELS.len())];
    let prompt = PROMPTS[rng.gen_range(0..PROMPTS.len())];
    let mut llm = Span::new(trace_id, rng.gen(), root.span_id, "llm.chat", SpanKind::Client)
        .with_sampled(sampled)
        .with_attribute(keys::LLM_MODEL, model);

    if rng.gen_bool(0.5) {
        // Provider reported usage
        llm.set_attribute(keys::USAGE_PROMPT_TOKENS, rng.gen_range(20..2000_i64));
        llm.set_attribute(keys::USAGE_COMPLETION_TOKENS, rng.gen_range(10..800_i64));
        llm.set_attribute(keys::USAGE_SOURCE, "provider_usage");
    } else {
        let messages = serde_json::json!([
            {"role": "system", "content": "You are a helpful assistant"},
            {"role": "user", "content": prompt},
        ]);
        llm.set_attribute(keys::LLM_MESSAGES, messages.to_string());
        llm.set_attribute(keys::LLM_COMPLETION, "Here is a short and helpful answer");
    }

    if rng.gen_bool(0.05) {
        llm.set_status(SpanStatus::Error, Some("upstream timeout".to_string()));
    }
    [llm, root]
}

#[derive(Default)]
struct ProducerTally {
    queued: u64,
    dropped: u64,
}

// =============================================================================
// MAIN APPLICATION
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let quick = args.iter().any(|a| a == "--quick");
    let log_spans = args.iter().any(|a| a == "--log-spans");

    let (num_producers, traces_per_producer, rate) = if quick { (2, 50, 150.0) } else { (8, 250, 1500.0) };

    println!();
    println!("=== Span Finalization Pipeline Demo ===");
    println!("   Mode: {}", if quick { "quick" } else { "full" });
    println!("   Producers: {num_producers}");
    println!("   Traces per producer: {traces_per_producer}");
    println!("   Rate limit: {rate} spans/s");
    println!();

    // =========================================================================
    // PHASE 1: Build the pipeline
    // =========================================================================

    let backend = Arc::new(SimulatedBackendExporter::new(0.1, Duration::from_millis(3)));
    let config = PipelineConfig::default()
        .with_sample_rate(0.9)
        .with_rate_limit(rate, Duration::from_millis(20))
        .with_max_queue_size(2048)
        .with_max_export_batch_size(128)
        .with_schedule_delay(Duration::from_millis(200))
        .with_span_logging(log_spans);
    let pipeline = Arc::new(Pipeline::from_config(&config, backend.clone())?);
    println!("Phase 1: stages {:?}\n", pipeline.stage_names());

    // =========================================================================
    // PHASE 2: Concurrent producers
    // =========================================================================

    println!("Phase 2: finalizing spans from {num_producers} threads\n");
    let started = Instant::now();

    let producers: Vec<_> = (0..num_producers)
        .map(|producer| {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut tally = ProducerTally::default();
                for i in 0..traces_per_producer {
                    let trace_id = (u128::from(producer as u32) << 64) | u128::from(i as u32 + 1);
                    for span in generate_trace(&pipeline, trace_id, &mut rng) {
                        match pipeline.finalize(span) {
                            FinalizeOutcome::Queued => tally.queued += 1,
                            FinalizeOutcome::Dropped(_) => tally.dropped += 1,
                        }
                    }
                }
                tally
            })
        })
        .collect();

    let mut queued = 0;
    let mut dropped = 0;
    for producer in producers {
        let tally = producer.join().map_err(|_| "producer thread panicked")?;
        queued += tally.queued;
        dropped += tally.dropped;
    }
    let produce_elapsed = started.elapsed();

    // =========================================================================
    // PHASE 3: Shutdown
    // =========================================================================

    println!("Phase 3: shutting down (queue length {})\n", pipeline.queue_len());
    pipeline.shutdown().await;
    let total_elapsed = started.elapsed();

    // =========================================================================
    // FINAL STATISTICS
    // =========================================================================

    let metrics = pipeline.batch_metrics();
    println!("=== Final Statistics ===");
    println!("   Finalized:            {}", queued + dropped);
    println!("   Queued:               {queued}");
    println!("   Dropped:              {dropped}");
    println!("     unsampled:          {}", metrics.unsampled());
    println!("     queue overflow:     {}", metrics.dropped_by_policy());
    if let Some(stats) = pipeline.rate_limiter_stats() {
        println!(
            "     rate limited:       {} ({:.1}%), {} admitted after blocking",
            stats.dropped,
            stats.drop_rate_percent(),
            stats.blocked
        );
    }
    println!("   Batches exported:     {}", metrics.batches_exported());
    println!("   Spans exported:       {}", metrics.spans_exported());
    println!(
        "   Export errors:        {} ({} spans lost)",
        metrics.export_errors(),
        metrics.spans_failed()
    );
    println!(
        "   Backend:              {} attempts, {} failures, {} spans",
        backend.attempts.load(Ordering::Relaxed),
        backend.failures.load(Ordering::Relaxed),
        backend.delivered_spans.load(Ordering::Relaxed)
    );
    println!(
        "   Estimated spend:      ${:.6}",
        backend.total_cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    );
    println!(
        "   Throughput:           {:.0} spans/s (producing), {:?} total",
        (queued + dropped) as f64 / produce_elapsed.as_secs_f64().max(f64::EPSILON),
        total_elapsed
    );
    println!();

    Ok(())
}
