use span_pipeline::exporter::{ExportError, SpanExporter};
use span_pipeline::keys;
use span_pipeline::{
    AttributeValue, BatchConfig, CostAnnotator, DropPolicy, DropReason, FinalizeOutcome, JsonFileExporter, Pipeline,
    PipelineConfig, PricingTable, RateLimiterConfig, Span, SpanBatch, SpanKind, TokenizerRegistry, UsageEstimator,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every exported batch
#[derive(Default)]
struct RecordingExporter {
    batches: Mutex<Vec<Vec<Span>>>,
    shutdowns: AtomicUsize,
}

impl RecordingExporter {
    fn exported_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    fn all_spans(&self) -> Vec<Span> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

impl SpanExporter for RecordingExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.batches.lock().unwrap().push(batch.spans);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fails the first `failures` calls, then records like `RecordingExporter`
struct FlakyExporter {
    failures: AtomicUsize,
    inner: RecordingExporter,
}

impl FlakyExporter {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            inner: RecordingExporter::default(),
        }
    }
}

impl SpanExporter for FlakyExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ExportError::Timeout);
        }
        self.inner.export(batch).await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

fn quiet_config() -> PipelineConfig {
    PipelineConfig::default().with_schedule_delay(Duration::from_secs(60))
}

fn f64_attr(span: &Span, key: &str) -> Option<f64> {
    span.attribute(key).and_then(AttributeValue::as_f64)
}

fn str_attr<'a>(span: &'a Span, key: &str) -> Option<&'a str> {
    span.attribute(key).and_then(AttributeValue::as_str)
}

#[tokio::test]
async fn test_end_to_end_provider_usage_cost() {
    let exporter = Arc::new(RecordingExporter::default());
    let pipeline = Pipeline::from_config(&quiet_config(), exporter.clone()).unwrap();

    let span = Span::new(7, 1, 0, "anthropic.messages", SpanKind::Client)
        .with_attribute(keys::LLM_MODEL, "claude-3-opus-20240229")
        .with_attribute(keys::USAGE_PROMPT_TOKENS, 100)
        .with_attribute(keys::USAGE_COMPLETION_TOKENS, 50)
        .with_attribute(keys::USAGE_SOURCE, "provider_usage");
    assert_eq!(pipeline.finalize(span), FinalizeOutcome::Queued);
    pipeline.shutdown().await;

    let spans = exporter.all_spans();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];

    let expected = ((100.0 / 1000.0 * 0.015 + 50.0 / 1000.0 * 0.075) * 1_000_000.0_f64).round() / 1_000_000.0;
    assert_eq!(f64_attr(span, keys::COST_USD), Some(expected));
    assert_eq!(str_attr(span, keys::PRICING_MODEL_KEY), Some("claude-3-opus"));
    assert_eq!(str_attr(span, keys::COST_SOURCE), Some("provider_usage"));
    // Provider counts were complete, so the estimator left them alone
    assert!(!span.has_attribute(keys::USAGE_PROMPT_SOURCE));
    assert_eq!(str_attr(span, keys::USAGE_SOURCE), Some("provider_usage"));
}

#[tokio::test]
async fn test_estimated_usage_feeds_cost() {
    let exporter = Arc::new(RecordingExporter::default());
    let pipeline = Pipeline::builder()
        .usage_estimator(UsageEstimator::new(TokenizerRegistry::new()))
        .cost_annotator(CostAnnotator::default())
        .batch_config(BatchConfig::default().with_schedule_delay(Duration::from_secs(60)))
        .build(exporter.clone())
        .unwrap();

    let messages = r#"[{"role": "user", "content": "summarize this document please"}]"#;
    let span = Span::new(1, 1, 0, "openai.chat", SpanKind::Client)
        .with_attribute(keys::LLM_MODEL, "gpt-4o-2024-08-06")
        .with_attribute(keys::LLM_MESSAGES, messages)
        .with_attribute(keys::LLM_COMPLETION, "Here is a summary");
    pipeline.finalize(span);
    pipeline.shutdown().await;

    let span = &exporter.all_spans()[0];
    // "user: summarize this document please" and "Here is a summary"
    assert_eq!(span.attribute(keys::USAGE_PROMPT_TOKENS).and_then(AttributeValue::as_i64), Some(5));
    assert_eq!(span.attribute(keys::USAGE_COMPLETION_TOKENS).and_then(AttributeValue::as_i64), Some(4));
    assert_eq!(str_attr(span, keys::USAGE_SOURCE), Some("heuristic"));
    assert_eq!(str_attr(span, keys::COST_SOURCE), Some("heuristic"));
    assert_eq!(str_attr(span, keys::PRICING_MODEL_KEY), Some("gpt-4o"));
    // 5/1000 * 0.005 + 4/1000 * 0.015
    assert_eq!(f64_attr(span, keys::COST_USD), Some(0.000_085));
}

#[tokio::test]
async fn test_cost_annotation_is_idempotent_across_pipelines() {
    let first = Arc::new(RecordingExporter::default());
    let pipeline = Pipeline::from_config(&quiet_config(), first.clone()).unwrap();
    pipeline.finalize(
        Span::new(1, 1, 0, "llm", SpanKind::Client)
            .with_attribute(keys::LLM_MODEL, "gpt-4")
            .with_attribute(keys::USAGE_PROMPT_TOKENS, 1000)
            .with_attribute(keys::USAGE_COMPLETION_TOKENS, 1000),
    );
    pipeline.shutdown().await;
    let annotated = first.all_spans().remove(0);
    let cost = f64_attr(&annotated, keys::COST_USD);

    // Re-run the enrichment on a fresh copy of the exported attributes
    let mut replay = Span::new(1, 2, 0, "llm", SpanKind::Client);
    for (key, value) in annotated.attributes() {
        replay.set_attribute(key.clone(), value.clone());
    }
    let second = Arc::new(RecordingExporter::default());
    let config = quiet_config().with_pricing_override(
        [("gpt-4", span_pipeline::PricingEntry::new(9.0, 9.0))].into_iter().collect(),
    );
    let pipeline = Pipeline::from_config(&config, second.clone()).unwrap();
    pipeline.finalize(replay);
    pipeline.shutdown().await;

    assert_eq!(f64_attr(&second.all_spans()[0], keys::COST_USD), cost);
}

#[tokio::test]
async fn test_batches_of_five_in_fifo_order() {
    let exporter = Arc::new(RecordingExporter::default());
    let config = quiet_config().with_max_export_batch_size(5);
    let pipeline = Pipeline::from_config(&config, exporter.clone()).unwrap();

    for i in 0..10 {
        pipeline.finalize(Span::new(1, i, 0, format!("op-{i}"), SpanKind::Internal));
    }
    assert!(pipeline.force_flush(None).await);

    assert_eq!(exporter.batch_sizes(), vec![5, 5]);
    let ids: Vec<u64> = exporter.all_spans().iter().map(|s| s.span_id).collect();
    assert_eq!(ids, (0..10).collect::<Vec<_>>());
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unsampled_spans_are_never_exported() {
    let exporter = Arc::new(RecordingExporter::default());
    let pipeline = Pipeline::from_config(&quiet_config(), exporter.clone()).unwrap();

    let outcome = pipeline.finalize(Span::new(1, 1, 0, "dropped", SpanKind::Internal).with_sampled(false));
    assert_eq!(outcome, FinalizeOutcome::Dropped(DropReason::Unsampled));
    pipeline.finalize(Span::new(2, 2, 0, "kept", SpanKind::Internal));
    pipeline.shutdown().await;

    let names: Vec<String> = exporter.all_spans().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["kept".to_string()]);
    assert_eq!(pipeline.batch_metrics().unsampled(), 1);
}

#[tokio::test]
async fn test_finalizing_a_clone_of_a_queued_span_is_a_duplicate() {
    let exporter = Arc::new(RecordingExporter::default());
    let pipeline = Pipeline::from_config(&quiet_config(), exporter.clone()).unwrap();

    pipeline.finalize(Span::new(1, 1, 0, "once", SpanKind::Internal));
    pipeline.force_flush(None).await;

    let exported = exporter.all_spans().remove(0);
    assert_eq!(
        pipeline.finalize(exported),
        FinalizeOutcome::Dropped(DropReason::AlreadyEnded)
    );
    pipeline.shutdown().await;
    assert_eq!(exporter.exported_count(), 1);
    assert_eq!(pipeline.batch_metrics().duplicates(), 1);
}

#[tokio::test]
async fn test_rate_limit_immediate_only() {
    let exporter = Arc::new(RecordingExporter::default());
    let config = quiet_config().with_rate_limit(2.0, Duration::ZERO);
    let pipeline = Pipeline::from_config(&config, exporter.clone()).unwrap();

    let outcomes: Vec<FinalizeOutcome> = (0..5)
        .map(|i| pipeline.finalize(Span::new(1, i, 0, "burst", SpanKind::Internal)))
        .collect();
    let queued = outcomes.iter().filter(|o| o.is_queued()).count();
    assert_eq!(queued, 2);
    assert!(outcomes
        .iter()
        .filter(|o| !o.is_queued())
        .all(|o| *o == FinalizeOutcome::Dropped(DropReason::Stage("rate_limiter".to_string()))));

    let stats = pipeline.rate_limiter_stats().unwrap();
    assert_eq!((stats.total, stats.dropped), (5, 3));

    pipeline.shutdown().await;
    assert_eq!(exporter.exported_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_blocking_recovers() {
    let exporter = Arc::new(RecordingExporter::default());
    // Bucket of 20, refilled one token every 50ms
    let limited = RateLimiterConfig::new(20.0).with_max_block(Duration::from_millis(200));
    let pipeline = Arc::new(
        Pipeline::builder()
            .rate_limit(limited)
            .batch_config(BatchConfig::default().with_schedule_delay(Duration::from_secs(60)))
            .build(exporter.clone())
            .unwrap(),
    );

    // Blocking happens on the caller's thread, so keep it off the runtime workers
    let caller = Arc::clone(&pipeline);
    let queued = tokio::task::spawn_blocking(move || {
        (0..23)
            .map(|i| caller.finalize(Span::new(1, i, 0, "burst", SpanKind::Internal)))
            .filter(FinalizeOutcome::is_queued)
            .count()
    })
    .await
    .unwrap();

    assert_eq!(queued, 23);
    let stats = pipeline.rate_limiter_stats().unwrap();
    assert_eq!(stats.dropped, 0);
    assert!(stats.blocked >= 1, "blocked {}", stats.blocked);

    pipeline.shutdown().await;
    assert_eq!(exporter.exported_count(), 23);
}

#[tokio::test]
async fn test_drop_newest_under_overflow() {
    let exporter = Arc::new(RecordingExporter::default());
    let config = quiet_config()
        .with_max_queue_size(4)
        .with_max_export_batch_size(4)
        .with_drop_policy(DropPolicy::DropNewest);
    let pipeline = Pipeline::from_config(&config, exporter.clone()).unwrap();

    // Fill the queue from a plain thread so the worker cannot drain in between
    let outcomes: Vec<FinalizeOutcome> = std::thread::scope(|scope| {
        scope
            .spawn(|| {
                (0..6)
                    .map(|i| pipeline.finalize(Span::new(1, i, 0, "op", SpanKind::Internal)))
                    .collect()
            })
            .join()
            .unwrap()
    });
    assert!(outcomes[..4].iter().all(FinalizeOutcome::is_queued));
    assert_eq!(outcomes[4], FinalizeOutcome::Dropped(DropReason::QueueFull));

    pipeline.shutdown().await;
    let ids: Vec<u64> = exporter.all_spans().iter().map(|s| s.span_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_export_failures_do_not_block_later_batches() {
    let exporter = Arc::new(FlakyExporter::new(1));
    let config = quiet_config().with_max_export_batch_size(2);
    let pipeline = Pipeline::from_config(&config, exporter.clone()).unwrap();

    for i in 0..4 {
        pipeline.finalize(Span::new(1, i, 0, "op", SpanKind::Internal));
    }
    assert!(pipeline.force_flush(None).await);

    // First batch was lost, second delivered
    let ids: Vec<u64> = exporter.inner.all_spans().iter().map(|s| s.span_id).collect();
    assert_eq!(ids, vec![2, 3]);
    assert_eq!(pipeline.batch_metrics().export_errors(), 1);
    assert_eq!(pipeline.batch_metrics().spans_exported(), 2);
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_finalize_then_shutdown_exports_everything() {
    let exporter = Arc::new(RecordingExporter::default());
    let config = PipelineConfig::default()
        .with_max_queue_size(10_000)
        .with_max_export_batch_size(100)
        .with_schedule_delay(Duration::from_millis(10));
    let pipeline = Arc::new(Pipeline::from_config(&config, exporter.clone()).unwrap());

    let producers: Vec<_> = (0..4u64)
        .map(|producer| {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || {
                for i in 0..500 {
                    let span = Span::new(u128::from(producer) + 1, producer * 10_000 + i, 0, "work", SpanKind::Internal)
                        .with_attribute(keys::LLM_MODEL, "gpt-4o-mini")
                        .with_attribute(keys::LLM_PROMPT, "count these four words");
                    assert!(pipeline.finalize(span).is_queued());
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    pipeline.shutdown().await;
    assert_eq!(exporter.exported_count(), 2000);
    assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
    assert!(exporter.batch_sizes().iter().all(|&n| n <= 100));

    // Per-producer order is preserved through the single FIFO queue
    let spans = exporter.all_spans();
    for producer in 0..4u64 {
        let ids: Vec<u64> = spans
            .iter()
            .filter(|s| s.trace_id == u128::from(producer) + 1)
            .map(|s| s.span_id)
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }
}

#[tokio::test]
async fn test_pricing_override_from_json_config() {
    let exporter = Arc::new(RecordingExporter::default());
    let config = PipelineConfig::from_json_str(
        r#"{
            "schedule_delay_ms": 60000,
            "estimate_usage": false,
            "pricing_override": {"house-model": {"prompt": 0.5, "completion": 1.0}}
        }"#,
    )
    .unwrap();
    let pipeline = Pipeline::from_config(&config, exporter.clone()).unwrap();
    assert_eq!(pipeline.stage_names(), vec!["cost_annotator"]);

    pipeline.finalize(
        Span::new(1, 1, 0, "llm", SpanKind::Client)
            .with_attribute(keys::LLM_MODEL, "house-model-v3")
            .with_attribute(keys::USAGE_INPUT_TOKENS, 2000)
            .with_attribute(keys::USAGE_OUTPUT_TOKENS, 1000),
    );
    pipeline.shutdown().await;

    let span = &exporter.all_spans()[0];
    assert_eq!(f64_attr(span, keys::COST_USD), Some(2.0));
    assert_eq!(str_attr(span, keys::PRICING_SOURCE), Some("override"));
    assert_eq!(str_attr(span, keys::PRICING_MODEL_KEY), Some("house-model"));
}

#[test]
fn test_default_pricing_table_is_stable() {
    let table = PricingTable::defaults();
    assert_eq!(
        span_pipeline::compute_cost("gpt-4o-2024-08-06", 1000, 1000, &table),
        span_pipeline::compute_cost("gpt-4o", 1000, 1000, &table)
    );
}

#[tokio::test]
async fn test_json_file_exporter_writes_enriched_lines() {
    let path = std::env::temp_dir().join(format!("span_pipeline_it_{}.jsonl", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let pipeline = Pipeline::from_config(&quiet_config(), Arc::new(JsonFileExporter::new(&path))).unwrap();
    for i in 0..3 {
        pipeline.finalize(
            Span::new(9, i, 0, "llm", SpanKind::Client)
                .with_attribute(keys::LLM_MODEL, "gpt-4")
                .with_attribute(keys::USAGE_PROMPT_TOKENS, 1000)
                .with_attribute(keys::USAGE_COMPLETION_TOKENS, 500),
        );
    }
    pipeline.shutdown().await;

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line["span_id"], i as u64);
        assert_eq!(line["attributes"][keys::COST_USD], 0.06);
        assert_eq!(line["status"], "Ok");
    }
    let _ = std::fs::remove_file(&path);
}
