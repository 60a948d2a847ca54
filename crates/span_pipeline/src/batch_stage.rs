//! Batch Stage - bounded queue plus background export worker
//!
//! Finalizing threads push spans into a mutex-protected `VecDeque`; a single
//! Tokio task drains it in batches and hands them to the exporter. Callers
//! never wait on export I/O: when the queue is full the [`DropPolicy`]
//! decides which span is lost.
//!
//! # Delivery
//!
//! At-most-once. A batch leaves the queue when it is drained; if the export
//! fails the batch is logged and discarded, never re-queued.
//!
//! # Worker schedule
//!
//! The worker exports one batch every `schedule_delay`. Every enqueue wakes
//! it, and whenever at least `max_export_batch_size` spans are waiting it
//! exports full batches immediately instead of waiting for the next tick.

use crate::drop_policy::{Admission, DropPolicy};
use crate::error::ValidationError;
use crate::exporter::SpanExporterBoxed;
use crate::invariants::debug_assert_sealed;
use crate::span::{Span, SpanBatch};
use crate::stage::DropReason;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for the batch stage
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of spans buffered before the drop policy applies
    pub max_queue_size: usize,
    /// Maximum number of spans per exporter call
    pub max_export_batch_size: usize,
    /// Interval between scheduled exports
    pub schedule_delay: Duration,
    /// What to do when the queue is full
    pub drop_policy: DropPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 5000,
            max_export_batch_size: 512,
            schedule_delay: Duration::from_secs(5),
            drop_policy: DropPolicy::default(),
        }
    }
}

impl BatchConfig {
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size;
        self
    }

    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay = delay;
        self
    }

    pub fn with_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_queue_size == 0 {
            return Err(ValidationError::NonPositive { field: "max_queue_size" });
        }
        if self.max_export_batch_size == 0 {
            return Err(ValidationError::NonPositive {
                field: "max_export_batch_size",
            });
        }
        if self.schedule_delay.is_zero() {
            return Err(ValidationError::NonPositive { field: "schedule_delay" });
        }
        Ok(())
    }
}

/// Thread-safe counters of the batch stage (uses atomics)
#[derive(Debug, Default)]
pub struct BatchMetrics {
    queued: AtomicU64,
    dropped_by_policy: AtomicU64,
    unsampled: AtomicU64,
    duplicates: AtomicU64,
    spans_exported: AtomicU64,
    batches_exported: AtomicU64,
    export_errors: AtomicU64,
    spans_failed: AtomicU64,
}

impl BatchMetrics {
    /// Spans accepted into the queue
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Spans lost to the drop policy (evicted or rejected)
    pub fn dropped_by_policy(&self) -> u64 {
        self.dropped_by_policy.load(Ordering::Relaxed)
    }

    pub fn unsampled(&self) -> u64 {
        self.unsampled.load(Ordering::Relaxed)
    }

    /// Spans offered a second time
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    /// Spans discarded because their batch failed to export
    pub fn spans_failed(&self) -> u64 {
        self.spans_failed.load(Ordering::Relaxed)
    }

    fn record_success(&self, span_count: u64) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, span_count: u64) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
        self.spans_failed.fetch_add(span_count, Ordering::Relaxed);
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared between callers and the worker task
struct Shared {
    queue: Mutex<VecDeque<Span>>,
    notify: Notify,
    shutdown: AtomicBool,
    /// Serializes exporter calls between the worker and `force_flush`
    export_lock: tokio::sync::Mutex<()>,
    exporter: Arc<dyn SpanExporterBoxed>,
    metrics: BatchMetrics,
    config: BatchConfig,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Span>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drains and exports at most one batch. Returns `false` if the queue was empty.
    async fn export_once(&self) -> bool {
        let _guard = self.export_lock.lock().await;

        let spans: Vec<Span> = {
            let mut queue = self.lock_queue();
            let n = queue.len().min(self.config.max_export_batch_size);
            queue.drain(..n).collect()
        };
        if spans.is_empty() {
            return false;
        }

        let span_count = spans.len() as u64;
        match self.exporter.export_boxed(SpanBatch::with_spans(spans)).await {
            Ok(()) => self.metrics.record_success(span_count),
            Err(err) => {
                self.metrics.record_error(span_count);
                tracing::warn!(
                    exporter = self.exporter.name(),
                    spans = span_count,
                    error = %err,
                    "span export failed, dropping batch"
                );
            }
        }
        true
    }
}

async fn run_worker(shared: Arc<Shared>) {
    let delay = shared.config.schedule_delay;
    let batch_size = shared.config.max_export_batch_size;

    loop {
        // Woken by an enqueue or by the periodic tick; either way one batch goes out
        let _ = tokio::time::timeout(delay, shared.notify.notified()).await;
        if shared.is_shutdown() {
            break;
        }

        shared.export_once().await;
        while !shared.is_shutdown() && shared.queue_len() >= batch_size {
            shared.export_once().await;
        }
    }

    while shared.export_once().await {}
    tracing::debug!("batch worker stopped");
}

/// Terminal pipeline stage: buffers spans and exports them in the background.
///
/// Must be created inside a Tokio runtime (or given one via
/// [`BatchStage::with_runtime`]); everything else, `enqueue` included, can be
/// called from any thread.
pub struct BatchStage {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchStage {
    /// Creates the stage and spawns its worker on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(config: BatchConfig, exporter: Arc<dyn SpanExporterBoxed>) -> Self {
        Self::with_runtime(config, exporter, &Handle::current())
    }

    /// Creates the stage and spawns its worker on `runtime`
    pub fn with_runtime(mut config: BatchConfig, exporter: Arc<dyn SpanExporterBoxed>, runtime: &Handle) -> Self {
        config.max_export_batch_size = config.max_export_batch_size.clamp(1, config.max_queue_size.max(1));
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.max_queue_size.min(8192))),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            export_lock: tokio::sync::Mutex::new(()),
            exporter,
            metrics: BatchMetrics::default(),
            config,
        });

        let worker = runtime.spawn(run_worker(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.shared.metrics
    }

    /// Number of spans waiting for export
    pub fn queue_len(&self) -> usize {
        self.shared.queue_len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Takes ownership of a finished span.
    ///
    /// Unsampled and already-queued spans are refused before the drop policy
    /// is consulted. On success the span is sealed against further mutation.
    pub fn enqueue(&self, mut span: Span) -> Result<(), DropReason> {
        let metrics = &self.shared.metrics;
        if self.shared.is_shutdown() {
            return Err(DropReason::ShutDown);
        }
        if span.is_ended() {
            BatchMetrics::inc(&metrics.duplicates);
            return Err(DropReason::AlreadyEnded);
        }
        if !span.sampled {
            BatchMetrics::inc(&metrics.unsampled);
            return Err(DropReason::Unsampled);
        }

        span.mark_ended();
        debug_assert_sealed!(span);
        let admission = {
            let mut queue = self.shared.lock_queue();
            self.shared
                .config
                .drop_policy
                .handle(&mut queue, span, self.shared.config.max_queue_size)
        };

        match admission {
            Admission::Queued => {}
            Admission::Evicted(_) => BatchMetrics::inc(&metrics.dropped_by_policy),
            Admission::Rejected(_) => {
                BatchMetrics::inc(&metrics.dropped_by_policy);
                return Err(DropReason::QueueFull);
            }
        }
        BatchMetrics::inc(&metrics.queued);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Exports until the queue is empty or `timeout` elapses.
    ///
    /// Returns `true` if the queue was fully drained. A batch whose export
    /// is still running when the deadline hits is abandoned.
    pub async fn force_flush(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let exported = match deadline {
                None => self.shared.export_once().await,
                Some(deadline) => match tokio::time::timeout_at(deadline, self.shared.export_once()).await {
                    Ok(exported) => exported,
                    Err(_) => return self.shared.queue_len() == 0,
                },
            };
            if !exported {
                return true;
            }
        }
    }

    /// Stops the worker, exports everything still queued and shuts the exporter down.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.notify.notify_one();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let join_timeout = self.shared.config.schedule_delay.saturating_mul(2);
            match tokio::time::timeout(join_timeout, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "batch worker terminated abnormally"),
                Err(_) => tracing::warn!(timeout = ?join_timeout, "batch worker did not stop in time"),
            }
        }

        // Catches spans enqueued while the worker was stopping
        self.force_flush(None).await;
        self.shared.exporter.shutdown();

        let metrics = &self.shared.metrics;
        tracing::info!(
            exported = metrics.spans_exported(),
            dropped_by_policy = metrics.dropped_by_policy(),
            export_errors = metrics.export_errors(),
            "batch stage shut down"
        );
    }
}

impl Drop for BatchStage {
    fn drop(&mut self) {
        // Lets a detached worker drain and exit instead of ticking forever
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            self.shared.notify.notify_one();
        }
    }
}

impl std::fmt::Debug for BatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStage")
            .field("config", &self.shared.config)
            .field("exporter", &self.shared.exporter.name())
            .field("queue_len", &self.queue_len())
            .finish()
    }
}
