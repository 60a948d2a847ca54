use crate::span::SpanBatch;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Error types for span export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Transport-layer error (network, file system)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
    /// Backend refused the batch
    #[error("batch rejected: {0}")]
    Rejected(String),
}

/// Trait for exporting span batches to various backends.
///
/// Uses native async fn in traits instead of `#[async_trait]`. The batch
/// stage never calls `export` concurrently, so implementations only need to
/// be safe to move between threads, not to run in parallel with themselves.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn SpanExporterBoxed>`.
pub trait SpanExporter: Send + Sync {
    /// Exports a batch of spans.
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;

    /// Releases backend resources; called once after the final flush.
    fn shutdown(&self) {}
}

/// Object-safe version of SpanExporter for dynamic dispatch.
///
/// This trait uses `Pin<Box<dyn Future>>` to allow `dyn SpanExporterBoxed`.
pub trait SpanExporterBoxed: Send + Sync {
    /// Exports a batch of spans (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;

    fn shutdown(&self);
}

/// Blanket implementation: any SpanExporter can be used as SpanExporterBoxed
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }

    fn shutdown(&self) {
        SpanExporter::shutdown(self);
    }
}

/// Stdout exporter for local debugging
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    /// Creates a new stdout exporter; `verbose` also prints attributes
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl SpanExporter for StdoutExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        for span in &batch.spans {
            println!(
                "span trace_id={:032x} span_id={:016x} name={} duration={}ns status={:?}",
                span.trace_id,
                span.span_id,
                span.name,
                span.duration_nanos().unwrap_or_default(),
                span.status()
            );
            if self.verbose {
                for (key, value) in span.attributes() {
                    let rendered = serde_json::to_string(value)
                        .map_err(|e| ExportError::Serialization(e.to_string()))?;
                    println!("    {key}={rendered}");
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Appends spans to a file as JSON lines, one span per line
pub struct JsonFileExporter {
    file_path: PathBuf,
}

impl JsonFileExporter {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }
}

impl SpanExporter for JsonFileExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let mut buf = Vec::new();
        for span in &batch.spans {
            serde_json::to_writer(&mut buf, span).map_err(|e| ExportError::Serialization(e.to_string()))?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.write_all(&buf)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.flush().await.map_err(|e| ExportError::Transport(e.to_string()))?;

        Ok(())
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

/// Null exporter that discards all spans (for benchmarking)
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for NullExporter {
    async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Test exporter that records every batch for verification
#[cfg(test)]
#[derive(Default)]
pub struct TestExporter {
    batches: std::sync::Mutex<Vec<Vec<crate::span::Span>>>,
    shutdowns: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl TestExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exported_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn all_spans(&self) -> Vec<crate::span::Span> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdowns.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl SpanExporter for TestExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.batches.lock().unwrap().push(batch.spans);
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Slow exporter for backpressure testing
#[cfg(test)]
pub struct SlowExporter {
    delay: std::time::Duration,
    spans: std::sync::Mutex<Vec<crate::span::Span>>,
}

#[cfg(test)]
impl SlowExporter {
    pub fn new(delay: std::time::Duration) -> Self {
        Self {
            delay,
            spans: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn exported_count(&self) -> usize {
        self.spans.lock().unwrap().len()
    }
}

#[cfg(test)]
impl SpanExporter for SlowExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        tokio::time::sleep(self.delay).await;
        self.spans.lock().unwrap().extend(batch.spans);
        Ok(())
    }

    fn name(&self) -> &str {
        "slow"
    }
}

/// Exporter whose every call fails
#[cfg(test)]
#[derive(Default)]
pub struct FailingExporter {
    attempts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FailingExporter {
    pub fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl SpanExporter for FailingExporter {
    async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
        self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(ExportError::Transport("connection refused".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}
