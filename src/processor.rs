//! Span batching and the pipeline run-loop.
//!
//! Completed spans are buffered by a [`BatchSpanProcessor`] handle and
//! drained by a background [`BatchWorker`] that forwards them to the
//! exporter in batches, either when the buffer reaches the configured batch
//! size or on a timer tick. The worker runs until it is cancelled, asked to
//! shut down, or every handle has been dropped.

use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_channel::oneshot;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::error::{ExportError, ExportResult};
use crate::export::SpanExporter;
use crate::span::SpanData;

pub(crate) const ENV_BSP_SCHEDULE_DELAY: &str = "OTEL_BSP_SCHEDULE_DELAY";
pub(crate) const ENV_BSP_MAX_QUEUE_SIZE: &str = "OTEL_BSP_MAX_QUEUE_SIZE";
pub(crate) const ENV_BSP_MAX_EXPORT_BATCH_SIZE: &str = "OTEL_BSP_MAX_EXPORT_BATCH_SIZE";
pub(crate) const ENV_BSP_EXPORT_TIMEOUT: &str = "OTEL_BSP_EXPORT_TIMEOUT";

const DEFAULT_SCHEDULE_DELAY_MILLIS: u64 = 5_000;
const DEFAULT_MAX_QUEUE_SIZE: usize = 2_048;
const DEFAULT_MAX_EXPORT_BATCH_SIZE: usize = 512;
const DEFAULT_EXPORT_TIMEOUT_MILLIS: u64 = 30_000;

/// Batching configuration for the span pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchConfig {
    /// Maximum number of spans queued for the worker. Spans completed while
    /// the queue is full are dropped.
    pub(crate) max_queue_size: usize,

    /// Delay between two consecutive timer-driven flushes.
    pub(crate) scheduled_delay: Duration,

    /// Maximum number of spans handed to the exporter in one batch. Must be
    /// less than or equal to `max_queue_size`.
    pub(crate) max_export_batch_size: usize,

    /// Upper bound on a single export call.
    pub(crate) export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// Builder for [`BatchConfig`].
///
/// Defaults come from the `OTEL_BSP_MAX_QUEUE_SIZE`,
/// `OTEL_BSP_SCHEDULE_DELAY`, `OTEL_BSP_MAX_EXPORT_BATCH_SIZE` and
/// `OTEL_BSP_EXPORT_TIMEOUT` environment variables where set; unparseable
/// values are ignored.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
    export_timeout: Duration,
}

impl Default for BatchConfigBuilder {
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            scheduled_delay: Duration::from_millis(DEFAULT_SCHEDULE_DELAY_MILLIS),
            max_export_batch_size: DEFAULT_MAX_EXPORT_BATCH_SIZE,
            export_timeout: Duration::from_millis(DEFAULT_EXPORT_TIMEOUT_MILLIS),
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Set the maximum queue size. Spans are dropped once the queue is full.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the delay between timer-driven flushes.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set the maximum export batch size.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Set the upper bound on a single export call.
    pub fn with_export_timeout(mut self, export_timeout: Duration) -> Self {
        self.export_timeout = export_timeout;
        self
    }

    /// Build the config, clamping `max_export_batch_size` to
    /// `max_queue_size`.
    pub fn build(self) -> BatchConfig {
        BatchConfig {
            max_queue_size: self.max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_batch_size: self.max_export_batch_size.min(self.max_queue_size),
            export_timeout: self.export_timeout,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = parse_env::<usize>(ENV_BSP_MAX_QUEUE_SIZE) {
            self.max_queue_size = max_queue_size;
        }
        if let Some(delay) = parse_env::<u64>(ENV_BSP_SCHEDULE_DELAY) {
            self.scheduled_delay = Duration::from_millis(delay);
        }
        if let Some(batch_size) = parse_env::<usize>(ENV_BSP_MAX_EXPORT_BATCH_SIZE) {
            self.max_export_batch_size = batch_size;
        }
        if let Some(timeout) = parse_env::<u64>(ENV_BSP_EXPORT_TIMEOUT) {
            self.export_timeout = Duration::from_millis(timeout);
        }
        self
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Messages sent from processor handles to the worker.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum BatchMessage {
    /// A span finished; add it to the buffer of pending spans.
    ExportSpan(SpanData),
    /// Export the current buffer now, acknowledging on the channel if one
    /// is provided.
    Flush(Option<oneshot::Sender<ExportResult>>),
    /// Flush, shut down the exporter and stop the worker.
    Shutdown(oneshot::Sender<ExportResult>),
}

/// Handle through which completed spans enter the pipeline.
///
/// The handle is the caller-facing half of the processor; the buffering and
/// exporting happen on the [`BatchWorker`] spawned by the lifecycle
/// controller.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    sender: mpsc::Sender<BatchMessage>,
    dropped_spans: AtomicUsize,
}

impl BatchSpanProcessor {
    /// Create a processor handle and its worker, not yet running.
    pub(crate) fn new(
        exporter: Box<dyn SpanExporter>,
        config: BatchConfig,
        cancel: watch::Receiver<bool>,
    ) -> (Self, BatchWorker) {
        let (sender, receiver) = mpsc::channel(config.max_queue_size.max(1));
        let worker = BatchWorker {
            buffer: Vec::new(),
            exporter,
            receiver,
            cancel,
            config,
        };
        (
            BatchSpanProcessor {
                sender,
                dropped_spans: AtomicUsize::new(0),
            },
            worker,
        )
    }

    /// Enqueue a completed span without blocking.
    ///
    /// Unsampled spans are ignored. If the queue is full or the worker has
    /// stopped, the span is dropped; the first drop emits a warning, further
    /// drops are only counted.
    pub fn on_end(&self, span: SpanData) {
        if !span.span_context.is_sampled() {
            return;
        }
        if self
            .sender
            .try_send(BatchMessage::ExportSpan(span))
            .is_err()
            && self.dropped_spans.fetch_add(1, Ordering::Relaxed) == 0
        {
            warn!(
                "span queue full or pipeline stopped; dropping spans \
                 (further drops will only be counted)"
            );
        }
    }

    /// Ask the worker to export all buffered spans now and wait for the
    /// result of that export.
    pub async fn force_flush(&self) -> ExportResult {
        let (ack, done) = oneshot::channel();
        self.sender
            .try_send(BatchMessage::Flush(Some(ack)))
            .map_err(|e| ExportError::InternalFailure(format!("failed to send flush: {e}")))?;
        done.await.map_err(|_| ExportError::AlreadyShutdown)?
    }

    /// Flush remaining spans, shut the exporter down and stop the worker.
    pub async fn shutdown(&self) -> ExportResult {
        let dropped = self.dropped_spans.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(
                dropped_spans = dropped,
                "spans were dropped due to a full or closed queue"
            );
        }
        let (ack, done) = oneshot::channel();
        self.sender
            .try_send(BatchMessage::Shutdown(ack))
            .map_err(|e| ExportError::InternalFailure(format!("failed to send shutdown: {e}")))?;
        done.await.map_err(|_| ExportError::AlreadyShutdown)?
    }
}

/// The background half of the processor: buffers spans and drives the
/// exporter until cancelled or shut down.
#[derive(Debug)]
pub(crate) struct BatchWorker {
    buffer: Vec<SpanData>,
    exporter: Box<dyn SpanExporter>,
    receiver: mpsc::Receiver<BatchMessage>,
    cancel: watch::Receiver<bool>,
    config: BatchConfig,
}

impl BatchWorker {
    /// Drive the pipeline: pull batched spans and forward them to the
    /// exporter until cancelled.
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.scheduled_delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so the first real
        // flush happens one full delay after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                // A closed cancel channel counts as cancellation, so dropping
                // the run handle also stops the loop.
                _ = self.cancel.changed() => {
                    debug!("span pipeline cancelled; draining");
                    self.drain().await;
                    self.exporter.shutdown();
                    return;
                }
                _ = ticker.tick() => {
                    self.flush(None).await;
                }
                message = self.receiver.recv() => match message {
                    Some(BatchMessage::ExportSpan(span)) => {
                        self.buffer.push(span);
                        if self.buffer.len() >= self.config.max_export_batch_size {
                            self.flush(None).await;
                        }
                    }
                    Some(BatchMessage::Flush(ack)) => {
                        self.flush(ack).await;
                    }
                    Some(BatchMessage::Shutdown(ack)) => {
                        self.flush(Some(ack)).await;
                        self.exporter.shutdown();
                        return;
                    }
                    // Every handle dropped: final drain, then stop.
                    None => {
                        self.flush(None).await;
                        self.exporter.shutdown();
                        return;
                    }
                },
            }
        }
    }

    /// One final export on cancellation: pull spans that are already queued
    /// but not yet received, then flush. Flush and shutdown requests still
    /// in the queue see the channel close instead of an ack.
    async fn drain(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            if let BatchMessage::ExportSpan(span) = message {
                self.buffer.push(span);
            }
        }
        self.flush(None).await;
    }

    /// Export the current buffer, reporting the result on `ack` when
    /// provided and logging it otherwise.
    async fn flush(&mut self, ack: Option<oneshot::Sender<ExportResult>>) {
        let result = self.export_batch().await;
        match ack {
            Some(channel) => {
                if channel.send(result).is_err() {
                    debug!("flush caller went away before the result arrived");
                }
            }
            None => {
                if let Err(err) = result {
                    error!(error = %err, "failed to export span batch");
                }
            }
        }
    }

    async fn export_batch(&mut self) -> ExportResult {
        // Flush and shutdown may arrive with nothing buffered.
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = self.buffer.split_off(0);
        let deadline = self.config.export_timeout;
        match tokio::time::timeout(deadline, self.exporter.export(batch)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout(deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::InMemorySpanExporter;
    use crate::span::test_span;
    use futures_util::future::BoxFuture;
    use std::fmt;

    fn processor(
        exporter: Box<dyn SpanExporter>,
        config: BatchConfig,
    ) -> (BatchSpanProcessor, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (handle, worker) = BatchSpanProcessor::new(exporter, config, cancel_rx);
        let join = tokio::spawn(worker.run());
        (handle, cancel_tx, join)
    }

    // Keeps the timer out of the picture so tests control every flush.
    fn manual_flush_config() -> BatchConfig {
        BatchConfigBuilder::default()
            .with_scheduled_delay(Duration::from_secs(60 * 60 * 24))
            .build()
    }

    struct BlockingExporter {
        delay: Duration,
    }

    impl fmt::Debug for BlockingExporter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("blocking exporter for testing")
        }
    }

    impl SpanExporter for BlockingExporter {
        fn export(&mut self, _batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
        }
    }

    #[test]
    fn config_builder_reads_env() {
        temp_env::with_vars(
            [
                (ENV_BSP_MAX_EXPORT_BATCH_SIZE, Some("500")),
                (ENV_BSP_SCHEDULE_DELAY, Some("I am not a number")),
                (ENV_BSP_EXPORT_TIMEOUT, Some("2046")),
                (ENV_BSP_MAX_QUEUE_SIZE, None),
            ],
            || {
                let config = BatchConfig::default();
                assert_eq!(config.max_export_batch_size, 500);
                assert_eq!(
                    config.scheduled_delay,
                    Duration::from_millis(DEFAULT_SCHEDULE_DELAY_MILLIS)
                );
                assert_eq!(config.max_queue_size, DEFAULT_MAX_QUEUE_SIZE);
                assert_eq!(config.export_timeout, Duration::from_millis(2046));
            },
        );
    }

    #[test]
    fn config_batch_size_clamped_to_queue_size() {
        temp_env::with_vars_unset(
            [
                ENV_BSP_MAX_QUEUE_SIZE,
                ENV_BSP_MAX_EXPORT_BATCH_SIZE,
                ENV_BSP_SCHEDULE_DELAY,
                ENV_BSP_EXPORT_TIMEOUT,
            ],
            || {
                let config = BatchConfigBuilder::default()
                    .with_max_queue_size(120)
                    .with_max_export_batch_size(500)
                    .build();
                assert_eq!(config.max_export_batch_size, 120);
                assert_eq!(config.max_queue_size, 120);
            },
        );
    }

    #[tokio::test]
    async fn force_flush_exports_buffered_spans() {
        let exporter = InMemorySpanExporter::new();
        let (handle, _cancel, _join) =
            processor(Box::new(exporter.clone()), manual_flush_config());

        handle.on_end(test_span("one"));
        handle.on_end(test_span("two"));
        handle.force_flush().await.unwrap();

        let spans = exporter.finished_spans();
        assert_eq!(spans.len(), 2);
        // within a batch, order is completion order
        assert_eq!(spans[0].name, "one");
        assert_eq!(spans[1].name, "two");
    }

    #[tokio::test]
    async fn batch_size_triggers_export() {
        let exporter = InMemorySpanExporter::new();
        let config = BatchConfigBuilder::default()
            .with_scheduled_delay(Duration::from_secs(60 * 60 * 24))
            .with_max_export_batch_size(2)
            .build();
        let (handle, _cancel, _join) = processor(Box::new(exporter.clone()), config);

        handle.on_end(test_span("one"));
        handle.on_end(test_span("two"));

        // no force_flush: the batch threshold alone must push the spans out
        for _ in 0..50 {
            if exporter.finished_spans().len() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch-size threshold did not trigger an export");
    }

    #[tokio::test]
    async fn unsampled_spans_are_ignored() {
        let exporter = InMemorySpanExporter::new();
        let (handle, _cancel, _join) =
            processor(Box::new(exporter.clone()), manual_flush_config());

        let mut span = test_span("invisible");
        span.span_context = crate::span::SpanContext::new(
            span.span_context.trace_id(),
            span.span_context.span_id(),
            crate::span::TraceFlags::NOT_SAMPLED,
            false,
            String::new(),
        );
        handle.on_end(span);
        handle.force_flush().await.unwrap();
        assert!(exporter.finished_spans().is_empty());
    }

    #[tokio::test]
    async fn slow_exporter_times_out() {
        let config = BatchConfigBuilder::default()
            .with_scheduled_delay(Duration::from_secs(60 * 60 * 24))
            .with_export_timeout(Duration::from_millis(5))
            .build();
        let (handle, _cancel, _join) = processor(
            Box::new(BlockingExporter {
                delay: Duration::from_secs(60),
            }),
            config,
        );

        handle.on_end(test_span("slow"));
        let result = handle.force_flush().await;
        assert!(matches!(result, Err(ExportError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancellation_drains_buffer() {
        let exporter = InMemorySpanExporter::new();
        let (handle, cancel, join) =
            processor(Box::new(exporter.clone()), manual_flush_config());

        handle.on_end(test_span("buffered"));
        // no sleep: the cancel drain must pick up the queued span even when
        // the worker never got to receive it
        cancel.send(true).unwrap();
        join.await.unwrap();
        assert_eq!(exporter.finished_spans().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_and_stops_worker() {
        let exporter = InMemorySpanExporter::new();
        let (handle, _cancel, join) =
            processor(Box::new(exporter.clone()), manual_flush_config());

        handle.on_end(test_span("last"));
        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert_eq!(exporter.finished_spans().len(), 1);

        // the worker is gone; further flushes fail internally, not loudly
        assert!(handle.force_flush().await.is_err());
    }
}
