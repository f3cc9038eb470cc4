//! Pipeline assembly.
//!
//! [`PipelineBuilder`] wires the collaborators of the tracing pipeline into
//! an immutable [`TracerHandle`]: id generator, sampler, resource, the
//! batching processor handle and the not-yet-running worker. Assembly
//! validates configuration but performs no I/O; nothing runs until the
//! lifecycle controller spawns the worker.

use std::sync::Mutex;

use tokio::sync::watch;

use crate::error::{ConfigError, ExportResult};
use crate::export::{ExportTarget, SpanExporter, StdoutSpanExporter};
use crate::id_generator::{IdGenerator, RandomIdGenerator};
use crate::processor::{BatchConfig, BatchSpanProcessor, BatchWorker};
use crate::propagation::TraceContextPropagator;
use crate::resource::Resource;
use crate::sampler::{ConstantSampler, Sampler};
use crate::span::{SpanContext, SpanData, TraceFlags};

/// Builder for the span pipeline.
///
/// Every collaborator is injectable; the defaults are random ids, a
/// constant-on sampler, batching configured from the environment and a
/// stdout exporter targeting the endpoint from
/// `OTEL_EXPORTER_OTLP_ENDPOINT`.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    exporter: Option<Box<dyn SpanExporter>>,
    id_generator: Option<Box<dyn IdGenerator>>,
    sampler: Option<Box<dyn Sampler>>,
    batch_config: Option<BatchConfig>,
    target: Option<ExportTarget>,
}

impl PipelineBuilder {
    /// Start from the default collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `exporter` instead of the stdout default.
    pub fn with_exporter<E: SpanExporter + 'static>(mut self, exporter: E) -> Self {
        self.exporter = Some(Box::new(exporter));
        self
    }

    /// Use `id_generator` instead of random ids.
    pub fn with_id_generator<G: IdGenerator + 'static>(mut self, id_generator: G) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Use `sampler` instead of sampling everything.
    pub fn with_sampler<S: Sampler + 'static>(mut self, sampler: S) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Use `config` instead of the environment-derived batching config.
    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = Some(config);
        self
    }

    /// Export to `target` instead of the endpoint from the environment.
    pub fn with_target(mut self, target: ExportTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Compose the pipeline for `resource`.
    ///
    /// The export target is resolved (and its endpoint validated) even when
    /// an injected exporter ignores it, so a malformed endpoint fails here
    /// rather than mid-run.
    pub fn assemble(self, resource: Resource) -> Result<TracerHandle, ConfigError> {
        let target = match self.target {
            Some(target) => target,
            None => ExportTarget::from_env()?,
        };
        let exporter = self
            .exporter
            .unwrap_or_else(|| Box::new(StdoutSpanExporter::new()));
        let config = self.batch_config.unwrap_or_default();
        let (cancel, cancelled) = watch::channel(false);
        let (processor, worker) = BatchSpanProcessor::new(exporter, config, cancelled);

        Ok(TracerHandle {
            resource,
            target,
            id_generator: self
                .id_generator
                .unwrap_or_else(|| Box::new(RandomIdGenerator::default())),
            sampler: self
                .sampler
                .unwrap_or_else(|| Box::new(ConstantSampler::always_on())),
            propagator: TraceContextPropagator::new(),
            processor,
            worker: Mutex::new(Some((worker, cancel))),
        })
    }
}

/// The assembled pipeline.
///
/// Shared behind an `Arc` by the lifecycle controller; everything except
/// the one-shot worker slot is immutable after assembly.
#[derive(Debug)]
pub struct TracerHandle {
    resource: Resource,
    target: ExportTarget,
    id_generator: Box<dyn IdGenerator>,
    sampler: Box<dyn Sampler>,
    propagator: TraceContextPropagator,
    processor: BatchSpanProcessor,
    worker: Mutex<Option<(BatchWorker, watch::Sender<bool>)>>,
}

impl TracerHandle {
    /// The resource all spans from this pipeline are associated with.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// The validated export target.
    pub fn target(&self) -> &ExportTarget {
        &self.target
    }

    /// W3C trace-context propagator for carrier injection and extraction.
    pub fn propagator(&self) -> &TraceContextPropagator {
        &self.propagator
    }

    /// Build the context for a new span, inheriting the trace id and
    /// sampling decision from `parent` when it is valid and consulting the
    /// sampler otherwise.
    pub fn new_span_context(&self, name: &str, parent: Option<&SpanContext>) -> SpanContext {
        let span_id = self.id_generator.new_span_id();
        match parent.filter(|p| p.is_valid()) {
            Some(parent) => SpanContext::new(
                parent.trace_id(),
                span_id,
                parent.trace_flags(),
                false,
                parent.trace_state().to_owned(),
            ),
            None => {
                let trace_id = self.id_generator.new_trace_id();
                let flags = if self.sampler.should_sample(trace_id, name).is_sampled() {
                    TraceFlags::SAMPLED
                } else {
                    TraceFlags::NOT_SAMPLED
                };
                SpanContext::new(trace_id, span_id, flags, false, String::new())
            }
        }
    }

    /// Hand a completed span to the batching processor. Never blocks.
    pub fn record_span(&self, span: SpanData) {
        self.processor.on_end(span);
    }

    /// Export everything buffered so far and wait for the result.
    pub async fn force_flush(&self) -> ExportResult {
        self.processor.force_flush().await
    }

    /// Flush remaining spans and stop the worker.
    pub(crate) async fn shutdown(&self) -> ExportResult {
        self.processor.shutdown().await
    }

    /// Take the worker and its cancellation sender for spawning. Returns
    /// `None` after the first call.
    pub(crate) fn take_worker(&self) -> Option<(BatchWorker, watch::Sender<bool>)> {
        self.worker.lock().ok().and_then(|mut slot| slot.take())
    }
}
