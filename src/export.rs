//! Span exporters and export target configuration.
//!
//! The wire protocol for shipping spans to a collector is out of scope here;
//! exporters are black-box sinks behind [`SpanExporter`]. This module carries
//! the pieces the pipeline itself needs: the exporter seam, validated export
//! targets, and the in-memory/stdout sinks used by tests and defaults.

use std::env;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use url::Url;

use crate::error::{ConfigError, ExportResult};
use crate::span::SpanData;

pub(crate) const ENV_EXPORT_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub(crate) const ENV_EXPORT_TIMEOUT: &str = "OTEL_EXPORTER_OTLP_TIMEOUT";

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Interface protocol-specific exporters implement so they can be plugged
/// into the pipeline.
///
/// `export` is never called concurrently for the same exporter instance and
/// must not block indefinitely; the pipeline enforces its own timeout on top.
pub trait SpanExporter: Send + Sync + fmt::Debug {
    /// Export a batch of completed spans.
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult>;

    /// Shut down the exporter. Called once when the pipeline terminates.
    fn shutdown(&mut self) {}
}

/// A parsed and validated export destination.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportTarget {
    endpoint: Url,
    timeout: Duration,
}

impl ExportTarget {
    /// Parse an endpoint string.
    ///
    /// Fails with [`ConfigError::InvalidEndpoint`] if the string is not a
    /// valid URL or uses an unsupported scheme.
    pub fn new(endpoint: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" | "grpc" => {}
            other => {
                return Err(ConfigError::InvalidEndpoint {
                    endpoint: endpoint.to_owned(),
                    reason: format!("unsupported scheme {other:?}"),
                })
            }
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_owned(),
                reason: "missing host".to_owned(),
            });
        }
        Ok(ExportTarget {
            endpoint: url,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Build a target from `OTEL_EXPORTER_OTLP_ENDPOINT` and
    /// `OTEL_EXPORTER_OTLP_TIMEOUT` (milliseconds), falling back to
    /// `http://localhost:4317` and 10s.
    ///
    /// A malformed endpoint value is an error; a malformed timeout value is
    /// ignored and the default used.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = env::var(ENV_EXPORT_ENDPOINT)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());
        let mut target = ExportTarget::new(&endpoint)?;
        if let Some(timeout) = env::var(ENV_EXPORT_TIMEOUT)
            .ok()
            .and_then(|ms| ms.parse::<u64>().ok())
        {
            target.timeout = Duration::from_millis(timeout);
        }
        Ok(target)
    }

    /// Replace the export timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The destination endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Per-export timeout for this target.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// An exporter that stores spans in memory, for tests and debugging.
///
/// Clones share the same storage, so a test can keep one clone and hand the
/// other to the pipeline.
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemorySpanExporter {
    /// Create a new empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the spans exported so far.
    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.spans
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Clears the stored spans.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.spans.lock() {
            guard.clear();
        }
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, mut batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .spans
            .lock()
            .map(|mut guard| guard.append(&mut batch))
            .map_err(|e| {
                crate::error::ExportError::InternalFailure(format!("span store poisoned: {e}"))
            });
        Box::pin(std::future::ready(result))
    }
}

/// An exporter that writes one line per span to stdout.
///
/// Used as the default sink when no exporter is injected, so a bootstrap
/// without a collector still makes spans visible.
#[derive(Debug, Default)]
pub struct StdoutSpanExporter {
    _private: (),
}

impl StdoutSpanExporter {
    /// Create a new stdout exporter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpanExporter for StdoutSpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        for span in &batch {
            let duration = span
                .end_time
                .duration_since(span.start_time)
                .unwrap_or_default();
            println!(
                "span {} trace_id={} span_id={} duration={:?}",
                span.name,
                span.span_context.trace_id(),
                span.span_context.span_id(),
                duration,
            );
        }
        Box::pin(std::future::ready(Ok(())))
    }
}
