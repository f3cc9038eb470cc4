//! W3C trace-context propagation.
//!
//! Encodes and decodes [`SpanContext`]s across process boundaries using the
//! `traceparent` and `tracestate` headers. Malformed input yields `None`,
//! never a panic.

use std::collections::HashMap;

use crate::span::{SpanContext, SpanId, TraceFlags, TraceId};

const SUPPORTED_VERSION: u8 = 0;
const MAX_VERSION: u8 = 254;
const TRACEPARENT_HEADER: &str = "traceparent";
const TRACESTATE_HEADER: &str = "tracestate";

/// Injects context values into a carrier (typically outbound headers).
pub trait Injector {
    /// Set a key-value pair on the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Extracts context values from a carrier (typically inbound headers).
pub trait Extractor {
    /// Get the value for `key`, if present.
    fn get(&self, key: &str) -> Option<&str>;
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(|v| v.as_str())
    }
}

/// Propagates span contexts in [W3C TraceContext] format.
///
/// An example `traceparent` header:
///
/// `traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
///
/// [W3C TraceContext]: https://www.w3.org/TR/trace-context/
#[derive(Clone, Debug, Default)]
pub struct TraceContextPropagator {
    _private: (),
}

impl TraceContextPropagator {
    /// Create a new `TraceContextPropagator`.
    pub fn new() -> Self {
        TraceContextPropagator { _private: () }
    }

    /// Encode `cx` into the carrier. Invalid contexts inject nothing.
    pub fn inject(&self, cx: &SpanContext, injector: &mut dyn Injector) {
        if !cx.is_valid() {
            return;
        }
        let header_value = format!(
            "{:02x}-{}-{}-{:02x}",
            SUPPORTED_VERSION,
            cx.trace_id(),
            cx.span_id(),
            cx.trace_flags() & TraceFlags::SAMPLED
        );
        injector.set(TRACEPARENT_HEADER, header_value);
        if !cx.trace_state().is_empty() {
            injector.set(TRACESTATE_HEADER, cx.trace_state().to_owned());
        }
    }

    /// Decode a remote span context from the carrier.
    ///
    /// Returns `None` if the `traceparent` header is absent or malformed.
    pub fn extract(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let header_value = extractor.get(TRACEPARENT_HEADER).unwrap_or("").trim();
        let parts = header_value.split_terminator('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return None;
        }

        // For version 0 there must be exactly 4 parts.
        let version = u8::from_str_radix(parts[0], 16).ok()?;
        if version > MAX_VERSION || version == 0 && parts.len() != 4 {
            return None;
        }

        // Ids must be fixed-width lowercase hex.
        if parts[1].len() != 32 || parts[1].chars().any(|c| c.is_ascii_uppercase()) {
            return None;
        }
        let trace_id = TraceId::from_hex(parts[1]).ok()?;

        if parts[2].len() != 16 || parts[2].chars().any(|c| c.is_ascii_uppercase()) {
            return None;
        }
        let span_id = SpanId::from_hex(parts[2]).ok()?;

        if parts[3].len() != 2 {
            return None;
        }
        let opts = u8::from_str_radix(parts[3], 16).ok()?;
        if version == 0 && opts > 2 {
            return None;
        }

        // Clear all flags other than the supported sampling bit.
        let trace_flags = TraceFlags::new(opts) & TraceFlags::SAMPLED;
        let trace_state = extractor.get(TRACESTATE_HEADER).unwrap_or("").to_owned();

        let cx = SpanContext::new(trace_id, span_id, trace_flags, true, trace_state);
        cx.is_valid().then_some(cx)
    }
}
