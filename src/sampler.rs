//! Span sampling decisions.

use std::fmt;

use crate::span::TraceId;

/// The decision a [`Sampler`] returns for a span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingDecision {
    /// The span is recorded and exported.
    RecordAndSample,
    /// The span is dropped and never reaches the pipeline.
    Drop,
}

impl SamplingDecision {
    /// Whether the span should be exported.
    pub fn is_sampled(&self) -> bool {
        matches!(self, SamplingDecision::RecordAndSample)
    }
}

/// Decides whether a given span should be recorded and exported.
pub trait Sampler: Send + Sync + fmt::Debug {
    /// Return the sampling decision for a span about to be created.
    fn should_sample(&self, trace_id: TraceId, name: &str) -> SamplingDecision;
}

/// A sampler that returns the same decision for every span.
///
/// The default is "on", matching test semantics where every span matters.
#[derive(Clone, Copy, Debug)]
pub struct ConstantSampler {
    on: bool,
}

impl ConstantSampler {
    /// Sampler that records and exports every span.
    pub fn always_on() -> Self {
        ConstantSampler { on: true }
    }

    /// Sampler that drops every span.
    pub fn always_off() -> Self {
        ConstantSampler { on: false }
    }
}

impl Default for ConstantSampler {
    fn default() -> Self {
        ConstantSampler::always_on()
    }
}

impl Sampler for ConstantSampler {
    fn should_sample(&self, _trace_id: TraceId, _name: &str) -> SamplingDecision {
        if self.on {
            SamplingDecision::RecordAndSample
        } else {
            SamplingDecision::Drop
        }
    }
}
