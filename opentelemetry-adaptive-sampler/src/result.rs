//! Stage results and the final sampling result handed to the SDK.
use crate::strategy::merge_decision;
use crate::trace_state::TraceState;
use opentelemetry::trace::{SamplingDecision, TraceState as OtelTraceState};
use opentelemetry::KeyValue;

/// The result of one pipeline stage.
#[derive(Clone, Debug, PartialEq)]
pub struct StageResult {
    /// Stage decision.
    pub decision: SamplingDecision,
    /// Attributes the stage wants on the span.
    pub attributes: Vec<KeyValue>,
}

impl StageResult {
    /// A `Drop` result without attributes.
    pub fn dropped() -> Self {
        StageResult::new(SamplingDecision::Drop)
    }

    /// A result without attributes.
    pub fn new(decision: SamplingDecision) -> Self {
        StageResult {
            decision,
            attributes: Vec::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Folds `other` into this result: decisions merge with keep-wins
    /// semantics, attributes concatenate.
    pub fn merge(mut self, other: StageResult) -> StageResult {
        self.decision = merge_decision(self.decision, other.decision);
        self.attributes.extend(other.attributes);
        self
    }
}

/// The final decision for a span.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingResult {
    /// Whether the span is dropped, recorded, or recorded and sampled.
    pub decision: SamplingDecision,
    /// Extra attributes to set on the span.
    pub attributes: Vec<KeyValue>,
    /// State to propagate to the span's children.
    pub trace_state: TraceState,
}

impl SamplingResult {
    /// Converts into the SDK result, writing the sampler state into
    /// `parent_trace_state`.
    pub fn into_otel(
        self,
        parent_trace_state: &OtelTraceState,
    ) -> opentelemetry::trace::SamplingResult {
        opentelemetry::trace::SamplingResult {
            trace_state: self.trace_state.apply_to(parent_trace_state),
            decision: self.decision,
            attributes: self.attributes,
        }
    }
}
