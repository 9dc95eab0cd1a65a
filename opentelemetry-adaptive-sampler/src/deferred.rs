//! Post-span sampling.
//!
//! Some reasons to keep a span are only known once it ends: it failed, or it
//! was slow. When deferred sampling is enabled the adaptive sampler records
//! spans nothing else kept (`RecordOnly`), and [`DeferredSampler::on_end`]
//! decides whether the finished span is exported after all.
//!
//! While the span is still mutable, [`DeferredSampler::pre_compute`] runs the
//! evaluation once and caches the result in the span's [`DeferredMark`].
//! Calling it again after the span was finalised and mutated returns the
//! cached result, which may no longer describe the span.
//!
//! [`DeferredSpanProcessor`] applies these decisions in an SDK pipeline. It
//! wraps the exporting processor and forwards the spans it keeps with the
//! sampled flag set.
use crate::config::{SamplerConfig, Snapshot};
use crate::semconv;
use crate::strategy::Strategy;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use opentelemetry::trace::{Span as _, SpanContext, SpanId, Status, TraceId};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use opentelemetry_sdk::Resource;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Per-span cache of a pre-computed deferred decision.
#[derive(Debug, Default)]
pub struct DeferredMark {
    cached: OnceLock<Strategy>,
}

impl DeferredMark {
    /// Creates an empty mark.
    pub fn new() -> Self {
        DeferredMark::default()
    }

    /// The pre-computed strategy, if any.
    pub fn get(&self) -> Option<Strategy> {
        self.cached.get().copied()
    }
}

/// What the deferred sampler needs to know about a span.
#[derive(Clone, Copy, Debug)]
pub struct SpanOutcome<'a> {
    /// Trace id of the span.
    pub trace_id: TraceId,
    /// The W3C sampled flag of the span.
    pub sampled: bool,
    /// Whether the span status is an error.
    pub is_error: bool,
    /// Time between start and end of the span.
    pub duration: Duration,
    /// Span attributes, including those set by the adaptive sampler.
    pub attributes: &'a [KeyValue],
}

impl<'a> From<&'a SpanData> for SpanOutcome<'a> {
    fn from(span: &'a SpanData) -> Self {
        SpanOutcome {
            trace_id: span.span_context.trace_id(),
            sampled: span.span_context.is_sampled(),
            is_error: matches!(span.status, Status::Error { .. }),
            duration: span
                .end_time
                .duration_since(span.start_time)
                .unwrap_or_default(),
            attributes: &span.attributes,
        }
    }
}

impl SpanOutcome<'_> {
    fn attribute_str(&self, key: &str) -> Option<std::borrow::Cow<'_, str>> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.as_str())
    }

    fn discovered_edge(&self) -> bool {
        self.attribute_str(semconv::WORKFLOW_RESULT)
            .is_some_and(|result| matches!(result.as_ref(), "path" | "sample"))
    }
}

/// The verdict for a finished span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeferredDecision {
    /// Why the span is kept, [`Strategy::NotMatch`] if it is not kept by
    /// strategy.
    pub strategy: Strategy,
    /// Whether the span should be exported.
    pub keep: bool,
}

/// Evaluates finished spans against the deferred sampling settings.
///
/// Cloning is cheap, clones share the marks of live spans. Instances
/// obtained from an [`AdaptiveSampler`](crate::AdaptiveSampler) follow its
/// configuration updates.
#[derive(Clone, Debug)]
pub struct DeferredSampler {
    snapshot: Arc<ArcSwap<Snapshot>>,
    marks: Arc<DashMap<(TraceId, SpanId), DeferredMark>>,
}

impl DeferredSampler {
    /// Creates a standalone deferred sampler.
    pub fn new(config: SamplerConfig) -> Self {
        let snapshot = Arc::new(ArcSwap::from_pointee(Snapshot::compile(config)));
        DeferredSampler::shared(snapshot)
    }

    pub(crate) fn shared(snapshot: Arc<ArcSwap<Snapshot>>) -> Self {
        DeferredSampler {
            snapshot,
            marks: Arc::new(DashMap::new()),
        }
    }

    /// Runs the deferred predicates on `outcome`.
    pub fn evaluate(&self, outcome: &SpanOutcome<'_>) -> Strategy {
        let snapshot = self.snapshot.load();
        let config = &snapshot.config().deferred;
        if !config.enabled {
            return Strategy::NotMatch;
        }
        if config.sample_errors
            && outcome.is_error
            && error_selected(config.error_fraction, outcome.trace_id)
        {
            return Strategy::Error;
        }
        match config.slow_duration() {
            Some(threshold) if outcome.duration >= threshold => Strategy::Slow,
            _ => Strategy::NotMatch,
        }
    }

    /// Evaluates a span that is still in progress and caches the result in
    /// `mark`.
    ///
    /// Only the first call on a mark evaluates, every later call returns the
    /// cached strategy without running `outcome`.
    pub fn pre_compute<'a, F>(&self, mark: &DeferredMark, outcome: F) -> Strategy
    where
        F: FnOnce() -> SpanOutcome<'a>,
    {
        *mark.cached.get_or_init(|| self.evaluate(&outcome()))
    }

    /// Pre-computes the decision of a live SDK span and keeps it until a
    /// [`DeferredSpanProcessor`] sharing this sampler sees the span end.
    ///
    /// The span is measured up to now. Spans that are not recording, or have
    /// ended already, get [`Strategy::NotMatch`] and no mark.
    pub fn pre_compute_span(&self, span: &Span) -> Strategy {
        let span_context = span.span_context();
        let key = (span_context.trace_id(), span_context.span_id());
        if let Some(strategy) = self.marks.get(&key).and_then(|mark| mark.value().get()) {
            return strategy;
        }
        let Some(data) = span.exported_data() else {
            return Strategy::NotMatch;
        };
        let outcome = SpanOutcome {
            duration: data.start_time.elapsed().unwrap_or_default(),
            ..SpanOutcome::from(&data)
        };
        let mark = self.marks.entry(key).or_default();
        self.pre_compute(&mark, || outcome)
    }

    /// Number of live spans holding a pre-computed mark.
    pub fn pending_marks(&self) -> usize {
        self.marks.len()
    }

    /// Decides whether a finished span is exported.
    ///
    /// A span carrying the sampled flag is always kept. Otherwise the
    /// pre-computed strategy is used when `mark` has one, else the span is
    /// evaluated now. A span that would be dropped is still kept when it
    /// discovered a workflow edge.
    pub fn on_end(
        &self,
        mark: Option<&DeferredMark>,
        outcome: &SpanOutcome<'_>,
    ) -> DeferredDecision {
        if outcome.sampled {
            let strategy = outcome
                .attribute_str(semconv::SAMPLER_STRATEGY)
                .and_then(|name| name.parse().ok())
                .unwrap_or(Strategy::Match);
            return DeferredDecision {
                strategy,
                keep: true,
            };
        }

        let strategy = mark
            .and_then(DeferredMark::get)
            .unwrap_or_else(|| self.evaluate(outcome));
        DeferredDecision {
            strategy,
            keep: strategy.is_sampled() || outcome.discovered_edge(),
        }
    }
}

/// A [`SpanProcessor`] applying deferred decisions before `P` sees a span.
///
/// The SDK hands every recording span to every processor. Spans that are
/// not sampled are evaluated with the wrapped [`DeferredSampler`], together
/// with the mark [`DeferredSampler::pre_compute_span`] left for them. Kept
/// spans are forwarded with the sampled flag set, so an exporting processor
/// such as `SimpleSpanProcessor` or `BatchSpanProcessor` exports them. The
/// rest are dropped here.
///
/// ```no_run
/// use opentelemetry_adaptive_sampler::{AdaptiveSampler, DeferredSpanProcessor};
/// use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SimpleSpanProcessor};
///
/// let sampler = AdaptiveSampler::builder().build();
/// let exporter = InMemorySpanExporter::default();
/// let provider = SdkTracerProvider::builder()
///     .with_sampler(sampler.clone())
///     .with_span_processor(DeferredSpanProcessor::new(
///         sampler.deferred_sampler(),
///         SimpleSpanProcessor::new(exporter),
///     ))
///     .build();
/// ```
#[derive(Debug)]
pub struct DeferredSpanProcessor<P> {
    sampler: DeferredSampler,
    inner: P,
}

impl<P: SpanProcessor> DeferredSpanProcessor<P> {
    /// Wraps `inner`, which receives the sampled and the kept spans.
    pub fn new(sampler: DeferredSampler, inner: P) -> Self {
        DeferredSpanProcessor { sampler, inner }
    }

    /// The deferred sampler deciding on unsampled spans.
    pub fn sampler(&self) -> &DeferredSampler {
        &self.sampler
    }
}

impl<P: SpanProcessor> SpanProcessor for DeferredSpanProcessor<P> {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        self.inner.on_start(span, cx);
    }

    fn on_end(&self, mut span: SpanData) {
        let key = (span.span_context.trace_id(), span.span_context.span_id());
        let mark = self.sampler.marks.remove(&key).map(|(_, mark)| mark);
        if span.span_context.is_sampled() {
            self.inner.on_end(span);
            return;
        }

        let decision = self
            .sampler
            .on_end(mark.as_ref(), &SpanOutcome::from(&span));
        if !decision.keep {
            return;
        }
        if decision.strategy.is_sampled() {
            span.attributes.push(KeyValue::new(
                semconv::SAMPLER_STRATEGY,
                decision.strategy.name(),
            ));
        }
        span.span_context = SpanContext::new(
            span.span_context.trace_id(),
            span.span_context.span_id(),
            span.span_context.trace_flags().with_sampled(true),
            span.span_context.is_remote(),
            span.span_context.trace_state().clone(),
        );
        self.inner.on_end(span);
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.inner.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.sampler.marks.clear();
        self.inner.shutdown_with_timeout(timeout)
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.inner.set_resource(resource);
    }
}

/// Selects `fraction` of traces using the high half of the trace id, so every
/// span of a trace gets the same answer.
fn error_selected(fraction: f64, trace_id: TraceId) -> bool {
    if fraction >= 1.0 {
        return true;
    }
    let bytes = trace_id.to_bytes();
    let mut high = [0u8; 8];
    high.copy_from_slice(&bytes[..8]);
    let bound = (fraction.max(0.0) * (1u64 << 63) as f64) as u64;
    (u64::from_be_bytes(high) >> 1) < bound
}
