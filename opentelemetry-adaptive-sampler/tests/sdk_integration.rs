use opentelemetry::trace::{
    Span, SpanContext, SpanId, SpanKind, Status, TraceContextExt, TraceFlags, TraceId,
    TraceState as OtelTraceState, Tracer, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_adaptive_sampler::config::{DeferredConfig, WorkflowConfig};
use opentelemetry_adaptive_sampler::{
    semconv, AdaptiveSampler, DeferredMark, DeferredSpanProcessor, SamplerConfig, SpanOutcome,
    Strategy, TRACE_STATE_KEY,
};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SimpleSpanProcessor};

fn setup(fraction: f64) -> (AdaptiveSampler, SdkTracerProvider, InMemorySpanExporter) {
    let sampler = AdaptiveSampler::builder()
        .with_service_name("checkout")
        .with_config(SamplerConfig {
            fraction,
            workflow: WorkflowConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        })
        .with_background_rotation(false)
        .build();
    let exporter = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_sampler(sampler.clone())
        .with_simple_exporter(exporter.clone())
        .build();
    (sampler, provider, exporter)
}

/// A provider exporting through a [`DeferredSpanProcessor`].
fn setup_deferred(
    config: SamplerConfig,
) -> (AdaptiveSampler, SdkTracerProvider, InMemorySpanExporter) {
    let sampler = AdaptiveSampler::builder()
        .with_service_name("checkout")
        .with_config(config)
        .with_background_rotation(false)
        .build();
    let exporter = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_sampler(sampler.clone())
        .with_span_processor(DeferredSpanProcessor::new(
            sampler.deferred_sampler(),
            SimpleSpanProcessor::new(exporter.clone()),
        ))
        .build();
    (sampler, provider, exporter)
}

fn deferred_config(workflow: bool, deferred: bool) -> SamplerConfig {
    SamplerConfig {
        fraction: 0.0,
        workflow: WorkflowConfig {
            enabled: workflow,
            ..Default::default()
        },
        deferred: DeferredConfig {
            enabled: deferred,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a opentelemetry::Value> {
    attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

#[test]
fn sampled_root_is_exported_with_its_state() {
    let (sampler, provider, exporter) = setup(1.0);
    let tracer = provider.tracer("adaptive");

    let mut span = tracer
        .span_builder("GET /cart")
        .with_kind(SpanKind::Server)
        .start(&tracer);
    let trace_state = span.span_context().trace_state().clone();
    span.end();

    assert_eq!(trace_state.get(TRACE_STATE_KEY), Some("s:4;r:4"));
    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(
        attribute(&spans[0].attributes, semconv::SAMPLER_STRATEGY).map(|v| v.as_str()),
        Some("random".into())
    );
    sampler.shutdown().unwrap();
}

#[test]
fn dropped_root_is_not_recorded() {
    let (_sampler, provider, exporter) = setup(0.0);
    let tracer = provider.tracer("adaptive");

    let mut span = tracer.start("GET /cart");
    assert!(!span.is_recording());
    assert!(!span.span_context().is_sampled());
    span.end();

    assert!(exporter.get_finished_spans().unwrap().is_empty());
}

#[test]
fn local_child_follows_its_parent() {
    let (_sampler, provider, exporter) = setup(1.0);
    let tracer = provider.tracer("adaptive");

    let parent = tracer.start("parent");
    let cx = Context::current_with_span(parent);
    let mut child = tracer.start_with_context("child", &cx);
    assert_eq!(
        child.span_context().trace_state().get(TRACE_STATE_KEY),
        Some("s:5;r:4")
    );
    child.end();
    drop(cx);

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);
    let child = spans.iter().find(|s| s.name == "child").unwrap();
    assert_eq!(
        attribute(&child.attributes, semconv::SAMPLER_STRATEGY).map(|v| v.as_str()),
        Some("follow".into())
    );
}

#[test]
fn remote_parent_state_is_honoured() {
    let (_sampler, provider, exporter) = setup(0.0);
    let tracer = provider.tracer("adaptive");

    let upstream =
        OtelTraceState::from_key_value([(TRACE_STATE_KEY, "s:2:uin;r:2"), ("vendor", "v1")])
            .unwrap();
    let cx = Context::new().with_remote_span_context(SpanContext::new(
        TraceId::from(0xabc),
        SpanId::from(0xdef),
        TraceFlags::NOT_SAMPLED,
        true,
        upstream,
    ));

    let mut span = tracer.start_with_context("handler", &cx);
    assert!(span.span_context().is_sampled());
    let trace_state = span.span_context().trace_state().clone();
    span.end();

    assert_eq!(trace_state.get(TRACE_STATE_KEY), Some("s:5;r:2"));
    assert_eq!(trace_state.get("vendor"), Some("v1"));
    assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
}

#[test]
fn remote_unsampled_parent_is_not_overridden_by_its_flag() {
    let (_sampler, provider, exporter) = setup(0.0);
    let tracer = provider.tracer("adaptive");

    let upstream = OtelTraceState::from_key_value([(TRACE_STATE_KEY, "s:0")]).unwrap();
    let cx = Context::new().with_remote_span_context(SpanContext::new(
        TraceId::from(0xabc),
        SpanId::from(0xdef),
        TraceFlags::SAMPLED,
        true,
        upstream,
    ));

    let mut span = tracer.start_with_context("handler", &cx);
    assert!(!span.span_context().is_sampled());
    span.end();
    assert!(exporter.get_finished_spans().unwrap().is_empty());
}

#[test]
fn deferred_sampler_reads_exported_span_data() {
    let (sampler, provider, exporter) = setup(1.0);
    let tracer = provider.tracer("adaptive");

    let mut span = tracer.start("GET /cart");
    span.set_status(opentelemetry::trace::Status::error("boom"));
    span.end();

    let spans = exporter.get_finished_spans().unwrap();
    let outcome = SpanOutcome::from(&spans[0]);
    assert!(outcome.sampled);
    assert!(outcome.is_error);

    let deferred = sampler.deferred_sampler();
    let decision = deferred.on_end(Some(&DeferredMark::new()), &outcome);
    assert!(decision.keep);
    assert_eq!(decision.strategy, Strategy::Random);
}

#[test]
fn failed_record_only_span_is_exported_by_the_deferred_processor() {
    let (_sampler, provider, exporter) = setup_deferred(deferred_config(false, true));
    let tracer = provider.tracer("adaptive");

    let mut failed = tracer.start("GET /cart");
    assert!(failed.is_recording());
    assert!(!failed.span_context().is_sampled());
    failed.set_status(Status::error("boom"));
    failed.end();

    let mut healthy = tracer.start("GET /cart");
    assert!(healthy.is_recording());
    healthy.end();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert!(spans[0].span_context.is_sampled());
    assert_eq!(
        attribute(&spans[0].attributes, semconv::SAMPLER_STRATEGY).map(|v| v.as_str()),
        Some("error".into())
    );
}

#[test]
fn discovered_edge_is_exported_by_the_deferred_processor() {
    let (_sampler, provider, exporter) = setup_deferred(deferred_config(true, false));
    let tracer = provider.tracer("adaptive");
    let start = || {
        tracer
            .span_builder("Cart/Get")
            .with_kind(SpanKind::Client)
            .with_attributes([KeyValue::new(semconv::CALLEE_SERVICE, "cart")])
            .start(&tracer)
    };

    let mut first = start();
    assert!(first.is_recording());
    assert!(!first.span_context().is_sampled());
    first.end();

    // the edge is known now, the repeat is dropped at start
    let mut repeat = start();
    assert!(!repeat.is_recording());
    repeat.end();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert!(spans[0].span_context.is_sampled());
    assert_eq!(
        attribute(&spans[0].attributes, semconv::WORKFLOW_RESULT).map(|v| v.as_str()),
        Some("path".into())
    );
    assert!(attribute(&spans[0].attributes, semconv::SAMPLER_STRATEGY).is_none());
}

#[test]
fn sampled_spans_pass_the_deferred_processor_unchanged() {
    let mut config = deferred_config(false, true);
    config.fraction = 1.0;
    let (_sampler, provider, exporter) = setup_deferred(config);
    let tracer = provider.tracer("adaptive");

    let mut span = tracer.start("GET /cart");
    span.set_status(Status::error("boom"));
    span.end();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    let strategies: Vec<_> = spans[0]
        .attributes
        .iter()
        .filter(|kv| kv.key.as_str() == semconv::SAMPLER_STRATEGY)
        .map(|kv| kv.value.as_str().into_owned())
        .collect();
    assert_eq!(strategies, ["random"]);
}

#[test]
fn pre_computed_live_span_keeps_its_decision() {
    let (sampler, provider, exporter) = setup_deferred(deferred_config(false, true));
    let tracer = provider.tracer("adaptive");
    let deferred = sampler.deferred_sampler();

    let mut span = tracer.start("GET /cart");
    assert_eq!(deferred.pre_compute_span(&span), Strategy::NotMatch);
    assert_eq!(deferred.pending_marks(), 1);
    // fails after the decision was taken
    span.set_status(Status::error("boom"));
    assert_eq!(deferred.pre_compute_span(&span), Strategy::NotMatch);
    span.end();

    assert_eq!(deferred.pending_marks(), 0);
    assert!(exporter.get_finished_spans().unwrap().is_empty());

    let mut failed = tracer.start("GET /cart");
    failed.set_status(Status::error("boom"));
    assert_eq!(deferred.pre_compute_span(&failed), Strategy::Error);
    failed.end();
    assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
}

#[test]
fn dropped_span_gets_no_mark() {
    let (sampler, provider, _exporter) = setup_deferred(deferred_config(false, false));
    let tracer = provider.tracer("adaptive");
    let deferred = sampler.deferred_sampler();

    let mut span = tracer.start("GET /cart");
    assert!(!span.is_recording());
    assert_eq!(deferred.pre_compute_span(&span), Strategy::NotMatch);
    assert_eq!(deferred.pending_marks(), 0);
    span.end();
}
