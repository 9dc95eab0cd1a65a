//! The adaptive sampler.
//!
//! Every span runs through two stages whose results are merged with keep-wins
//! semantics:
//!
//! 1. the workflow stage, which always runs and keeps newly discovered
//!    call-graph edges (see [`crate::workflow`]);
//! 2. the decision stage, by default the [`DefaultPipeline`], optionally
//!    replaced by a [`UserSampler`] that may delegate to it.
//!
//! The default pipeline tries, in order: follow a sampled parent, dyeing,
//! min-count, fraction based random sampling, and finally a provisional
//! `RecordOnly` when deferred sampling is enabled. Kept spans then pass the
//! rate limiter bucket of their root strategy.
use crate::config::{SamplerConfig, Snapshot};
use crate::deferred::DeferredSampler;
use crate::dyeing::{self, DyeingMatcher};
use crate::error::{SamplerError, SamplerResult};
use crate::min_count::MinCountSampler;
use crate::request::{Interface, ParentContext, SamplingRequest};
use crate::result::{SamplingResult, StageResult};
use crate::rotation::{Intervals, Rotating, RotationTask, BUDGET_PERIOD};
use crate::semconv;
use crate::strategy::Strategy;
use crate::trace_state::{TraceState, TRACE_STATE_KEY};
use crate::workflow::WorkflowSampler;
use arc_swap::ArcSwap;
use opentelemetry::trace::{
    Link, SamplingDecision, SpanKind, TraceContextExt, TraceId, TraceState as OtelTraceState,
};
use opentelemetry::{otel_debug, otel_error, otel_info, Context, KeyValue};
use opentelemetry_sdk::trace::ShouldSample;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_SERVICE_NAME: &str = "unknown_service";

/// State shared by every clone of a sampler and its rotation thread.
#[derive(Debug)]
struct Shared {
    service_name: String,
    snapshot: Arc<ArcSwap<Snapshot>>,
    min_count: MinCountSampler,
    workflow: WorkflowSampler,
    deferred: DeferredSampler,
}

impl Rotating for Shared {
    fn intervals(&self) -> Intervals {
        let snapshot = self.snapshot.load();
        let config = snapshot.config();
        Intervals {
            window: config.min_sample.window(),
            cache_lifetime: config.workflow.cache_lifetime(),
            budget: BUDGET_PERIOD,
        }
    }

    fn rotate_window(&self) {
        self.min_count.rotate();
    }

    fn reset_cache(&self) {
        self.workflow.reset_cache();
    }

    fn reset_budget(&self) {
        self.workflow.reset_budget();
    }
}

/// The built-in decision stage, bound to the request being sampled and the
/// configuration snapshot it was admitted under.
#[derive(Clone, Copy)]
pub struct DefaultPipeline<'a> {
    shared: &'a Shared,
    snapshot: &'a Snapshot,
    request: &'a SamplingRequest<'a>,
    interface: &'a Interface<'a>,
}

impl fmt::Debug for DefaultPipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultPipeline")
            .field("service_name", &self.shared.service_name)
            .field("request", self.request)
            .finish()
    }
}

impl<'a> DefaultPipeline<'a> {
    /// The configuration in effect for this request.
    pub fn config(&self) -> &SamplerConfig {
        self.snapshot.config()
    }

    /// The request this pipeline decides on.
    pub fn request(&self) -> &SamplingRequest<'a> {
        self.request
    }

    /// Runs the built-in strategies on the bound request and updates the
    /// sampling lineage in `state`.
    pub fn sample(&self, state: &mut TraceState) -> StageResult {
        let request = self.request;
        let snapshot = self.snapshot;
        let config = snapshot.config();
        let attributes = request.attributes;

        let parent_sampled = request.parent.is_some_and(|parent| {
            if state.is_legacy() {
                parent.sampled
            } else {
                state.sample.sampled_strategy.is_sampled()
            }
        });

        let mut args = None;
        let strategy = if parent_sampled {
            Strategy::Follow
        } else if let Some(key) = dyeing::forced(attributes)
            .or_else(|| snapshot.dyeing.matches(attributes))
            .or_else(|| snapshot.bloom_dyeing.matches(attributes))
        {
            args = Some(key.as_str());
            Strategy::Dyeing
        } else if config.min_sample.enabled && self.min_count_accepts() {
            Strategy::MinCount
        } else if sample_by_fraction(
            snapshot.fraction_for(request.name, request.kind),
            request.trace_id,
        ) {
            Strategy::Random
        } else {
            Strategy::NotMatch
        };

        if strategy.is_sampled() {
            let root = state.sample.root_strategy;
            let bucket = if root.is_sampled() { root } else { strategy };
            if snapshot.rate_limiter.allow(bucket) {
                state.sample.sampled_strategy = strategy;
                if !root.is_sampled() {
                    state.sample.root_strategy = strategy;
                }
                state.set_args(args);
                return StageResult::new(SamplingDecision::RecordAndSample)
                    .with_attribute(KeyValue::new(semconv::SAMPLER_STRATEGY, strategy.name()));
            }
            otel_debug!(name: "AdaptiveSampler.RateLimited", bucket = bucket.name());
            // downstream hops start over as a new root
            state.reset_lineage();
            return StageResult::dropped();
        }

        state.sample.sampled_strategy = Strategy::NotMatch;
        if state.sample.root_strategy == Strategy::NotExist {
            state.sample.root_strategy = Strategy::NotMatch;
        }
        state.set_args(None);
        if config.deferred.enabled {
            StageResult::new(SamplingDecision::RecordOnly)
        } else {
            StageResult::dropped()
        }
    }

    fn min_count_accepts(&self) -> bool {
        let min_sample = &self.snapshot.config().min_sample;
        self.shared.min_count.should_sample(
            &self.interface.callee_service,
            &self.interface.callee_method,
            min_sample.count,
            min_sample.max_keys,
        )
    }
}

/// A replacement for the built-in decision stage.
///
/// The workflow stage still runs beneath it. Implementations receive the
/// built-in pipeline, bound to the same request, and may delegate to it.
pub trait UserSampler: Send + Sync + fmt::Debug {
    /// Decides on a span and updates the sampling lineage in `state`.
    fn sample(
        &self,
        request: &SamplingRequest<'_>,
        state: &mut TraceState,
        inner: &DefaultPipeline<'_>,
    ) -> StageResult;
}

#[derive(Clone, Debug)]
enum Stage {
    Default,
    UserOverride(Arc<dyn UserSampler>),
}

/// Builder for [`AdaptiveSampler`].
#[derive(Debug)]
pub struct AdaptiveSamplerBuilder {
    service_name: String,
    config: SamplerConfig,
    stage: Stage,
    background_rotation: bool,
}

impl AdaptiveSamplerBuilder {
    /// Name of the local service, used when span attributes do not say who
    /// is calling whom.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Initial configuration. Defaults to [`SamplerConfig::from_env`].
    pub fn with_config(mut self, config: SamplerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the built-in decision stage.
    pub fn with_user_sampler<U: UserSampler + 'static>(mut self, user: U) -> Self {
        self.stage = Stage::UserOverride(Arc::new(user));
        self
    }

    /// Enables or disables the background thread rotating min-count windows,
    /// workflow caches and budgets. When disabled the host calls
    /// [`AdaptiveSampler::rotate_min_count_window`],
    /// [`AdaptiveSampler::reset_workflow_cache`] and
    /// [`AdaptiveSampler::reset_workflow_budget`] itself.
    pub fn with_background_rotation(mut self, enabled: bool) -> Self {
        self.background_rotation = enabled;
        self
    }

    /// Builds the sampler.
    pub fn build(self) -> AdaptiveSampler {
        let snapshot = Snapshot::compile(self.config);
        let workflow = WorkflowSampler::new();
        workflow.configure(&snapshot.config().workflow);
        let snapshot = Arc::new(ArcSwap::from_pointee(snapshot));
        let shared = Arc::new(Shared {
            service_name: self.service_name,
            deferred: DeferredSampler::shared(Arc::clone(&snapshot)),
            snapshot,
            min_count: MinCountSampler::new(),
            workflow,
        });

        let rotation = if self.background_rotation {
            match RotationTask::spawn(Arc::clone(&shared)) {
                Ok(task) => Some(task),
                Err(err) => {
                    otel_error!(
                        name: "AdaptiveSampler.RotationThreadStartError",
                        error = format!("{:?}", err)
                    );
                    None
                }
            }
        } else {
            None
        };

        AdaptiveSampler {
            inner: Arc::new(Inner {
                shared,
                stage: self.stage,
                rotation,
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    shared: Arc<Shared>,
    stage: Stage,
    rotation: Option<RotationTask>,
    is_shutdown: AtomicBool,
}

/// Combines workflow coverage, dyeing, min-count, random sampling and rate
/// limiting into one decision per span.
///
/// Cloning is cheap, clones share all state. Dropping the last clone stops
/// the rotation thread.
#[derive(Clone, Debug)]
pub struct AdaptiveSampler {
    inner: Arc<Inner>,
}

impl AdaptiveSampler {
    /// Starts building a sampler.
    pub fn builder() -> AdaptiveSamplerBuilder {
        AdaptiveSamplerBuilder {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            config: SamplerConfig::from_env(),
            stage: Stage::Default,
            background_rotation: true,
        }
    }

    /// Decides on a span.
    pub fn sample(&self, request: &SamplingRequest<'_>) -> SamplingResult {
        let shared = &*self.inner.shared;
        let snapshot = shared.snapshot.load();
        let mut state = request
            .parent
            .map(|parent| TraceState::parse(parent.trace_state))
            .unwrap_or_default();

        let interface = request.interface(&shared.service_name);
        let workflow = shared.workflow.sample(
            request,
            &interface,
            &mut state,
            &snapshot.config().workflow,
        );

        let pipeline = DefaultPipeline {
            shared,
            snapshot: &snapshot,
            request,
            interface: &interface,
        };
        let decision = match &self.inner.stage {
            Stage::Default => pipeline.sample(&mut state),
            Stage::UserOverride(user) => user.sample(request, &mut state, &pipeline),
        };

        let merged = workflow.merge(decision);
        align_lineage(&merged.decision, &mut state);
        SamplingResult {
            decision: merged.decision,
            attributes: merged.attributes,
            trace_state: state,
        }
    }

    /// Publishes a new configuration. Requests already running finish with
    /// the previous one. Rate limit buckets start full again.
    pub fn update_config(&self, config: SamplerConfig) {
        let shared = &self.inner.shared;
        let snapshot = Snapshot::compile(config);
        shared.workflow.configure(&snapshot.config().workflow);
        shared.snapshot.store(Arc::new(snapshot));
        if let Some(rotation) = &self.inner.rotation {
            rotation.reschedule();
        }
        otel_info!(name: "AdaptiveSampler.ConfigUpdated");
    }

    /// The configuration snapshot currently in effect.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.shared.snapshot.load_full()
    }

    /// Local service name.
    pub fn service_name(&self) -> &str {
        &self.inner.shared.service_name
    }

    /// The min-count sampler.
    pub fn min_count(&self) -> &MinCountSampler {
        &self.inner.shared.min_count
    }

    /// The workflow sampler.
    pub fn workflow(&self) -> &WorkflowSampler {
        &self.inner.shared.workflow
    }

    /// The deferred sampler following this sampler's configuration. Every
    /// call returns a handle to the same pending marks.
    pub fn deferred_sampler(&self) -> DeferredSampler {
        self.inner.shared.deferred.clone()
    }

    /// Opens a new min-count window.
    pub fn rotate_min_count_window(&self) {
        self.inner.shared.rotate_window();
    }

    /// Forgets every seen workflow edge.
    pub fn reset_workflow_cache(&self) {
        self.inner.shared.reset_cache();
    }

    /// Starts a new workflow insertion budget period.
    pub fn reset_workflow_budget(&self) {
        self.inner.shared.reset_budget();
    }

    /// Stops the rotation thread. Sampling keeps working, windows and caches
    /// are no longer rotated.
    pub fn shutdown(&self) -> SamplerResult<()> {
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(SamplerError::AlreadyShutdown);
        }
        let result = match &self.inner.rotation {
            Some(rotation) => rotation.shutdown(),
            None => Ok(()),
        };
        otel_info!(name: "AdaptiveSampler.Shutdown");
        result
    }

    /// Returns `true` once [`AdaptiveSampler::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Acquire)
    }
}

/// Keeps `RecordAndSample` and a sampled hop strategy in agreement, whatever
/// the decision stage did, and never lets the protocol marker get lost.
fn align_lineage(decision: &SamplingDecision, state: &mut TraceState) {
    let sample = &mut state.sample;
    if sample.root_strategy == Strategy::NotExist {
        sample.root_strategy = Strategy::NotMatch;
    }
    match decision {
        SamplingDecision::RecordAndSample if !sample.sampled_strategy.is_sampled() => {
            sample.sampled_strategy = Strategy::User;
            if !sample.root_strategy.is_sampled() {
                sample.root_strategy = Strategy::User;
            }
        }
        SamplingDecision::Drop | SamplingDecision::RecordOnly
            if sample.sampled_strategy.is_sampled() =>
        {
            sample.sampled_strategy = Strategy::NotMatch;
        }
        _ => {
            if sample.sampled_strategy == Strategy::NotExist {
                sample.sampled_strategy = Strategy::NotMatch;
            }
        }
    }
}

/// Keeps `fraction` of trace ids, compatible with the SDK's trace id ratio
/// sampler.
fn sample_by_fraction(fraction: f64, trace_id: TraceId) -> bool {
    if fraction >= 1.0 {
        return true;
    }
    let bound = (fraction.max(0.0) * (1u64 << 63) as f64) as u64;
    let bytes = trace_id.to_bytes();
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[8..]);
    (u64::from_be_bytes(low) >> 1) < bound
}

impl ShouldSample for AdaptiveSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        _links: &[Link],
    ) -> opentelemetry::trace::SamplingResult {
        let parent_span_context = parent_context
            .filter(|cx| cx.has_active_span())
            .map(|cx| cx.span().span_context().clone());

        let parent = parent_span_context
            .as_ref()
            .map(|span_context| ParentContext {
                trace_id: span_context.trace_id(),
                sampled: span_context.is_sampled(),
                trace_state: span_context.trace_state().get(TRACE_STATE_KEY).unwrap_or(""),
            });
        let request = SamplingRequest {
            trace_id,
            name,
            kind: span_kind,
            attributes,
            parent,
        };

        let parent_trace_state = parent_span_context
            .as_ref()
            .map(|span_context| span_context.trace_state().clone())
            .unwrap_or_else(OtelTraceState::default);
        self.sample(&request).into_otel(&parent_trace_state)
    }
}
