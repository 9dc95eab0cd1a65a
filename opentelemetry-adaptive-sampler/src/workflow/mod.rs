//! Workflow path sampling.
//!
//! Every client or server span is one half of a call-graph edge. The edge gets
//! a hash-chained id (see [`path`]) and is looked up in a bounded seen-edge
//! cache per side. The first occurrence of an edge within the cache lifetime
//! is recorded, repeats are not, so the topology of the fleet is covered no
//! matter how little traffic an edge carries.
//!
//! A discovered edge is marked `RecordOnly` rather than sampled so the
//! decision is not forced onto downstream hops. The client half writes
//! [`WorkflowResult::Path`] into the propagated state, which tells the server
//! half to keep its side of the same edge.
use crate::config::WorkflowConfig;
use crate::request::{Interface, SamplingRequest};
use crate::result::StageResult;
use crate::semconv;
use crate::trace_state::{TraceState, WorkflowResult, WorkflowState};
use opentelemetry::trace::{SamplingDecision, SpanKind};
use opentelemetry::KeyValue;

mod cache;
pub mod path;

pub use cache::{Insertion, PathCache, Side};

/// The workflow stage of the sampling pipeline.
#[derive(Debug, Default)]
pub struct WorkflowSampler {
    cache: PathCache,
}

impl WorkflowSampler {
    /// Creates a sampler with empty caches.
    pub fn new() -> Self {
        WorkflowSampler::default()
    }

    /// The seen-edge caches.
    pub fn cache(&self) -> &PathCache {
        &self.cache
    }

    /// Applies the limits of a newly published configuration.
    pub fn configure(&self, config: &WorkflowConfig) {
        self.cache
            .set_insertion_limit(config.max_insertions_per_minute);
    }

    /// Forgets every seen edge.
    pub fn reset_cache(&self) {
        self.cache.reset();
    }

    /// Starts a new insertion budget period.
    pub fn reset_budget(&self) {
        self.cache.reset_budget();
    }

    /// Evaluates the span and writes the workflow bookkeeping into `state`.
    ///
    /// Internal spans are not edges, they leave `state` untouched. The same
    /// holds for every span when the stage is disabled.
    pub(crate) fn sample(
        &self,
        request: &SamplingRequest<'_>,
        interface: &Interface<'_>,
        state: &mut TraceState,
        config: &WorkflowConfig,
    ) -> StageResult {
        if !config.enabled {
            return StageResult::dropped();
        }
        let side = match request.kind {
            SpanKind::Client | SpanKind::Producer => Side::Client,
            SpanKind::Server | SpanKind::Consumer => Side::Server,
            SpanKind::Internal => return StageResult::dropped(),
        };

        let incoming = state.workflow;
        let (path, parent_path) = edge(side, &incoming, interface);

        let legacy_sampled = state.is_legacy() && request.parent.is_some_and(|p| p.sampled);
        let (result, decision) = if legacy_sampled {
            // the upstream sampler already kept the trace, nothing to discover
            (WorkflowResult::RandomLegacy, SamplingDecision::Drop)
        } else if side == Side::Server && incoming.result == WorkflowResult::Path {
            // the client half of this edge was new, record the server half too
            self.cache
                .insert_unbudgeted(Side::Server, path, config.max_paths);
            (WorkflowResult::Sample, SamplingDecision::RecordOnly)
        } else {
            match self.cache.try_insert(side, path, config.max_paths) {
                Insertion::Inserted => (WorkflowResult::Path, SamplingDecision::RecordOnly),
                Insertion::Seen | Insertion::Full | Insertion::OverBudget => {
                    (WorkflowResult::Drop, SamplingDecision::Drop)
                }
            }
        };

        state.workflow = WorkflowState {
            result,
            path,
            parent_path,
        };

        StageResult::new(decision)
            .with_attribute(KeyValue::new(semconv::WORKFLOW_PATH, path as i64))
            .with_attribute(KeyValue::new(
                semconv::WORKFLOW_PARENT_PATH,
                parent_path as i64,
            ))
            .with_attribute(KeyValue::new(semconv::WORKFLOW_RESULT, result.name()))
    }
}

/// Returns `(path, parent_path)` of the edge a span belongs to.
fn edge(side: Side, incoming: &WorkflowState, interface: &Interface<'_>) -> (u64, u64) {
    match side {
        Side::Client => {
            let parent_path = if incoming.path != 0 {
                incoming.path
            } else {
                path::root_path(&interface.caller_service, &interface.caller_method)
            };
            let path = path::child_path(
                parent_path,
                &interface.callee_service,
                &interface.callee_method,
            );
            (path, parent_path)
        }
        // the client half already computed the edge id
        Side::Server if incoming.path != 0 => (incoming.path, incoming.parent_path),
        Side::Server => {
            let parent_path =
                path::root_path(&interface.caller_service, &interface.caller_method);
            let path = path::child_path(
                parent_path,
                &interface.callee_service,
                &interface.callee_method,
            );
            (path, parent_path)
        }
    }
}
