//! Attribute keys read and written by the sampler.

/// Attribute whose presence (with any value other than `false`, `0` or empty)
/// forces a span to be sampled. Meant for manual debugging.
pub const FORCE_SAMPLE: &str = "sampler.force";

/// Service name of the caller.
pub const CALLER_SERVICE: &str = "caller.service";
/// Method name of the caller.
pub const CALLER_METHOD: &str = "caller.method";
/// Service name of the callee.
pub const CALLEE_SERVICE: &str = "callee.service";
/// Method name of the callee.
pub const CALLEE_METHOD: &str = "callee.method";

/// OpenTelemetry `rpc.service`.
pub const RPC_SERVICE: &str = "rpc.service";
/// OpenTelemetry `rpc.method`.
pub const RPC_METHOD: &str = "rpc.method";
/// OpenTelemetry `peer.service`.
pub const PEER_SERVICE: &str = "peer.service";

/// Strategy that sampled the span, written on sampled spans.
pub const SAMPLER_STRATEGY: &str = "sampler.strategy";
/// Id of the workflow node the span belongs to, as the bit pattern of the
/// `u64` path in an `i64`.
pub const WORKFLOW_PATH: &str = "sampler.workflow.path";
/// Id of the caller's workflow node, encoded like [`WORKFLOW_PATH`].
pub const WORKFLOW_PARENT_PATH: &str = "sampler.workflow.parent_path";
/// Workflow sampler result for the span.
pub const WORKFLOW_RESULT: &str = "sampler.workflow.result";
