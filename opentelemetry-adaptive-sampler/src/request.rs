//! The inputs of one sampling decision.
use crate::semconv;
use opentelemetry::trace::{SpanKind, TraceId};
use opentelemetry::{KeyValue, Value};
use std::borrow::Cow;

/// What the sampler knows about the parent of a span.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParentContext<'a> {
    /// Trace id of the parent.
    pub trace_id: TraceId,
    /// The W3C sampled flag of the parent.
    pub sampled: bool,
    /// The sampler entry of the parent's `tracestate`, empty if absent.
    pub trace_state: &'a str,
}

/// The inputs of one sampling decision. Lives only for the decision call.
#[derive(Clone, Copy, Debug)]
pub struct SamplingRequest<'a> {
    /// Trace id of the span to be created.
    pub trace_id: TraceId,
    /// Span name.
    pub name: &'a str,
    /// Span kind.
    pub kind: &'a SpanKind,
    /// Span attributes, in order and possibly with repeated keys.
    pub attributes: &'a [KeyValue],
    /// Parent of the span, `None` for root spans.
    pub parent: Option<ParentContext<'a>>,
}

impl<'a> SamplingRequest<'a> {
    /// Creates a request for a root span.
    pub fn new(
        trace_id: TraceId,
        name: &'a str,
        kind: &'a SpanKind,
        attributes: &'a [KeyValue],
    ) -> Self {
        SamplingRequest {
            trace_id,
            name,
            kind,
            attributes,
            parent: None,
        }
    }

    /// Attaches a parent context.
    pub fn with_parent(mut self, parent: ParentContext<'a>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// First attribute value stored under `key`.
    pub fn attribute(&self, key: &str) -> Option<&'a Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    fn attribute_str(&self, key: &str) -> Option<Cow<'a, str>> {
        self.attribute(key)
            .map(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    fn first_of(&self, keys: &[&str]) -> Option<Cow<'a, str>> {
        keys.iter().find_map(|key| self.attribute_str(key))
    }

    /// Resolves who is calling whom for this span.
    pub(crate) fn interface(&self, local_service: &'a str) -> Interface<'a> {
        let local = Cow::Borrowed(local_service);
        let name = Cow::Borrowed(self.name);
        let callee_method = self
            .first_of(&[semconv::CALLEE_METHOD, semconv::RPC_METHOD])
            .unwrap_or_else(|| name.clone());

        match self.kind {
            SpanKind::Client | SpanKind::Producer => Interface {
                caller_service: self
                    .first_of(&[semconv::CALLER_SERVICE])
                    .unwrap_or_else(|| local.clone()),
                caller_method: self
                    .first_of(&[semconv::CALLER_METHOD])
                    .unwrap_or(name),
                callee_service: self
                    .first_of(&[
                        semconv::CALLEE_SERVICE,
                        semconv::RPC_SERVICE,
                        semconv::PEER_SERVICE,
                    ])
                    .unwrap_or_default(),
                callee_method,
            },
            SpanKind::Server | SpanKind::Consumer => Interface {
                caller_service: self
                    .first_of(&[semconv::CALLER_SERVICE, semconv::PEER_SERVICE])
                    .unwrap_or_default(),
                caller_method: self
                    .first_of(&[semconv::CALLER_METHOD])
                    .unwrap_or_default(),
                callee_service: self
                    .first_of(&[semconv::CALLEE_SERVICE])
                    .unwrap_or(local),
                callee_method,
            },
            SpanKind::Internal => Interface {
                caller_service: local.clone(),
                caller_method: name,
                callee_service: local,
                callee_method,
            },
        }
    }
}

/// Caller and callee identity of a span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Interface<'a> {
    pub(crate) caller_service: Cow<'a, str>,
    pub(crate) caller_method: Cow<'a, str>,
    pub(crate) callee_service: Cow<'a, str>,
    pub(crate) callee_method: Cow<'a, str>,
}

/// Configuration name of a span kind.
pub(crate) fn kind_name(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "client",
        SpanKind::Server => "server",
        SpanKind::Producer => "producer",
        SpanKind::Consumer => "consumer",
        SpanKind::Internal => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_resolves_callee_from_rpc_attributes() {
        let attributes = [
            KeyValue::new(semconv::RPC_SERVICE, "inventory"),
            KeyValue::new(semconv::RPC_METHOD, "Reserve"),
        ];
        let request = SamplingRequest::new(
            TraceId::from(1),
            "call",
            &SpanKind::Client,
            &attributes,
        );
        let interface = request.interface("checkout");
        assert_eq!(interface.caller_service, "checkout");
        assert_eq!(interface.caller_method, "call");
        assert_eq!(interface.callee_service, "inventory");
        assert_eq!(interface.callee_method, "Reserve");
    }

    #[test]
    fn explicit_callee_wins_over_rpc() {
        let attributes = [
            KeyValue::new(semconv::RPC_SERVICE, "rpc-name"),
            KeyValue::new(semconv::CALLEE_SERVICE, "explicit"),
        ];
        let request = SamplingRequest::new(
            TraceId::from(1),
            "call",
            &SpanKind::Client,
            &attributes,
        );
        assert_eq!(request.interface("local").callee_service, "explicit");
    }

    #[test]
    fn server_is_its_own_callee() {
        let attributes = [KeyValue::new(semconv::PEER_SERVICE, "frontend")];
        let request = SamplingRequest::new(
            TraceId::from(1),
            "GET /cart",
            &SpanKind::Server,
            &attributes,
        );
        let interface = request.interface("cart");
        assert_eq!(interface.caller_service, "frontend");
        assert_eq!(interface.caller_method, "");
        assert_eq!(interface.callee_service, "cart");
        assert_eq!(interface.callee_method, "GET /cart");
    }

    #[test]
    fn first_occurrence_of_repeated_key_is_used() {
        let attributes = [
            KeyValue::new("uin", ""),
            KeyValue::new("uin", "42"),
            KeyValue::new("uin", "43"),
        ];
        let request = SamplingRequest::new(
            TraceId::from(1),
            "op",
            &SpanKind::Internal,
            &attributes,
        );
        assert_eq!(request.attribute("uin"), Some(&Value::from("")));
    }
}
