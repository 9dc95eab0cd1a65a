//! # OpenTelemetry Adaptive Sampler
//!
//! An in-process sampler for the OpenTelemetry SDK that decides, per span and
//! without central coordination, whether a span is kept, and propagates that
//! decision to downstream hops in a private `tracestate` entry.
//!
//! A decision combines several tactics:
//!
//! * **workflow coverage**: the first occurrence of every call-graph edge
//!   within a cache lifetime is recorded ([`workflow`]);
//! * **follow**: a span whose parent was sampled is sampled;
//! * **dyeing**: spans carrying configured attribute values are sampled, with
//!   exact or bloom filter matching ([`dyeing`]);
//! * **min-count**: every interface is sampled at least `N` times per window
//!   ([`min_count`]);
//! * **random**: a configured fraction of traces is sampled;
//! * **rate limiting** per root strategy ([`rate_limit`]);
//! * **deferred** sampling of failed or slow spans once they end, applied in
//!   the SDK pipeline by a [`DeferredSpanProcessor`] ([`deferred`]).
//!
//! ```
//! use opentelemetry_adaptive_sampler::{AdaptiveSampler, SamplerConfig};
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! let config = SamplerConfig::from_json(r#"{"fraction": 0.01, "min_sample": {"enabled": true}}"#)
//!     .expect("valid configuration");
//! let sampler = AdaptiveSampler::builder()
//!     .with_service_name("checkout")
//!     .with_config(config)
//!     .build();
//!
//! let provider = SdkTracerProvider::builder()
//!     .with_sampler(sampler.clone())
//!     .build();
//! # drop(provider);
//! sampler.shutdown().expect("first shutdown");
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

mod adaptive;
pub mod config;
pub mod deferred;
pub mod dyeing;
mod error;
pub mod min_count;
pub mod rate_limit;
mod registry;
pub mod request;
mod result;
mod rotation;
pub mod semconv;
pub mod strategy;
pub mod trace_state;
pub mod workflow;

pub use adaptive::{AdaptiveSampler, AdaptiveSamplerBuilder, DefaultPipeline, UserSampler};
pub use config::{SamplerConfig, Snapshot};
pub use deferred::{
    DeferredDecision, DeferredMark, DeferredSampler, DeferredSpanProcessor, SpanOutcome,
};
pub use error::{SamplerError, SamplerResult};
pub use registry::SamplerRegistry;
pub use request::{ParentContext, SamplingRequest};
pub use result::{SamplingResult, StageResult};
pub use strategy::Strategy;
pub use trace_state::{TraceState, TRACE_STATE_KEY};
