//! Sampler configuration.
//!
//! [`SamplerConfig`] is the serde model of the configuration document. Every
//! field is optional. A configuration is sanitised and compiled into an
//! immutable [`Snapshot`] which the sampler publishes behind a single atomic
//! reference, so a decision always sees one whole configuration.
use crate::dyeing::{BloomDyeing, BloomFilter, ExactDyeing};
use crate::error::{SamplerError, SamplerResult};
use crate::rate_limit::{RateLimiter, TokenBucket};
use crate::request::kind_name;
use crate::strategy::Strategy;
use opentelemetry::otel_warn;
use opentelemetry::trace::SpanKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Path of a JSON configuration file.
pub const OTEL_ADAPTIVE_SAMPLER_CONFIG: &str = "OTEL_ADAPTIVE_SAMPLER_CONFIG";
/// Overrides the global fraction.
pub const OTEL_TRACES_SAMPLER_ARG: &str = "OTEL_TRACES_SAMPLER_ARG";

/// Default global fraction.
pub const DEFAULT_FRACTION: f64 = 0.001;
/// Default min-count window.
pub const DEFAULT_WINDOW_SECS: u64 = 60;
/// Default workflow cache lifetime.
pub const DEFAULT_CACHE_LIFETIME_SECS: u64 = 3600;
/// Default rate limiter tick.
pub const DEFAULT_TICK_MS: u64 = 1000;

/// Name of the rate limit bucket used for strategies without their own.
pub const DEFAULT_BUCKET: &str = "default";

/// The sampler configuration document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Fraction of traces kept by random sampling.
    pub fraction: f64,
    /// Fraction overrides by span kind name.
    pub kind_fractions: HashMap<String, f64>,
    /// Fraction overrides by span name.
    pub method_fractions: HashMap<String, f64>,
    /// Windowed min-count sampling.
    pub min_sample: MinSampleConfig,
    /// Exact-match dyeing.
    pub dyeing: DyeingConfig,
    /// Bloom filter dyeing.
    pub bloom_dyeing: BloomDyeingConfig,
    /// Workflow path sampling.
    pub workflow: WorkflowConfig,
    /// Rate limiting by root strategy.
    pub rate_limit: RateLimitConfig,
    /// Post-span sampling.
    pub deferred: DeferredConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            fraction: DEFAULT_FRACTION,
            kind_fractions: HashMap::new(),
            method_fractions: HashMap::new(),
            min_sample: MinSampleConfig::default(),
            dyeing: DyeingConfig::default(),
            bloom_dyeing: BloomDyeingConfig::default(),
            workflow: WorkflowConfig::default(),
            rate_limit: RateLimitConfig::default(),
            deferred: DeferredConfig::default(),
        }
    }
}

/// Windowed min-count sampling settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinSampleConfig {
    /// Enables the sampler.
    pub enabled: bool,
    /// Samples guaranteed per interface and window.
    pub count: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Distinct interfaces tracked per window.
    pub max_keys: usize,
}

impl Default for MinSampleConfig {
    fn default() -> Self {
        MinSampleConfig {
            enabled: false,
            count: 1,
            window_secs: DEFAULT_WINDOW_SECS,
            max_keys: 10_000,
        }
    }
}

impl MinSampleConfig {
    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Exact-match dyeing settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DyeingConfig {
    /// Enables dyeing.
    pub enabled: bool,
    /// Dyeing rules.
    pub rules: Vec<DyeingRuleConfig>,
}

/// One exact-match dyeing rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DyeingRuleConfig {
    /// Attribute key.
    pub key: String,
    /// Values that dye a span.
    pub values: Vec<String>,
}

/// Bloom filter dyeing settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomDyeingConfig {
    /// Enables bloom filter dyeing.
    pub enabled: bool,
    /// Dyeing rules.
    pub rules: Vec<BloomRuleConfig>,
}

/// One bloom filter dyeing rule.
///
/// The filter is either shipped as a bitmap with its geometry
/// (`bit_size`, `hash_count`, `bitmap`) or derived from an estimated number
/// of values and a target false positive rate. `values` are inserted in both
/// cases.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomRuleConfig {
    /// Attribute key.
    pub key: String,
    /// Number of bits of a shipped filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_size: Option<u64>,
    /// Number of hash functions of a shipped filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_count: Option<u32>,
    /// Base64 bitmap of a shipped filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitmap: Option<String>,
    /// Expected number of dyed values. Defaults to the length of `values`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_count: Option<u64>,
    /// Target false positive rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_positive_rate: Option<f64>,
    /// Values to add to the filter.
    pub values: Vec<String>,
}

impl BloomRuleConfig {
    /// Builds the filter described by this rule.
    pub fn build(&self) -> SamplerResult<BloomFilter> {
        let mut filter = match (
            self.bitmap.as_deref(),
            self.bit_size,
            self.hash_count,
            self.false_positive_rate,
        ) {
            (Some(bitmap), Some(bit_size), Some(hash_count), _) => {
                BloomFilter::from_base64(bit_size, hash_count, bitmap)?
            }
            (None, Some(bit_size), Some(hash_count), None) => {
                BloomFilter::new(bit_size, hash_count)?
            }
            (_, _, _, Some(rate)) => BloomFilter::with_false_positive_rate(
                self.estimated_count.unwrap_or(self.values.len() as u64),
                rate,
            )?,
            _ => {
                return Err(SamplerError::BloomFilter(format!(
                    "rule for {:?} needs bit_size and hash_count, or false_positive_rate",
                    self.key
                )))
            }
        };
        filter.extend(self.values.iter().map(String::as_str));
        Ok(filter)
    }
}

/// Workflow path sampling settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Enables the sampler.
    pub enabled: bool,
    /// Capacity of each seen-edge cache.
    pub max_paths: usize,
    /// Seconds after which both caches are reset.
    pub cache_lifetime_secs: u64,
    /// New edges recorded per minute, over both caches.
    pub max_insertions_per_minute: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        WorkflowConfig {
            enabled: true,
            max_paths: 10_000,
            cache_lifetime_secs: DEFAULT_CACHE_LIFETIME_SECS,
            max_insertions_per_minute: 1000,
        }
    }
}

impl WorkflowConfig {
    /// Cache lifetime.
    pub fn cache_lifetime(&self) -> Duration {
        Duration::from_secs(self.cache_lifetime_secs)
    }
}

/// Rate limiting settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of one tick in milliseconds. Bucket rates are per tick.
    pub tick_ms: u64,
    /// Buckets by strategy name, plus the optional `"default"` bucket.
    pub buckets: HashMap<String, BucketConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            tick_ms: DEFAULT_TICK_MS,
            buckets: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Tick length.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Builds the limiter. Buckets named after unknown strategies are skipped.
    pub fn build(&self) -> RateLimiter {
        let tick = self.tick();
        self.buckets
            .iter()
            .fold(RateLimiter::new(), |limiter, (name, bucket)| {
                let token_bucket = TokenBucket::new(bucket.rate, bucket.burst, tick);
                if name == DEFAULT_BUCKET {
                    return limiter.with_default(token_bucket);
                }
                match name.parse::<Strategy>() {
                    Ok(strategy) => limiter.with_bucket(strategy, token_bucket),
                    Err(err) => {
                        otel_warn!(
                            name: "AdaptiveSampler.Config.UnknownRateLimitBucket",
                            bucket = name.clone(),
                            error = err.to_string()
                        );
                        limiter
                    }
                }
            })
    }
}

/// One token bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Tokens added per tick.
    pub rate: u64,
    /// Bucket capacity.
    pub burst: u64,
}

/// Post-span sampling settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    /// Enables post-span sampling. Spans nothing else keeps are recorded
    /// provisionally so their outcome can be evaluated when they end.
    pub enabled: bool,
    /// Keeps spans that end with an error status.
    pub sample_errors: bool,
    /// Fraction of failing traces kept.
    pub error_fraction: f64,
    /// Keeps spans lasting at least this many milliseconds, `0` disables.
    pub slow_duration_ms: u64,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        DeferredConfig {
            enabled: false,
            sample_errors: true,
            error_fraction: 1.0,
            slow_duration_ms: 0,
        }
    }
}

impl DeferredConfig {
    /// Slow threshold, `None` when disabled.
    pub fn slow_duration(&self) -> Option<Duration> {
        (self.slow_duration_ms > 0).then(|| Duration::from_millis(self.slow_duration_ms))
    }
}

impl SamplerConfig {
    /// Parses a JSON document.
    pub fn from_json(json: &str) -> SamplerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON document from a file.
    pub fn from_file(path: impl AsRef<Path>) -> SamplerResult<Self> {
        let json = fs::read_to_string(path)?;
        SamplerConfig::from_json(&json)
    }

    /// Builds a configuration from the environment.
    ///
    /// `OTEL_ADAPTIVE_SAMPLER_CONFIG` names a JSON file, and
    /// `OTEL_TRACES_SAMPLER_ARG` overrides the global fraction. Unreadable or
    /// invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = match env::var(OTEL_ADAPTIVE_SAMPLER_CONFIG) {
            Ok(path) if !path.is_empty() => {
                SamplerConfig::from_file(&path).unwrap_or_else(|err| {
                    otel_warn!(
                        name: "AdaptiveSampler.Config.InvalidFile",
                        path = path.as_str(),
                        error = err.to_string()
                    );
                    SamplerConfig::default()
                })
            }
            _ => SamplerConfig::default(),
        };

        if let Ok(arg) = env::var(OTEL_TRACES_SAMPLER_ARG) {
            match arg.parse::<f64>() {
                Ok(fraction) => config.fraction = fraction,
                Err(_) => {
                    otel_warn!(
                        name: "AdaptiveSampler.Config.InvalidSamplerArgument",
                        otel_traces_sampler_arg = arg.as_str()
                    );
                }
            }
        }
        config.sanitize()
    }

    /// Replaces out of range values with usable ones, logging each fix.
    pub fn sanitize(mut self) -> Self {
        self.fraction = sanitize_fraction("fraction", self.fraction, DEFAULT_FRACTION);
        for (name, fraction) in self.kind_fractions.iter_mut() {
            *fraction = sanitize_fraction(name, *fraction, DEFAULT_FRACTION);
        }
        for (name, fraction) in self.method_fractions.iter_mut() {
            *fraction = sanitize_fraction(name, *fraction, DEFAULT_FRACTION);
        }
        self.deferred.error_fraction =
            sanitize_fraction("deferred.error_fraction", self.deferred.error_fraction, 1.0);

        if self.min_sample.window_secs == 0 {
            warn_replaced("min_sample.window_secs", DEFAULT_WINDOW_SECS);
            self.min_sample.window_secs = DEFAULT_WINDOW_SECS;
        }
        if self.workflow.cache_lifetime_secs == 0 {
            warn_replaced("workflow.cache_lifetime_secs", DEFAULT_CACHE_LIFETIME_SECS);
            self.workflow.cache_lifetime_secs = DEFAULT_CACHE_LIFETIME_SECS;
        }
        if self.rate_limit.tick_ms == 0 {
            warn_replaced("rate_limit.tick_ms", DEFAULT_TICK_MS);
            self.rate_limit.tick_ms = DEFAULT_TICK_MS;
        }
        self
    }
}

fn sanitize_fraction(field: &str, value: f64, default: f64) -> f64 {
    if value.is_nan() {
        otel_warn!(
            name: "AdaptiveSampler.Config.InvalidFraction",
            field = field.to_string(),
            replacement = default
        );
        default
    } else if !(0.0..=1.0).contains(&value) {
        let clamped = value.clamp(0.0, 1.0);
        otel_warn!(
            name: "AdaptiveSampler.Config.InvalidFraction",
            field = field.to_string(),
            value = value,
            replacement = clamped
        );
        clamped
    } else {
        value
    }
}

fn warn_replaced(field: &str, replacement: u64) {
    otel_warn!(
        name: "AdaptiveSampler.Config.InvalidValue",
        field = field.to_string(),
        replacement = replacement
    );
}

/// A sanitised configuration compiled for evaluation.
#[derive(Debug, Default)]
pub struct Snapshot {
    config: SamplerConfig,
    pub(crate) dyeing: Option<ExactDyeing>,
    pub(crate) bloom_dyeing: Option<BloomDyeing>,
    pub(crate) rate_limiter: RateLimiter,
}

impl Snapshot {
    /// Sanitises and compiles `config`.
    ///
    /// Invalid bloom rules are logged and skipped, they never prevent the rest
    /// of the configuration from taking effect.
    pub fn compile(config: SamplerConfig) -> Self {
        let config = config.sanitize();

        let dyeing = config.dyeing.enabled.then(|| {
            config
                .dyeing
                .rules
                .iter()
                .fold(ExactDyeing::new(), |rules, rule| {
                    rules.with_rule(rule.key.clone(), rule.values.iter().cloned())
                })
        });

        let bloom_dyeing = config.bloom_dyeing.enabled.then(|| {
            config
                .bloom_dyeing
                .rules
                .iter()
                .fold(BloomDyeing::new(), |rules, rule| match rule.build() {
                    Ok(filter) => rules.with_rule(rule.key.clone(), filter),
                    Err(err) => {
                        otel_warn!(
                            name: "AdaptiveSampler.Config.InvalidBloomRule",
                            key = rule.key.clone(),
                            error = err.to_string()
                        );
                        rules
                    }
                })
        });

        let rate_limiter = config.rate_limit.build();

        Snapshot {
            config,
            dyeing,
            bloom_dyeing,
            rate_limiter,
        }
    }

    /// The configuration this snapshot was compiled from.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Random sampling fraction for a span. A span name override wins over a
    /// span kind override, which wins over the global fraction.
    pub fn fraction_for(&self, name: &str, kind: &SpanKind) -> f64 {
        self.config
            .method_fractions
            .get(name)
            .or_else(|| self.config.kind_fractions.get(kind_name(kind)))
            .copied()
            .unwrap_or(self.config.fraction)
    }
}
