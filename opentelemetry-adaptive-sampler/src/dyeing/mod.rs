//! Dyeing: forced sampling based on attribute values.
//!
//! Two rule sets share the same shape, a map from attribute key to the values
//! that dye a span. [`ExactDyeing`] stores the values as they are,
//! [`BloomDyeing`] stores a bloom filter per key and trades exactness (it may
//! over-sample, never under-sample) for a compact representation of very
//! large value sets.
//!
//! Rule sets are immutable once built. A configuration change builds new ones
//! and publishes them as part of a new snapshot.
use crate::semconv;
use opentelemetry::{Key, KeyValue};

mod bloom;
mod exact;

pub use bloom::{BloomDyeing, BloomFilter};
pub use exact::ExactDyeing;

/// Matches span attributes against a rule set.
pub trait DyeingMatcher {
    /// Returns the key of the first attribute that dyes the span.
    fn matches<'a>(&self, attributes: &'a [KeyValue]) -> Option<&'a Key>;
}

impl<T: DyeingMatcher> DyeingMatcher for Option<T> {
    fn matches<'a>(&self, attributes: &'a [KeyValue]) -> Option<&'a Key> {
        self.as_ref().and_then(|rules| rules.matches(attributes))
    }
}

/// Returns the force-sample attribute if the span carries it with a truthy
/// value. This override works without any configured rules.
pub fn forced(attributes: &[KeyValue]) -> Option<&Key> {
    attributes
        .iter()
        .find(|kv| {
            kv.key.as_str() == semconv::FORCE_SAMPLE
                && !matches!(kv.value.as_str().as_ref(), "" | "0" | "false")
        })
        .map(|kv| &kv.key)
}
