//! Exact-match dyeing on attribute values.
use super::DyeingMatcher;
use opentelemetry::{Key, KeyValue};
use std::collections::{HashMap, HashSet};

/// Exact-match dyeing rules: attribute key to the set of dyed values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExactDyeing {
    rules: HashMap<String, HashSet<String>>,
}

impl ExactDyeing {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        ExactDyeing::default()
    }

    /// Adds dyed `values` for attribute `key`.
    pub fn with_rule<K, I, V>(mut self, key: K, values: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.rules
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Returns `true` if no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.rules.values().all(HashSet::is_empty)
    }
}

impl DyeingMatcher for ExactDyeing {
    fn matches<'a>(&self, attributes: &'a [KeyValue]) -> Option<&'a Key> {
        if self.rules.is_empty() {
            return None;
        }
        attributes
            .iter()
            .find(|kv| {
                self.rules
                    .get(kv.key.as_str())
                    .is_some_and(|values| values.contains(kv.value.as_str().as_ref()))
            })
            .map(|kv| &kv.key)
    }
}
