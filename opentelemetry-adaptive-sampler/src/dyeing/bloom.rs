//! Bloom filter dyeing for large value sets.
use super::DyeingMatcher;
use crate::error::{SamplerError, SamplerResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fnv::FnvHasher;
use opentelemetry::{Key, KeyValue};
use std::collections::HashMap;
use std::f64::consts::LN_2;
use std::hash::Hasher;

const MAX_BIT_SIZE: u64 = 1 << 32;
const MAX_HASH_COUNT: u32 = 32;
// seeds the second hash of the double hashing scheme
const SECOND_HASH_KEY: u64 = 0x9e37_79b9_7f4a_7c15;

/// A fixed size bloom filter over strings.
///
/// Bit `i` lives in bit `i % 8` of byte `i / 8`, so the bitmap can be built
/// by a configuration service and shipped as base64. Index `j` of a value is
/// `(h1 + j * h2) mod bit_size`, where `h1` is the FNV-1a hash of the value and
/// `h2` a second, differently seeded FNV-1a hash forced to be odd.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    bit_size: u64,
    hash_count: u32,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bit_size", &self.bit_size)
            .field("hash_count", &self.hash_count)
            .finish()
    }
}

impl BloomFilter {
    /// Creates an empty filter with the given geometry.
    pub fn new(bit_size: u64, hash_count: u32) -> SamplerResult<Self> {
        validate_geometry(bit_size, hash_count)?;
        Ok(BloomFilter {
            bits: vec![0; bytes_for(bit_size)],
            bit_size,
            hash_count,
        })
    }

    /// Creates an empty filter sized to hold `estimated_count` values with a
    /// false positive rate of at most `false_positive_rate`.
    pub fn with_false_positive_rate(
        estimated_count: u64,
        false_positive_rate: f64,
    ) -> SamplerResult<Self> {
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(SamplerError::BloomFilter(format!(
                "false positive rate must be in (0, 1), got {false_positive_rate}"
            )));
        }
        let n = estimated_count.max(1) as f64;
        let bit_size = (-n * false_positive_rate.ln() / (LN_2 * LN_2)).ceil() as u64;
        let hash_count = ((bit_size as f64 / n) * LN_2).round() as u32;
        BloomFilter::new(bit_size.max(8), hash_count.clamp(1, MAX_HASH_COUNT))
    }

    /// Wraps a bitmap produced elsewhere.
    pub fn from_bitmap(bit_size: u64, hash_count: u32, bits: Vec<u8>) -> SamplerResult<Self> {
        validate_geometry(bit_size, hash_count)?;
        if bits.len() < bytes_for(bit_size) {
            return Err(SamplerError::BloomFilter(format!(
                "bitmap holds {} bits, {} required",
                bits.len() * 8,
                bit_size
            )));
        }
        Ok(BloomFilter {
            bits,
            bit_size,
            hash_count,
        })
    }

    /// Wraps a base64 encoded bitmap produced elsewhere.
    pub fn from_base64(bit_size: u64, hash_count: u32, bitmap: &str) -> SamplerResult<Self> {
        let bits = STANDARD.decode(bitmap.trim())?;
        BloomFilter::from_bitmap(bit_size, hash_count, bits)
    }

    /// Base64 encoding of the bitmap.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bits)
    }

    /// Number of bits in the filter.
    pub fn bit_size(&self) -> u64 {
        self.bit_size
    }

    /// Number of hash functions.
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Adds a value.
    pub fn insert(&mut self, value: &str) {
        let (h1, h2) = hashes(value);
        for j in 0..u64::from(self.hash_count) {
            let idx = self.index(h1, h2, j);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// Returns `true` if the value may have been added, `false` if it
    /// certainly was not.
    pub fn contains(&self, value: &str) -> bool {
        let (h1, h2) = hashes(value);
        (0..u64::from(self.hash_count)).all(|j| {
            let idx = self.index(h1, h2, j);
            self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0
        })
    }

    fn index(&self, h1: u64, h2: u64, j: u64) -> u64 {
        h1.wrapping_add(j.wrapping_mul(h2)) % self.bit_size
    }
}

impl<'a> Extend<&'a str> for BloomFilter {
    fn extend<T: IntoIterator<Item = &'a str>>(&mut self, iter: T) {
        for value in iter {
            self.insert(value);
        }
    }
}

fn validate_geometry(bit_size: u64, hash_count: u32) -> SamplerResult<()> {
    if bit_size == 0 || bit_size > MAX_BIT_SIZE {
        return Err(SamplerError::BloomFilter(format!(
            "bit size must be in 1..={MAX_BIT_SIZE}, got {bit_size}"
        )));
    }
    if hash_count == 0 || hash_count > MAX_HASH_COUNT {
        return Err(SamplerError::BloomFilter(format!(
            "hash count must be in 1..={MAX_HASH_COUNT}, got {hash_count}"
        )));
    }
    Ok(())
}

fn bytes_for(bit_size: u64) -> usize {
    bit_size.div_ceil(8) as usize
}

fn hashes(value: &str) -> (u64, u64) {
    let mut first = FnvHasher::default();
    first.write(value.as_bytes());
    let mut second = FnvHasher::with_key(SECOND_HASH_KEY);
    second.write(value.as_bytes());
    (first.finish(), second.finish() | 1)
}

/// Bloom filter dyeing rules: attribute key to a filter of dyed values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BloomDyeing {
    rules: HashMap<String, BloomFilter>,
}

impl BloomDyeing {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        BloomDyeing::default()
    }

    /// Sets the filter for attribute `key`.
    pub fn with_rule(mut self, key: impl Into<String>, filter: BloomFilter) -> Self {
        self.rules.insert(key.into(), filter);
        self
    }

    /// Returns `true` if no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl DyeingMatcher for BloomDyeing {
    fn matches<'a>(&self, attributes: &'a [KeyValue]) -> Option<&'a Key> {
        if self.rules.is_empty() {
            return None;
        }
        attributes
            .iter()
            .find(|kv| {
                self.rules
                    .get(kv.key.as_str())
                    .is_some_and(|filter| filter.contains(kv.value.as_str().as_ref()))
            })
            .map(|kv| &kv.key)
    }
}
