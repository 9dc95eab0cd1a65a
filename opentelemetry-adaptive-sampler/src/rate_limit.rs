//! Token buckets capping sampled traces per root strategy.
use crate::strategy::Strategy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free token bucket.
///
/// Instead of counting tokens the bucket keeps a virtual clock, the time at
/// which the last granted token would have been produced. Consuming `n` tokens
/// advances it by `n` token periods, starting no earlier than one full burst
/// before now, and succeeds only if the result does not pass now.
#[derive(Debug)]
pub struct TokenBucket {
    time_per_token: u64,
    time_per_burst: u64,
    // nanoseconds since `epoch`, shifted by `time_per_burst`
    last_grant: AtomicU64,
    epoch: Instant,
    deny_all: bool,
}

impl TokenBucket {
    /// A bucket producing `rate` tokens per `tick` and holding at most
    /// `burst` tokens. A zero `rate` denies everything.
    pub fn new(rate: u64, burst: u64, tick: Duration) -> Self {
        let tick_nanos = u64::try_from(tick.as_nanos()).unwrap_or(u64::MAX).max(1);
        let time_per_token = if rate == 0 {
            u64::MAX
        } else {
            (tick_nanos / rate).max(1)
        };
        TokenBucket {
            time_per_token,
            time_per_burst: time_per_token.saturating_mul(burst.max(1)),
            last_grant: AtomicU64::new(0),
            epoch: Instant::now(),
            deny_all: rate == 0,
        }
    }

    /// Takes `n` tokens if they are available.
    pub fn consume(&self, n: u64) -> bool {
        if self.deny_all {
            return false;
        }
        let elapsed = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.consume_at(n, elapsed.saturating_add(self.time_per_burst))
    }

    fn consume_at(&self, n: u64, now: u64) -> bool {
        let cost = n.saturating_mul(self.time_per_token);
        let floor = now.saturating_sub(self.time_per_burst);
        let mut last = self.last_grant.load(Ordering::Acquire);
        loop {
            let next = last.max(floor).saturating_add(cost);
            if next > now {
                return false;
            }
            match self.last_grant.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Independent token buckets keyed by the root strategy of a trace, plus an
/// optional default bucket for strategies without their own.
///
/// Strategies without any bucket are not limited.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<Strategy, TokenBucket>,
    default: Option<TokenBucket>,
}

impl RateLimiter {
    /// A limiter that admits everything.
    pub fn new() -> Self {
        RateLimiter::default()
    }

    /// Limits traces rooted in `strategy` with `bucket`.
    pub fn with_bucket(mut self, strategy: Strategy, bucket: TokenBucket) -> Self {
        self.buckets.insert(strategy, bucket);
        self
    }

    /// Limits traces whose root strategy has no bucket of its own.
    pub fn with_default(mut self, bucket: TokenBucket) -> Self {
        self.default = Some(bucket);
        self
    }

    /// Returns `true` if no bucket is configured.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.default.is_none()
    }

    /// Admits one more trace rooted in `root`.
    pub fn allow(&self, root: Strategy) -> bool {
        self.buckets
            .get(&root)
            .or(self.default.as_ref())
            .map_or(true, |bucket| bucket.consume(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn burst_then_refill() {
        // 2 tokens per second, burst of 4
        let bucket = TokenBucket::new(2, 4, Duration::from_secs(1));
        let start = bucket.time_per_burst;

        let immediate: Vec<bool> = (0..5).map(|_| bucket.consume_at(1, start)).collect();
        assert_eq!(immediate, vec![true, true, true, true, false]);

        let after_tick: Vec<bool> = (0..3).map(|_| bucket.consume_at(1, start + SEC)).collect();
        assert_eq!(after_tick, vec![true, true, false]);
    }

    #[test]
    fn idle_bucket_refills_only_up_to_burst() {
        let bucket = TokenBucket::new(2, 4, Duration::from_secs(1));
        let later = bucket.time_per_burst + 60 * SEC;
        let granted = (0..10).filter(|_| bucket.consume_at(1, later)).count();
        assert_eq!(granted, 4);
    }

    #[test]
    fn multi_token_consume() {
        let bucket = TokenBucket::new(2, 4, Duration::from_secs(1));
        let start = bucket.time_per_burst;
        assert!(bucket.consume_at(4, start));
        assert!(!bucket.consume_at(1, start));

        let fresh = TokenBucket::new(2, 4, Duration::from_secs(1));
        assert!(!fresh.consume_at(5, start));
    }

    #[test]
    fn zero_rate_denies() {
        let bucket = TokenBucket::new(0, 10, Duration::from_secs(1));
        assert!(!bucket.consume(1));
    }

    #[test]
    fn real_clock_grants_the_burst() {
        let bucket = TokenBucket::new(1, 3, Duration::from_secs(3600));
        let granted = (0..5).filter(|_| bucket.consume(1)).count();
        assert_eq!(granted, 3);
    }

    #[test]
    fn concurrent_consumers_never_exceed_burst() {
        let bucket = Arc::new(TokenBucket::new(1, 50, Duration::from_secs(3600)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                thread::spawn(move || (0..100).filter(|_| bucket.consume(1)).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }

    #[test]
    fn limiter_routes_by_root_strategy() {
        let limiter = RateLimiter::new()
            .with_bucket(Strategy::Dyeing, TokenBucket::new(1, 1, Duration::from_secs(3600)))
            .with_default(TokenBucket::new(1, 2, Duration::from_secs(3600)));

        assert!(limiter.allow(Strategy::Dyeing));
        assert!(!limiter.allow(Strategy::Dyeing));

        assert!(limiter.allow(Strategy::Random));
        assert!(limiter.allow(Strategy::MinCount));
        assert!(!limiter.allow(Strategy::Random));
    }

    #[test]
    fn empty_limiter_admits_everything() {
        let limiter = RateLimiter::new();
        assert!(limiter.is_empty());
        assert!((0..1000).all(|_| limiter.allow(Strategy::Random)));
    }
}
