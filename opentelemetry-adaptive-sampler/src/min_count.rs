//! Windowed min-count sampling: at least `N` samples per interface per window.
use arc_swap::ArcSwap;
use dashmap::DashMap;
use fnv::FnvHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counts per interface for one window.
///
/// A window is never cleared. Rotation replaces it with a fresh one.
#[derive(Debug)]
pub struct KeyWindow {
    counts: DashMap<u64, AtomicU32>,
    distinct: AtomicUsize,
    started: Instant,
}

impl KeyWindow {
    fn new() -> Self {
        KeyWindow {
            counts: DashMap::new(),
            distinct: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Number of distinct interfaces seen in this window.
    pub fn distinct_keys(&self) -> usize {
        self.distinct.load(Ordering::Relaxed)
    }

    /// When the window was opened.
    pub fn started(&self) -> Instant {
        self.started
    }

    fn try_sample(&self, key: u64, min_count: u32, max_keys: usize) -> bool {
        if let Some(count) = self.counts.get(&key) {
            return increment_below(&count, min_count);
        }

        // reserve a slot before inserting so the key budget is a hard cap
        let reserved = self
            .distinct
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_keys).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return false;
        }

        let mut inserted = false;
        let count = self
            .counts
            .entry(key)
            .or_insert_with(|| {
                inserted = true;
                AtomicU32::new(0)
            })
            .downgrade();
        if !inserted {
            // lost the race against another request for the same key
            self.distinct.fetch_sub(1, Ordering::AcqRel);
        }
        increment_below(&count, min_count)
    }
}

fn increment_below(count: &AtomicU32, limit: u32) -> bool {
    count
        .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |c| {
            (c < limit).then_some(c + 1)
        })
        .is_ok()
}

fn interface_key(service: &str, method: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(service.as_bytes());
    hasher.write_u8(0x1f);
    hasher.write(method.as_bytes());
    hasher.finish()
}

/// Guarantees a sampling floor per (callee service, callee method) pair.
///
/// Two windows are held, the current one and the one it replaced. Readers
/// always go through the current window, which is swapped atomically by
/// [`MinCountSampler::rotate`].
#[derive(Debug)]
pub struct MinCountSampler {
    current: ArcSwap<KeyWindow>,
    previous: ArcSwap<KeyWindow>,
}

impl Default for MinCountSampler {
    fn default() -> Self {
        MinCountSampler::new()
    }
}

impl MinCountSampler {
    /// Creates a sampler with an empty window.
    pub fn new() -> Self {
        MinCountSampler {
            current: ArcSwap::from_pointee(KeyWindow::new()),
            previous: ArcSwap::from_pointee(KeyWindow::new()),
        }
    }

    /// Returns `true` if the interface has been sampled fewer than
    /// `min_count` times in the current window, counting this request.
    ///
    /// Once `max_keys` distinct interfaces are tracked, new interfaces are not
    /// sampled by this sampler.
    pub fn should_sample(
        &self,
        callee_service: &str,
        callee_method: &str,
        min_count: u32,
        max_keys: usize,
    ) -> bool {
        if min_count == 0 {
            return false;
        }
        let key = interface_key(callee_service, callee_method);
        self.current.load().try_sample(key, min_count, max_keys)
    }

    /// Opens a new window and retires the current one.
    pub fn rotate(&self) {
        let retired = self.current.swap(Arc::new(KeyWindow::new()));
        self.previous.store(retired);
    }

    /// The window requests are currently counted in.
    pub fn current_window(&self) -> Arc<KeyWindow> {
        self.current.load_full()
    }

    /// The window that was current before the last rotation.
    pub fn previous_window(&self) -> Arc<KeyWindow> {
        self.previous.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn floor_then_reject() {
        let sampler = MinCountSampler::new();
        let results: Vec<bool> = (0..4)
            .map(|_| sampler.should_sample("inventory", "Reserve", 2, 10))
            .collect();
        assert_eq!(results, vec![true, true, false, false]);
        assert!(sampler.should_sample("inventory", "Release", 2, 10));
    }

    #[test]
    fn rotation_opens_a_fresh_window() {
        let sampler = MinCountSampler::new();
        assert!(sampler.should_sample("svc", "m", 1, 10));
        assert!(!sampler.should_sample("svc", "m", 1, 10));

        sampler.rotate();
        assert_eq!(sampler.previous_window().distinct_keys(), 1);
        assert_eq!(sampler.current_window().distinct_keys(), 0);
        assert!(sampler.should_sample("svc", "m", 1, 10));
    }

    #[test]
    fn key_budget_overflow_bypasses_sampler() {
        let sampler = MinCountSampler::new();
        assert!(sampler.should_sample("svc", "a", 1, 2));
        assert!(sampler.should_sample("svc", "b", 1, 2));
        assert!(!sampler.should_sample("svc", "c", 1, 2));
        assert_eq!(sampler.current_window().distinct_keys(), 2);
    }

    #[test]
    fn service_and_method_do_not_alias() {
        assert_ne!(interface_key("ab", "c"), interface_key("a", "bc"));
    }

    #[test]
    fn concurrent_requests_respect_the_floor() {
        let sampler = Arc::new(MinCountSampler::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sampler = Arc::clone(&sampler);
                thread::spawn(move || {
                    (0..100)
                        .filter(|_| sampler.should_sample("svc", "hot", 5, 10))
                        .count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 5);
        assert_eq!(sampler.current_window().distinct_keys(), 1);
    }
}
