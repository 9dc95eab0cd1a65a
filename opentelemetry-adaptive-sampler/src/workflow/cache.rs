//! Bounded seen-edge sets for the workflow stage.
use arc_swap::ArcSwap;
use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Which end of an edge a span sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Client and producer spans.
    Client,
    /// Server and consumer spans.
    Server,
}

/// Result of an insertion attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// The path was new and is now recorded.
    Inserted,
    /// The path was already recorded.
    Seen,
    /// The cache holds `max_paths` paths already.
    Full,
    /// The per-minute insertion budget is used up.
    OverBudget,
}

#[derive(Debug, Default)]
struct EdgeSet {
    paths: DashSet<u64>,
    len: AtomicUsize,
}

impl EdgeSet {
    fn insert(&self, path: u64, max_paths: usize, budget: Option<&Budget>) -> Insertion {
        if self.paths.contains(&path) {
            return Insertion::Seen;
        }
        if self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_paths).then_some(n + 1)
            })
            .is_err()
        {
            return Insertion::Full;
        }
        if let Some(budget) = budget {
            if !budget.try_take() {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Insertion::OverBudget;
            }
        }
        if self.paths.insert(path) {
            Insertion::Inserted
        } else {
            // another request inserted the same path in the meantime
            self.len.fetch_sub(1, Ordering::AcqRel);
            if let Some(budget) = budget {
                budget.give_back();
            }
            Insertion::Seen
        }
    }
}

#[derive(Debug)]
struct Budget {
    used: AtomicU64,
    limit: AtomicU64,
}

impl Budget {
    fn try_take(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn give_back(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// The client side and server side seen-edge sets plus the global
/// per-minute insertion budget.
///
/// Both sets are replaced wholesale by [`PathCache::reset`], never cleared in
/// place.
#[derive(Debug)]
pub struct PathCache {
    client: ArcSwap<EdgeSet>,
    server: ArcSwap<EdgeSet>,
    budget: Budget,
}

impl Default for PathCache {
    fn default() -> Self {
        PathCache::new()
    }
}

impl PathCache {
    /// Creates empty caches with an unlimited budget.
    pub fn new() -> Self {
        PathCache {
            client: ArcSwap::from_pointee(EdgeSet::default()),
            server: ArcSwap::from_pointee(EdgeSet::default()),
            budget: Budget {
                used: AtomicU64::new(0),
                limit: AtomicU64::new(u64::MAX),
            },
        }
    }

    fn set(&self, side: Side) -> &ArcSwap<EdgeSet> {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    /// Sets how many budgeted insertions a budget period allows. Called when
    /// a configuration is published, not per span.
    pub fn set_insertion_limit(&self, insertions_per_minute: u64) {
        self.budget
            .limit
            .store(insertions_per_minute, Ordering::Relaxed);
    }

    /// The current per-period insertion limit.
    pub fn insertion_limit(&self) -> u64 {
        self.budget.limit.load(Ordering::Relaxed)
    }

    /// Records `path`, consuming one unit of the per-minute budget if it is
    /// new.
    pub fn try_insert(&self, side: Side, path: u64, max_paths: usize) -> Insertion {
        self.set(side)
            .load()
            .insert(path, max_paths, Some(&self.budget))
    }

    /// Records `path` without consuming budget. Used for the second half of
    /// an edge whose first half was already paid for.
    pub fn insert_unbudgeted(&self, side: Side, path: u64, max_paths: usize) -> Insertion {
        self.set(side).load().insert(path, max_paths, None)
    }

    /// Returns `true` if `path` is recorded.
    pub fn contains(&self, side: Side, path: u64) -> bool {
        self.set(side).load().paths.contains(&path)
    }

    /// Number of paths recorded on `side`.
    pub fn len(&self, side: Side) -> usize {
        self.set(side).load().len.load(Ordering::Relaxed)
    }

    /// Insertions made since the last budget reset.
    pub fn budget_used(&self) -> u64 {
        self.budget.used.load(Ordering::Relaxed)
    }

    /// Forgets every recorded path.
    pub fn reset(&self) {
        self.client.store(Arc::new(EdgeSet::default()));
        self.server.store(Arc::new(EdgeSet::default()));
    }

    /// Starts a new budget period.
    pub fn reset_budget(&self) {
        self.budget.used.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_insert_wins_then_seen() {
        let cache = PathCache::new();
        assert_eq!(cache.try_insert(Side::Client, 7, 10), Insertion::Inserted);
        assert_eq!(cache.try_insert(Side::Client, 7, 10), Insertion::Seen);
        assert!(cache.contains(Side::Client, 7));
        assert!(!cache.contains(Side::Server, 7));
        assert_eq!(cache.budget_used(), 1);
    }

    #[test]
    fn capacity_and_budget_bound_insertions() {
        let cache = PathCache::new();
        cache.set_insertion_limit(3);
        assert_eq!(cache.try_insert(Side::Client, 1, 2), Insertion::Inserted);
        assert_eq!(cache.try_insert(Side::Client, 2, 2), Insertion::Inserted);
        assert_eq!(cache.try_insert(Side::Client, 3, 2), Insertion::Full);

        assert_eq!(cache.try_insert(Side::Server, 1, 10), Insertion::Inserted);
        assert_eq!(cache.try_insert(Side::Server, 2, 10), Insertion::OverBudget);
        assert_eq!(cache.len(Side::Server), 1);

        cache.reset_budget();
        assert_eq!(cache.try_insert(Side::Server, 2, 10), Insertion::Inserted);
    }

    #[test]
    fn insertion_limit_is_read_not_written_by_inserts() {
        let cache = PathCache::new();
        assert_eq!(cache.insertion_limit(), u64::MAX);
        cache.set_insertion_limit(2);
        cache.try_insert(Side::Client, 1, 10);
        assert_eq!(cache.insertion_limit(), 2);
        assert_eq!(cache.try_insert(Side::Client, 2, 10), Insertion::Inserted);
        assert_eq!(cache.try_insert(Side::Client, 3, 10), Insertion::OverBudget);

        // a raised limit applies to the running period
        cache.set_insertion_limit(3);
        assert_eq!(cache.try_insert(Side::Client, 3, 10), Insertion::Inserted);
    }

    #[test]
    fn unbudgeted_insert_skips_budget() {
        let cache = PathCache::new();
        cache.set_insertion_limit(1);
        assert_eq!(cache.try_insert(Side::Client, 1, 10), Insertion::Inserted);
        assert_eq!(cache.insert_unbudgeted(Side::Server, 1, 10), Insertion::Inserted);
        assert_eq!(cache.budget_used(), 1);
    }

    #[test]
    fn reset_forgets_paths() {
        let cache = PathCache::new();
        cache.try_insert(Side::Client, 1, 10);
        cache.insert_unbudgeted(Side::Server, 1, 10);
        cache.reset();
        assert_eq!(cache.len(Side::Client), 0);
        assert_eq!(cache.len(Side::Server), 0);
        assert_eq!(cache.try_insert(Side::Client, 1, 10), Insertion::Inserted);
    }

    #[test]
    fn concurrent_inserts_of_one_path_have_one_winner() {
        let cache = Arc::new(PathCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.try_insert(Side::Client, 42, 100))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r == Insertion::Inserted)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(cache.len(Side::Client), 1);
        assert_eq!(cache.budget_used(), 1);
    }
}
