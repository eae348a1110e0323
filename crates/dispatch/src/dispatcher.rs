//! Request coalescing
//!
//! Tracks one pending group per key. The first requester for a key becomes
//! the starter and is responsible for the fetch; everyone arriving before
//! completion joins the group and is notified, in join order, when the
//! starter calls [`CoalescingDispatcher::complete`].

use crate::waiter::Waiter;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Role handed back by [`CoalescingDispatcher::request_or_join`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The caller must fetch, then call `complete` exactly once
    Starter,
    /// The caller's waiter will be notified by the starter's `complete`
    Joiner,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Groups created (one fetch each)
    pub groups_started: u64,

    /// Requests that attached to an existing group
    pub joins: u64,

    /// Groups completed
    pub completions: u64,

    /// Results handed to waiters
    pub delivered: u64,

    /// Waiters skipped because they were detached
    pub detached: u64,

    /// Groups currently pending
    pub pending: usize,
}

impl DispatchStats {
    /// Fetches avoided by coalescing
    pub fn fetches_saved(&self) -> u64 {
        self.joins
    }
}

struct PendingGroup<R> {
    waiters: Vec<Waiter<R>>,
    started_at: Instant,
}

#[derive(Default)]
struct Counters {
    groups_started: AtomicU64,
    joins: AtomicU64,
    completions: AtomicU64,
    delivered: AtomicU64,
    detached: AtomicU64,
}

/// Coalesces concurrent requests for the same key into one fetch.
///
/// A group is always materialized on the first request, so there is no
/// window in which a second requester can slip in before the waiter list
/// exists.
///
/// # Example
///
/// ```
/// use pixcache_dispatch::{CoalescingDispatcher, Role, Waiter};
///
/// let dispatcher = CoalescingDispatcher::<String, u32>::new();
///
/// let (first, first_handle) = Waiter::channel();
/// let (second, second_handle) = Waiter::channel();
///
/// assert_eq!(dispatcher.request_or_join("a.png".to_string(), first), Role::Starter);
/// assert_eq!(dispatcher.request_or_join("a.png".to_string(), second), Role::Joiner);
///
/// // The starter fetches, then fans the result out to both waiters
/// assert_eq!(dispatcher.complete(&"a.png".to_string(), 42), 2);
/// assert_eq!(first_handle.wait(), Ok(42));
/// assert_eq!(second_handle.wait(), Ok(42));
/// ```
pub struct CoalescingDispatcher<K, R> {
    groups: Mutex<HashMap<K, PendingGroup<R>>>,
    counters: Counters,
}

impl<K, R> CoalescingDispatcher<K, R>
where
    K: Eq + Hash + Clone + Debug,
    R: Clone,
{
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Register `waiter` for `key`.
    ///
    /// Returns [`Role::Starter`] if no group was pending (a new one is
    /// created with this waiter as its only member), otherwise appends the
    /// waiter and returns [`Role::Joiner`].
    pub fn request_or_join(&self, key: K, waiter: Waiter<R>) -> Role {
        let mut groups = self.groups.lock();
        match groups.entry(key) {
            Entry::Occupied(mut entry) => {
                let waiters = {
                    let group = entry.get_mut();
                    group.waiters.push(waiter);
                    group.waiters.len()
                };
                self.counters.joins.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = ?entry.key(), waiters, "joined pending fetch");
                Role::Joiner
            }
            Entry::Vacant(entry) => {
                tracing::debug!(key = ?entry.key(), "starting fetch");
                entry.insert(PendingGroup {
                    waiters: vec![waiter],
                    started_at: Instant::now(),
                });
                self.counters.groups_started.fetch_add(1, Ordering::Relaxed);
                Role::Starter
            }
        }
    }

    /// Complete the group for `key` and deliver `result` to its waiters.
    ///
    /// The group is removed under the lock; delivery happens after the lock
    /// is released, in join order, skipping detached waiters. A later
    /// `request_or_join` for the same key starts a fresh group. Returns the
    /// number of waiters that received the result.
    pub fn complete(&self, key: &K, result: R) -> usize {
        let group = self.groups.lock().remove(key);
        let Some(group) = group else {
            tracing::warn!(key = ?key, "complete called without a pending group");
            return 0;
        };
        self.counters.completions.fetch_add(1, Ordering::Relaxed);

        let total = group.waiters.len();
        let mut delivered = 0;
        let mut first_panic = None;
        for waiter in group.waiters {
            // A panicking callback must not starve the waiters behind it
            let value = result.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| waiter.deliver(value))) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(payload) => {
                    delivered += 1;
                    tracing::warn!(key = ?key, "waiter callback panicked during delivery");
                    first_panic.get_or_insert(payload);
                }
            }
        }

        let detached = total - delivered;
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.counters
            .detached
            .fetch_add(detached as u64, Ordering::Relaxed);
        tracing::debug!(
            key = ?key,
            delivered,
            detached,
            elapsed_ms = group.started_at.elapsed().as_millis() as u64,
            "fetch completed"
        );
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        delivered
    }

    /// Whether a fetch for `key` is outstanding
    pub fn is_pending(&self, key: &K) -> bool {
        self.groups.lock().contains_key(key)
    }

    /// Number of waiters attached to the pending group for `key`
    pub fn waiter_count(&self, key: &K) -> Option<usize> {
        self.groups.lock().get(key).map(|group| group.waiters.len())
    }

    /// How long the group for `key` has been pending
    pub fn pending_for(&self, key: &K) -> Option<Duration> {
        self.groups
            .lock()
            .get(key)
            .map(|group| group.started_at.elapsed())
    }

    /// Number of pending groups
    pub fn pending_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Drop every pending group without delivering anything.
    ///
    /// Waiters created with [`Waiter::channel`] observe
    /// [`crate::WaitError::Closed`]. Starters that complete afterwards find
    /// no group and deliver nothing. Returns the number of groups dropped.
    pub fn clear(&self) -> usize {
        let dropped: Vec<_> = self.groups.lock().drain().collect();
        let count = dropped.len();
        drop(dropped);
        if count > 0 {
            tracing::warn!(groups = count, "pending fetch groups cleared");
        }
        count
    }

    /// Get current statistics
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            groups_started: self.counters.groups_started.load(Ordering::Relaxed),
            joins: self.counters.joins.load(Ordering::Relaxed),
            completions: self.counters.completions.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            detached: self.counters.detached.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }
}

impl<K, R> Default for CoalescingDispatcher<K, R>
where
    K: Eq + Hash + Clone + Debug,
    R: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WaitError;
    use rand::Rng;
    use std::sync::{Arc, Barrier};
    use std::thread;

    type Dispatcher = CoalescingDispatcher<&'static str, u32>;

    fn recording_waiter(log: &Arc<parking_lot::Mutex<Vec<(usize, u32)>>>, id: usize) -> Waiter<u32> {
        let log = Arc::clone(log);
        Waiter::new(move |value| log.lock().push((id, value)))
    }

    #[test]
    fn test_panicking_callback_does_not_starve_later_waiters() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        dispatcher.request_or_join("k", Waiter::new(|_| panic!("render failed")));
        dispatcher.request_or_join("k", recording_waiter(&log, 1));
        let (waiter, handle) = Waiter::channel();
        dispatcher.request_or_join("k", waiter);

        let completer = Arc::clone(&dispatcher);
        let outcome = thread::spawn(move || completer.complete(&"k", 7)).join();

        assert!(outcome.is_err(), "callback panic should be re-raised");
        assert_eq!(*log.lock(), vec![(1, 7)]);
        assert_eq!(handle.try_take(), Some(Ok(7)));
        assert!(!dispatcher.is_pending(&"k"));
        assert_eq!(dispatcher.stats().delivered, 3);
    }

    #[test]
    fn test_first_request_starts() {
        let dispatcher = Dispatcher::new();
        let (waiter, _handle) = Waiter::channel();

        assert_eq!(dispatcher.request_or_join("a", waiter), Role::Starter);
        assert!(dispatcher.is_pending(&"a"));
        assert_eq!(dispatcher.waiter_count(&"a"), Some(1));
    }

    #[test]
    fn test_subsequent_requests_join() {
        let dispatcher = Dispatcher::new();
        let roles: Vec<_> = (0..5)
            .map(|_| dispatcher.request_or_join("a", Waiter::new(|_| {})))
            .collect();

        assert_eq!(roles[0], Role::Starter);
        assert!(roles[1..].iter().all(|role| *role == Role::Joiner));
        assert_eq!(dispatcher.waiter_count(&"a"), Some(5));
        assert_eq!(dispatcher.stats().joins, 4);
    }

    #[test]
    fn test_keys_are_independent() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.request_or_join("a", Waiter::new(|_| {})), Role::Starter);
        assert_eq!(dispatcher.request_or_join("b", Waiter::new(|_| {})), Role::Starter);
        assert_eq!(dispatcher.pending_count(), 2);
    }

    #[test]
    fn test_complete_delivers_in_join_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for id in 0..4 {
            dispatcher.request_or_join("a", recording_waiter(&log, id));
        }
        assert_eq!(dispatcher.complete(&"a", 9), 4);

        assert_eq!(*log.lock(), vec![(0, 9), (1, 9), (2, 9), (3, 9)]);
        assert!(!dispatcher.is_pending(&"a"));
    }

    #[test]
    fn test_complete_starts_fresh_group() {
        let dispatcher = Dispatcher::new();
        dispatcher.request_or_join("a", Waiter::new(|_| {}));
        dispatcher.complete(&"a", 1);

        assert_eq!(dispatcher.request_or_join("a", Waiter::new(|_| {})), Role::Starter);
        assert_eq!(dispatcher.waiter_count(&"a"), Some(1));
    }

    #[test]
    fn test_complete_without_group() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.complete(&"nothing", 1), 0);
        assert_eq!(dispatcher.stats().completions, 0);
    }

    #[test]
    fn test_detached_waiters_are_skipped() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        dispatcher.request_or_join("a", recording_waiter(&log, 0));
        let detached = recording_waiter(&log, 1);
        let token = detached.token();
        dispatcher.request_or_join("a", detached);
        dispatcher.request_or_join("a", recording_waiter(&log, 2));

        token.cancel();
        // Membership is append-only until completion
        assert_eq!(dispatcher.waiter_count(&"a"), Some(3));

        assert_eq!(dispatcher.complete(&"a", 5), 2);
        assert_eq!(*log.lock(), vec![(0, 5), (2, 5)]);
        assert_eq!(dispatcher.stats().detached, 1);
    }

    #[test]
    fn test_clear_closes_waiters() {
        let dispatcher = Dispatcher::new();
        let (waiter, handle) = Waiter::channel();
        dispatcher.request_or_join("a", waiter);

        assert_eq!(dispatcher.clear(), 1);
        assert_eq!(handle.wait(), Err(WaitError::Closed));
        assert_eq!(dispatcher.complete(&"a", 1), 0);
    }

    #[test]
    fn test_delivery_may_reenter_dispatcher() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = Arc::clone(&dispatcher);
        let role = Arc::new(parking_lot::Mutex::new(None));
        let seen = Arc::clone(&role);

        dispatcher.request_or_join(
            "a",
            Waiter::new(move |_| {
                *seen.lock() = Some(inner.request_or_join("a", Waiter::new(|_| {})));
            }),
        );
        dispatcher.complete(&"a", 1);

        assert_eq!(*role.lock(), Some(Role::Starter));
    }

    #[test]
    fn test_concurrent_requests_single_starter() {
        let dispatcher = Arc::new(CoalescingDispatcher::<String, u64>::new());
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let mut handles = vec![];

        for _ in 0..threads {
            let dispatcher = Arc::clone(&dispatcher);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let (waiter, handle) = Waiter::channel();
                barrier.wait();
                let role = dispatcher.request_or_join("shared".to_string(), waiter);
                (role, handle)
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let starters = results
            .iter()
            .filter(|(role, _)| *role == Role::Starter)
            .count();
        assert_eq!(starters, 1);

        assert_eq!(dispatcher.complete(&"shared".to_string(), 77), threads);
        for (_, handle) in results {
            assert_eq!(handle.wait(), Ok(77));
        }
    }

    #[test]
    fn test_randomized_keys_each_waiter_notified_once() {
        let dispatcher = Arc::new(CoalescingDispatcher::<u32, u32>::new());
        let delivered = Arc::new(AtomicU64::new(0));
        let mut handles = vec![];

        for _ in 0..8 {
            let dispatcher = Arc::clone(&dispatcher);
            let delivered = Arc::clone(&delivered);
            handles.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut registered = 0u64;
                for _ in 0..200 {
                    let key = rng.gen_range(0..8);
                    let counter = Arc::clone(&delivered);
                    let waiter = Waiter::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                    registered += 1;
                    if dispatcher.request_or_join(key, waiter) == Role::Starter {
                        thread::yield_now();
                        dispatcher.complete(&key, key);
                    }
                }
                registered
            }));
        }

        let registered: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(delivered.load(Ordering::SeqCst), registered);
    }
}
