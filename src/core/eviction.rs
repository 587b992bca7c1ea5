use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::core::entry::Entry;

/// Counters reported by an eviction implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionMetrics {
    /// Entries currently tracked by the eviction data structures.
    pub entry_count: u64,
    /// Entries removed to stay within the capacity bound.
    pub evicted_count: u64,
}

/// The replacement-policy collaborator. The core guarantees that
/// [`submit_without_eviction`][Eviction::submit_without_eviction] is called
/// under the hash segment lock of the affected entry, on insert and on
/// removal, so the membership tracked here is consistent with the hash
/// table whenever that lock is held.
///
/// Victim selection, list maintenance and weighing are entirely owned by
/// the implementation; the core never inspects them.
pub trait Eviction<K, V>: Send + Sync {
    /// Tracks an entry mutation of the hash table: a freshly inserted entry
    /// or, when [`Entry::is_gone`] reports true, a removed one. Must not
    /// evict; called under the segment write lock.
    fn submit_without_eviction(&self, entry: &Arc<Entry<K, V>>);

    /// A new entry is about to be inserted into the segment of `hash`; the
    /// implementation may evict ahead of the insert. Called outside the
    /// segment lock.
    fn evict_eventually(&self, hash: u64);

    /// The value of an entry changed; re-weigh it.
    fn update_weight(&self, entry: &Arc<Entry<K, V>>);

    /// Forget all entries; returns how many were tracked.
    fn remove_all(&self) -> u64;

    /// Halt eviction activity. Called under the global structure lock
    /// before whole-cache transitions.
    fn stop(&self);

    /// Resume after [`stop`][Eviction::stop].
    fn start(&self);

    /// Process any internally queued work, so a following snapshot is
    /// consistent.
    fn drain(&self);

    /// Runs `job` while eviction-internal structures are locked.
    fn run_locked(&self, job: &mut dyn FnMut());

    fn metrics(&self) -> EvictionMetrics;

    fn is_weigher_present(&self) -> bool {
        false
    }
}

/// Default collaborator: no capacity bound, bookkeeping only.
pub(crate) struct UnboundedEviction {
    entry_count: AtomicI64,
    stopped: AtomicBool,
    lock: Mutex<()>,
}

impl UnboundedEviction {
    pub(crate) fn new() -> Self {
        Self {
            entry_count: AtomicI64::new(0),
            stopped: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }
}

impl<K, V> Eviction<K, V> for UnboundedEviction
where
    K: Send + Sync,
    V: Send + Sync,
{
    fn submit_without_eviction(&self, entry: &Arc<Entry<K, V>>) {
        if entry.is_gone() {
            self.entry_count.fetch_sub(1, Ordering::AcqRel);
        } else {
            self.entry_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn evict_eventually(&self, _hash: u64) {}

    fn update_weight(&self, _entry: &Arc<Entry<K, V>>) {}

    fn remove_all(&self) -> u64 {
        self.entry_count.swap(0, Ordering::AcqRel).max(0) as u64
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn start(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    fn drain(&self) {}

    fn run_locked(&self, job: &mut dyn FnMut()) {
        let _guard = self.lock.lock();
        job();
    }

    fn metrics(&self) -> EvictionMetrics {
        EvictionMetrics {
            entry_count: self.entry_count.load(Ordering::Acquire).max(0) as u64,
            evicted_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_eviction_tracks_membership() {
        let eviction = UnboundedEviction::new();
        let e = Arc::new(Entry::new(1u32, 1));

        Eviction::<u32, u32>::submit_without_eviction(&eviction, &e);
        assert_eq!(Eviction::<u32, u32>::metrics(&eviction).entry_count, 1);

        {
            let mut guard = e.lock();
            e.set_gone(&mut guard);
        }
        Eviction::<u32, u32>::submit_without_eviction(&eviction, &e);
        assert_eq!(Eviction::<u32, u32>::metrics(&eviction).entry_count, 0);

        Eviction::<u32, u32>::submit_without_eviction(&eviction, &Arc::new(Entry::new(2u32, 2)));
        assert_eq!(Eviction::<u32, u32>::remove_all(&eviction), 1);
        assert_eq!(Eviction::<u32, u32>::metrics(&eviction).entry_count, 0);
    }
}
