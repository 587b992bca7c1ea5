use std::{
    hash::{BuildHasher, Hash},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;

use crate::{
    common::{time::Clock, Executor},
    core::{
        action::{self, ActionMode},
        entry::{Entry, EntryInner, ValueSlot},
        eviction::Eviction,
        hash_table::HashTable,
        metrics::Metrics,
        timing::{TimerEventSink, Timing},
    },
    entry::CacheEntry,
    error::CacheError,
    listener::Listeners,
    loader::{AsyncCacheLoader, CacheLoader, CacheWriter, CompletionListener},
    ops,
    stats::CacheStatistics,
};

/// The engine behind a [`Cache`][crate::Cache] handle: the entry store, the
/// collaborators and the global structure lock serializing whole-cache
/// transitions (clear, close, statistics) against ongoing operations.
pub(crate) struct HeapCacheInner<K, V, S> {
    /// Back-reference for timer tasks and deferred jobs.
    pub(crate) self_weak: Weak<HeapCacheInner<K, V, S>>,
    pub(crate) name: String,
    pub(crate) hash: HashTable<K, V, S>,
    pub(crate) clock: Clock,
    pub(crate) timing: Timing<K, V>,
    pub(crate) eviction: Arc<dyn Eviction<K, V>>,
    pub(crate) metrics: Metrics,
    pub(crate) listeners: Listeners<K, V>,
    pub(crate) loader: Option<Arc<dyn CacheLoader<K, V>>>,
    pub(crate) async_loader: Option<Arc<dyn AsyncCacheLoader<K, V>>>,
    pub(crate) writer: Option<Arc<dyn CacheWriter<K, V>>>,
    pub(crate) loader_executor: Executor,
    pub(crate) prefetch_executor: Executor,
    pub(crate) listener_executor: Executor,
    /// The global structure lock.
    pub(crate) structure_lock: Mutex<()>,
    pub(crate) closed: AtomicBool,
    /// Bumped by every `clear`; lets iterators detect a concurrent clear.
    pub(crate) clear_count: AtomicU64,
    pub(crate) keep_data_after_expired: bool,
    pub(crate) permit_null_values: bool,
    pub(crate) record_refresh_time: bool,
}

impl<K, V, S> HeapCacheInner<K, V, S>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    fn arc(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("cache engine alive")
    }

    pub(crate) fn is_loader_present(&self) -> bool {
        self.loader.is_some() || self.async_loader.is_some()
    }

    pub(crate) fn check_closed(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed {
                name: self.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Entry lookup for the examine phase; records the dirty hit counter
    /// for the eviction collaborator.
    pub(crate) fn lookup_with_hit_record(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
        let hash = self.hash.hash_of(key);
        let entry = self.hash.lookup(key, hash)?;
        entry.record_hit();
        Some(entry)
    }

    /// Lookup or insert of a virgin entry, used on the mutation path. The
    /// eviction collaborator is notified inside the segment write lock and
    /// may evict ahead of the insert.
    pub(crate) fn lookup_or_new_entry(&self, key: &K) -> Arc<Entry<K, V>> {
        let hash = self.hash.hash_of(key);
        self.eviction.evict_eventually(hash);
        self.hash.lookup_or_insert(
            key,
            hash,
            || Arc::new(Entry::new(key.clone(), hash)),
            |e| self.eviction.submit_without_eviction(e),
        )
    }

    /// Removes an entry from the hash table and marks it gone. The caller
    /// holds the entry monitor; removal and eviction notification happen
    /// under the segment write lock.
    pub(crate) fn remove_entry(
        &self,
        entry: &Arc<Entry<K, V>>,
        guard: &mut parking_lot::MutexGuard<'_, EntryInner<V>>,
    ) {
        entry.set_gone(guard);
        self.hash
            .remove(entry, |e| self.eviction.submit_without_eviction(e));
    }

    /// Builds a snapshot of the entry's current value, `None` while virgin.
    pub(crate) fn snapshot_entry(&self, entry: &Arc<Entry<K, V>>) -> Option<CacheEntry<K, V>> {
        let inner = entry.lock();
        Self::snapshot_locked(entry, &inner)
    }

    pub(crate) fn snapshot_locked(
        entry: &Arc<Entry<K, V>>,
        inner: &EntryInner<V>,
    ) -> Option<CacheEntry<K, V>> {
        let refresh_time = inner.refresh_time;
        match &inner.slot {
            ValueSlot::Virgin => None,
            ValueSlot::Value(v) => Some(CacheEntry::with_value(
                entry.key().clone(),
                v.clone(),
                refresh_time,
            )),
            ValueSlot::Null => Some(CacheEntry::with_null(entry.key().clone(), refresh_time)),
            ValueSlot::Exception(info) => Some(CacheEntry::with_exception(
                entry.key().clone(),
                info.clone(),
                refresh_time,
            )),
        }
    }

    /// Executes one user operation synchronously.
    pub(crate) fn execute<R>(
        &self,
        key: &K,
        semantic: impl ops::Semantic<K, V, R>,
    ) -> Result<Option<R>, CacheError> {
        self.check_closed()?;
        action::run_action(&self.arc(), key, semantic, ActionMode::Sync)
    }

    /// Executes an internal operation in asynchronous mode: when the entry
    /// is busy, the operation enqueues itself on the running action instead
    /// of parking.
    fn execute_async(&self, kind: AsyncOp, bound: Option<Arc<Entry<K, V>>>, key: K) {
        if self.check_closed().is_err() {
            return;
        }
        let retry: crate::core::entry::FollowUp = {
            let cache = self.arc();
            let key = key.clone();
            let bound = bound.clone();
            Box::new(move || cache.execute_async(kind, bound, key))
        };
        let mode = ActionMode::Async {
            bound,
            retry: Some(retry),
        };
        let this = self.arc();
        let result = match kind {
            AsyncOp::ExpireEvent => action::run_action(&this, &key, ops::ExpireEvent, mode),
            AsyncOp::Refresh => action::run_action(&this, &key, ops::Refresh, mode),
        };
        if let Err(error) = result {
            log::debug!(
                "cache `{}`: internal {kind:?} operation failed for key {key:?}: {error}",
                self.name
            );
        }
    }

    /// Starts a background refresh for a key, used by the `REFRESH` expiry
    /// sentinel.
    pub(crate) fn submit_refresh(&self, key: K) {
        let cache = self.arc();
        self.loader_executor
            .execute(move || cache.execute_async(AsyncOp::Refresh, None, key));
    }

    /// Approximate number of entries.
    pub(crate) fn entry_count(&self) -> u64 {
        self.hash.entry_count()
    }

    /// The clear protocol: stop eviction, take all segment locks, drop the
    /// hash content, reset the eviction membership, restart. Entries are
    /// marked gone outside the segment locks; in-flight operations observe
    /// the gone state or finish against the detached entry object.
    pub(crate) fn clear(&self) -> Result<(), CacheError> {
        let removed = {
            let _structure = self.structure_lock.lock();
            self.check_closed()?;
            self.eviction.stop();
            let mut removed = Vec::new();
            self.hash.run_total_locked(|total| {
                self.clear_count.fetch_add(1, Ordering::AcqRel);
                total.drain(|e| removed.push(e));
            });
            self.eviction.remove_all();
            self.eviction.start();
            removed
        };
        for entry in removed {
            let mut guard = entry.lock();
            if guard.is_processing() {
                // The owning action completes against the detached entry.
                guard.cancel_timer();
            } else {
                entry.set_gone(&mut guard);
            }
        }
        Ok(())
    }

    /// Close: flips the closed flag under the global lock, then tears down
    /// entries and stops the collaborators. Idempotent.
    pub(crate) fn close(&self) {
        {
            let _structure = self.structure_lock.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let mut removed = Vec::new();
        self.hash.run_total_locked(|total| {
            self.clear_count.fetch_add(1, Ordering::AcqRel);
            total.drain(|e| removed.push(e));
        });
        for entry in removed {
            let mut guard = entry.lock();
            if guard.is_processing() {
                guard.cancel_timer();
            } else {
                entry.set_gone(&mut guard);
            }
        }
        // Collaborators are closed last.
        self.eviction.remove_all();
        self.eviction.stop();
    }

    /// Statistics snapshot under the global lock: eviction is paused and
    /// drained so the numbers fit together.
    pub(crate) fn statistics(&self) -> Result<CacheStatistics, CacheError> {
        let _structure = self.structure_lock.lock();
        self.check_closed()?;
        self.eviction.stop();
        self.eviction.drain();
        let mut stats = None;
        self.eviction.run_locked(&mut || {
            stats = Some(CacheStatistics::new(
                self.metrics.snapshot(),
                self.eviction.metrics(),
                self.hash.entry_count(),
            ));
        });
        self.eviction.start();
        Ok(stats.expect("statistics job did not run"))
    }

    /// Bulk load: ensures all `keys` are loaded (`reload` forces a load for
    /// present entries too). The completion listener receives exactly one
    /// final notification, carrying the first failure if any load failed.
    pub(crate) fn load_all(
        &self,
        keys: Vec<K>,
        listener: Option<Arc<dyn CompletionListener>>,
        reload: bool,
    ) -> Result<(), CacheError> {
        self.check_closed()?;
        if !self.is_loader_present() {
            return Err(CacheError::NoLoader {
                name: self.name.clone(),
            });
        }
        let keys = dedupe(keys);
        let tracker = CompletionTracker::new(keys.len(), listener);
        for key in keys {
            let cache = self.arc();
            let tracker = Arc::clone(&tracker);
            self.loader_executor.execute(move || {
                let result = if reload {
                    cache.execute(&key, ops::UnconditionalLoad)
                } else {
                    cache.execute(&key, ops::EnsureLoaded)
                };
                tracker.complete_one(result.err());
            });
        }
        Ok(())
    }

    /// Prefetch: loads absent keys on the prefetch executor; failures are
    /// only reported through the optional listener.
    pub(crate) fn prefetch_all(
        &self,
        keys: Vec<K>,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<(), CacheError> {
        self.check_closed()?;
        if !self.is_loader_present() {
            return Err(CacheError::NoLoader {
                name: self.name.clone(),
            });
        }
        let keys = dedupe(keys);
        let tracker = CompletionTracker::new(keys.len(), listener);
        for key in keys {
            let cache = self.arc();
            let tracker = Arc::clone(&tracker);
            self.prefetch_executor.execute(move || {
                let result = cache.execute(&key, ops::EnsureLoaded);
                tracker.complete_one(result.err());
            });
        }
        Ok(())
    }

    /// Iterator over entry snapshots, one segment at a time. Terminates
    /// cleanly when the cache is cleared or closed mid-iteration.
    pub(crate) fn iter(&self) -> EntryIter<K, V, S> {
        EntryIter {
            cache: self.arc(),
            clear_epoch: self.clear_count.load(Ordering::Acquire),
            next_segment: 0,
            buffer: Vec::new().into_iter(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum AsyncOp {
    ExpireEvent,
    Refresh,
}

/// Timer events delivered from the shared scheduler. Each handler
/// revalidates the task generation under the entry monitor; a stale task is
/// a no-op.
impl<K, V, S> TimerEventSink<K, V> for HeapCacheInner<K, V, S>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    fn timer_event_expire(&self, entry: Arc<Entry<K, V>>, generation: u64) {
        {
            let guard = entry.lock();
            if guard.timer_generation != generation || guard.is_gone() {
                return;
            }
        }
        self.metrics.timer_event();
        let key = entry.key().clone();
        self.execute_async(AsyncOp::ExpireEvent, Some(entry), key);
    }

    fn timer_event_refresh(&self, entry: Arc<Entry<K, V>>, generation: u64) {
        {
            let guard = entry.lock();
            if guard.timer_generation != generation || guard.is_gone() {
                return;
            }
        }
        self.metrics.timer_event();
        let cache = self.arc();
        self.loader_executor.execute(move || {
            let key = entry.key().clone();
            cache.execute_async(AsyncOp::Refresh, Some(entry), key);
        });
    }

    fn timer_event_sharp_pre_expiry(&self, entry: Arc<Entry<K, V>>, generation: u64) {
        let mut guard = entry.lock();
        if guard.timer_generation != generation || guard.is_gone() {
            return;
        }
        if guard.next_refresh_time >= 0 {
            return;
        }
        self.metrics.timer_event();
        self.timing
            .schedule_final_timer_for_sharp_expiry(&entry, &mut guard);
    }
}

fn dedupe<K: Eq + Hash + Clone>(keys: Vec<K>) -> Vec<K> {
    let mut seen = std::collections::HashSet::with_capacity(keys.len());
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

/// Tracks the outstanding operations of one bulk load and fires the single
/// final notification.
struct CompletionTracker {
    remaining: AtomicUsize,
    first_error: Mutex<Option<CacheError>>,
    listener: Option<Arc<dyn CompletionListener>>,
}

impl CompletionTracker {
    fn new(count: usize, listener: Option<Arc<dyn CompletionListener>>) -> Arc<Self> {
        let tracker = Arc::new(Self {
            remaining: AtomicUsize::new(count),
            first_error: Mutex::new(None),
            listener,
        });
        if count == 0 {
            tracker.fire();
        }
        tracker
    }

    fn complete_one(&self, error: Option<CacheError>) {
        if let Some(error) = error {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(error);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        if let Some(listener) = &self.listener {
            match self.first_error.lock().take() {
                None => listener.on_completed(),
                Some(error) => listener.on_exception(error),
            }
        }
    }
}

/// Thread-safe iterator over entry snapshots. Walks segment by segment;
/// entries observed expired, removed or without committed data are
/// skipped. A concurrent `clear` or `close` terminates the iteration
/// cleanly.
pub(crate) struct EntryIter<K, V, S> {
    cache: Arc<HeapCacheInner<K, V, S>>,
    clear_epoch: u64,
    next_segment: usize,
    buffer: std::vec::IntoIter<Arc<Entry<K, V>>>,
}

impl<K, V, S> Iterator for EntryIter<K, V, S>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    type Item = CacheEntry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cache.closed.load(Ordering::Acquire)
                || self.cache.clear_count.load(Ordering::Acquire) != self.clear_epoch
            {
                return None;
            }
            match self.buffer.next() {
                Some(entry) => {
                    let now = self.cache.clock.millis();
                    let committed = entry.committed();
                    if !committed.has_fresh_data(now) {
                        continue;
                    }
                    if let Some(snapshot) = self.cache.snapshot_entry(&entry) {
                        return Some(snapshot);
                    }
                }
                None => {
                    let entries = self.cache.hash.segment_entries(self.next_segment)?;
                    self.next_segment += 1;
                    self.buffer = entries.into_iter();
                }
            }
        }
    }
}
