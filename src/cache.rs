use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    sync::Arc,
};

use crate::{
    builder::CacheBuilder,
    core::{entry::ValueSlot, heap::HeapCacheInner},
    entry::{CacheEntry, MutableCacheEntry},
    error::{BoxError, CacheError},
    loader::CompletionListener,
    ops,
    stats::CacheStatistics,
};

/// A loading, expiring, thread-safe key/value cache.
///
/// All operations on a single key are serialized through the entry's state
/// machine: loads, writes, listener dispatch and expiry never interleave
/// for the same key. Unrelated keys proceed in parallel on independent
/// hash segments.
///
/// `Cache` is a cheap handle: cloning shares the same cache.
///
/// ```
/// use siphon::{Cache, CacheBuilder};
///
/// let cache: Cache<u64, u64> = CacheBuilder::new()
///     .loader_fn(|key: &u64| Ok(key * 2))
///     .build();
/// assert_eq!(cache.get(&21).unwrap(), Some(42));
/// cache.close();
/// ```
pub struct Cache<K, V, S = RandomState> {
    inner: Arc<HeapCacheInner<K, V, S>>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Cache<K, V, RandomState> {
    /// Shortcut for [`CacheBuilder::new`].
    pub fn builder() -> CacheBuilder<K, V, RandomState> {
        CacheBuilder::new()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    pub(crate) fn from_inner(inner: Arc<HeapCacheInner<K, V, S>>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the value for `key`. On a miss the configured loader is
    /// invoked; without a loader a miss returns `Ok(None)`. A cached
    /// loader failure surfaces as the wrapped loader error.
    pub fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        let slot = self.inner.execute(key, ops::Get)?;
        project_value(slot)
    }

    /// Returns the value for `key` if fresh data is present; never invokes
    /// the loader. Entries holding a cached loader failure read as absent.
    pub fn peek(&self, key: &K) -> Result<Option<V>, CacheError> {
        let slot = self.inner.execute(key, ops::Peek)?;
        match slot {
            Some(ValueSlot::Value(v)) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// Like [`get`][Cache::get], returning the whole entry snapshot.
    pub fn get_entry(&self, key: &K) -> Result<Option<CacheEntry<K, V>>, CacheError> {
        self.inner.execute(key, ops::GetEntry)
    }

    /// Like [`peek`][Cache::peek], returning the whole entry snapshot.
    /// Unlike `peek`, an entry holding a cached loader failure is
    /// returned, with the failure accessible through the snapshot.
    pub fn peek_entry(&self, key: &K) -> Result<Option<CacheEntry<K, V>>, CacheError> {
        self.inner.execute(key, ops::PeekEntry)
    }

    /// True when fresh data (a value, null or cached failure) is present.
    /// Never loads and never counts as a read access.
    pub fn contains_key(&self, key: &K) -> Result<bool, CacheError> {
        Ok(self
            .inner
            .execute(key, ops::Contains)?
            .unwrap_or(false))
    }

    /// Inserts or updates the entry.
    pub fn put(&self, key: K, value: V) -> Result<(), CacheError> {
        self.inner.execute(&key, ops::Put(Some(value)))?;
        Ok(())
    }

    /// Inserts or updates all pairs, one atomic operation per key.
    pub fn put_all(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<(), CacheError> {
        for (key, value) in pairs {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Inserts the value when no fresh data is present. Returns whether
    /// the insert happened.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<bool, CacheError> {
        Ok(self
            .inner
            .execute(&key, ops::PutIfAbsent(Some(value)))?
            .unwrap_or(false))
    }

    /// Updates the entry when fresh data is present. Returns whether the
    /// update happened.
    pub fn replace(&self, key: K, value: V) -> Result<bool, CacheError> {
        Ok(self
            .inner
            .execute(&key, ops::Replace(Some(value)))?
            .unwrap_or(false))
    }

    /// Updates the entry when its current value equals `expected`.
    pub fn replace_if_equals(&self, key: K, expected: V, new_value: V) -> Result<bool, CacheError>
    where
        V: PartialEq,
    {
        Ok(self
            .inner
            .execute(
                &key,
                ops::ReplaceIfEquals {
                    expected,
                    new_value: Some(new_value),
                },
            )?
            .unwrap_or(false))
    }

    /// Removes the entry, if present.
    pub fn remove(&self, key: &K) -> Result<(), CacheError> {
        self.inner.execute(key, ops::Remove)?;
        Ok(())
    }

    /// Removes the entry when its current value equals `expected`.
    pub fn remove_if_equals(&self, key: &K, expected: V) -> Result<bool, CacheError>
    where
        V: PartialEq,
    {
        Ok(self
            .inner
            .execute(key, ops::RemoveIfEquals(expected))?
            .unwrap_or(false))
    }

    /// Removes the entry and reports whether data was present.
    pub fn contains_and_remove(&self, key: &K) -> Result<bool, CacheError> {
        Ok(self
            .inner
            .execute(key, ops::ContainsAndRemove)?
            .unwrap_or(false))
    }

    /// Stores the value and returns the previous one.
    pub fn peek_and_put(&self, key: K, value: V) -> Result<Option<V>, CacheError> {
        let slot = self.inner.execute(&key, ops::PeekAndPut(Some(value)))?;
        project_value(slot)
    }

    /// Removes the entry and returns the previous value.
    pub fn peek_and_remove(&self, key: &K) -> Result<Option<V>, CacheError> {
        let slot = self.inner.execute(key, ops::PeekAndRemove)?;
        project_value(slot)
    }

    /// Replaces the value when data is present and returns the previous
    /// value; does nothing on a miss.
    pub fn peek_and_replace(&self, key: K, value: V) -> Result<Option<V>, CacheError> {
        let slot = self.inner.execute(&key, ops::PeekAndReplace(Some(value)))?;
        project_value(slot)
    }

    /// Returns the present value or atomically computes and caches one.
    /// The computation runs at most once per absent key, also under
    /// concurrency; a failing computation is wrapped as a processor error.
    /// `Ok(None)` is only seen when the entry holds a permitted null.
    pub fn compute_if_absent(
        &self,
        key: K,
        init: impl FnOnce() -> Result<V, BoxError>,
    ) -> Result<Option<V>, CacheError> {
        let slot = self
            .inner
            .execute(&key, ops::ComputeIfAbsent { init: Some(init) })?;
        project_value(slot)
    }

    /// Runs an entry processor atomically against the entry. The processor
    /// receives a mutable view; recorded mutations are applied after it
    /// returns. With a loader configured, reading a missing value loads it
    /// and re-runs the processor.
    pub fn invoke<R>(
        &self,
        key: &K,
        processor: impl FnMut(&mut MutableCacheEntry<'_, K, V>) -> Result<R, BoxError>,
    ) -> Result<R, CacheError> {
        let result = self.inner.execute(key, ops::Invoke::new(processor))?;
        Ok(result.expect("entry processor always produces a result"))
    }

    /// Runs the processor against each key; results and failures are
    /// reported per key.
    pub fn invoke_all<R>(
        &self,
        keys: impl IntoIterator<Item = K>,
        processor: impl Fn(&mut MutableCacheEntry<'_, K, V>) -> Result<R, BoxError>,
    ) -> Vec<(K, Result<R, CacheError>)> {
        keys.into_iter()
            .map(|key| {
                let result = self.invoke(&key, &processor);
                (key, result)
            })
            .collect()
    }

    /// Loads all absent keys on the loader executor. `listener` receives
    /// exactly one final notification, even when some loads failed.
    pub fn load_all(
        &self,
        keys: impl IntoIterator<Item = K>,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<(), CacheError> {
        self.inner.load_all(keys.into_iter().collect(), listener, false)
    }

    /// Loads all keys, replacing present values.
    pub fn reload_all(
        &self,
        keys: impl IntoIterator<Item = K>,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<(), CacheError> {
        self.inner.load_all(keys.into_iter().collect(), listener, true)
    }

    /// Hints that the key will be needed: loads it in the background on
    /// the prefetch executor. Does nothing without a loader.
    pub fn prefetch(&self, key: K) {
        let _ = self.inner.prefetch_all(vec![key], None);
    }

    /// Prefetches all keys; the optional listener receives one final
    /// notification.
    pub fn prefetch_all(
        &self,
        keys: impl IntoIterator<Item = K>,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<(), CacheError> {
        self.inner.prefetch_all(keys.into_iter().collect(), listener)
    }

    /// Forces the expiry time of a present entry. Accepts the
    /// [`expiry_values`][crate::policy::expiry_values] sentinels:
    /// `NOW`/`NO_CACHE` expires immediately, `REFRESH` expires and
    /// triggers a refresh, `ETERNAL` pins the entry, and a negative value
    /// requests sharp expiry at the absolute value.
    pub fn expire_at(&self, key: &K, millis: i64) -> Result<(), CacheError> {
        self.inner.execute(key, ops::ExpireAt(millis))?;
        Ok(())
    }

    /// Iterates over snapshots of all fresh entries. The iterator is
    /// weakly consistent: entries mutated during iteration may or may not
    /// be observed, and a concurrent [`clear`][Cache::clear] or
    /// [`close`][Cache::close] ends the iteration cleanly.
    pub fn iter(&self) -> impl Iterator<Item = CacheEntry<K, V>> {
        self.inner.iter()
    }

    /// Iterates over the keys of all fresh entries.
    pub fn keys(&self) -> impl Iterator<Item = K> {
        self.inner.iter().map(|e| e.key().clone())
    }

    /// Approximate number of entries, including entries that are expired
    /// but not yet removed.
    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all entries. Listeners are not called; the eviction
    /// collaborator is stopped for the duration of the sweep.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.inner.clear()
    }

    /// Operation counters, sampled consistently under the global lock.
    pub fn statistics(&self) -> Result<CacheStatistics, CacheError> {
        self.inner.statistics()
    }

    /// Closes the cache: subsequent operations fail fast with
    /// [`CacheError::Closed`], in-flight operations drain. Idempotent.
    pub fn close(&self) {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.check_closed().is_err()
    }
}

fn project_value<V>(slot: Option<ValueSlot<V>>) -> Result<Option<V>, CacheError> {
    match slot {
        None | Some(ValueSlot::Virgin) | Some(ValueSlot::Null) => Ok(None),
        Some(ValueSlot::Value(v)) => Ok(Some(v)),
        Some(ValueSlot::Exception(info)) => Err(info.to_error()),
    }
}

impl<K, V, S> std::fmt::Debug for Cache<K, V, S>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
