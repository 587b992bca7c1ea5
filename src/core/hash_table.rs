use std::{
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
};

use parking_lot::{RwLock, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::{common::spread_hash, core::entry::Entry};

/// Load factor threshold in percent above which a segment doubles its
/// bucket array.
const EXPAND_THRESHOLD_PERCENT: usize = 64;

const INITIAL_BUCKETS_PER_SEGMENT: usize = 8;

type Bucket<K, V> = SmallVec<[Arc<Entry<K, V>>; 1]>;

struct SegmentInner<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    len: usize,
}

impl<K, V> SegmentInner<K, V> {
    fn with_buckets(count: usize) -> Self {
        debug_assert!(count.is_power_of_two());
        Self {
            buckets: (0..count).map(|_| Bucket::new()).collect(),
            len: 0,
        }
    }

    #[inline]
    fn bucket_index(&self, hash: u64) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    /// Doubles the bucket array and redistributes all entries.
    fn expand(&mut self) {
        let new_count = self.buckets.len() * 2;
        let old = std::mem::replace(
            &mut self.buckets,
            (0..new_count).map(|_| Bucket::new()).collect(),
        );
        for bucket in Vec::from(old) {
            for entry in bucket {
                let idx = entry.hash() as usize & (new_count - 1);
                self.buckets[idx].push(entry);
            }
        }
    }

    fn needs_expansion(&self) -> bool {
        self.len * 100 > self.buckets.len() * EXPAND_THRESHOLD_PERCENT
    }
}

/// The entry store: a growable hash table partitioned into segments, each
/// guarded by its own read/write lock. Unrelated keys progress on
/// independent segments; whole-table operations take all segment locks in
/// index order.
pub(crate) struct HashTable<K, V, S> {
    segments: Box<[RwLock<SegmentInner<K, V>>]>,
    build_hasher: S,
    segment_shift: u32,
}

impl<K, V, S> HashTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// `num_segments` is rounded up to the next power of two.
    pub(crate) fn new(num_segments: usize, build_hasher: S) -> Self {
        assert!(num_segments > 0);
        let num_segments = num_segments.next_power_of_two();
        let segment_shift = 64 - num_segments.trailing_zeros();
        let segments = (0..num_segments)
            .map(|_| RwLock::new(SegmentInner::with_buckets(INITIAL_BUCKETS_PER_SEGMENT)))
            .collect();
        Self {
            segments,
            build_hasher,
            segment_shift,
        }
    }

    /// The spread hash of a key, as stored in the entries.
    pub(crate) fn hash_of(&self, key: &K) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        spread_hash(hasher.finish())
    }

    #[inline]
    fn segment_index(&self, hash: u64) -> usize {
        if self.segment_shift == 64 {
            0
        } else {
            (hash >> self.segment_shift) as usize
        }
    }

    pub(crate) fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Finds the entry for a key, if present.
    pub(crate) fn lookup(&self, key: &K, hash: u64) -> Option<Arc<Entry<K, V>>> {
        let segment = self.segments[self.segment_index(hash)].read();
        let bucket = &segment.buckets[segment.bucket_index(hash)];
        bucket
            .iter()
            .find(|e| e.hash() == hash && e.key() == key)
            .map(Arc::clone)
    }

    /// Returns the existing entry or inserts the one produced by `make`.
    /// `on_insert` runs under the segment write lock, in the same critical
    /// section as the insertion, so the eviction collaborator observes a
    /// consistent membership.
    pub(crate) fn lookup_or_insert(
        &self,
        key: &K,
        hash: u64,
        make: impl FnOnce() -> Arc<Entry<K, V>>,
        on_insert: impl FnOnce(&Arc<Entry<K, V>>),
    ) -> Arc<Entry<K, V>> {
        let mut segment = self.segments[self.segment_index(hash)].write();
        let idx = segment.bucket_index(hash);
        if let Some(e) = segment.buckets[idx]
            .iter()
            .find(|e| e.hash() == hash && e.key() == key)
        {
            return Arc::clone(e);
        }
        let entry = make();
        segment.buckets[idx].push(Arc::clone(&entry));
        segment.len += 1;
        on_insert(&entry);
        if segment.needs_expansion() {
            segment.expand();
        }
        entry
    }

    /// Removes an entry by identity. `on_remove` runs under the segment
    /// write lock when the entry was present. Returns whether the entry was
    /// removed.
    pub(crate) fn remove(
        &self,
        entry: &Arc<Entry<K, V>>,
        on_remove: impl FnOnce(&Arc<Entry<K, V>>),
    ) -> bool {
        let hash = entry.hash();
        let mut segment = self.segments[self.segment_index(hash)].write();
        let idx = segment.bucket_index(hash);
        let bucket = &mut segment.buckets[idx];
        match bucket.iter().position(|e| Arc::ptr_eq(e, entry)) {
            Some(pos) => {
                bucket.swap_remove(pos);
                segment.len -= 1;
                on_remove(entry);
                true
            }
            None => false,
        }
    }

    /// Acquires all segment write locks in index order and runs `job`
    /// atomically across the whole table.
    pub(crate) fn run_total_locked<T>(&self, job: impl FnOnce(&mut TotalLocked<'_, K, V>) -> T) -> T {
        let guards: Vec<RwLockWriteGuard<'_, SegmentInner<K, V>>> =
            self.segments.iter().map(|s| s.write()).collect();
        let mut total = TotalLocked { guards };
        job(&mut total)
    }

    /// Sum of all segment sizes. Dirty when taken without the total lock.
    pub(crate) fn entry_count(&self) -> u64 {
        self.segments.iter().map(|s| s.read().len as u64).sum()
    }

    /// Snapshot of the entries of one segment, for iteration. Returns
    /// `None` past the last segment.
    pub(crate) fn segment_entries(&self, index: usize) -> Option<Vec<Arc<Entry<K, V>>>> {
        let segment = self.segments.get(index)?.read();
        let mut out = Vec::with_capacity(segment.len);
        for bucket in segment.buckets.iter() {
            out.extend(bucket.iter().map(Arc::clone));
        }
        Some(out)
    }
}

/// View of the table while all segment write locks are held.
pub(crate) struct TotalLocked<'a, K, V> {
    guards: Vec<RwLockWriteGuard<'a, SegmentInner<K, V>>>,
}

impl<K, V> TotalLocked<'_, K, V> {
    pub(crate) fn entry_count(&self) -> u64 {
        self.guards.iter().map(|g| g.len as u64).sum()
    }

    /// Removes every entry, handing each removed entry to `each`.
    pub(crate) fn drain(&mut self, mut each: impl FnMut(Arc<Entry<K, V>>)) -> u64 {
        let mut removed = 0;
        for guard in self.guards.iter_mut() {
            removed += guard.len as u64;
            guard.len = 0;
            let bucket_count = guard.buckets.len();
            let old = std::mem::replace(
                &mut guard.buckets,
                (0..bucket_count).map(|_| Bucket::new()).collect(),
            );
            for bucket in Vec::from(old) {
                for entry in bucket {
                    each(entry);
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;

    fn table(segments: usize) -> HashTable<u32, u32, RandomState> {
        HashTable::new(segments, RandomState::default())
    }

    fn insert(t: &HashTable<u32, u32, RandomState>, key: u32) -> Arc<Entry<u32, u32>> {
        let hash = t.hash_of(&key);
        t.lookup_or_insert(&key, hash, || Arc::new(Entry::new(key, hash)), |_| {})
    }

    #[test]
    fn insert_lookup_remove() {
        let t = table(4);
        assert!(t.lookup(&1, t.hash_of(&1)).is_none());

        let e = insert(&t, 1);
        let found = t.lookup(&1, t.hash_of(&1)).unwrap();
        assert!(Arc::ptr_eq(&e, &found));
        assert_eq!(t.entry_count(), 1);

        assert!(t.remove(&e, |_| {}));
        assert!(!t.remove(&e, |_| {}));
        assert!(t.lookup(&1, t.hash_of(&1)).is_none());
        assert_eq!(t.entry_count(), 0);
    }

    #[test]
    fn insert_returns_the_winner() {
        let t = table(1);
        let a = insert(&t, 7);
        let b = insert(&t, 7);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(t.entry_count(), 1);
    }

    #[test]
    fn removal_is_by_identity_not_key() {
        let t = table(1);
        let hash = t.hash_of(&7);
        let stray = Arc::new(Entry::new(7u32, hash));
        insert(&t, 7);
        assert!(!t.remove(&stray, |_| {}));
        assert_eq!(t.entry_count(), 1);
    }

    #[test]
    fn growth_keeps_all_entries_reachable() {
        let t = table(2);
        for key in 0..500 {
            insert(&t, key);
        }
        assert_eq!(t.entry_count(), 500);
        for key in 0..500 {
            assert!(t.lookup(&key, t.hash_of(&key)).is_some(), "key {key}");
        }
    }

    #[test]
    fn total_locked_drain_empties_the_table() {
        let t = table(4);
        for key in 0..100 {
            insert(&t, key);
        }
        let mut seen = 0;
        let removed = t.run_total_locked(|total| {
            assert_eq!(total.entry_count(), 100);
            total.drain(|_| seen += 1)
        });
        assert_eq!(removed, 100);
        assert_eq!(seen, 100);
        assert_eq!(t.entry_count(), 0);
        assert!(t.lookup(&1, t.hash_of(&1)).is_none());
    }

    #[test]
    fn segment_snapshot_covers_all_entries() {
        let t = table(4);
        for key in 0..64 {
            insert(&t, key);
        }
        let mut count = 0;
        let mut index = 0;
        while let Some(entries) = t.segment_entries(index) {
            count += entries.len();
            index += 1;
        }
        assert_eq!(index, t.num_segments());
        assert_eq!(count, 64);
    }
}
