use crate::error::{BoxError, CacheError, ErrorRef, LoadExceptionInfo};

/// Immutable snapshot of a cache entry: the key together with the value or
/// the cached loader exception at the time the snapshot was taken.
#[derive(Clone)]
pub struct CacheEntry<K, V> {
    key: K,
    slot: SnapshotSlot<V>,
    refresh_time: i64,
}

#[derive(Clone)]
pub(crate) enum SnapshotSlot<V> {
    Value(V),
    /// A cached null result from the loader.
    Null,
    Exception(LoadExceptionInfo),
}

impl<K, V> CacheEntry<K, V> {
    pub(crate) fn with_value(key: K, value: V, refresh_time: i64) -> Self {
        Self {
            key,
            slot: SnapshotSlot::Value(value),
            refresh_time,
        }
    }

    pub(crate) fn with_null(key: K, refresh_time: i64) -> Self {
        Self {
            key,
            slot: SnapshotSlot::Null,
            refresh_time,
        }
    }

    pub(crate) fn with_exception(key: K, info: LoadExceptionInfo, refresh_time: i64) -> Self {
        Self {
            key,
            slot: SnapshotSlot::Exception(info),
            refresh_time,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// The entry value. `Ok(None)` for a cached null result. For an entry
    /// holding a cached loader failure this returns the wrapped loader
    /// error.
    pub fn value(&self) -> Result<Option<&V>, CacheError> {
        match &self.slot {
            SnapshotSlot::Value(v) => Ok(Some(v)),
            SnapshotSlot::Null => Ok(None),
            SnapshotSlot::Exception(info) => Err(info.to_error()),
        }
    }

    /// The cached loader failure, if this entry holds one.
    pub fn exception(&self) -> Option<&LoadExceptionInfo> {
        match &self.slot {
            SnapshotSlot::Exception(info) => Some(info),
            _ => None,
        }
    }

    /// The recorded modification time in milliseconds, `0` when the cache
    /// does not record modification times.
    pub fn refresh_time(&self) -> i64 {
        self.refresh_time
    }

    pub(crate) fn slot(&self) -> &SnapshotSlot<V> {
        &self.slot
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("CacheEntry");
        s.field("key", &self.key);
        match &self.slot {
            SnapshotSlot::Value(v) => s.field("value", v),
            SnapshotSlot::Null => s.field("value", &Option::<V>::None),
            SnapshotSlot::Exception(info) => s.field("exception", info),
        };
        s.finish()
    }
}

/// Mutation recorded by an entry processor.
pub(crate) enum ProcessorOp<V> {
    None,
    SetValue(V),
    SetException(ErrorRef),
    Remove,
}

/// Mutable view of an entry handed to an [`invoke`][crate::Cache::invoke]
/// processor. All reads reflect the entry state at processing time; all
/// writes are recorded and applied atomically after the processor returns.
pub struct MutableCacheEntry<'a, K, V> {
    key: &'a K,
    current: Option<&'a CacheEntry<K, V>>,
    was_existing: bool,
    loader_present: bool,
    now: i64,
    pub(crate) op: ProcessorOp<V>,
    pub(crate) expiry_time: Option<i64>,
    pub(crate) refreshed_time: Option<i64>,
    pub(crate) needs_load: bool,
}

impl<'a, K, V: Clone> MutableCacheEntry<'a, K, V> {
    pub(crate) fn new(
        key: &'a K,
        current: Option<&'a CacheEntry<K, V>>,
        loader_present: bool,
        now: i64,
    ) -> Self {
        Self {
            key,
            current,
            was_existing: current.is_some(),
            loader_present,
            now,
            op: ProcessorOp::None,
            expiry_time: None,
            refreshed_time: None,
            needs_load: false,
        }
    }

    pub fn key(&self) -> &K {
        self.key
    }

    /// True when the entry holds data, taking mutations recorded by this
    /// processor invocation into account.
    pub fn exists(&self) -> bool {
        match &self.op {
            ProcessorOp::SetValue(_) | ProcessorOp::SetException(_) => true,
            ProcessorOp::Remove => false,
            ProcessorOp::None => self.current.is_some(),
        }
    }

    /// The current value. With a loader configured this is read-through: a
    /// missing value makes this return
    /// [`CacheError::ProcessingRestart`]; propagating it restarts the
    /// processor against the loaded entry. A cached loader failure
    /// surfaces as the wrapped error.
    pub fn value(&mut self) -> Result<Option<V>, CacheError> {
        if let ProcessorOp::SetValue(v) = &self.op {
            return Ok(Some(v.clone()));
        }
        match self.current {
            Some(entry) => entry.value().map(|v| v.cloned()),
            None => {
                if self.loader_present {
                    self.needs_load = true;
                    return Err(CacheError::ProcessingRestart);
                }
                Ok(None)
            }
        }
    }

    /// The value before any mutation recorded by this processor.
    pub fn old_value(&self) -> Result<Option<V>, CacheError> {
        match self.current {
            Some(entry) => entry.value().map(|v| v.cloned()),
            None => Ok(None),
        }
    }

    /// True when the entry held data before this processor ran.
    pub fn was_existing(&self) -> bool {
        self.was_existing
    }

    pub fn set_value(&mut self, value: V) {
        self.op = ProcessorOp::SetValue(value);
    }

    /// Records a failure as the entry value; reads of the entry will
    /// surface it as a loader error.
    pub fn set_exception(&mut self, error: BoxError) {
        self.op = ProcessorOp::SetException(error.into());
    }

    pub fn remove(&mut self) {
        self.op = ProcessorOp::Remove;
    }

    /// Overrides the expiry time. [`expiry_values`][crate::policy::expiry_values]
    /// sentinels are honored.
    pub fn set_expiry_time(&mut self, expiry_time: i64) {
        self.expiry_time = Some(expiry_time);
    }

    /// Overrides the modification time recorded with the mutation.
    pub fn set_refreshed_time(&mut self, refreshed_time: i64) {
        self.refreshed_time = Some(refreshed_time);
    }

    /// The recorded modification time of the current entry.
    pub fn refreshed_time(&self) -> i64 {
        self.current.map(CacheEntry::refresh_time).unwrap_or(0)
    }

    /// The current cache time in milliseconds.
    pub fn current_time(&self) -> i64 {
        self.now
    }

    pub(crate) fn mutation_needed(&self) -> bool {
        !matches!(self.op, ProcessorOp::None) || self.expiry_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_projects_value_and_exception() {
        let e = CacheEntry::with_value(1, "a", 7);
        assert_eq!(*e.key(), 1);
        assert_eq!(e.value().unwrap(), Some(&"a"));
        assert!(e.exception().is_none());
        assert_eq!(e.refresh_time(), 7);

        let info = LoadExceptionInfo::new(
            "1".into(),
            std::sync::Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "nope")),
            5,
        );
        let e: CacheEntry<i32, &str> = CacheEntry::with_exception(1, info, 0);
        assert!(e.value().is_err());
        assert!(e.exception().is_some());
    }

    #[test]
    fn mutable_entry_records_mutations() {
        let current = CacheEntry::with_value(1, 10, 0);
        let mut m = MutableCacheEntry::new(&1, Some(&current), false, 99);
        assert!(m.exists());
        assert!(m.was_existing());
        assert_eq!(m.value().unwrap(), Some(10));
        assert_eq!(m.current_time(), 99);

        m.set_value(11);
        assert!(m.exists());
        assert_eq!(m.value().unwrap(), Some(11));
        assert_eq!(m.old_value().unwrap(), Some(10));
        assert!(m.mutation_needed());

        m.remove();
        assert!(!m.exists());
    }

    #[test]
    fn mutable_entry_requests_load_on_missing_value() {
        let mut m: MutableCacheEntry<'_, i32, i32> = MutableCacheEntry::new(&1, None, true, 0);
        assert!(matches!(m.value(), Err(CacheError::ProcessingRestart)));
        assert!(m.needs_load);

        let mut m: MutableCacheEntry<'_, i32, i32> = MutableCacheEntry::new(&1, None, false, 0);
        assert_eq!(m.value().unwrap(), None);
        assert!(!m.needs_load);
    }
}
