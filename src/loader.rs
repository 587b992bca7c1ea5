use crate::{
    common::Executor,
    entry::CacheEntry,
    error::{BoxError, CacheError},
};

/// Value produced by a loader, optionally overriding the recorded refresh
/// time of the entry.
pub struct Loaded<V> {
    pub(crate) value: Option<V>,
    pub(crate) refresh_time: Option<i64>,
}

impl<V> Loaded<V> {
    /// A loaded value.
    pub fn value(value: V) -> Self {
        Self {
            value: Some(value),
            refresh_time: None,
        }
    }

    /// The null result: the source holds no value for this key. Cached as
    /// such when the cache permits null values, treated as a load failure
    /// otherwise.
    pub fn none() -> Self {
        Self {
            value: None,
            refresh_time: None,
        }
    }

    /// Overrides the modification time recorded for the entry, e.g. with a
    /// timestamp delivered by the backing source.
    pub fn with_refresh_time(mut self, refresh_time: i64) -> Self {
        self.refresh_time = Some(refresh_time);
        self
    }
}

impl<V> From<V> for Loaded<V> {
    fn from(value: V) -> Self {
        Loaded::value(value)
    }
}

/// Loads values from the backing source on a miss or refresh.
///
/// The loader is always invoked outside the entry lock, but all other
/// operations on the same key block until the load completes.
pub trait CacheLoader<K, V>: Send + Sync {
    /// `load_start` is the time the load was started in milliseconds.
    /// `current` is the entry currently cached for the key, if any,
    /// including entries that are expired or carry an exception.
    fn load(
        &self,
        key: &K,
        load_start: i64,
        current: Option<&CacheEntry<K, V>>,
    ) -> Result<Loaded<V>, BoxError>;
}

pub(crate) struct FnCacheLoader<F>(pub(crate) F);

impl<K, V, F> CacheLoader<K, V> for FnCacheLoader<F>
where
    F: Fn(&K) -> Result<V, BoxError> + Send + Sync,
{
    fn load(
        &self,
        key: &K,
        _load_start: i64,
        _current: Option<&CacheEntry<K, V>>,
    ) -> Result<Loaded<V>, BoxError> {
        (self.0)(key).map(Loaded::value)
    }
}

/// Context handed to an [`AsyncCacheLoader`] invocation.
pub struct LoadContext<'a, K, V> {
    pub(crate) key: &'a K,
    pub(crate) load_start: i64,
    pub(crate) current: Option<CacheEntry<K, V>>,
    pub(crate) executor: Executor,
}

impl<'a, K, V> LoadContext<'a, K, V> {
    pub fn key(&self) -> &K {
        self.key
    }

    /// Time the load was started, in milliseconds.
    pub fn load_start_time(&self) -> i64 {
        self.load_start
    }

    /// The entry currently cached for the key, if any.
    pub fn current_entry(&self) -> Option<&CacheEntry<K, V>> {
        self.current.as_ref()
    }

    /// The loader executor, for spawning additional work.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

/// Completion handle for an [`AsyncCacheLoader`]. Must be completed exactly
/// once; the consuming methods make a second completion unrepresentable,
/// and dropping the callback without completing it fails the load.
pub struct LoadCallback<V> {
    pub(crate) tx: crossbeam_channel::Sender<Result<Loaded<V>, BoxError>>,
}

impl<V> LoadCallback<V> {
    pub fn on_load_success(self, value: impl Into<Loaded<V>>) {
        // The receiver only disappears when the cache is dropped mid-load.
        let _ = self.tx.send(Ok(value.into()));
    }

    pub fn on_load_failure(self, error: BoxError) {
        let _ = self.tx.send(Err(error));
    }
}

/// A loader that delivers its result through a callback, e.g. from its own
/// I/O or reactor threads. The submitting cache operation suspends without
/// holding any lock until the callback completes.
pub trait AsyncCacheLoader<K, V>: Send + Sync {
    fn load(&self, key: &K, context: &LoadContext<'_, K, V>, callback: LoadCallback<V>);
}

/// Propagates cache mutations to the backing source (write-through).
///
/// A failure aborts the mutation: the entry is left unchanged and the error
/// is surfaced to the caller.
pub trait CacheWriter<K, V>: Send + Sync {
    fn write(&self, key: &K, value: &V) -> Result<(), BoxError>;

    fn delete(&self, key: &K) -> Result<(), BoxError>;
}

/// Receives the single final notification of a bulk load operation
/// ([`load_all`][crate::Cache::load_all],
/// [`reload_all`][crate::Cache::reload_all],
/// [`prefetch_all`][crate::Cache::prefetch_all]).
pub trait CompletionListener: Send + Sync {
    /// All requested loads finished without failure.
    fn on_completed(&self);

    /// All requested loads finished; `error` is the first failure observed.
    fn on_exception(&self, error: CacheError);
}
