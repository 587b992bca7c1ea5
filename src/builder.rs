use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    cache::Cache,
    common::{
        available_parallelism,
        thread_pool::{Executor, PoolName},
        time::Clock,
    },
    core::{
        eviction::{Eviction, UnboundedEviction},
        hash_table::HashTable,
        heap::HeapCacheInner,
        metrics::Metrics,
        timing::{ExpiryVariant, TimerEventSink, Timing},
    },
    listener::{
        CreatedListener, ExpiredListener, Listeners, RemovedListener, UpdatedListener,
    },
    loader::{AsyncCacheLoader, CacheLoader, CacheWriter, FnCacheLoader},
    policy::{ExpiryPolicy, ResiliencePolicy},
};

static ANONYMOUS_CACHE_COUNTER: AtomicUsize = AtomicUsize::new(0);

enum ExpiryConfig<K, V> {
    Eternal,
    AfterWrite(Duration),
    Policy(Arc<dyn ExpiryPolicy<K, V>>),
}

/// Builds a [`Cache`].
///
/// ```
/// use siphon::{Cache, CacheBuilder};
/// use std::time::Duration;
///
/// let cache: Cache<String, u32> = CacheBuilder::new()
///     .name("user-age")
///     .expire_after_write(Duration::from_secs(300))
///     .build();
/// cache.put("alice".to_string(), 31).unwrap();
/// ```
pub struct CacheBuilder<K, V, S = RandomState> {
    name: Option<String>,
    num_segments: Option<usize>,
    expiry: ExpiryConfig<K, V>,
    sharp_expiry: bool,
    refresh_ahead: bool,
    keep_data_after_expired: bool,
    permit_null_values: bool,
    record_refresh_time: bool,
    statistics: bool,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    async_loader: Option<Arc<dyn AsyncCacheLoader<K, V>>>,
    writer: Option<Arc<dyn CacheWriter<K, V>>>,
    resilience: Option<Arc<dyn ResiliencePolicy<K, V>>>,
    listeners: Listeners<K, V>,
    eviction: Option<Arc<dyn Eviction<K, V>>>,
    loader_executor: Option<Executor>,
    prefetch_executor: Option<Executor>,
    listener_executor: Option<Executor>,
    clock: Option<Clock>,
    build_hasher: S,
}

impl<K, V> CacheBuilder<K, V, RandomState> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            name: None,
            num_segments: None,
            expiry: ExpiryConfig::Eternal,
            sharp_expiry: false,
            refresh_ahead: false,
            keep_data_after_expired: false,
            permit_null_values: false,
            record_refresh_time: true,
            statistics: true,
            loader: None,
            async_loader: None,
            writer: None,
            resilience: None,
            listeners: Listeners::default(),
            eviction: None,
            loader_executor: None,
            prefetch_executor: None,
            listener_executor: None,
            clock: None,
            build_hasher: RandomState::default(),
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S> {
    /// Replaces the hasher used by the segmented entry table.
    pub fn hasher<S2: BuildHasher>(self, build_hasher: S2) -> CacheBuilder<K, V, S2> {
        CacheBuilder {
            name: self.name,
            num_segments: self.num_segments,
            expiry: self.expiry,
            sharp_expiry: self.sharp_expiry,
            refresh_ahead: self.refresh_ahead,
            keep_data_after_expired: self.keep_data_after_expired,
            permit_null_values: self.permit_null_values,
            record_refresh_time: self.record_refresh_time,
            statistics: self.statistics,
            loader: self.loader,
            async_loader: self.async_loader,
            writer: self.writer,
            resilience: self.resilience,
            listeners: self.listeners,
            eviction: self.eviction,
            loader_executor: self.loader_executor,
            prefetch_executor: self.prefetch_executor,
            listener_executor: self.listener_executor,
            clock: self.clock,
            build_hasher,
        }
    }

    /// Cache name, used in log output and error messages. A unique name is
    /// generated when none is given.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Number of hash segments, rounded up to a power of two. Defaults to
    /// the available parallelism.
    pub fn segments(mut self, num_segments: usize) -> Self {
        assert!(num_segments > 0, "segment count must be positive");
        self.num_segments = Some(num_segments);
        self
    }

    /// Entries expire this long after each load or update.
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.expiry = ExpiryConfig::AfterWrite(duration);
        self
    }

    /// Entries never expire. This is the default.
    pub fn eternal(mut self) -> Self {
        self.expiry = ExpiryConfig::Eternal;
        self
    }

    /// Installs a custom expiry policy, consulted on every load and
    /// update.
    pub fn expiry_policy(mut self, policy: impl ExpiryPolicy<K, V> + 'static) -> Self {
        self.expiry = ExpiryConfig::Policy(Arc::new(policy));
        self
    }

    /// Values become unavailable exactly at their expiry time, enforced by
    /// a read-time check plus a safety timer.
    pub fn sharp_expiry(mut self, enable: bool) -> Self {
        self.sharp_expiry = enable;
        self
    }

    /// Reload entries when they expire instead of dropping them. The old
    /// value keeps being served while the refresh runs; the refreshed
    /// entry goes into probation until its next access. Requires a loader.
    pub fn refresh_ahead(mut self, enable: bool) -> Self {
        self.refresh_ahead = enable;
        self
    }

    /// Keep expired entries and serve them as not-fresh instead of
    /// removing them.
    pub fn keep_data_after_expired(mut self, enable: bool) -> Self {
        self.keep_data_after_expired = enable;
        self
    }

    /// Permit the loader to produce no value and cache that null result.
    /// Rejected as a load failure otherwise.
    pub fn permit_null_values(mut self, enable: bool) -> Self {
        self.permit_null_values = enable;
        self
    }

    /// Record the modification time on each entry. Enabled by default.
    pub fn record_refresh_time(mut self, enable: bool) -> Self {
        self.record_refresh_time = enable;
        self
    }

    /// Toggle operation counters. Enabled by default.
    pub fn statistics(mut self, enable: bool) -> Self {
        self.statistics = enable;
        self
    }

    pub fn loader(mut self, loader: impl CacheLoader<K, V> + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Convenience for a loader that only looks at the key.
    pub fn loader_fn<F>(mut self, load: F) -> Self
    where
        F: Fn(&K) -> Result<V, crate::error::BoxError> + Send + Sync + 'static,
    {
        self.loader = Some(Arc::new(FnCacheLoader(load)));
        self
    }

    /// Installs a callback-style loader. Takes precedence over a
    /// synchronous loader for load execution.
    pub fn async_loader(mut self, loader: impl AsyncCacheLoader<K, V> + 'static) -> Self {
        self.async_loader = Some(Arc::new(loader));
        self
    }

    /// Write-through: mutations are propagated to the writer before they
    /// are published.
    pub fn writer(mut self, writer: impl CacheWriter<K, V> + 'static) -> Self {
        self.writer = Some(Arc::new(writer));
        self
    }

    /// Controls suppression and caching of loader failures.
    pub fn resilience_policy(mut self, policy: impl ResiliencePolicy<K, V> + 'static) -> Self {
        self.resilience = Some(Arc::new(policy));
        self
    }

    /// Replaces the eviction collaborator. The default is unbounded.
    pub fn eviction(mut self, eviction: impl Eviction<K, V> + 'static) -> Self {
        self.eviction = Some(Arc::new(eviction));
        self
    }

    pub fn on_entry_created(mut self, listener: CreatedListener<K, V>) -> Self {
        self.listeners.created.push(listener);
        self
    }

    pub fn on_entry_updated(mut self, listener: UpdatedListener<K, V>) -> Self {
        self.listeners.updated.push(listener);
        self
    }

    pub fn on_entry_removed(mut self, listener: RemovedListener<K, V>) -> Self {
        self.listeners.removed.push(listener);
        self
    }

    pub fn on_entry_expired(mut self, listener: ExpiredListener<K, V>) -> Self {
        self.listeners.expired.push(listener);
        self
    }

    /// Asynchronous listener variants run on the listener executor, each
    /// event with its own copy of the entry data.
    pub fn on_entry_created_async(mut self, listener: CreatedListener<K, V>) -> Self {
        self.listeners.async_created.push(listener);
        self
    }

    pub fn on_entry_updated_async(mut self, listener: UpdatedListener<K, V>) -> Self {
        self.listeners.async_updated.push(listener);
        self
    }

    pub fn on_entry_removed_async(mut self, listener: RemovedListener<K, V>) -> Self {
        self.listeners.async_removed.push(listener);
        self
    }

    pub fn on_entry_expired_async(mut self, listener: ExpiredListener<K, V>) -> Self {
        self.listeners.async_expired.push(listener);
        self
    }

    pub fn loader_executor(mut self, executor: Executor) -> Self {
        self.loader_executor = Some(executor);
        self
    }

    pub fn prefetch_executor(mut self, executor: Executor) -> Self {
        self.prefetch_executor = Some(executor);
        self
    }

    pub fn listener_executor(mut self, executor: Executor) -> Self {
        self.listener_executor = Some(executor);
        self
    }

    /// Replaces the time source, e.g. with a mocked clock in tests.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }
}

impl<K, V, S> CacheBuilder<K, V, S>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    /// Builds the cache.
    ///
    /// # Panics
    ///
    /// Panics when refresh-ahead is requested without a loader.
    pub fn build(self) -> Cache<K, V, S> {
        let has_loader = self.loader.is_some() || self.async_loader.is_some();
        assert!(
            !self.refresh_ahead || has_loader,
            "refresh_ahead requires a loader"
        );

        let name = self.name.unwrap_or_else(|| {
            let n = ANONYMOUS_CACHE_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("cache#{n}")
        });
        let clock = self.clock.unwrap_or_default();
        let variant = match self.expiry {
            ExpiryConfig::Eternal => ExpiryVariant::Eternal,
            ExpiryConfig::AfterWrite(d) => {
                ExpiryVariant::Fixed(d.as_millis().min(i64::MAX as u128) as i64)
            }
            ExpiryConfig::Policy(p) => ExpiryVariant::Dynamic(p),
        };
        let timing = Timing::new(
            variant,
            self.sharp_expiry,
            self.refresh_ahead,
            self.resilience,
            clock.clone(),
        );
        let num_segments = self.num_segments.unwrap_or_else(available_parallelism);
        let has_expiry_listeners = self.listeners.has_expired_listeners();

        let inner = Arc::new_cyclic(|weak| HeapCacheInner {
            self_weak: weak.clone(),
            name,
            hash: HashTable::new(num_segments, self.build_hasher),
            clock,
            timing,
            eviction: self
                .eviction
                .unwrap_or_else(|| Arc::new(UnboundedEviction::new())),
            metrics: Metrics::new(self.statistics),
            listeners: self.listeners,
            loader: self.loader,
            async_loader: self.async_loader,
            writer: self.writer,
            loader_executor: self
                .loader_executor
                .unwrap_or_else(|| Executor::shared(PoolName::Loader)),
            prefetch_executor: self
                .prefetch_executor
                .unwrap_or_else(|| Executor::shared(PoolName::Prefetch)),
            listener_executor: self
                .listener_executor
                .unwrap_or_else(|| Executor::shared(PoolName::Listener)),
            structure_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            clear_count: AtomicU64::new(0),
            keep_data_after_expired: self.keep_data_after_expired,
            permit_null_values: self.permit_null_values,
            record_refresh_time: self.record_refresh_time,
        });
        let sink: Arc<dyn TimerEventSink<K, V>> = inner.clone();
        inner
            .timing
            .init_sink(Arc::downgrade(&sink), has_expiry_listeners);
        Cache::from_inner(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_caches_get_distinct_names() {
        let a: Cache<u32, u32> = CacheBuilder::new().build();
        let b: Cache<u32, u32> = CacheBuilder::new().build();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    #[should_panic(expected = "refresh_ahead requires a loader")]
    fn refresh_ahead_without_loader_is_rejected() {
        let _: Cache<u32, u32> = CacheBuilder::new().refresh_ahead(true).build();
    }
}
