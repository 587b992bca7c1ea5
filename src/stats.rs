use crate::core::{eviction::EvictionMetrics, metrics::MetricsSnapshot};

/// Point-in-time operation counters of a cache, taken under the global
/// structure lock by [`Cache::statistics`][crate::Cache::statistics].
///
/// The underlying counters are updated without synchronization; small
/// undercounts under heavy contention are by contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStatistics {
    metrics: MetricsSnapshot,
    eviction: EvictionMetrics,
    entry_count: u64,
}

impl CacheStatistics {
    pub(crate) fn new(
        metrics: MetricsSnapshot,
        eviction: EvictionMetrics,
        entry_count: u64,
    ) -> Self {
        Self {
            metrics,
            eviction,
            entry_count,
        }
    }

    /// Number of read accesses: hits plus misses.
    pub fn get_count(&self) -> u64 {
        self.metrics.hit_count + self.metrics.miss_count
    }

    /// Reads that observed fresh data.
    pub fn hit_count(&self) -> u64 {
        self.metrics.hit_count
    }

    /// Reads that observed no usable data.
    pub fn miss_count(&self) -> u64 {
        self.metrics.miss_count
    }

    /// Successful loader invocations into entries without previous data.
    pub fn load_count(&self) -> u64 {
        self.metrics.load_count
    }

    /// Successful loader invocations replacing existing data.
    pub fn reload_count(&self) -> u64 {
        self.metrics.reload_count
    }

    /// Loads initiated by the refresh-ahead timer.
    pub fn refresh_count(&self) -> u64 {
        self.metrics.refresh_count
    }

    /// Total time spent in successful loader calls, in milliseconds.
    pub fn load_millis(&self) -> u64 {
        self.metrics.load_millis
    }

    /// Loader failures that were surfaced or cached.
    pub fn load_exception_count(&self) -> u64 {
        self.metrics.load_exception_count
    }

    /// Loader failures suppressed by the resilience policy while a
    /// previous value kept being served.
    pub fn suppressed_exception_count(&self) -> u64 {
        self.metrics.suppressed_exception_count
    }

    /// Insert and update mutations.
    pub fn put_count(&self) -> u64 {
        self.metrics.put_count
    }

    /// Explicit removals of present data.
    pub fn remove_count(&self) -> u64 {
        self.metrics.remove_count
    }

    /// Entries that expired but were kept and served as not-fresh.
    pub fn expired_kept_count(&self) -> u64 {
        self.metrics.expired_kept_count
    }

    /// Accesses revived from refresh probation without a loader call.
    pub fn refreshed_hit_count(&self) -> u64 {
        self.metrics.refreshed_hit_count
    }

    /// Timer events processed for expiry and refresh.
    pub fn timer_event_count(&self) -> u64 {
        self.metrics.timer_event_count
    }

    /// Lock retries because an entry was removed while waiting on it.
    pub fn gone_spin_count(&self) -> u64 {
        self.metrics.gone_spin_count
    }

    /// Approximate number of entries at snapshot time.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Entries removed by the eviction collaborator to honor the capacity
    /// bound.
    pub fn evicted_count(&self) -> u64 {
        self.eviction.evicted_count
    }
}
