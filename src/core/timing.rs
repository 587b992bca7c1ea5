use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
    time::Duration,
};

use once_cell::sync::OnceCell;

use crate::{
    common::{
        thread_pool::{PoolName, ThreadPool, ThreadPoolRegistry},
        time::Clock,
    },
    core::entry::{self, Entry, EntryInner},
    entry::CacheEntry,
    error::LoadExceptionInfo,
    policy::{expiry_values, ExpiryPolicy, ResiliencePolicy},
};

/// Safety gap for sharp expiry: the pre-expiry timer event fires this much
/// ahead of the exact expiry time, the read-time check does the precise
/// cutoff in between.
pub(crate) const SHARP_EXPIRY_SAFETY_GAP_MILLIS: i64 = 27 * 1000 + 127;

/// How expiry times are produced.
pub(crate) enum ExpiryVariant<K, V> {
    /// Entries never expire.
    Eternal,
    /// Fixed time to live after each load or update.
    Fixed(i64),
    /// A user supplied policy decides per entry.
    Dynamic(Arc<dyn ExpiryPolicy<K, V>>),
}

/// Timer event kinds delivered back into the cache.
enum TimerTask {
    /// The expiry time of an entry was reached.
    Expire,
    /// Refresh-ahead: reload the entry instead of dropping it.
    Refresh,
    /// Sharp expiry: the safety event ahead of the exact expiry time.
    SharpPreExpiry,
}

/// Receives timer events. Implemented by the heap cache; held weakly so
/// pending timer tasks never keep a closed cache alive.
pub(crate) trait TimerEventSink<K, V>: Send + Sync {
    fn timer_event_expire(&self, entry: Arc<Entry<K, V>>, generation: u64);
    fn timer_event_refresh(&self, entry: Arc<Entry<K, V>>, generation: u64);
    fn timer_event_sharp_pre_expiry(&self, entry: Arc<Entry<K, V>>, generation: u64);
}

struct SinkConfig<K, V> {
    sink: Weak<dyn TimerEventSink<K, V>>,
    has_expiry_listeners: bool,
}

/// Owns expiry policy evaluation and timer scheduling for one cache. All
/// caches share the single global scheduler pool; per-entry tasks are
/// invalidated through the entry's timer generation.
pub(crate) struct Timing<K, V> {
    variant: ExpiryVariant<K, V>,
    sharp_expiry: bool,
    refresh_ahead: bool,
    resilience: Option<Arc<dyn ResiliencePolicy<K, V>>>,
    clock: Clock,
    timer_pool: Arc<ThreadPool>,
    sink: OnceCell<SinkConfig<K, V>>,
}

impl<K, V> Drop for Timing<K, V> {
    fn drop(&mut self) {
        ThreadPoolRegistry::release_pool(&self.timer_pool);
    }
}

impl<K, V> Timing<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        variant: ExpiryVariant<K, V>,
        sharp_expiry: bool,
        refresh_ahead: bool,
        resilience: Option<Arc<dyn ResiliencePolicy<K, V>>>,
        clock: Clock,
    ) -> Self {
        Self {
            variant,
            sharp_expiry,
            refresh_ahead,
            resilience,
            clock,
            timer_pool: ThreadPoolRegistry::acquire_pool(PoolName::Timer),
            sink: OnceCell::new(),
        }
    }

    /// Wires the timer event sink. Called once while the cache is built.
    pub(crate) fn init_sink(
        &self,
        sink: Weak<dyn TimerEventSink<K, V>>,
        has_expiry_listeners: bool,
    ) {
        let config = SinkConfig {
            sink,
            has_expiry_listeners,
        };
        if self.sink.set(config).is_err() {
            panic!("timer event sink initialized twice");
        }
    }

    pub(crate) fn is_refresh_ahead(&self) -> bool {
        self.refresh_ahead
    }

    /// Evaluates the expiry policy for a new value. Returns the raw policy
    /// result; a panicking policy is reported as `Err` with the panic
    /// detail.
    pub(crate) fn calculate_next_refresh_time(
        &self,
        key: &K,
        value: Option<&V>,
        load_time: i64,
        old_entry: Option<&CacheEntry<K, V>>,
    ) -> Result<i64, String> {
        match &self.variant {
            ExpiryVariant::Eternal => Ok(entry::ETERNAL),
            ExpiryVariant::Fixed(ttl) => Ok(saturating_expiry(load_time, *ttl)),
            ExpiryVariant::Dynamic(policy) => {
                let policy = Arc::clone(policy);
                catch(move || policy.calculate_expiry_time(key, value, load_time, old_entry))
            }
        }
    }

    /// Consults the resilience policy on whether a previous value keeps
    /// being served after a loader failure.
    pub(crate) fn suppress_exception_until(
        &self,
        key: &K,
        info: &LoadExceptionInfo,
        cached_entry: &CacheEntry<K, V>,
    ) -> Result<i64, String> {
        match &self.resilience {
            None => Ok(0),
            Some(policy) => {
                let policy = Arc::clone(policy);
                catch(move || policy.suppress_exception_until(key, info, cached_entry))
            }
        }
    }

    /// Consults the resilience policy on how long a loader failure itself
    /// stays cached.
    pub(crate) fn cache_exception_until(
        &self,
        key: &K,
        info: &LoadExceptionInfo,
    ) -> Result<i64, String> {
        match &self.resilience {
            None => Ok(0),
            Some(policy) => {
                let policy = Arc::clone(policy);
                catch(move || policy.retry_load_after(key, info))
            }
        }
    }

    /// Cancels any scheduled timer, schedules the next one for `expiry` and
    /// returns the `next_refresh_time` value to publish in the entry. The
    /// caller holds the entry monitor.
    pub(crate) fn stop_start_timer(
        &self,
        expiry: i64,
        entry: &Arc<Entry<K, V>>,
        inner: &mut EntryInner<V>,
    ) -> i64 {
        inner.cancel_timer();
        let now = self.clock.millis();

        if expiry == expiry_values::NO_CACHE {
            return entry::EXPIRED;
        }
        if expiry == entry::ETERNAL {
            return entry::ETERNAL;
        }

        let (time, sharp) = if expiry < 0 {
            (-expiry, true)
        } else {
            (expiry, self.sharp_expiry)
        };
        if time <= now {
            return entry::EXPIRED;
        }

        if sharp {
            self.schedule(
                TimerTask::SharpPreExpiry,
                entry,
                inner,
                time - SHARP_EXPIRY_SAFETY_GAP_MILLIS,
                now,
            );
            return -time;
        }
        if self.refresh_ahead {
            self.schedule(TimerTask::Refresh, entry, inner, time, now);
            return time;
        }
        if self.has_expiry_listeners() {
            self.schedule(TimerTask::Expire, entry, inner, time, now);
            return time;
        }
        // Lazy expiry: the read-time freshness check is sufficient.
        time
    }

    /// After the sharp pre-expiry event, schedules the final expiry event
    /// at the exact cutoff time. The caller holds the entry monitor and has
    /// verified the entry still awaits its sharp expiry.
    pub(crate) fn schedule_final_timer_for_sharp_expiry(
        &self,
        entry: &Arc<Entry<K, V>>,
        inner: &mut EntryInner<V>,
    ) {
        debug_assert!(inner.next_refresh_time < 0);
        inner.cancel_timer();
        let time = -inner.next_refresh_time;
        let now = self.clock.millis();
        self.schedule(TimerTask::Expire, entry, inner, time, now);
    }

    /// Idempotent timer cancel.
    pub(crate) fn cancel_expiry_timer(&self, inner: &mut EntryInner<V>) {
        inner.cancel_timer();
    }

    /// Puts a freshly refreshed entry into probation: the new value stays
    /// invisible to plain freshness checks, a hit before `next_refresh_time`
    /// revives it without a loader call, and the deadline expires it.
    pub(crate) fn start_refresh_probation_timer(
        &self,
        entry: &Arc<Entry<K, V>>,
        inner: &mut EntryInner<V>,
        next_refresh_time: i64,
    ) {
        inner.cancel_timer();
        inner.next_refresh_time = entry::EXPIRED_REFRESHED;
        inner.probation_next_refresh_time = next_refresh_time;
        let deadline = next_refresh_time.abs();
        let now = self.clock.millis();
        if next_refresh_time != entry::ETERNAL && deadline > now {
            self.schedule(TimerTask::Expire, entry, inner, deadline, now);
        }
    }

    fn has_expiry_listeners(&self) -> bool {
        self.sink
            .get()
            .map(|c| c.has_expiry_listeners)
            .unwrap_or(false)
    }

    fn schedule(
        &self,
        task: TimerTask,
        entry: &Arc<Entry<K, V>>,
        inner: &mut EntryInner<V>,
        fire_at: i64,
        now: i64,
    ) {
        let config = match self.sink.get() {
            Some(config) => config,
            // Still in construction, nothing can fire yet.
            None => return,
        };
        inner.timer_generation += 1;
        let generation = inner.timer_generation;
        let sink = Weak::clone(&config.sink);
        let weak_entry = Arc::downgrade(entry);
        let delay = Duration::from_millis(fire_at.saturating_sub(now).max(0) as u64);
        let handle = self.timer_pool.pool.execute_after(delay, move || {
            let (sink, entry) = match (sink.upgrade(), weak_entry.upgrade()) {
                (Some(sink), Some(entry)) => (sink, entry),
                _ => return,
            };
            match task {
                TimerTask::Expire => sink.timer_event_expire(entry, generation),
                TimerTask::Refresh => sink.timer_event_refresh(entry, generation),
                TimerTask::SharpPreExpiry => sink.timer_event_sharp_pre_expiry(entry, generation),
            }
        });
        inner.timer_task = Some(handle);
    }
}

fn saturating_expiry(load_time: i64, ttl: i64) -> i64 {
    match load_time.checked_add(ttl) {
        Some(t) if t < entry::ETERNAL => t,
        _ => entry::ETERNAL,
    }
}

/// Runs a policy callback, converting a panic into an error detail.
fn catch<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "expiry policy panicked".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(variant: ExpiryVariant<u32, u32>, clock: Clock) -> Timing<u32, u32> {
        Timing::new(variant, false, false, None, clock)
    }

    #[test]
    fn fixed_variant_adds_the_ttl() {
        let (clock, _mock) = Clock::mock();
        let t = timing(ExpiryVariant::Fixed(500), clock);
        assert_eq!(t.calculate_next_refresh_time(&1, Some(&1), 1_000, None), Ok(1_500));
    }

    #[test]
    fn fixed_variant_saturates_to_eternal() {
        let (clock, _mock) = Clock::mock();
        let t = timing(ExpiryVariant::Fixed(i64::MAX - 10), clock);
        assert_eq!(
            t.calculate_next_refresh_time(&1, Some(&1), 1_000, None),
            Ok(entry::ETERNAL)
        );
    }

    #[test]
    fn eternal_variant_never_expires() {
        let (clock, _mock) = Clock::mock();
        let t = timing(ExpiryVariant::Eternal, clock);
        assert_eq!(
            t.calculate_next_refresh_time(&1, Some(&1), 1_000, None),
            Ok(entry::ETERNAL)
        );
    }

    #[test]
    fn panicking_policy_is_reported() {
        let (clock, _mock) = Clock::mock();
        let policy = |_: &u32, _: Option<&u32>, _: i64, _: Option<&CacheEntry<u32, u32>>| -> i64 {
            panic!("bad policy")
        };
        let t = timing(ExpiryVariant::Dynamic(Arc::new(policy)), clock);
        let err = t
            .calculate_next_refresh_time(&1, Some(&1), 1_000, None)
            .unwrap_err();
        assert_eq!(err, "bad policy");
    }

    #[test]
    fn stop_start_timer_maps_sentinels() {
        let (clock, mock) = Clock::mock();
        let now = clock.millis();
        let t = timing(ExpiryVariant::Fixed(500), clock);
        let e = Arc::new(Entry::new(1u32, 1));
        let mut inner = e.lock();

        assert_eq!(
            t.stop_start_timer(expiry_values::NO_CACHE, &e, &mut inner),
            entry::EXPIRED
        );
        assert_eq!(
            t.stop_start_timer(entry::ETERNAL, &e, &mut inner),
            entry::ETERNAL
        );
        // A time in the past expires right away.
        assert_eq!(t.stop_start_timer(now - 1, &e, &mut inner), entry::EXPIRED);
        // A future time is published as-is (lazy expiry, no listeners).
        assert_eq!(
            t.stop_start_timer(now + 10_000, &e, &mut inner),
            now + 10_000
        );
        // Sharp request: negative time published.
        assert_eq!(
            t.stop_start_timer(-(now + 10_000), &e, &mut inner),
            -(now + 10_000)
        );
        let _ = mock;
    }

    #[test]
    fn probation_publishes_the_deferred_expiry() {
        let (clock, _mock) = Clock::mock();
        let now = clock.millis();
        let t = timing(ExpiryVariant::Fixed(500), clock);
        let e = Arc::new(Entry::new(1u32, 1));
        let mut inner = e.lock();
        t.start_refresh_probation_timer(&e, &mut inner, now + 5_000);
        assert_eq!(inner.next_refresh_time, entry::EXPIRED_REFRESHED);
        assert_eq!(inner.probation_next_refresh_time, now + 5_000);
    }
}
