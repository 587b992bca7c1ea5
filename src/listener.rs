use std::{panic::AssertUnwindSafe, sync::Arc};

use smallvec::SmallVec;

use crate::{common::Executor, entry::CacheEntry, error::CacheError};

/// Invoked after a new entry was inserted.
pub type CreatedListener<K, V> = Arc<dyn Fn(&CacheEntry<K, V>) + Send + Sync + 'static>;

/// Invoked after an existing entry was updated; receives the previous and
/// the new entry.
pub type UpdatedListener<K, V> =
    Arc<dyn Fn(&CacheEntry<K, V>, &CacheEntry<K, V>) + Send + Sync + 'static>;

/// Invoked after an entry was removed.
pub type RemovedListener<K, V> = Arc<dyn Fn(&CacheEntry<K, V>) + Send + Sync + 'static>;

/// Invoked when an entry expired.
pub type ExpiredListener<K, V> = Arc<dyn Fn(&CacheEntry<K, V>) + Send + Sync + 'static>;

type List<T> = SmallVec<[T; 2]>;

/// Registered entry lifecycle listeners of one cache. Synchronous listeners
/// run on the thread performing the mutation, while the entry is still
/// being processed. Asynchronous listeners are dispatched to the listener
/// executor, each event with its own copy of the entry data.
pub(crate) struct Listeners<K, V> {
    pub(crate) created: List<CreatedListener<K, V>>,
    pub(crate) updated: List<UpdatedListener<K, V>>,
    pub(crate) removed: List<RemovedListener<K, V>>,
    pub(crate) expired: List<ExpiredListener<K, V>>,
    pub(crate) async_created: List<CreatedListener<K, V>>,
    pub(crate) async_updated: List<UpdatedListener<K, V>>,
    pub(crate) async_removed: List<RemovedListener<K, V>>,
    pub(crate) async_expired: List<ExpiredListener<K, V>>,
}

impl<K, V> Default for Listeners<K, V> {
    fn default() -> Self {
        Self {
            created: List::new(),
            updated: List::new(),
            removed: List::new(),
            expired: List::new(),
            async_created: List::new(),
            async_updated: List::new(),
            async_removed: List::new(),
            async_expired: List::new(),
        }
    }
}

impl<K, V> Listeners<K, V>
where
    K: Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.expired.is_empty()
            && self.async_created.is_empty()
            && self.async_updated.is_empty()
            && self.async_removed.is_empty()
            && self.async_expired.is_empty()
    }

    pub(crate) fn has_expired_listeners(&self) -> bool {
        !self.expired.is_empty() || !self.async_expired.is_empty()
    }

    /// Runs the synchronous listeners on the calling thread and hands each
    /// asynchronous listener its own event copy. Returns the first captured
    /// synchronous failure; later ones are logged and suppressed.
    pub(crate) fn dispatch_created(
        &self,
        cache_name: &str,
        executor: &Executor,
        entry: &CacheEntry<K, V>,
    ) -> Option<CacheError> {
        let mut first = None;
        for l in &self.created {
            capture(cache_name, entry, &mut first, || l(entry));
        }
        for l in &self.async_created {
            let l = Arc::clone(l);
            let entry = entry.clone();
            let name = cache_name.to_string();
            executor.execute(move || log_failure(&name, || l(&entry)));
        }
        first
    }

    pub(crate) fn dispatch_updated(
        &self,
        cache_name: &str,
        executor: &Executor,
        old_entry: &CacheEntry<K, V>,
        new_entry: &CacheEntry<K, V>,
    ) -> Option<CacheError> {
        let mut first = None;
        for l in &self.updated {
            capture(cache_name, new_entry, &mut first, || l(old_entry, new_entry));
        }
        for l in &self.async_updated {
            let l = Arc::clone(l);
            let old_entry = old_entry.clone();
            let new_entry = new_entry.clone();
            let name = cache_name.to_string();
            executor.execute(move || log_failure(&name, || l(&old_entry, &new_entry)));
        }
        first
    }

    pub(crate) fn dispatch_removed(
        &self,
        cache_name: &str,
        executor: &Executor,
        entry: &CacheEntry<K, V>,
    ) -> Option<CacheError> {
        let mut first = None;
        for l in &self.removed {
            capture(cache_name, entry, &mut first, || l(entry));
        }
        for l in &self.async_removed {
            let l = Arc::clone(l);
            let entry = entry.clone();
            let name = cache_name.to_string();
            executor.execute(move || log_failure(&name, || l(&entry)));
        }
        first
    }

    pub(crate) fn dispatch_expired(
        &self,
        cache_name: &str,
        executor: &Executor,
        entry: &CacheEntry<K, V>,
    ) -> Option<CacheError> {
        let mut first = None;
        for l in &self.expired {
            capture(cache_name, entry, &mut first, || l(entry));
        }
        for l in &self.async_expired {
            let l = Arc::clone(l);
            let entry = entry.clone();
            let name = cache_name.to_string();
            executor.execute(move || log_failure(&name, || l(&entry)));
        }
        first
    }
}

/// Runs one synchronous listener, capturing a panic into `first` unless an
/// earlier failure was already captured. Later failures are logged.
fn capture<K: std::fmt::Debug, V>(
    cache_name: &str,
    entry: &CacheEntry<K, V>,
    first: &mut Option<CacheError>,
    listener: impl FnOnce(),
) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(listener)) {
        let detail = panic_detail(&payload);
        if first.is_none() {
            *first = Some(CacheError::Listener {
                key: format!("{:?}", entry.key()),
                detail,
            });
        } else {
            log::warn!(
                "cache `{cache_name}`: suppressed entry listener failure: {detail}"
            );
        }
    }
}

/// Runs an asynchronous listener on the executor thread; failures never
/// reach the originating operation and are only logged.
fn log_failure(cache_name: &str, listener: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(listener)) {
        log::warn!(
            "cache `{cache_name}`: async entry listener failed: {}",
            panic_detail(&payload)
        );
    }
}

fn panic_detail(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;

    fn entry(key: u32, value: u32) -> CacheEntry<u32, u32> {
        CacheEntry::with_value(key, value, 0)
    }

    #[test]
    fn first_sync_failure_is_captured_later_ones_suppressed() {
        let mut listeners: Listeners<u32, u32> = Listeners::default();
        listeners.created.push(Arc::new(|_| panic!("first boom")));
        listeners.created.push(Arc::new(|_| panic!("second boom")));
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            listeners.created.push(Arc::new(move |_| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }

        let executor = Executor::custom(|job| job());
        let err = listeners.dispatch_created("t", &executor, &entry(1, 2));
        match err {
            Some(CacheError::Listener { detail, .. }) => assert_eq!(detail, "first boom"),
            other => panic!("unexpected: {other:?}"),
        }
        // All listeners ran despite the failures.
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
