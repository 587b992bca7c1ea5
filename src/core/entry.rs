use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};
use scheduled_thread_pool::JobHandle;

use crate::error::LoadExceptionInfo;

/// Sentinels packed into the low range of `next_refresh_time`. Values at or
/// above [`DATA_VALID`] are absolute expiry times in milliseconds, negative
/// values mark a pending sharp expiry at the absolute value, so freshness
/// reduces to a pair of comparisons.
pub(crate) const VIRGIN: i64 = 0;
pub(crate) const REMOVE_PENDING: i64 = 1;
pub(crate) const ABORTED: i64 = 2;
pub(crate) const EXPIRED: i64 = 3;
pub(crate) const EXPIRED_REFRESHED: i64 = 4;
/// Lowest `next_refresh_time` that is an absolute expiry time.
pub(crate) const DATA_VALID: i64 = 5;
pub(crate) const ETERNAL: i64 = i64::MAX;

/// Processing state of an entry. While the state is not `Done` (or `Gone`),
/// exactly one entry action owns the entry; all other operations on the
/// same key wait on the entry monitor or enqueue a follow-up.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ProcessingState {
    Done,
    Read,
    Mutate,
    Load,
    LoadAsync,
    LoadComplete,
    Compute,
    Refresh,
    Expiry,
    ExpiryComplete,
    Write,
    WriteComplete,
    Notify,
    /// Removed from the hash table. The object may still be referenced by
    /// in-flight operations but is inert.
    Gone,
}

/// Current value of an entry.
pub(crate) enum ValueSlot<V> {
    /// No data was ever loaded into this entry.
    Virgin,
    Value(V),
    /// A cached null result from the loader.
    Null,
    /// A cached loader failure; counts as data for expiry purposes but
    /// projects to an error when read.
    Exception(LoadExceptionInfo),
}

impl<V: Clone> Clone for ValueSlot<V> {
    fn clone(&self) -> Self {
        match self {
            ValueSlot::Virgin => ValueSlot::Virgin,
            ValueSlot::Value(v) => ValueSlot::Value(v.clone()),
            ValueSlot::Null => ValueSlot::Null,
            ValueSlot::Exception(info) => ValueSlot::Exception(info.clone()),
        }
    }
}

impl<V> ValueSlot<V> {
    pub(crate) fn is_exception(&self) -> bool {
        matches!(self, ValueSlot::Exception(_))
    }

    pub(crate) fn exception_info(&self) -> Option<&LoadExceptionInfo> {
        match self {
            ValueSlot::Exception(info) => Some(info),
            _ => None,
        }
    }
}

pub(crate) type FollowUp = Box<dyn FnOnce() + Send>;

/// Mutable entry state, guarded by the entry monitor.
pub(crate) struct EntryInner<V> {
    pub(crate) slot: ValueSlot<V>,
    pub(crate) next_refresh_time: i64,
    /// Last modification time in milliseconds, when recorded.
    pub(crate) refresh_time: i64,
    /// Deferred expiry while the entry sits in refresh probation.
    pub(crate) probation_next_refresh_time: i64,
    pub(crate) processing: ProcessingState,
    /// Most recent loader failure whose propagation is suppressed by the
    /// resilience policy while the previous value keeps being served.
    pub(crate) suppressed_exception: Option<LoadExceptionInfo>,
    /// Operations that arrived while this entry was processing and chose
    /// not to wait. Drained in FIFO order at commit.
    pub(crate) followups: Vec<FollowUp>,
    /// Bumped on every timer (re)schedule and cancel; a firing task that
    /// observes a stale generation is a no-op.
    pub(crate) timer_generation: u64,
    pub(crate) timer_task: Option<JobHandle>,
}

impl<V> EntryInner<V> {
    pub(crate) fn is_virgin(&self) -> bool {
        self.next_refresh_time == VIRGIN
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.processing == ProcessingState::Gone
    }

    pub(crate) fn is_processing(&self) -> bool {
        !matches!(self.processing, ProcessingState::Done | ProcessingState::Gone)
    }

    /// State carries valid data, disregarding the clock.
    pub(crate) fn is_data_valid(&self) -> bool {
        self.next_refresh_time >= DATA_VALID || self.next_refresh_time < 0
    }

    pub(crate) fn is_expired_state(&self) -> bool {
        self.next_refresh_time == EXPIRED
    }

    pub(crate) fn is_in_refresh_probation(&self) -> bool {
        self.next_refresh_time == EXPIRED_REFRESHED
    }

    pub(crate) fn is_data_valid_or_probation(&self) -> bool {
        self.is_data_valid() || self.is_in_refresh_probation()
    }

    /// The freshness check: data is served iff this holds.
    pub(crate) fn has_fresh_data(&self, now: i64) -> bool {
        let nrt = self.next_refresh_time;
        if nrt == ETERNAL {
            return true;
        }
        if nrt >= DATA_VALID {
            return nrt > now;
        }
        if nrt < 0 {
            return -nrt > now;
        }
        false
    }

    /// The expiry time was reached, or the entry sits in refresh probation.
    pub(crate) fn is_expiry_time_reached_or_in_probation(&self, now: i64) -> bool {
        let nrt = self.next_refresh_time;
        if nrt == EXPIRED_REFRESHED {
            return true;
        }
        if (0..DATA_VALID).contains(&nrt) {
            return false;
        }
        nrt.abs() <= now
    }

    /// Cancels a scheduled timer task. Idempotent.
    pub(crate) fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(task) = self.timer_task.take() {
            task.cancel();
        }
    }
}

/// A cache entry: the per-key record holding the value, the encoded expiry
/// state, the processing state and the timer bookkeeping. Entries are
/// created virgin, reachable through the hash table until marked gone, and
/// serialized through their own monitor.
pub struct Entry<K, V> {
    key: K,
    hash: u64,
    /// Dirty access counter, read by the eviction collaborator. Lost
    /// increments under contention are acceptable.
    hit_counter: AtomicU64,
    inner: Mutex<EntryInner<V>>,
    processing_done: Condvar,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(key: K, hash: u64) -> Self {
        Self {
            key,
            hash,
            hit_counter: AtomicU64::new(0),
            inner: Mutex::new(EntryInner {
                slot: ValueSlot::Virgin,
                next_refresh_time: VIRGIN,
                refresh_time: 0,
                probation_next_refresh_time: 0,
                processing: ProcessingState::Done,
                suppressed_exception: None,
                followups: Vec::new(),
                timer_generation: 0,
                timer_task: None,
            }),
            processing_done: Condvar::new(),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The dirty access counter, for use by the eviction collaborator.
    pub fn hit_count(&self) -> u64 {
        self.hit_counter.load(Ordering::Relaxed)
    }

    /// True when this entry was removed from the hash table.
    pub fn is_gone(&self) -> bool {
        self.inner.lock().is_gone()
    }

    pub(crate) fn record_hit(&self) {
        let count = self.hit_counter.load(Ordering::Relaxed);
        self.hit_counter.store(count.wrapping_add(1), Ordering::Relaxed);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryInner<V>> {
        self.inner.lock()
    }

    /// Parks the calling thread until the current action completes. The
    /// caller must re-check `is_gone` after waking: the entry may have been
    /// removed by the concurrent operation.
    pub(crate) fn wait_for_processing(&self, guard: &mut MutexGuard<'_, EntryInner<V>>) {
        while guard.is_processing() {
            self.processing_done.wait(guard);
        }
    }

    /// Takes exclusive processing ownership. The caller must hold the entry
    /// monitor and have verified the entry is neither processing nor gone.
    pub(crate) fn start_processing(
        &self,
        guard: &mut MutexGuard<'_, EntryInner<V>>,
        state: ProcessingState,
    ) {
        debug_assert!(!guard.is_processing());
        debug_assert!(!guard.is_gone());
        guard.processing = state;
    }

    /// Moves the owned entry to the next processing state.
    pub(crate) fn next_processing_step(
        &self,
        guard: &mut MutexGuard<'_, EntryInner<V>>,
        state: ProcessingState,
    ) {
        assert!(
            guard.is_processing(),
            "processing step {state:?} on an entry that is not being processed"
        );
        guard.processing = state;
    }

    /// Single-winner transition used by the asynchronous load completion.
    /// Returns false when the entry is not in `from`, which indicates a
    /// duplicate or misdirected callback.
    pub(crate) fn check_and_switch_processing_state(
        &self,
        guard: &mut MutexGuard<'_, EntryInner<V>>,
        from: ProcessingState,
        to: ProcessingState,
    ) -> bool {
        if guard.processing != from {
            return false;
        }
        guard.processing = to;
        true
    }

    /// Ends processing: wakes parked waiters and hands the follow-up queue
    /// to the caller for FIFO dispatch outside the monitor.
    pub(crate) fn processing_done(
        &self,
        guard: &mut MutexGuard<'_, EntryInner<V>>,
    ) -> Vec<FollowUp> {
        if !guard.is_gone() {
            guard.processing = ProcessingState::Done;
        }
        self.processing_done.notify_all();
        std::mem::take(&mut guard.followups)
    }

    /// Marks the entry gone: unreachable, timer cancelled, waiters woken.
    pub(crate) fn set_gone(&self, guard: &mut MutexGuard<'_, EntryInner<V>>) {
        guard.cancel_timer();
        guard.processing = ProcessingState::Gone;
        self.processing_done.notify_all();
    }

    /// Snapshot of the committed value state, taken under a short monitor
    /// acquisition. Used by read paths that need no mutation.
    pub(crate) fn committed(&self) -> Committed<V>
    where
        V: Clone,
    {
        let inner = self.inner.lock();
        Committed {
            slot: inner.slot.clone(),
            next_refresh_time: inner.next_refresh_time,
            refresh_time: inner.refresh_time,
        }
    }
}

impl<K: std::fmt::Debug, V> std::fmt::Debug for Entry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("hash", &self.hash)
            .field("next_refresh_time", &inner.next_refresh_time)
            .field("processing", &inner.processing)
            .finish()
    }
}

/// Committed value state of an entry at one point in time.
pub(crate) struct Committed<V> {
    pub(crate) slot: ValueSlot<V>,
    pub(crate) next_refresh_time: i64,
    pub(crate) refresh_time: i64,
}

impl<V> Committed<V> {
    pub(crate) fn has_fresh_data(&self, now: i64) -> bool {
        let nrt = self.next_refresh_time;
        if nrt == ETERNAL {
            return true;
        }
        if nrt >= DATA_VALID {
            return nrt > now;
        }
        if nrt < 0 {
            return -nrt > now;
        }
        false
    }

    pub(crate) fn is_in_refresh_probation(&self) -> bool {
        self.next_refresh_time == EXPIRED_REFRESHED
    }

    pub(crate) fn is_expiry_time_reached_or_in_probation(&self, now: i64) -> bool {
        let nrt = self.next_refresh_time;
        if nrt == EXPIRED_REFRESHED {
            return true;
        }
        if (0..DATA_VALID).contains(&nrt) {
            return false;
        }
        nrt.abs() <= now
    }
}
