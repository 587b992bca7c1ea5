//! Semantics of all cache operations on entries: the pure description of
//! how an operation examines an entry and which mutation it requests,
//! separated from the driver that executes it.

use crate::{
    core::entry::ValueSlot,
    entry::{CacheEntry, MutableCacheEntry, ProcessorOp},
    error::{BoxError, CacheError, LoadExceptionInfo},
    policy::expiry_values,
};

/// View of the entry data a semantic examines: the committed slot before a
/// mutation, or the loaded value when re-examining after a load.
pub(crate) struct Examination<'a, K, V> {
    pub(crate) key: &'a K,
    pub(crate) slot: &'a ValueSlot<V>,
    pub(crate) refresh_time: i64,
    pub(crate) now: i64,
    /// Fresh data is present, or a load just completed.
    pub(crate) present: bool,
    /// The entry sits in refresh probation.
    pub(crate) in_probation: bool,
    /// The expiry time was reached or the entry sits in refresh probation.
    pub(crate) expiry_reached_or_probation: bool,
}

/// Collects the observations and the result of one operation.
pub(crate) struct Progress<R> {
    pub(crate) result: Option<R>,
    /// Examine observed no usable data; counted as a miss.
    pub(crate) count_miss: bool,
    /// Examine observed fresh data; counted as a hit.
    pub(crate) count_hit: bool,
    /// The access must not be counted (e.g. `contains_key`).
    pub(crate) do_not_count_access: bool,
    pub(crate) loader_present: bool,
}

impl<R> Progress<R> {
    pub(crate) fn new(loader_present: bool) -> Self {
        Self {
            result: None,
            count_miss: false,
            count_hit: false,
            do_not_count_access: false,
            loader_present,
        }
    }

    pub(crate) fn result(&mut self, result: R) {
        self.result = Some(result);
    }

    /// Present check that never counts as a read access.
    pub(crate) fn is_present<K, V>(&mut self, e: &Examination<'_, K, V>) -> bool {
        self.do_not_count_access = true;
        e.present
    }

    pub(crate) fn is_present_or_in_probation<K, V>(&mut self, e: &Examination<'_, K, V>) -> bool {
        self.do_not_count_access = true;
        e.present || e.in_probation
    }

    /// Present check that counts a hit on usable data and a miss otherwise.
    pub(crate) fn is_present_or_miss<K, V>(&mut self, e: &Examination<'_, K, V>) -> bool {
        if e.present {
            self.count_hit = true;
            return true;
        }
        self.count_miss = true;
        false
    }
}

/// Outcome of the examine phase.
pub(crate) enum Step {
    NoMutation,
    WantMutation,
    Failure(CacheError),
}

/// Mutation requested by a semantic.
pub(crate) enum Mutation<V> {
    /// Invoke the loader.
    Load,
    /// Invoke the loader, then run the semantic's examine again against the
    /// loaded value.
    LoadAndRestart,
    /// Invoke the loader as a refresh; the entry moves to probation.
    Refresh,
    /// Store a new value slot. `expiry` is an absolute time or
    /// [`expiry_values::NEUTRAL`] to consult the expiry policy;
    /// `refresh_time` is an absolute time or negative to record the
    /// mutation start time.
    Put {
        slot: ValueSlot<V>,
        expiry: i64,
        refresh_time: i64,
    },
    Remove,
    /// Force the expiry time, honoring the `expiry_values` sentinels.
    Expire(i64),
    Failure(CacheError),
}

impl<V> Mutation<V> {
    pub(crate) fn put(value: V) -> Self {
        Mutation::Put {
            slot: ValueSlot::Value(value),
            expiry: expiry_values::NEUTRAL,
            refresh_time: -1,
        }
    }
}

/// One cache operation: how it examines an entry and how it mutates it.
/// `mutate` is only invoked after `examine` returned [`Step::WantMutation`]
/// (for operations without an examine phase, unconditionally).
pub(crate) trait Semantic<K, V, R> {
    /// Whether the operation examines current entry data first. Plain
    /// insert-or-update operations skip straight to the mutation phase.
    fn wants_data(&self) -> bool {
        true
    }

    /// Whether the mutation phase runs user-supplied computation code.
    fn computes(&self) -> bool {
        false
    }

    fn examine(&mut self, p: &mut Progress<R>, e: &Examination<'_, K, V>) -> Step {
        let _ = (p, e);
        Step::WantMutation
    }

    fn mutate(&mut self, p: &mut Progress<R>, e: &Examination<'_, K, V>) -> Mutation<V>;

    /// Called once a requested load completed; `e` reflects the loaded
    /// value.
    fn loaded(&mut self, p: &mut Progress<R>, e: &Examination<'_, K, V>) {
        let _ = (p, e);
    }
}

/// Builds an entry snapshot from examined data, `None` when no data is
/// present.
pub(crate) fn snapshot_of<K: Clone, V: Clone>(
    e: &Examination<'_, K, V>,
) -> Option<CacheEntry<K, V>> {
    match e.slot {
        ValueSlot::Virgin => None,
        ValueSlot::Value(v) => Some(CacheEntry::with_value(
            e.key.clone(),
            v.clone(),
            e.refresh_time,
        )),
        ValueSlot::Null => Some(CacheEntry::with_null(e.key.clone(), e.refresh_time)),
        ValueSlot::Exception(info) => Some(CacheEntry::with_exception(
            e.key.clone(),
            info.clone(),
            e.refresh_time,
        )),
    }
}

/// `peek`: returns the present value, never loads.
pub(crate) struct Peek;

impl<K, V: Clone> Semantic<K, V, ValueSlot<V>> for Peek {
    fn examine(&mut self, p: &mut Progress<ValueSlot<V>>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) {
            p.result(e.slot.clone());
        }
        Step::NoMutation
    }

    fn mutate(&mut self, _: &mut Progress<ValueSlot<V>>, _: &Examination<'_, K, V>) -> Mutation<V> {
        unreachable!("peek never mutates")
    }
}

/// `get`: returns the present value, loads on a miss when a loader is
/// configured.
pub(crate) struct Get;

impl<K, V: Clone> Semantic<K, V, ValueSlot<V>> for Get {
    fn examine(&mut self, p: &mut Progress<ValueSlot<V>>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) {
            p.result(e.slot.clone());
            Step::NoMutation
        } else if p.loader_present {
            Step::WantMutation
        } else {
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<ValueSlot<V>>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::Load
    }

    fn loaded(&mut self, p: &mut Progress<ValueSlot<V>>, e: &Examination<'_, K, V>) {
        p.result(e.slot.clone());
    }
}

/// `get_entry` / `peek_entry`: like `get`/`peek` with an entry snapshot as
/// the result.
pub(crate) struct GetEntry;

impl<K: Clone, V: Clone> Semantic<K, V, CacheEntry<K, V>> for GetEntry {
    fn examine(&mut self, p: &mut Progress<CacheEntry<K, V>>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) {
            if let Some(snapshot) = snapshot_of(e) {
                p.result(snapshot);
            }
            Step::NoMutation
        } else if p.loader_present {
            Step::WantMutation
        } else {
            Step::NoMutation
        }
    }

    fn mutate(
        &mut self,
        _: &mut Progress<CacheEntry<K, V>>,
        _: &Examination<'_, K, V>,
    ) -> Mutation<V> {
        Mutation::Load
    }

    fn loaded(&mut self, p: &mut Progress<CacheEntry<K, V>>, e: &Examination<'_, K, V>) {
        if let Some(snapshot) = snapshot_of(e) {
            p.result(snapshot);
        }
    }
}

pub(crate) struct PeekEntry;

impl<K: Clone, V: Clone> Semantic<K, V, CacheEntry<K, V>> for PeekEntry {
    fn examine(&mut self, p: &mut Progress<CacheEntry<K, V>>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) {
            if let Some(snapshot) = snapshot_of(e) {
                p.result(snapshot);
            }
        }
        Step::NoMutation
    }

    fn mutate(
        &mut self,
        _: &mut Progress<CacheEntry<K, V>>,
        _: &Examination<'_, K, V>,
    ) -> Mutation<V> {
        unreachable!("peek_entry never mutates")
    }
}

/// `contains_key`.
pub(crate) struct Contains;

impl<K, V> Semantic<K, V, bool> for Contains {
    fn examine(&mut self, p: &mut Progress<bool>, e: &Examination<'_, K, V>) -> Step {
        let present = p.is_present(e);
        p.result(present);
        Step::NoMutation
    }

    fn mutate(&mut self, _: &mut Progress<bool>, _: &Examination<'_, K, V>) -> Mutation<V> {
        unreachable!("contains never mutates")
    }
}

/// `put`: unconditional insert or update.
pub(crate) struct Put<V>(pub(crate) Option<V>);

impl<K, V> Semantic<K, V, ()> for Put<V> {
    fn wants_data(&self) -> bool {
        false
    }

    fn mutate(&mut self, _: &mut Progress<()>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::put(self.0.take().expect("put value consumed twice"))
    }
}

/// `remove`: unconditional removal.
pub(crate) struct Remove;

impl<K, V> Semantic<K, V, ()> for Remove {
    fn wants_data(&self) -> bool {
        false
    }

    fn mutate(&mut self, _: &mut Progress<()>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::Remove
    }
}

/// `contains_and_remove`: always removes, reports whether data was present.
pub(crate) struct ContainsAndRemove;

impl<K, V> Semantic<K, V, bool> for ContainsAndRemove {
    fn mutate(&mut self, p: &mut Progress<bool>, e: &Examination<'_, K, V>) -> Mutation<V> {
        let present = p.is_present(e);
        p.result(present);
        Mutation::Remove
    }
}

/// `put_if_absent`.
pub(crate) struct PutIfAbsent<V>(pub(crate) Option<V>);

impl<K, V> Semantic<K, V, bool> for PutIfAbsent<V> {
    fn examine(&mut self, p: &mut Progress<bool>, e: &Examination<'_, K, V>) -> Step {
        if !p.is_present_or_miss(e) {
            p.result(true);
            Step::WantMutation
        } else {
            p.result(false);
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<bool>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::put(self.0.take().expect("put value consumed twice"))
    }
}

/// `replace`: update only when data is present.
pub(crate) struct Replace<V>(pub(crate) Option<V>);

impl<K, V> Semantic<K, V, bool> for Replace<V> {
    fn examine(&mut self, p: &mut Progress<bool>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) {
            p.result(true);
            Step::WantMutation
        } else {
            p.result(false);
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<bool>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::put(self.0.take().expect("put value consumed twice"))
    }
}

/// `replace_if_equals`: update only when the present value equals the
/// expected one.
pub(crate) struct ReplaceIfEquals<V> {
    pub(crate) expected: V,
    pub(crate) new_value: Option<V>,
}

impl<K, V: PartialEq> Semantic<K, V, bool> for ReplaceIfEquals<V> {
    fn examine(&mut self, p: &mut Progress<bool>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) && slot_equals(e.slot, &self.expected) {
            p.result(true);
            Step::WantMutation
        } else {
            p.result(false);
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<bool>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::put(self.new_value.take().expect("put value consumed twice"))
    }
}

/// `remove_if_equals`.
pub(crate) struct RemoveIfEquals<V>(pub(crate) V);

impl<K, V: PartialEq> Semantic<K, V, bool> for RemoveIfEquals<V> {
    fn examine(&mut self, p: &mut Progress<bool>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) && slot_equals(e.slot, &self.0) {
            p.result(true);
            Step::WantMutation
        } else {
            p.result(false);
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<bool>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::Remove
    }
}

fn slot_equals<V: PartialEq>(slot: &ValueSlot<V>, expected: &V) -> bool {
    matches!(slot, ValueSlot::Value(v) if v == expected)
}

/// `peek_and_put`: returns the old value, stores the new one.
pub(crate) struct PeekAndPut<V>(pub(crate) Option<V>);

impl<K, V: Clone> Semantic<K, V, ValueSlot<V>> for PeekAndPut<V> {
    fn mutate(&mut self, p: &mut Progress<ValueSlot<V>>, e: &Examination<'_, K, V>) -> Mutation<V> {
        if p.is_present_or_miss(e) {
            p.result(e.slot.clone());
        }
        Mutation::put(self.0.take().expect("put value consumed twice"))
    }
}

/// `peek_and_remove`: returns the old value, removes the entry.
pub(crate) struct PeekAndRemove;

impl<K, V: Clone> Semantic<K, V, ValueSlot<V>> for PeekAndRemove {
    fn mutate(&mut self, p: &mut Progress<ValueSlot<V>>, e: &Examination<'_, K, V>) -> Mutation<V> {
        if p.is_present_or_miss(e) {
            p.result(e.slot.clone());
        }
        Mutation::Remove
    }
}

/// `peek_and_replace`: replaces only when data is present, returns the old
/// value.
pub(crate) struct PeekAndReplace<V>(pub(crate) Option<V>);

impl<K, V: Clone> Semantic<K, V, ValueSlot<V>> for PeekAndReplace<V> {
    fn examine(&mut self, p: &mut Progress<ValueSlot<V>>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) {
            p.result(e.slot.clone());
            Step::WantMutation
        } else {
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<ValueSlot<V>>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::put(self.0.take().expect("put value consumed twice"))
    }
}

/// `compute_if_absent`: runs the supplier only when no data is present.
pub(crate) struct ComputeIfAbsent<F> {
    pub(crate) init: Option<F>,
}

impl<K, V, F> Semantic<K, V, ValueSlot<V>> for ComputeIfAbsent<F>
where
    K: std::fmt::Debug,
    V: Clone,
    F: FnOnce() -> Result<V, BoxError>,
{
    fn computes(&self) -> bool {
        true
    }

    fn examine(&mut self, p: &mut Progress<ValueSlot<V>>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present_or_miss(e) {
            p.result(e.slot.clone());
            Step::NoMutation
        } else {
            Step::WantMutation
        }
    }

    fn mutate(&mut self, p: &mut Progress<ValueSlot<V>>, e: &Examination<'_, K, V>) -> Mutation<V> {
        let init = self.init.take().expect("supplier consumed twice");
        match init() {
            Ok(value) => {
                p.result(ValueSlot::Value(value.clone()));
                Mutation::put(value)
            }
            Err(error) => Mutation::Failure(CacheError::Processor {
                key: format!("{:?}", e.key),
                source: error.into(),
            }),
        }
    }
}

/// `invoke`: runs an entry processor against a mutable view and applies the
/// recorded mutation. The processor may be re-run after a read-through
/// load.
pub(crate) struct Invoke<F, V> {
    pub(crate) processor: F,
    pub(crate) needs_load: bool,
    pub(crate) op: ProcessorOp<V>,
    pub(crate) expiry_time: Option<i64>,
    pub(crate) refreshed_time: Option<i64>,
}

impl<F, V> Invoke<F, V> {
    pub(crate) fn new(processor: F) -> Self {
        Self {
            processor,
            needs_load: false,
            op: ProcessorOp::None,
            expiry_time: None,
            refreshed_time: None,
        }
    }
}

impl<K, V, R, F> Semantic<K, V, R> for Invoke<F, V>
where
    K: Clone + std::fmt::Debug,
    V: Clone,
    F: FnMut(&mut MutableCacheEntry<'_, K, V>) -> Result<R, BoxError>,
{
    fn computes(&self) -> bool {
        true
    }

    fn examine(&mut self, p: &mut Progress<R>, e: &Examination<'_, K, V>) -> Step {
        let current = if e.present { snapshot_of(e) } else { None };
        let mut view = MutableCacheEntry::new(e.key, current.as_ref(), p.loader_present, e.now);
        p.do_not_count_access = true;
        match (self.processor)(&mut view) {
            Ok(result) => p.result(result),
            Err(error) => {
                // A propagated restart marker is control flow, not a
                // failure: load and re-run the processor.
                if view.needs_load {
                    self.needs_load = true;
                    return Step::WantMutation;
                }
                return Step::Failure(CacheError::Processor {
                    key: format!("{:?}", e.key),
                    source: error.into(),
                });
            }
        }
        if view.needs_load {
            self.needs_load = true;
            return Step::WantMutation;
        }
        if view.mutation_needed() {
            self.op = view.op;
            self.expiry_time = view.expiry_time;
            self.refreshed_time = view.refreshed_time;
            Step::WantMutation
        } else {
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<R>, e: &Examination<'_, K, V>) -> Mutation<V> {
        if self.needs_load {
            self.needs_load = false;
            return Mutation::LoadAndRestart;
        }
        let expiry = self.expiry_time.unwrap_or(expiry_values::NEUTRAL);
        let refresh_time = self.refreshed_time.unwrap_or(-1);
        match std::mem::replace(&mut self.op, ProcessorOp::None) {
            ProcessorOp::Remove => Mutation::Remove,
            ProcessorOp::SetValue(value) => Mutation::Put {
                slot: ValueSlot::Value(value),
                expiry,
                refresh_time,
            },
            ProcessorOp::SetException(error) => Mutation::Put {
                slot: ValueSlot::Exception(LoadExceptionInfo::new(
                    format!("{:?}", e.key),
                    error,
                    e.now,
                )),
                expiry,
                refresh_time,
            },
            // Only the expiry time was touched.
            ProcessorOp::None => Mutation::Expire(self.expiry_time.expect("recorded expiry")),
        }
    }
}

/// Internal: ensure a value is loaded, used by `load_all` and `prefetch`.
pub(crate) struct EnsureLoaded;

impl<K, V> Semantic<K, V, ()> for EnsureLoaded {
    fn examine(&mut self, p: &mut Progress<()>, e: &Examination<'_, K, V>) -> Step {
        if p.is_present(e) {
            Step::NoMutation
        } else {
            Step::WantMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<()>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::Load
    }
}

/// Internal: load unconditionally, used by `reload_all`.
pub(crate) struct UnconditionalLoad;

impl<K, V> Semantic<K, V, ()> for UnconditionalLoad {
    fn wants_data(&self) -> bool {
        false
    }

    fn mutate(&mut self, _: &mut Progress<()>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::Load
    }
}

/// Internal: refresh-ahead load triggered by the expiry timer.
pub(crate) struct Refresh;

impl<K, V> Semantic<K, V, ()> for Refresh {
    fn wants_data(&self) -> bool {
        false
    }

    fn mutate(&mut self, _: &mut Progress<()>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::Refresh
    }
}

/// `expire_at`: force the expiry time of a present entry.
pub(crate) struct ExpireAt(pub(crate) i64);

impl<K, V> Semantic<K, V, ()> for ExpireAt {
    fn examine(&mut self, p: &mut Progress<()>, e: &Examination<'_, K, V>) -> Step {
        let eligible = if self.0 == expiry_values::NO_CACHE || self.0 == expiry_values::REFRESH {
            p.is_present_or_in_probation(e)
        } else {
            p.is_present(e)
        };
        if eligible {
            Step::WantMutation
        } else {
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<()>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::Expire(self.0)
    }
}

/// Internal: the timer event for a reached expiry time.
pub(crate) struct ExpireEvent;

impl<K, V> Semantic<K, V, ()> for ExpireEvent {
    fn examine(&mut self, p: &mut Progress<()>, e: &Examination<'_, K, V>) -> Step {
        p.do_not_count_access = true;
        if e.expiry_reached_or_probation {
            Step::WantMutation
        } else {
            Step::NoMutation
        }
    }

    fn mutate(&mut self, _: &mut Progress<()>, _: &Examination<'_, K, V>) -> Mutation<V> {
        Mutation::Expire(expiry_values::NO_CACHE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exam<'a>(key: &'a u32, slot: &'a ValueSlot<u32>, present: bool) -> Examination<'a, u32, u32> {
        Examination {
            key,
            slot,
            refresh_time: 0,
            now: 100,
            present,
            in_probation: false,
            expiry_reached_or_probation: false,
        }
    }

    #[test]
    fn get_counts_miss_and_wants_load_only_with_loader() {
        let key = 1;
        let slot = ValueSlot::Virgin;

        let mut p = Progress::new(true);
        let step = Get.examine(&mut p, &exam(&key, &slot, false));
        assert!(matches!(step, Step::WantMutation));
        assert!(p.count_miss);

        let mut p = Progress::new(false);
        let step = Get.examine(&mut p, &exam(&key, &slot, false));
        assert!(matches!(step, Step::NoMutation));
        assert!(p.count_miss);
        assert!(p.result.is_none());
    }

    #[test]
    fn peek_returns_value_without_mutation() {
        let key = 1;
        let slot = ValueSlot::Value(42);
        let mut p = Progress::new(true);
        let step = Peek.examine(&mut p, &exam(&key, &slot, true));
        assert!(matches!(step, Step::NoMutation));
        assert!(matches!(p.result, Some(ValueSlot::Value(42))));
        assert!(!p.count_miss);
    }

    #[test]
    fn put_if_absent_decides_on_presence() {
        let key = 1;
        let slot = ValueSlot::Value(1);

        let mut sem = PutIfAbsent(Some(2));
        let mut p = Progress::new(false);
        assert!(matches!(
            sem.examine(&mut p, &exam(&key, &slot, true)),
            Step::NoMutation
        ));
        assert_eq!(p.result, Some(false));

        let mut sem = PutIfAbsent(Some(2));
        let mut p = Progress::new(false);
        assert!(matches!(
            sem.examine(&mut p, &exam(&key, &ValueSlot::Virgin, false)),
            Step::WantMutation
        ));
        assert_eq!(p.result, Some(true));
        assert!(matches!(
            sem.mutate(&mut p, &exam(&key, &ValueSlot::Virgin, false)),
            Mutation::Put { .. }
        ));
    }

    #[test]
    fn replace_if_equals_compares_values() {
        let key = 1;
        let slot = ValueSlot::Value(10);

        let mut sem = ReplaceIfEquals {
            expected: 10,
            new_value: Some(11),
        };
        let mut p = Progress::new(false);
        assert!(matches!(
            sem.examine(&mut p, &exam(&key, &slot, true)),
            Step::WantMutation
        ));

        let mut sem = ReplaceIfEquals {
            expected: 99,
            new_value: Some(11),
        };
        let mut p = Progress::new(false);
        assert!(matches!(
            sem.examine(&mut p, &exam(&key, &slot, true)),
            Step::NoMutation
        ));
        assert_eq!(p.result, Some(false));
    }

    #[test]
    fn contains_and_remove_always_removes() {
        let key = 1;
        let mut p = Progress::new(false);
        let m = ContainsAndRemove.mutate(&mut p, &exam(&key, &ValueSlot::Value(5), true));
        assert!(matches!(m, Mutation::Remove));
        assert_eq!(p.result, Some(true));

        let mut p = Progress::new(false);
        let m = ContainsAndRemove.mutate(&mut p, &exam(&key, &ValueSlot::Virgin, false));
        assert!(matches!(m, Mutation::Remove));
        assert_eq!(p.result, Some(false));
    }

    #[test]
    fn expire_event_requires_reached_expiry() {
        let key = 1;
        let slot = ValueSlot::Value(1);
        let mut p = Progress::new(false);
        let mut e = exam(&key, &slot, false);
        e.expiry_reached_or_probation = true;
        assert!(matches!(
            ExpireEvent.examine(&mut p, &e),
            Step::WantMutation
        ));
        let mut e = exam(&key, &slot, true);
        e.expiry_reached_or_probation = false;
        assert!(matches!(ExpireEvent.examine(&mut p, &e), Step::NoMutation));
    }

    #[test]
    fn invoke_records_and_applies_mutation() {
        let key = 1u32;
        let slot = ValueSlot::Value(10u32);
        let mut sem = Invoke::new(|e: &mut MutableCacheEntry<'_, u32, u32>| {
            let v = e.value()?.unwrap();
            e.set_value(v + 1);
            Ok::<_, BoxError>(v)
        });
        let mut p: Progress<u32> = Progress::new(false);
        let step = sem.examine(&mut p, &exam(&key, &slot, true));
        assert!(matches!(step, Step::WantMutation));
        assert_eq!(p.result, Some(10));
        match sem.mutate(&mut p, &exam(&key, &slot, true)) {
            Mutation::Put {
                slot: ValueSlot::Value(v),
                ..
            } => assert_eq!(v, 11),
            _ => panic!("expected put"),
        }
    }

    #[test]
    fn invoke_requests_read_through_load() {
        let key = 1u32;
        let mut sem = Invoke::new(|e: &mut MutableCacheEntry<'_, u32, u32>| {
            let _ = e.value()?;
            Ok::<_, BoxError>(())
        });
        let mut p: Progress<()> = Progress::new(true);
        let step = sem.examine(&mut p, &exam(&key, &ValueSlot::Virgin, false));
        assert!(matches!(step, Step::WantMutation));
        assert!(matches!(
            sem.mutate(&mut p, &exam(&key, &ValueSlot::Virgin, false)),
            Mutation::LoadAndRestart
        ));
    }
}
