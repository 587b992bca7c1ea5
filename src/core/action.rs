//! The driver executing one operation on one entry: lock handling, loader
//! and writer orchestration, expiry computation with the resilience path,
//! heap update, listener dispatch, timer scheduling and commit.

use std::{
    hash::{BuildHasher, Hash},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use crate::{
    core::{
        entry::{self, Entry, FollowUp, ProcessingState, ValueSlot},
        heap::HeapCacheInner,
    },
    error::{BoxError, CacheError, LoadExceptionInfo},
    loader::{LoadCallback, LoadContext, Loaded},
    ops::{Examination, Mutation, Progress, Semantic, Step},
    policy::expiry_values,
};

/// How the action behaves when the entry is busy: synchronous callers park
/// on the entry monitor, asynchronous (internal) operations enqueue a retry
/// job on the running action and return.
pub(crate) enum ActionMode<K, V> {
    Sync,
    Async {
        /// Operate on this specific entry; abort silently when it is gone.
        bound: Option<Arc<Entry<K, V>>>,
        retry: Option<FollowUp>,
    },
}

pub(crate) fn run_action<K, V, S, R>(
    cache: &Arc<HeapCacheInner<K, V, S>>,
    key: &K,
    mut semantic: impl Semantic<K, V, R>,
    mode: ActionMode<K, V>,
) -> Result<Option<R>, CacheError>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    let (bound, retry) = match mode {
        ActionMode::Sync => (None, None),
        ActionMode::Async { bound, retry } => (bound, retry),
    };
    let mut action = EntryAction {
        cache,
        key,
        progress: Progress::new(cache.is_loader_present()),
        entry: None,
        entry_locked: false,
        heap_data_valid: false,
        heap_hit: false,
        bound,
        retry,
        new_slot: None,
        old_slot: None,
        remove: false,
        expired_immediately: false,
        expire_command: false,
        fixed_expiry: false,
        want_refresh_after: false,
        revived: false,
        expiry: 0,
        last_refresh_time: 0,
        load_started: None,
        mutation_start: None,
        load: false,
        refresh: false,
        load_and_restart: false,
        successful_load: false,
        stored_loaded_value: false,
        suppressed: None,
        exception_to_propagate: None,
    };
    action.run(&mut semantic)
}

struct EntryAction<'c, K, V, S, R> {
    cache: &'c Arc<HeapCacheInner<K, V, S>>,
    key: &'c K,
    progress: Progress<R>,
    entry: Option<Arc<Entry<K, V>>>,
    /// We own the entry's processing state.
    entry_locked: bool,
    /// Entry had data (valid or in probation) when we took ownership.
    heap_data_valid: bool,
    heap_hit: bool,
    bound: Option<Arc<Entry<K, V>>>,
    retry: Option<FollowUp>,
    new_slot: Option<ValueSlot<V>>,
    old_slot: Option<ValueSlot<V>>,
    remove: bool,
    /// The computed expiry is in the past; the entry expires as part of
    /// this mutation.
    expired_immediately: bool,
    /// Running an `expire` command: no expiry policy, no writer.
    expire_command: bool,
    /// The mutation carries an explicit expiry time; skip the policy.
    fixed_expiry: bool,
    /// Submit a refresh once the mutation committed (`REFRESH` sentinel).
    want_refresh_after: bool,
    /// Revived from refresh probation; value and expiry are already set.
    revived: bool,
    expiry: i64,
    last_refresh_time: i64,
    load_started: Option<i64>,
    mutation_start: Option<i64>,
    load: bool,
    refresh: bool,
    load_and_restart: bool,
    successful_load: bool,
    /// A load-and-restart ended without a different mutation; the loaded
    /// value is stored as-is (no writer, no put accounting).
    stored_loaded_value: bool,
    suppressed: Option<LoadExceptionInfo>,
    exception_to_propagate: Option<CacheError>,
}

impl<K, V, S, R> EntryAction<'_, K, V, S, R>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    fn run(&mut self, semantic: &mut impl Semantic<K, V, R>) -> Result<Option<R>, CacheError> {
        // Examine phase against committed state, no entry ownership yet.
        if semantic.wants_data() {
            let entry = match &self.bound {
                Some(e) => Some(Arc::clone(e)),
                None => self.cache.lookup_with_hit_record(self.key),
            };
            self.heap_hit = entry.is_some();
            match self.examine_entry(semantic, entry.as_ref()) {
                Step::Failure(err) => {
                    self.update_read_statistics();
                    return Err(err);
                }
                Step::NoMutation => {
                    self.update_read_statistics();
                    return Ok(self.progress.result.take());
                }
                Step::WantMutation => self.entry = entry,
            }
        }

        // Lock acquisition: take processing ownership or hand off.
        if !self.lock_entry() {
            return Ok(None);
        }

        // Re-examine under ownership; a concurrent operation may have
        // settled the matter while we waited.
        if semantic.wants_data() {
            self.progress.count_miss = false;
            self.progress.count_hit = false;
            let entry = self.entry.clone();
            match self.examine_entry(semantic, entry.as_ref()) {
                Step::NoMutation => return self.no_mutation_requested(),
                Step::Failure(err) => return self.mutation_abort(err),
                Step::WantMutation => {}
            }
        }

        self.check_expiry_before_mutation();

        let entry = self.entry.clone();
        if semantic.computes() {
            self.step_state(ProcessingState::Compute);
        }
        let mut mutation = self.mutate_step(semantic, entry.as_ref());

        'pipeline: loop {
            match mutation {
                Mutation::Failure(err) => return self.mutation_abort(err),
                Mutation::Load => {
                    self.load = true;
                    if let Err(err) = self.do_load() {
                        return self.mutation_abort(err);
                    }
                }
                Mutation::LoadAndRestart => {
                    self.load = true;
                    self.load_and_restart = true;
                    if let Err(err) = self.do_load() {
                        return self.mutation_abort(err);
                    }
                }
                Mutation::Refresh => {
                    self.load = true;
                    self.refresh = true;
                    if let Err(err) = self.do_load() {
                        return self.mutation_abort(err);
                    }
                }
                Mutation::Put {
                    slot,
                    expiry,
                    refresh_time,
                } => {
                    self.step_state(ProcessingState::Mutate);
                    self.new_slot = Some(slot);
                    self.last_refresh_time = if refresh_time >= 0 {
                        refresh_time
                    } else {
                        self.mutation_start_time()
                    };
                    if expiry != expiry_values::NEUTRAL {
                        self.expiry = expiry;
                        self.fixed_expiry = true;
                    }
                }
                Mutation::Remove => {
                    self.step_state(ProcessingState::Mutate);
                    self.remove = true;
                }
                Mutation::Expire(requested) => {
                    self.step_state(ProcessingState::Expiry);
                    self.begin_expire_command(requested);
                }
            }

            // Expiry computation, including the resilience path for
            // exception values.
            if !self.remove && !self.expire_command {
                if self.fixed_expiry {
                    self.step_state(ProcessingState::Expiry);
                    self.set_until_on_new_slot();
                } else if let Err(err) = self.calculate_expiry() {
                    return self.mutation_abort(err);
                }
            }
            if !self.remove {
                self.step_state(ProcessingState::ExpiryComplete);
            }

            // A loader-backed operation may want to examine again, now
            // against the loaded value.
            if self.load && self.load_and_restart {
                self.load = false;
                self.load_and_restart = false;
                self.successful_load = true;
                let entry = self.entry.clone();
                match self.examine_entry(semantic, entry.as_ref()) {
                    Step::Failure(err) => return self.mutation_abort(err),
                    Step::NoMutation => self.stored_loaded_value = true,
                    Step::WantMutation => {
                        self.fixed_expiry = false;
                        if semantic.computes() {
                            self.step_state(ProcessingState::Compute);
                        }
                        mutation = self.mutate_step(semantic, entry.as_ref());
                        continue 'pipeline;
                    }
                }
            }

            if !self.load && !self.stored_loaded_value && !self.expire_command {
                self.count_put_metrics();
                if let Err(err) = self.may_call_writer() {
                    return self.mutation_abort(err);
                }
            }

            // Keep-or-remove decision, heap update, listeners and commit.
            // Publishing a past expiry time re-enters this loop as an
            // immediate expiry.
            loop {
                self.check_keep_or_remove();
                self.update_heap();
                self.call_listeners();
                if !self.commit_and_release(semantic) {
                    break 'pipeline;
                }
            }
        }

        self.update_statistics_after_mutation();
        if self.want_refresh_after {
            self.cache.submit_refresh(self.key.clone());
        }
        match self.exception_to_propagate.take() {
            Some(err) => Err(err),
            None => Ok(self.progress.result.take()),
        }
    }

    /// Runs the semantic's examine against the current data: the loaded
    /// value after a successful load, the committed entry state otherwise.
    fn examine_entry(
        &mut self,
        semantic: &mut impl Semantic<K, V, R>,
        entry: Option<&Arc<Entry<K, V>>>,
    ) -> Step {
        let now = self.cache.clock.millis();
        if self.successful_load && self.new_slot.is_some() {
            let slot = self.new_slot.as_ref().expect("loaded slot");
            let exam = Examination {
                key: self.key,
                slot,
                refresh_time: self.last_refresh_time,
                now,
                present: true,
                in_probation: false,
                expiry_reached_or_probation: false,
            };
            return semantic.examine(&mut self.progress, &exam);
        }
        match entry {
            None => {
                let virgin = ValueSlot::Virgin;
                let exam = Examination {
                    key: self.key,
                    slot: &virgin,
                    refresh_time: 0,
                    now,
                    present: false,
                    in_probation: false,
                    expiry_reached_or_probation: false,
                };
                semantic.examine(&mut self.progress, &exam)
            }
            Some(e) => {
                let committed = e.committed();
                let exam = Examination {
                    key: self.key,
                    slot: &committed.slot,
                    refresh_time: committed.refresh_time,
                    now,
                    present: committed.has_fresh_data(now),
                    in_probation: committed.is_in_refresh_probation(),
                    expiry_reached_or_probation: committed
                        .is_expiry_time_reached_or_in_probation(now),
                };
                semantic.examine(&mut self.progress, &exam)
            }
        }
    }

    fn mutate_step(
        &mut self,
        semantic: &mut impl Semantic<K, V, R>,
        entry: Option<&Arc<Entry<K, V>>>,
    ) -> Mutation<V> {
        let now = self.cache.clock.millis();
        if self.successful_load {
            if let Some(slot) = self.new_slot.as_ref() {
                let exam = Examination {
                    key: self.key,
                    slot,
                    refresh_time: self.last_refresh_time,
                    now,
                    present: true,
                    in_probation: false,
                    expiry_reached_or_probation: false,
                };
                return semantic.mutate(&mut self.progress, &exam);
            }
        }
        match entry {
            None => {
                let virgin = ValueSlot::Virgin;
                let exam = Examination {
                    key: self.key,
                    slot: &virgin,
                    refresh_time: 0,
                    now,
                    present: false,
                    in_probation: false,
                    expiry_reached_or_probation: false,
                };
                semantic.mutate(&mut self.progress, &exam)
            }
            Some(e) => {
                let committed = e.committed();
                let exam = Examination {
                    key: self.key,
                    slot: &committed.slot,
                    refresh_time: committed.refresh_time,
                    now,
                    present: self.successful_load || committed.has_fresh_data(now),
                    in_probation: committed.is_in_refresh_probation(),
                    expiry_reached_or_probation: committed
                        .is_expiry_time_reached_or_in_probation(now),
                };
                semantic.mutate(&mut self.progress, &exam)
            }
        }
    }

    /// Takes processing ownership of the entry. Returns false when the
    /// operation was enqueued as a follow-up (async mode) or the bound
    /// entry is gone.
    fn lock_entry(&mut self) -> bool {
        loop {
            let e = match self.entry.take() {
                Some(e) => e,
                None => match &self.bound {
                    Some(b) => Arc::clone(b),
                    None => self.cache.lookup_or_new_entry(self.key),
                },
            };
            let mut guard = e.lock();
            if guard.is_gone() {
                drop(guard);
                self.cache.metrics.gone_spin();
                if self.bound.is_some() {
                    return false;
                }
                continue;
            }
            if guard.is_processing() {
                if let Some(retry) = self.retry.take() {
                    guard.followups.push(retry);
                    return false;
                }
                e.wait_for_processing(&mut guard);
                if guard.is_gone() {
                    drop(guard);
                    self.cache.metrics.gone_spin();
                    if self.bound.is_some() {
                        return false;
                    }
                    continue;
                }
            }
            e.start_processing(&mut guard, ProcessingState::Read);
            self.heap_data_valid = guard.is_data_valid_or_probation();
            self.heap_hit = !guard.is_virgin();
            drop(guard);
            self.entry = Some(e);
            self.entry_locked = true;
            return true;
        }
    }

    /// When expiry listeners exist and a sharp expiry time already passed,
    /// the expiry event is delivered before the mutation proceeds.
    fn check_expiry_before_mutation(&mut self) {
        if !self.cache.listeners.has_expired_listeners() {
            return;
        }
        let e = self.entry.clone().expect("entry locked");
        let now = self.cache.clock.millis();
        let snapshot = {
            let mut guard = e.lock();
            let nrt = guard.next_refresh_time;
            if nrt < 0 && now >= -nrt {
                guard.next_refresh_time = entry::EXPIRED;
                self.cache.timing.cancel_expiry_timer(&mut guard);
                self.heap_data_valid = false;
                HeapCacheInner::<K, V, S>::snapshot_locked(&e, &guard)
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            if let Some(err) = self.cache.listeners.dispatch_expired(
                &self.cache.name,
                &self.cache.listener_executor,
                &snapshot,
            ) {
                self.exception_to_propagate.get_or_insert(err);
            }
            self.cache.metrics.expired_kept();
        }
    }

    fn begin_expire_command(&mut self, requested: i64) {
        self.expire_command = true;
        let e = self.entry.clone().expect("entry locked");
        {
            let guard = e.lock();
            self.new_slot = Some(guard.slot.clone());
            self.last_refresh_time = guard.refresh_time;
        }
        self.expiry = if requested == expiry_values::REFRESH {
            if self.cache.is_loader_present() && self.cache.timing.is_refresh_ahead() {
                self.want_refresh_after = true;
            }
            expiry_values::NO_CACHE
        } else {
            requested
        };
        self.set_until_on_new_slot();
    }

    /// Loader invocation: probation revival first, then the sync or async
    /// loader, outside the entry monitor.
    fn do_load(&mut self) -> Result<(), CacheError> {
        if !self.cache.is_loader_present() {
            return Err(CacheError::NoLoader {
                name: self.cache.name.clone(),
            });
        }
        self.step_state(ProcessingState::Load);
        let t0 = self.mutation_start_time();
        self.load_started = Some(t0);
        self.last_refresh_time = t0;
        let e = self.entry.clone().expect("entry locked");

        // A refresh placed this entry into probation; revive without a
        // loader call while the probation deadline lies ahead.
        {
            let guard = e.lock();
            if guard.is_in_refresh_probation() && guard.probation_next_refresh_time > t0 {
                self.cache.metrics.refreshed_hit();
                self.new_slot = Some(guard.slot.clone());
                self.last_refresh_time = guard.refresh_time;
                self.expiry = guard.probation_next_refresh_time;
                self.revived = true;
                return Ok(());
            }
        }

        let current = self.cache.snapshot_entry(&e);
        let outcome = if let Some(async_loader) = &self.cache.async_loader {
            self.step_state(ProcessingState::LoadAsync);
            let (tx, rx) = crossbeam_channel::bounded(1);
            let context = LoadContext {
                key: self.key,
                load_start: t0,
                current,
                executor: self.cache.loader_executor.clone(),
            };
            let callback = LoadCallback { tx };
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| {
                async_loader.load(self.key, &context, callback)
            }));
            let outcome = match call {
                Err(payload) => Err(panic_to_error(payload)),
                Ok(()) => match rx.recv() {
                    Ok(result) => result,
                    Err(_) => Err(Box::from("async loader dropped its callback")),
                },
            };
            {
                let mut guard = e.lock();
                assert!(
                    e.check_and_switch_processing_state(
                        &mut guard,
                        ProcessingState::LoadAsync,
                        ProcessingState::LoadComplete,
                    ),
                    "async load completion on wrong entry state"
                );
            }
            outcome
        } else {
            let loader = Arc::clone(self.cache.loader.as_ref().expect("loader present"));
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                loader.load(self.key, t0, current.as_ref())
            }));
            let outcome = match result {
                Err(payload) => Err(panic_to_error(payload)),
                Ok(result) => result,
            };
            self.step_state(ProcessingState::LoadComplete);
            outcome
        };

        match outcome {
            Ok(Loaded {
                value,
                refresh_time,
            }) => {
                if let Some(refresh_time) = refresh_time {
                    self.last_refresh_time = refresh_time;
                }
                self.new_slot = Some(match value {
                    Some(v) => ValueSlot::Value(v),
                    None => ValueSlot::Null,
                });
                if !self.cache.metrics.is_disabled() {
                    let delta = (self.cache.clock.millis() - t0).max(0) as u64;
                    if self.refresh {
                        self.cache.metrics.refresh(delta);
                    } else if self.heap_data_valid {
                        self.cache.metrics.reload(delta);
                    } else {
                        self.cache.metrics.load(delta);
                    }
                }
            }
            Err(error) => {
                self.new_slot = Some(ValueSlot::Exception(LoadExceptionInfo::new(
                    format!("{:?}", self.key),
                    error.into(),
                    t0,
                )));
            }
        }
        Ok(())
    }

    /// Expiry computation for the new slot: the policy for values, the
    /// suppression/caching resilience path for exceptions. A failing policy
    /// during a load is treated as a load failure and re-entered once; a
    /// second failure becomes a resilience failure.
    fn calculate_expiry(&mut self) -> Result<(), CacheError> {
        self.step_state(ProcessingState::Expiry);
        if self.revived {
            return Ok(());
        }
        let e = self.entry.clone().expect("entry locked");
        let load_started = self.load_started.unwrap_or(0);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let exception = match self.new_slot.as_ref().expect("new slot") {
                ValueSlot::Exception(info) => Some(info.clone()),
                _ => None,
            };
            if let Some(info) = exception {
                self.expiry = 0;
                // Suppression candidate: live or kept-expired data that is
                // not itself an exception.
                let cached = {
                    let guard = e.lock();
                    if (guard.is_data_valid() || guard.is_expired_state())
                        && !guard.slot.is_exception()
                    {
                        HeapCacheInner::<K, V, S>::snapshot_locked(&e, &guard)
                    } else {
                        None
                    }
                };
                if let Some(cached) = &cached {
                    match self.cache.timing.suppress_exception_until(self.key, &info, cached) {
                        Ok(t) => self.expiry = t,
                        Err(detail) => return self.policy_failure(detail),
                    }
                }
                if self.expiry > load_started && cached.is_some() {
                    // Keep serving the previous value.
                    let guard = e.lock();
                    self.new_slot = Some(guard.slot.clone());
                    self.last_refresh_time = guard.refresh_time;
                    drop(guard);
                    self.suppressed = Some(info);
                    self.cache.metrics.suppressed_exception();
                } else {
                    if self.load {
                        self.cache.metrics.load_exception();
                    }
                    match self.cache.timing.cache_exception_until(self.key, &info) {
                        Ok(t) => self.expiry = t,
                        Err(detail) => return self.policy_failure(detail),
                    }
                }
                self.set_until_on_new_slot();
                return Ok(());
            }

            // Plain value: consult the expiry policy.
            let old_entry = if self.heap_data_valid {
                self.cache.snapshot_entry(&e)
            } else {
                None
            };
            let value_ref = match self.new_slot.as_ref().expect("new slot") {
                ValueSlot::Value(v) => Some(v),
                _ => None,
            };
            let calculated = self.cache.timing.calculate_next_refresh_time(
                self.key,
                value_ref,
                self.last_refresh_time,
                old_entry.as_ref(),
            );
            match calculated {
                Err(detail) => {
                    if !self.load {
                        return Err(CacheError::ExpiryPolicy {
                            key: format!("{:?}", self.key),
                            source: boxed_detail(detail),
                        });
                    }
                    // One re-entry as a load failure; a second failure is a
                    // resilience failure.
                    if attempts >= 2 {
                        return self.policy_failure(detail);
                    }
                    let error = CacheError::ExpiryPolicy {
                        key: format!("{:?}", self.key),
                        source: boxed_detail(detail),
                    };
                    self.new_slot = Some(ValueSlot::Exception(LoadExceptionInfo::new(
                        format!("{:?}", self.key),
                        Arc::new(error),
                        load_started,
                    )));
                    self.expiry = 0;
                    continue;
                }
                Ok(t) => {
                    self.expiry = t;
                    if matches!(self.new_slot, Some(ValueSlot::Null))
                        && !self.cache.permit_null_values
                        && t != expiry_values::NO_CACHE
                    {
                        let error = CacheError::NullValue {
                            key: format!("{:?}", self.key),
                        };
                        if !self.load {
                            return Err(error);
                        }
                        if attempts >= 2 {
                            return self.policy_failure("null value rejected".into());
                        }
                        self.new_slot = Some(ValueSlot::Exception(LoadExceptionInfo::new(
                            format!("{:?}", self.key),
                            Arc::new(error),
                            load_started,
                        )));
                        self.expiry = 0;
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Double fault: loader (or expiry policy) and resilience policy both
    /// failed. The failure is kept as the value with expiry 0, so it is
    /// surfaced but not cached.
    fn policy_failure(&mut self, detail: String) -> Result<(), CacheError> {
        let error = CacheError::ResiliencePolicy {
            key: format!("{:?}", self.key),
            source: boxed_detail(detail),
        };
        if !self.load {
            return Err(error);
        }
        self.new_slot = Some(ValueSlot::Exception(LoadExceptionInfo::new(
            format!("{:?}", self.key),
            Arc::new(error),
            self.load_started.unwrap_or(0),
        )));
        self.expiry = 0;
        Ok(())
    }

    fn set_until_on_new_slot(&mut self) {
        if let Some(ValueSlot::Exception(info)) = self.new_slot.as_mut() {
            if self.expiry < 0 {
                info.set_until(-self.expiry);
            } else if self.expiry >= entry::DATA_VALID {
                info.set_until(self.expiry);
            }
        }
    }

    fn count_put_metrics(&self) {
        if self.expiry != 0 {
            if self.heap_hit {
                self.cache.metrics.put_hit();
            } else {
                self.cache.metrics.put_new_entry();
            }
        }
    }

    /// Write-through: deletes and value writes go to the writer before the
    /// heap is touched; a writer failure aborts the mutation.
    fn may_call_writer(&mut self) -> Result<(), CacheError> {
        let writer = match &self.cache.writer {
            Some(w) => Arc::clone(w),
            None => return Ok(()),
        };
        if self.remove {
            // A remove of a non-existent entry is not written through.
            if !self.heap_data_valid {
                return Ok(());
            }
            self.step_state(ProcessingState::Write);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| writer.delete(self.key)));
            self.writer_result(result)?;
            self.step_state(ProcessingState::WriteComplete);
            return Ok(());
        }
        if let Some(ValueSlot::Value(v)) = self.new_slot.as_ref() {
            self.step_state(ProcessingState::Write);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| writer.write(self.key, v)));
            self.writer_result(result)?;
            self.step_state(ProcessingState::WriteComplete);
        }
        Ok(())
    }

    fn writer_result(
        &self,
        result: std::thread::Result<Result<(), BoxError>>,
    ) -> Result<(), CacheError> {
        let error = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(error)) => error,
            Err(payload) => panic_to_error(payload),
        };
        Err(CacheError::Writer {
            key: format!("{:?}", self.key),
            source: error.into(),
        })
    }

    /// Expiry 0 means the value must not be cached: remove it, or keep the
    /// expired entry when the cache is configured to.
    fn check_keep_or_remove(&mut self) {
        if self.expiry != 0 || self.remove {
            return;
        }
        if self.cache.keep_data_after_expired {
            self.expired_immediately = true;
        } else {
            self.remove = true;
            self.expired_immediately = true;
        }
    }

    /// Publishes the mutation into the entry under the monitor and
    /// re-weighs it with the eviction collaborator.
    fn update_heap(&mut self) {
        let e = self.entry.clone().expect("entry locked");
        let mut guard = e.lock();
        if self.cache.record_refresh_time {
            guard.refresh_time = self.last_refresh_time;
        }
        if self.remove {
            if self.expired_immediately {
                guard.next_refresh_time = entry::EXPIRED;
                if let Some(slot) = self.new_slot.take() {
                    self.old_slot = Some(std::mem::replace(&mut guard.slot, slot));
                }
            } else if !guard.is_virgin() {
                guard.next_refresh_time = entry::REMOVE_PENDING;
            }
        } else {
            let new_slot = self.new_slot.take().expect("new slot");
            self.old_slot = Some(std::mem::replace(&mut guard.slot, new_slot));
            guard.suppressed_exception = self.suppressed.take();
        }
        drop(guard);
        self.cache.eviction.update_weight(&e);
    }

    /// Listener dispatch with an immutable snapshot. Create vs. update is
    /// decided by whether the entry had valid data before this operation.
    fn call_listeners(&mut self) {
        if self.cache.listeners.is_empty() {
            return;
        }
        self.step_state(ProcessingState::Notify);
        let e = self.entry.clone().expect("entry locked");
        let snapshot = match self.cache.snapshot_entry(&e) {
            Some(snapshot) => snapshot,
            None => return,
        };
        let listeners = &self.cache.listeners;
        let executor = &self.cache.listener_executor;
        let name = &self.cache.name;
        let first_error = if self.expired_immediately {
            if self.heap_data_valid {
                listeners.dispatch_expired(name, executor, &snapshot)
            } else {
                None
            }
        } else if self.remove {
            if self.heap_data_valid {
                listeners.dispatch_removed(name, executor, &snapshot)
            } else {
                None
            }
        } else if self.heap_data_valid {
            let old_snapshot = self.old_snapshot(&e);
            match &old_snapshot {
                Some(old) => listeners.dispatch_updated(name, executor, old, &snapshot),
                None => listeners.dispatch_created(name, executor, &snapshot),
            }
        } else {
            listeners.dispatch_created(name, executor, &snapshot)
        };
        if let Some(err) = first_error {
            self.exception_to_propagate.get_or_insert(err);
        }
    }

    fn old_snapshot(&self, e: &Arc<Entry<K, V>>) -> Option<crate::entry::CacheEntry<K, V>> {
        match self.old_slot.as_ref()? {
            ValueSlot::Virgin => None,
            ValueSlot::Value(v) => Some(crate::entry::CacheEntry::with_value(
                e.key().clone(),
                v.clone(),
                0,
            )),
            ValueSlot::Null => Some(crate::entry::CacheEntry::with_null(e.key().clone(), 0)),
            ValueSlot::Exception(info) => Some(crate::entry::CacheEntry::with_exception(
                e.key().clone(),
                info.clone(),
                0,
            )),
        }
    }

    /// Final step: hand the loaded value to the semantic, publish the new
    /// expiry state atomically with the timer, release the entry and flush
    /// the follow-up queue. Returns true when publishing the expiry time
    /// made the entry expire right away, re-entering the expire flow.
    fn commit_and_release(&mut self, semantic: &mut impl Semantic<K, V, R>) -> bool {
        let e = self.entry.clone().expect("entry locked");
        if self.load || self.stored_loaded_value {
            let committed = e.committed();
            let now = self.cache.clock.millis();
            let exam = Examination {
                key: self.key,
                slot: &committed.slot,
                refresh_time: committed.refresh_time,
                now,
                present: true,
                in_probation: false,
                expiry_reached_or_probation: false,
            };
            semantic.loaded(&mut self.progress, &exam);
        }
        let just_expired = {
            let mut guard = e.lock();
            let mut just_expired = false;
            if self.refresh {
                self.cache
                    .timing
                    .start_refresh_probation_timer(&e, &mut guard, self.expiry);
            } else if self.remove {
                self.cache.remove_entry(&e, &mut guard);
            } else {
                let nrt = self.cache.timing.stop_start_timer(self.expiry, &e, &mut guard);
                guard.next_refresh_time = nrt;
                if !self.expired_immediately && guard.is_expired_state() {
                    just_expired = true;
                }
            }
            if !just_expired {
                let followups = e.processing_done(&mut guard);
                drop(guard);
                self.entry_locked = false;
                self.dispatch_followups(followups);
            }
            just_expired
        };
        if just_expired {
            // The published time was already in the past: the entry expires
            // as part of this operation after all.
            self.step_state(ProcessingState::Expiry);
            self.heap_data_valid = true;
            self.expiry = 0;
            self.expired_immediately = false;
            let guard = e.lock();
            self.new_slot = Some(guard.slot.clone());
        }
        just_expired
    }

    fn no_mutation_requested(&mut self) -> Result<Option<R>, CacheError> {
        self.release_entry(false);
        self.update_read_statistics();
        match self.exception_to_propagate.take() {
            Some(err) => Err(err),
            None => Ok(self.progress.result.take()),
        }
    }

    fn mutation_abort(&mut self, err: CacheError) -> Result<Option<R>, CacheError> {
        self.release_entry(true);
        self.update_read_statistics();
        Err(err)
    }

    /// Returns the entry to `Done`, removing it when still virgin, and
    /// flushes the follow-up queue.
    fn release_entry(&mut self, aborted: bool) {
        if !self.entry_locked {
            return;
        }
        let e = self.entry.clone().expect("entry locked");
        let mut guard = e.lock();
        if guard.is_virgin() {
            if aborted {
                guard.next_refresh_time = entry::ABORTED;
            }
            self.cache.remove_entry(&e, &mut guard);
        }
        let followups = e.processing_done(&mut guard);
        drop(guard);
        self.entry_locked = false;
        self.dispatch_followups(followups);
    }

    fn dispatch_followups(&self, followups: Vec<FollowUp>) {
        if followups.is_empty() {
            return;
        }
        self.cache.loader_executor.execute(move || {
            for job in followups {
                job();
            }
        });
    }

    fn update_statistics_after_mutation(&mut self) {
        if !self.load && !self.stored_loaded_value {
            if self.expired_immediately && !self.remove {
                self.cache.metrics.expired_kept();
            }
            if self.remove && !self.expired_immediately && self.heap_data_valid {
                self.cache.metrics.remove();
            }
        }
        self.update_read_statistics();
    }

    fn update_read_statistics(&self) {
        if self.progress.count_miss {
            self.cache.metrics.miss();
        } else if self.progress.count_hit && !self.progress.do_not_count_access {
            self.cache.metrics.hit();
        }
    }

    fn mutation_start_time(&mut self) -> i64 {
        match self.mutation_start {
            Some(t) => t,
            None => {
                let t = self.cache.clock.millis();
                self.mutation_start = Some(t);
                t
            }
        }
    }

    fn step_state(&self, state: ProcessingState) {
        let e = self.entry.as_ref().expect("entry locked");
        let mut guard = e.lock();
        e.next_processing_step(&mut guard, state);
    }
}

fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> BoxError {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Box::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Box::from(s.as_str())
    } else {
        Box::from("loader panicked")
    }
}

fn boxed_detail(detail: String) -> crate::error::ErrorRef {
    let boxed: BoxError = Box::from(detail);
    boxed.into()
}
