use std::sync::Arc;

/// Boxed error type accepted from loaders, writers, policies and entry
/// processors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared error reference kept inside cached exception records.
pub type ErrorRef = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The error type surfaced by all fallible cache operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CacheError {
    /// The loader failed for the affected key. When exception caching is in
    /// effect, reads keep returning this error until the `until` timestamp
    /// is reached and a new load is attempted.
    #[error("loader failed for key {key}: {source}")]
    Loader {
        key: String,
        /// End of the exception caching period in milliseconds, `0` when
        /// the failure was not cached.
        until: i64,
        #[source]
        source: ErrorRef,
    },

    /// The expiry policy failed while processing a user mutation. The entry
    /// is left unchanged.
    #[error("expiry policy failed for key {key}: {source}")]
    ExpiryPolicy {
        key: String,
        #[source]
        source: ErrorRef,
    },

    /// Both the loader (or expiry policy) and the resilience policy failed.
    /// The failing value is surfaced and not cached.
    #[error("resilience policy failed for key {key}: {source}")]
    ResiliencePolicy {
        key: String,
        #[source]
        source: ErrorRef,
    },

    /// The cache writer rejected a write-through or delete-through. The
    /// mutation was aborted and the entry is unchanged.
    #[error("writer failed for key {key}: {source}")]
    Writer {
        key: String,
        #[source]
        source: ErrorRef,
    },

    /// A synchronous entry listener failed. All listeners were still
    /// invoked; this carries the first captured failure.
    #[error("entry listener failed for key {key}: {detail}")]
    Listener { key: String, detail: String },

    /// An entry processor or `compute_if_absent` closure failed.
    #[error("entry processor failed for key {key}: {source}")]
    Processor {
        key: String,
        #[source]
        source: ErrorRef,
    },

    /// A load was requested but the cache has no loader configured.
    #[error("load requested but cache `{name}` has no loader")]
    NoLoader { name: String },

    /// Control flow of read-through entry processing: the processor asked
    /// for a value that must be loaded first, and is re-run against the
    /// loaded entry. Propagate it out of the processor; user code never
    /// observes it as a final result.
    #[error("operation restarts after loading the entry")]
    ProcessingRestart,

    /// The cache was closed; all operations fail fast.
    #[error("cache `{name}` is closed")]
    Closed { name: String },

    /// The loader produced no value and the cache rejects null values.
    #[error("loader produced a null value for key {key}")]
    NullValue { key: String },
}

impl CacheError {
    /// True when this error wraps a loader failure.
    pub fn is_loader_error(&self) -> bool {
        matches!(self, CacheError::Loader { .. })
    }
}

/// Record of a loader failure attached to an entry, either as the cached
/// value of the entry or as a suppressed exception next to a live value.
#[derive(Clone)]
pub struct LoadExceptionInfo {
    key: String,
    error: ErrorRef,
    load_time: i64,
    until: i64,
}

impl LoadExceptionInfo {
    pub(crate) fn new(key: String, error: ErrorRef, load_time: i64) -> Self {
        Self {
            key,
            error,
            load_time,
            until: 0,
        }
    }

    /// The original loader error.
    pub fn exception(&self) -> &ErrorRef {
        &self.error
    }

    /// Time the failing load was started, in milliseconds.
    pub fn load_time(&self) -> i64 {
        self.load_time
    }

    /// End of the caching or suppression period for this failure, `0` when
    /// none was established.
    pub fn until(&self) -> i64 {
        self.until
    }

    pub(crate) fn set_until(&mut self, until: i64) {
        self.until = until;
    }

    pub(crate) fn to_error(&self) -> CacheError {
        CacheError::Loader {
            key: self.key.clone(),
            until: self.until,
            source: Arc::clone(&self.error),
        }
    }
}

impl std::fmt::Debug for LoadExceptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadExceptionInfo")
            .field("key", &self.key)
            .field("error", &self.error)
            .field("load_time", &self.load_time)
            .field("until", &self.until)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(thiserror::Error, Debug)]
    #[error("backend unavailable")]
    struct BackendDown;

    #[test]
    fn loader_error_carries_cause_and_until() {
        let mut info = LoadExceptionInfo::new("42".into(), Arc::new(BackendDown), 1_000);
        info.set_until(4_000);
        let err = info.to_error();
        match &err {
            CacheError::Loader { key, until, .. } => {
                assert_eq!(key, "42");
                assert_eq!(*until, 4_000);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_loader_error());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("backend unavailable"));
    }
}
