//! Siphon is a loading, expiring, thread-safe in-process cache.
//!
//! It holds the hottest subset of a larger keyspace in memory and shields
//! a slow backing source from repeated requests. All operations on a
//! single key are serialized through a per-entry state machine, so loads,
//! write-through, listener dispatch and expiry never interleave for the
//! same key, while unrelated keys proceed in parallel on independent hash
//! segments.
//!
//! # Features
//!
//! - **Read-through loading** with a synchronous [`CacheLoader`] or a
//!   callback-style [`AsyncCacheLoader`]; concurrent requests for the same
//!   key trigger a single load.
//! - **Expiry**: eternal, fixed time-to-live, or a per-entry
//!   [`ExpiryPolicy`]; *sharp* expiry makes values unavailable at exactly
//!   the expiry time.
//! - **Refresh-ahead**: expired entries are reloaded in the background and
//!   kept in probation; an access inside the probation window revives them
//!   without a loader call.
//! - **Exception caching and suppression**: loader failures can be cached
//!   for a retry interval or suppressed behind the previous value, driven
//!   by a [`ResiliencePolicy`].
//! - **Write-through** via [`CacheWriter`], entry processors via
//!   [`Cache::invoke`], lifecycle listeners, and statistics.
//!
//! # Example
//!
//! ```
//! use siphon::{Cache, CacheBuilder};
//! use std::time::Duration;
//!
//! let cache: Cache<u64, String> = CacheBuilder::new()
//!     .name("greetings")
//!     .expire_after_write(Duration::from_secs(60))
//!     .loader_fn(|key: &u64| Ok(format!("hello {key}")))
//!     .build();
//!
//! assert_eq!(cache.get(&1).unwrap(), Some("hello 1".to_string()));
//! // The second read is served from memory.
//! assert_eq!(cache.get(&1).unwrap(), Some("hello 1".to_string()));
//! assert_eq!(cache.statistics().unwrap().load_count(), 1);
//! cache.close();
//! ```

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

mod builder;
mod cache;
mod common;
mod core;
mod entry;
mod error;
mod listener;
mod loader;
mod ops;
mod policy;
mod stats;

pub use builder::CacheBuilder;
pub use cache::Cache;
pub use common::{Clock, Executor, MockClock};
pub use entry::{CacheEntry, MutableCacheEntry};
pub use error::{BoxError, CacheError, ErrorRef, LoadExceptionInfo};
pub use listener::{CreatedListener, ExpiredListener, RemovedListener, UpdatedListener};
pub use loader::{
    AsyncCacheLoader, CacheLoader, CacheWriter, CompletionListener, LoadCallback, LoadContext,
    Loaded,
};
pub use policy::{expiry_values, ExpiryPolicy, FixedResilience, ResiliencePolicy};
pub use stats::CacheStatistics;

pub use crate::core::entry::Entry;
pub use crate::core::eviction::{Eviction, EvictionMetrics};
