pub(crate) mod thread_pool;
pub(crate) mod time;

pub use thread_pool::Executor;
pub use time::{Clock, MockClock};

/// Spreads the upper bits of a hash into the lower ones, defeating key
/// types whose `Hash` implementation only populates the low bits.
#[inline]
pub(crate) fn spread_hash(hash: u64) -> u64 {
    hash ^ (hash >> 16)
}

/// Number of hardware threads, never zero.
pub(crate) fn available_parallelism() -> usize {
    num_cpus::get().max(1)
}
