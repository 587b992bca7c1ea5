use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use scheduled_thread_pool::ScheduledThreadPool;

static REGISTRY: Lazy<ThreadPoolRegistry> = Lazy::new(ThreadPoolRegistry::default);

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub(crate) enum PoolName {
    /// The single global scheduler shared by all caches for expiry and
    /// refresh timer events.
    Timer,
    Loader,
    Prefetch,
    Listener,
}

impl PoolName {
    fn thread_name_template(&self) -> &'static str {
        match self {
            PoolName::Timer => "siphon-timer-{}",
            PoolName::Loader => "siphon-loader-{}",
            PoolName::Prefetch => "siphon-prefetch-{}",
            PoolName::Listener => "siphon-listener-{}",
        }
    }

    fn num_threads(&self) -> usize {
        match self {
            // Timer tasks only hand work off to other pools, one thread
            // keeps firing order simple.
            PoolName::Timer => 1,
            // Some platforms may return 0. In that case, use 1.
            _ => num_cpus::get().max(1),
        }
    }
}

pub(crate) struct ThreadPool {
    pub(crate) name: PoolName,
    pub(crate) pool: ScheduledThreadPool,
}

pub(crate) struct ThreadPoolRegistry {
    pools: RwLock<HashMap<PoolName, Arc<ThreadPool>>>,
}

impl Default for ThreadPoolRegistry {
    fn default() -> Self {
        Self {
            pools: RwLock::new(HashMap::default()),
        }
    }
}

impl ThreadPoolRegistry {
    pub(crate) fn acquire_pool(name: PoolName) -> Arc<ThreadPool> {
        loop {
            {
                // Acquire a read lock and get the pool.
                let pools = REGISTRY.pools.read();
                if let Some(pool) = pools.get(&name) {
                    return Arc::clone(pool);
                }
            }
            {
                // Acquire the write lock, double check the pool still does
                // not exist, and insert a new pool.
                let mut pools = REGISTRY.pools.write();
                pools.entry(name).or_insert_with(|| {
                    let pool = ScheduledThreadPool::with_name(
                        name.thread_name_template(),
                        name.num_threads(),
                    );
                    Arc::new(ThreadPool { name, pool })
                });
            }
        }
    }

    pub(crate) fn release_pool(pool: &Arc<ThreadPool>) {
        if Arc::strong_count(pool) <= 2 {
            // No other client exists; only this Arc and the registry are
            // the owners. Remove and drop the one in the registry.
            let name = pool.name;
            let mut pools = REGISTRY.pools.write();
            if let Some(pool) = pools.get(&name) {
                if Arc::strong_count(pool) <= 2 {
                    pools.remove(&name);
                }
            }
        }
    }
}

/// Where asynchronous work of a cache runs: loader calls, prefetches,
/// asynchronous listener dispatch and deferred follow-up operations.
///
/// The default executors are lazily created pools shared between all caches
/// in the process. A custom executor can be installed per concern through
/// the builder.
#[derive(Clone)]
pub struct Executor {
    inner: ExecutorInner,
}

#[derive(Clone)]
enum ExecutorInner {
    Pool(Arc<ThreadPool>),
    Custom(Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>),
}

impl Executor {
    pub(crate) fn shared(name: PoolName) -> Self {
        Self {
            inner: ExecutorInner::Pool(ThreadPoolRegistry::acquire_pool(name)),
        }
    }

    /// Wraps a custom spawn function, e.g. a handle into an existing
    /// application thread pool.
    pub fn custom(spawn: impl Fn(Box<dyn FnOnce() + Send>) + Send + Sync + 'static) -> Self {
        Self {
            inner: ExecutorInner::Custom(Arc::new(spawn)),
        }
    }

    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.inner {
            ExecutorInner::Pool(p) => {
                p.pool.execute(job);
            }
            ExecutorInner::Custom(spawn) => spawn(Box::new(job)),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let ExecutorInner::Pool(p) = &self.inner {
            ThreadPoolRegistry::release_pool(p);
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            ExecutorInner::Pool(p) => write!(f, "Executor::Pool({:?})", p.name),
            ExecutorInner::Custom(_) => write!(f, "Executor::Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Barrier,
    };

    #[test]
    fn shared_pool_is_reused() {
        let a = ThreadPoolRegistry::acquire_pool(PoolName::Loader);
        let b = ThreadPoolRegistry::acquire_pool(PoolName::Loader);
        assert!(Arc::ptr_eq(&a, &b));
        ThreadPoolRegistry::release_pool(&a);
        ThreadPoolRegistry::release_pool(&b);
    }

    #[test]
    fn custom_executor_runs_jobs() {
        let count = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let executor = Executor::custom(|job| {
            std::thread::spawn(job);
        });
        {
            let count = Arc::clone(&count);
            let barrier = Arc::clone(&barrier);
            executor.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
                barrier.wait();
            });
        }
        barrier.wait();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
