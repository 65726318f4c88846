//! Keyed worker pool with result caching.
//!
//! [`CachedWorkerPool`] guarantees that work for a given key runs at most
//! once: concurrent submissions of the same key receive the same
//! [`CacheEntry`] handle, and late submissions after completion are served
//! from the cache. Completed entries are evicted least-recently-referenced
//! first once the configured capacity is reached; pending entries are pinned
//! and never evicted.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, OnceLock, PoisonError};
use std::time::Instant;

use log::error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{WorkFn, WorkerPool};
use crate::error_handling::PoolError;

/// Cache behaviour of a [`CachedWorkerPool`].
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    capacity: Option<usize>,
}

impl CachePolicy {
    /// Evict the least-recently-referenced completed entry once `capacity`
    /// entries are cached.
    pub fn lru(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
        }
    }

    /// Never evict.
    pub fn unbounded() -> Self {
        Self { capacity: None }
    }

    /// Maps a configured capacity to a policy; 0 means unbounded.
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            Self::unbounded()
        } else {
            Self::lru(capacity)
        }
    }
}

/// A keyed job handle handed out by [`CachedWorkerPool::new_job`].
///
/// The entry doubles as the cache slot: the work function deposits its
/// result with [`set_value`](Self::set_value), and any number of tasks may
/// [`wait`](Self::wait) for completion.
pub struct CacheEntry<K, V> {
    key: K,
    value: OnceLock<V>,
    done: CancellationToken,
    created_at: Instant,
    touched: AtomicU64,
}

impl<K, V> CacheEntry<K, V> {
    fn new(key: K, tick: u64) -> Self {
        Self {
            key,
            value: OnceLock::new(),
            done: CancellationToken::new(),
            created_at: Instant::now(),
            touched: AtomicU64::new(tick),
        }
    }

    /// The job key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether the work for this entry has finished.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Waits until the entry is done. Returns immediately once it is; any
    /// number of tasks may wait concurrently.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// Deposits the result value. The first write wins.
    pub fn set_value(&self, value: V) {
        let _ = self.value.set(value);
    }

    /// The result value, if the work has deposited one.
    ///
    /// A `None` after [`is_done`](Self::is_done) means the work faulted
    /// without producing a value.
    pub fn value(&self) -> Option<V>
    where
        V: Clone,
    {
        self.value.get().cloned()
    }

    /// When this entry was first created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

struct CacheShared<K, V> {
    entries: StdMutex<HashMap<K, Arc<CacheEntry<K, V>>>>,
    capacity: Option<usize>,
    /// Woken whenever an entry completes, so capacity waiters re-check.
    slot_freed: Notify,
    clock: AtomicU64,
}

impl<K, V> CacheShared<K, V>
where
    K: Eq + Hash + Clone,
{
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn touch(&self, entry: &CacheEntry<K, V>) {
        entry.touched.store(self.tick(), Ordering::Relaxed);
    }

    /// Makes room for one more entry. Must be called with the map lock held
    /// (the map is passed in). Returns false when every cached entry is
    /// pending and therefore pinned.
    fn make_room(&self, entries: &mut HashMap<K, Arc<CacheEntry<K, V>>>) -> bool {
        let Some(capacity) = self.capacity else {
            return true;
        };
        if entries.len() < capacity {
            return true;
        }

        // Linear scan for the least-recently-referenced completed entry.
        // Eviction only happens on insertion at capacity, so this stays off
        // the hot path.
        let victim = entries
            .values()
            .filter(|entry| entry.is_done())
            .min_by_key(|entry| entry.touched.load(Ordering::Relaxed))
            .map(|entry| entry.key.clone());

        match victim {
            Some(key) => {
                entries.remove(&key);
                true
            }
            None => false,
        }
    }

    fn complete(&self, entry: &CacheEntry<K, V>) {
        // The cancellation token is the completion broadcast: level
        // triggered, observable by any number of waiters, sticky once fired.
        entry.done.cancel();
        self.slot_freed.notify_waiters();
    }
}

enum Submission<E> {
    Hit(E),
    Inserted(E),
    Full,
}

/// A [`WorkerPool`] whose jobs are deduplicated by key and whose results are
/// cached.
pub struct CachedWorkerPool<K, V> {
    shared: Arc<CacheShared<K, V>>,
    pool: WorkerPool<Arc<CacheEntry<K, V>>>,
}

impl<K, V> CachedWorkerPool<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a pool of `workers` tasks running `work` once per key.
    ///
    /// The work function receives the [`CacheEntry`] and is expected to
    /// deposit its result via [`CacheEntry::set_value`]. The entry
    /// transitions to done when the work returns, whether or not it
    /// deposited a value and whether or not it panicked.
    pub fn new(workers: usize, policy: CachePolicy, work: WorkFn<Arc<CacheEntry<K, V>>>) -> Self {
        let shared = Arc::new(CacheShared {
            entries: StdMutex::new(HashMap::new()),
            capacity: policy.capacity,
            slot_freed: Notify::new(),
            clock: AtomicU64::new(0),
        });

        let completion = Arc::clone(&shared);
        let wrapped: WorkFn<Arc<CacheEntry<K, V>>> = Arc::new(move |entry| {
            let work = Arc::clone(&work);
            let shared = Arc::clone(&completion);
            Box::pin(async move {
                // The user work runs on its own task: a panic must still
                // transition the entry to done, or waiters would hang.
                if let Err(err) = tokio::spawn(work(Arc::clone(&entry))).await {
                    error!("Job for key {} failed: {err}", entry.key());
                }
                shared.complete(&entry);
            })
        });

        Self {
            shared,
            pool: WorkerPool::new(workers, wrapped),
        }
    }

    /// Returns the entry for `key`, creating and enqueueing a job when none
    /// exists yet.
    ///
    /// Lookup and insertion are atomic with respect to other callers, so no
    /// two entries for the same key ever coexist. The enqueue happens
    /// outside the cache lock: workers of one pool may call `new_job` on
    /// another pool without risking deadlock.
    ///
    /// When the cache is at capacity and every entry is pending, this waits
    /// until a slot frees up.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] when the pool no longer accepts new
    /// keys. Already-cached keys keep resolving after close.
    pub async fn new_job(&self, key: K) -> Result<Arc<CacheEntry<K, V>>, PoolError> {
        loop {
            // Register for the wakeup before checking, so a completion
            // between the check and the await is not lost.
            let mut slot_freed = pin!(self.shared.slot_freed.notified());
            slot_freed.as_mut().enable();

            let submission = {
                let mut entries = self
                    .shared
                    .entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);

                if let Some(existing) = entries.get(&key) {
                    self.shared.touch(existing);
                    Submission::Hit(Arc::clone(existing))
                } else if self.shared.make_room(&mut entries) {
                    let entry = Arc::new(CacheEntry::new(key.clone(), self.shared.tick()));
                    entries.insert(key.clone(), Arc::clone(&entry));
                    Submission::Inserted(entry)
                } else {
                    Submission::Full
                }
            };

            match submission {
                Submission::Hit(entry) => return Ok(entry),
                Submission::Inserted(entry) => {
                    if let Err(err) = self.pool.add(Arc::clone(&entry)) {
                        // Pool closed between insert and enqueue: undo the
                        // insertion so the dead entry cannot be waited on.
                        self.shared
                            .entries
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&key);
                        return Err(err);
                    }
                    return Ok(entry);
                }
                Submission::Full => slot_freed.await,
            }
        }
    }

    /// Number of cached entries (pending and done).
    pub fn len(&self) -> usize {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new keys and waits until all enqueued work drains.
    /// Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type TestPool = CachedWorkerPool<String, u32>;

    fn sleepy_pool(
        workers: usize,
        policy: CachePolicy,
        invocations: Arc<AtomicUsize>,
    ) -> TestPool {
        CachedWorkerPool::new(
            workers,
            policy,
            Arc::new(move |entry: Arc<CacheEntry<String, u32>>| {
                let invocations = Arc::clone(&invocations);
                Box::pin(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    entry.set_value(42);
                })
            }),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_new_job_runs_work_once() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(sleepy_pool(4, CachePolicy::unbounded(), Arc::clone(&invocations)));

        let a = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.new_job("x".to_string()).await.unwrap() })
        };
        let b = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.new_job("x".to_string()).await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b), "both callers must share one handle");

        a.wait().await;
        b.wait().await;
        assert_eq!(a.value(), Some(42));
        assert_eq!(b.value(), Some(42));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_done_entry_served_from_cache() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let pool = sleepy_pool(1, CachePolicy::unbounded(), Arc::clone(&invocations));

        let first = pool.new_job("x".to_string()).await.unwrap();
        first.wait().await;

        let second = pool.new_job("x".to_string()).await.unwrap();
        assert!(second.is_done());
        assert_eq!(second.value(), Some(42));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_wait_after_done_returns_immediately() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let pool = sleepy_pool(1, CachePolicy::unbounded(), invocations);

        let entry = pool.new_job("x".to_string()).await.unwrap();
        entry.wait().await;

        // A second wait must not block.
        tokio::time::timeout(Duration::from_millis(10), entry.wait())
            .await
            .expect("wait after done must be immediate");
    }

    #[tokio::test]
    async fn test_lru_eviction_of_done_entries() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let pool = sleepy_pool(2, CachePolicy::lru(2), Arc::clone(&invocations));

        pool.new_job("a".to_string()).await.unwrap().wait().await;
        pool.new_job("b".to_string()).await.unwrap().wait().await;
        assert_eq!(pool.len(), 2);

        // Touch "a" so "b" becomes the eviction victim.
        pool.new_job("a".to_string()).await.unwrap();
        pool.new_job("c".to_string()).await.unwrap().wait().await;
        assert_eq!(pool.len(), 2);

        // "a" is still cached, "b" was evicted and re-runs.
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        pool.new_job("a".to_string()).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        pool.new_job("b".to_string()).await.unwrap().wait().await;
        assert_eq!(invocations.load(Ordering::SeqCst), 4);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_pending_entries_are_pinned() {
        // Work that finishes only when released.
        let release = Arc::new(Notify::new());
        let release_for_work = Arc::clone(&release);
        let pool: Arc<TestPool> = Arc::new(CachedWorkerPool::new(
            2,
            CachePolicy::lru(1),
            Arc::new(move |entry: Arc<CacheEntry<String, u32>>| {
                let release = Arc::clone(&release_for_work);
                Box::pin(async move {
                    release.notified().await;
                    entry.set_value(1);
                })
            }),
        ));

        let first = pool.new_job("a".to_string()).await.unwrap();

        // The cache is full with a pinned pending entry, so the second
        // insertion must block.
        let blocked = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.new_job("b".to_string()).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "insertion must block while pinned");

        // notify_one stores a permit, so the release cannot be lost even if
        // the job has not reached its await yet.
        release.notify_one();
        first.wait().await;
        release.notify_one();

        let second = blocked.await.unwrap();
        second.wait().await;
        assert_eq!(second.value(), Some(1));

        pool.close().await;
    }

    #[tokio::test]
    async fn test_new_key_after_close_fails() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let pool = sleepy_pool(1, CachePolicy::unbounded(), Arc::clone(&invocations));

        let entry = pool.new_job("a".to_string()).await.unwrap();
        pool.close().await;
        entry.wait().await;

        // Cached keys keep resolving, new keys fail.
        assert!(pool.new_job("a".to_string()).await.is_ok());
        assert_eq!(
            pool.new_job("b".to_string()).await.err(),
            Some(PoolError::Closed)
        );
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_work_still_completes_entry() {
        let pool: TestPool = CachedWorkerPool::new(
            1,
            CachePolicy::unbounded(),
            Arc::new(|entry: Arc<CacheEntry<String, u32>>| {
                Box::pin(async move {
                    if entry.key() == "bad" {
                        panic!("probe exploded");
                    }
                    entry.set_value(7);
                })
            }),
        );

        let bad = pool.new_job("bad".to_string()).await.unwrap();
        bad.wait().await;
        assert!(bad.is_done());
        assert_eq!(bad.value(), None);

        // The worker survives and keeps serving jobs.
        let good = pool.new_job("good".to_string()).await.unwrap();
        good.wait().await;
        assert_eq!(good.value(), Some(7));

        pool.close().await;
    }
}
