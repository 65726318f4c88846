//! Worker pools with job coalescing.
//!
//! Two primitives are provided:
//! - [`WorkerPool`]: a fixed set of worker tasks draining a shared intake
//!   queue. Used directly by the DNS processor, which keeps its own
//!   in-flight table.
//! - [`CachedWorkerPool`]: a `WorkerPool` combined with a keyed result cache
//!   so each key is worked on at most once. Used by the host and MX
//!   processors.
//!
//! Workers may block on the network and on other pools' job completions; the
//! pool dependency graph is acyclic (MX -> DNS, MX -> host), which is what
//! makes cross-pool waits safe.

mod cache;

pub use cache::{CacheEntry, CachePolicy, CachedWorkerPool};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use log::error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error_handling::PoolError;

/// A boxed unit of work executed by a pool worker.
pub type BoxedWork = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The work function a pool executes for each queued item.
pub type WorkFn<T> = Arc<dyn Fn(T) -> BoxedWork + Send + Sync>;

/// A fixed-size pool of worker tasks consuming a shared unbounded intake
/// queue.
///
/// The queue is unbounded so that enqueueing never blocks: a worker of one
/// pool may enqueue jobs on another pool (the MX workers create host jobs)
/// and must not deadlock doing so.
pub struct WorkerPool<T> {
    tx: StdMutex<Option<mpsc::UnboundedSender<T>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `workers` tasks executing `work` for each queued item.
    pub fn new(workers: usize, work: WorkFn<T>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|_| {
                let queue = Arc::clone(&queue);
                let work = Arc::clone(&work);
                tokio::spawn(worker_loop(queue, work))
            })
            .collect();

        Self {
            tx: StdMutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Enqueues an item. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] once [`close`](Self::close) has been
    /// called.
    pub fn add(&self, item: T) -> Result<(), PoolError> {
        let tx = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx.send(item).map_err(|_| PoolError::Closed),
            None => Err(PoolError::Closed),
        }
    }

    /// Stops accepting new items and waits until the queue is drained and
    /// all workers have exited. Idempotent.
    pub async fn close(&self) {
        // Dropping the sender closes the channel; workers exit once the
        // remaining items are consumed.
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                error!("Worker task failed: {err}");
            }
        }
    }
}

async fn worker_loop<T: Send + 'static>(
    queue: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    work: WorkFn<T>,
) {
    loop {
        // The queue lock is only held while waiting for the next item; the
        // work itself runs after it is released.
        let item = { queue.lock().await.recv().await };
        let Some(item) = item else {
            break;
        };

        // Run the work on its own task so a panic is contained to the job
        // instead of killing the worker.
        if let Err(err) = tokio::spawn(work(item)).await {
            error!("Pool job failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_work(counter: Arc<AtomicUsize>) -> WorkFn<u32> {
        Arc::new(move |_item| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_close_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(4, counting_work(Arc::clone(&counter)));

        for i in 0..20 {
            pool.add(i).expect("pool accepts items before close");
        }
        pool.close().await;

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_add_after_close_fails() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(1, counting_work(Arc::clone(&counter)));

        pool.close().await;
        assert_eq!(pool.add(1), Err(PoolError::Closed));

        // Closing again is a no-op.
        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_for_work = Arc::clone(&counter);
        let work: WorkFn<u32> = Arc::new(move |item| {
            let counter = Arc::clone(&counter_for_work);
            Box::pin(async move {
                if item == 0 {
                    panic!("boom");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let pool = WorkerPool::new(1, work);
        pool.add(0).unwrap();
        pool.add(1).unwrap();
        pool.close().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
