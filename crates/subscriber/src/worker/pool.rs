//! Bounded worker pool
//!
//! Runs admitted items through a worker function with a hard concurrency
//! ceiling. Items wait in FIFO order until a slot is free; completion
//! order is not guaranteed. The pool length (queued + running) is
//! published on a watch channel so callers can await changes.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, instrument, warn};

/// How long `drain` waits for a pool that has never received work
pub const DRAIN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    /// The pool was hard-stopped and no longer accepts work
    #[error("worker pool is stopped")]
    Stopped,
}

/// Worker function invoked once per admitted item
type WorkerFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct PoolState<T> {
    queue: VecDeque<T>,
    running: HashMap<u64, AbortHandle>,
    next_task: u64,
    concurrency: usize,
    paused: bool,
    started: bool,
    stopped: bool,
}

impl<T> PoolState<T> {
    fn length(&self) -> usize {
        self.queue.len() + self.running.len()
    }
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    worker: WorkerFn<T>,
    length_tx: watch::Sender<usize>,
}

/// Bounded worker pool
///
/// Cheap to clone; clones share the same pool.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(4, |job: Job| async move {
///     job.run().await;
/// });
///
/// pool.push(jobs)?;
/// pool.drain().await;
/// ```
pub struct WorkerPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool running at most `concurrency` workers at once
    pub fn new<F, Fut>(concurrency: usize, worker: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let worker: WorkerFn<T> = Arc::new(move |item| Box::pin(worker(item)));
        let (length_tx, _) = watch::channel(0);

        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    running: HashMap::new(),
                    next_task: 0,
                    concurrency: concurrency.max(1),
                    paused: false,
                    started: false,
                    stopped: false,
                }),
                worker,
                length_tx,
            }),
        }
    }

    /// Enqueue items; never blocks
    ///
    /// Returns the number of items enqueued. Rejected once the pool is stopped.
    pub fn push(&self, items: impl IntoIterator<Item = T>) -> Result<usize, WorkerPoolError> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(WorkerPoolError::Stopped);
        }

        let before = state.queue.len();
        state.queue.extend(items);
        let pushed = state.queue.len() - before;
        if pushed > 0 {
            state.started = true;
        }

        self.fill(&mut state);
        Ok(pushed)
    }

    /// Queued plus running items
    pub fn len(&self) -> usize {
        self.inner.state.lock().length()
    }

    /// Whether nothing is queued or running
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently executing
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    /// Items waiting for a free slot
    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Current concurrency limit
    pub fn concurrency(&self) -> usize {
        self.inner.state.lock().concurrency
    }

    /// Change the concurrency limit; raising it starts queued work at once
    pub fn set_concurrency(&self, concurrency: usize) {
        let mut state = self.inner.state.lock();
        state.concurrency = concurrency.max(1);
        debug!(concurrency = state.concurrency, "Pool concurrency updated");
        self.fill(&mut state);
    }

    /// Stop moving queued items into free slots; running items continue
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    /// Allow queued items to start again
    pub fn resume(&self) {
        let mut state = self.inner.state.lock();
        state.paused = false;
        self.fill(&mut state);
    }

    /// Whether the pool is paused
    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Whether any work has ever been pushed
    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Whether the pool was hard-stopped
    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// Receiver observing the pool length
    pub fn subscribe_length(&self) -> watch::Receiver<usize> {
        self.inner.length_tx.subscribe()
    }

    /// Wait until nothing is queued or running
    ///
    /// A pool that has never received work gets [`DRAIN_GRACE_PERIOD`] to
    /// start; if it is still unstarted afterwards it counts as drained.
    /// Queued items of a paused pool keep `drain` waiting until resumed.
    #[instrument(skip(self))]
    pub async fn drain(&self) {
        if !self.is_started() {
            tokio::time::sleep(DRAIN_GRACE_PERIOD).await;
            if !self.is_started() {
                debug!("Pool never started, treating as drained");
                return;
            }
        }

        let mut length = self.subscribe_length();
        // The sender lives as long as `self`, so this only returns Ok
        let _ = length.wait_for(|len| *len == 0).await;
        debug!("Pool drained");
    }

    /// Hard stop: discard queued items and abort running ones
    ///
    /// Returns the number of items discarded. Later pushes are rejected.
    pub fn stop(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.stopped = true;

        let queued = state.queue.len();
        state.queue.clear();

        let running = state.running.len();
        for (_, handle) in state.running.drain() {
            handle.abort();
        }

        self.publish_length(&state);
        if queued + running > 0 {
            warn!(queued, running, "Worker pool stopped with unfinished work");
        }
        queued + running
    }

    /// Start queued items while slots are free
    fn fill(&self, state: &mut PoolState<T>) {
        while !state.paused && !state.stopped && state.running.len() < state.concurrency {
            let Some(item) = state.queue.pop_front() else {
                break;
            };

            let task_id = state.next_task;
            state.next_task += 1;

            let work = (self.inner.worker)(item);
            let pool = self.clone();
            let handle = tokio::spawn(async move {
                if AssertUnwindSafe(work).catch_unwind().await.is_err() {
                    warn!(task_id, "Pool worker panicked");
                }
                pool.complete(task_id);
            });
            state.running.insert(task_id, handle.abort_handle());
        }

        self.publish_length(state);
    }

    fn complete(&self, task_id: u64) {
        let mut state = self.inner.state.lock();
        // Absent after a hard stop
        if state.running.remove(&task_id).is_some() {
            self.fill(&mut state);
        }
    }

    fn publish_length(&self, state: &PoolState<T>) {
        let length = state.length();
        self.inner.length_tx.send_if_modified(|current| {
            if *current == length {
                false
            } else {
                *current = length;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Pool whose workers record peak concurrency and sleep for `work`
    fn sleeping_pool(
        concurrency: usize,
        work: Duration,
    ) -> (WorkerPool<u32>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (a, p, d) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&done));

        let pool = WorkerPool::new(concurrency, move |_item: u32| {
            let (a, p, d) = (Arc::clone(&a), Arc::clone(&p), Arc::clone(&d));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                a.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
            }
        });
        (pool, peak, done)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let (pool, peak, done) = sleeping_pool(3, Duration::from_millis(50));

        assert_eq!(pool.push(0..10).unwrap(), 10);
        assert_eq!(pool.len(), 10);
        assert_eq!(pool.running_count(), 3);

        pool.drain().await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_queued_items() {
        let (pool, _peak, done) = sleeping_pool(1, Duration::from_millis(10));

        pool.pause();
        pool.push([1]).unwrap();

        assert!(pool.is_paused());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.running_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);

        pool.resume();
        assert!(!pool.is_paused());
        assert_eq!(pool.running_count(), 1);

        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_does_not_cancel_running_items() {
        let (pool, _peak, done) = sleeping_pool(2, Duration::from_millis(20));

        pool.push([1, 2, 3]).unwrap();
        pool.pause();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(pool.queued_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_unstarted_pool_returns_after_grace() {
        let (pool, _peak, _done) = sleeping_pool(1, Duration::from_millis(10));

        let start = tokio::time::Instant::now();
        pool.drain().await;

        assert!(start.elapsed() >= DRAIN_GRACE_PERIOD);
        assert!(!pool.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_push_during_grace() {
        let (pool, _peak, done) = sleeping_pool(1, Duration::from_millis(500));

        let pusher = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push([7]).unwrap();
        });

        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_discards_work_and_rejects_pushes() {
        let release = Arc::new(Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let (r, f) = (Arc::clone(&release), Arc::clone(&finished));

        let pool = WorkerPool::new(2, move |_item: u32| {
            let (r, f) = (Arc::clone(&r), Arc::clone(&f));
            async move {
                r.notified().await;
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        pool.push(0..5).unwrap();
        assert_eq!(pool.len(), 5);

        assert_eq!(pool.stop(), 5);
        assert!(pool.is_stopped());
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.push([9]), Err(WorkerPoolError::Stopped));

        release.notify_waiters();
        tokio::task::yield_now().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        // Drain of a stopped pool returns immediately
        tokio::time::timeout(Duration::from_secs(1), pool.drain())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_concurrency_starts_queued_work() {
        let (pool, peak, _done) = sleeping_pool(1, Duration::from_millis(100));

        pool.push(0..4).unwrap();
        assert_eq!(pool.running_count(), 1);

        pool.set_concurrency(4);
        assert_eq!(pool.concurrency(), 4);
        assert_eq!(pool.running_count(), 4);

        pool.drain().await;
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_panicking_worker_frees_its_slot() {
        let pool = WorkerPool::new(1, |item: u32| async move {
            if item == 0 {
                panic!("worker bug");
            }
        });

        pool.push([0, 1]).unwrap();
        tokio::time::timeout(Duration::from_secs(1), pool.drain())
            .await
            .unwrap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_length_is_published() {
        let release = Arc::new(Notify::new());
        let r = Arc::clone(&release);
        let pool = WorkerPool::new(1, move |_item: u32| {
            let r = Arc::clone(&r);
            async move { r.notified().await }
        });
        let mut length = pool.subscribe_length();

        pool.push([1, 2]).unwrap();
        assert_eq!(*length.borrow_and_update(), 2);

        release.notify_one();
        length.changed().await.unwrap();
        assert_eq!(*length.borrow_and_update(), 1);
    }
}
