//! Bounded worker pool over an ordered backlog.
//!
//! - Threads are spawned lazily, up to `max_workers`, as items arrive
//! - With `unique_orders`, an item equal to one already queued or running is
//!   not queued again
//! - `clear` drops queued items, in-flight items finish
//! - `stop` is cooperative: workers see the flag through [`StopSignal`]

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

/// Cooperative cancellation flag shared by a pool and its workers.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the owning pool has been stopped.
    pub fn must_stop(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Ask every holder of this signal to wind down. Cannot be lowered again.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

type WorkerFn<T> = dyn Fn(T, &StopSignal) -> anyhow::Result<()> + Send + Sync;

struct Backlog<T> {
    queue: VecDeque<T>,
    /// Queued or running items, tracked only with `unique_orders`.
    outstanding: HashSet<T>,
    threads: usize,
    busy: usize,
}

struct Inner<T> {
    name: String,
    max_workers: usize,
    unique_orders: bool,
    backlog: Mutex<Backlog<T>>,
    available: Condvar,
    stop: StopSignal,
    worker_fn: Box<WorkerFn<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A named set of OS threads running `worker_fn` over queued items.
pub struct WorkerPool<T: Clone + Eq + Hash + Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Eq + Hash + Send + 'static> WorkerPool<T> {
    /// Create a pool. No thread is spawned until the first item arrives.
    pub fn start<F>(name: &str, max_workers: usize, unique_orders: bool, worker_fn: F) -> Self
    where
        F: Fn(T, &StopSignal) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let max_workers = max_workers.max(1);
        debug!(pool = name, max_workers, unique_orders, "Created worker pool");
        Self {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                max_workers,
                unique_orders,
                backlog: Mutex::new(Backlog {
                    queue: VecDeque::new(),
                    outstanding: HashSet::new(),
                    threads: 0,
                    busy: 0,
                }),
                available: Condvar::new(),
                stop: StopSignal::new(),
                worker_fn: Box::new(worker_fn),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue one item at the tail.
    ///
    /// Returns false if the pool is stopped or the item is a duplicate.
    pub fn append(&self, item: T) -> bool {
        self.extend(std::iter::once(item)) == 1
    }

    /// Queue several items in order, returning how many were accepted.
    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) -> usize {
        // Checked under the lock: `stop` raises the flag before draining, so
        // nothing queued here can outlive a concurrent stop.
        let mut backlog = self.inner.backlog.lock();
        if self.must_stop() {
            return 0;
        }
        let mut added = 0;
        for item in items {
            if self.inner.unique_orders {
                if backlog.outstanding.contains(&item) {
                    trace!(pool = %self.inner.name, "Skipping duplicate order");
                    continue;
                }
                backlog.outstanding.insert(item.clone());
            }
            backlog.queue.push_back(item);
            added += 1;
        }

        while backlog.threads < self.inner.max_workers
            && backlog.threads - backlog.busy < backlog.queue.len()
        {
            if !self.spawn_worker(backlog.threads) {
                break;
            }
            backlog.threads += 1;
        }
        drop(backlog);

        for _ in 0..added {
            self.inner.available.notify_one();
        }
        added
    }

    /// Drop every item that has not started yet.
    pub fn clear(&self) {
        let mut backlog = self.inner.backlog.lock();
        let dropped: Vec<T> = backlog.queue.drain(..).collect();
        for item in &dropped {
            backlog.outstanding.remove(item);
        }
        trace!(pool = %self.inner.name, dropped = dropped.len(), "Cleared backlog");
    }

    /// Raise the stop flag, drop the backlog and join the workers.
    ///
    /// A worker that calls this is not joined.
    pub fn stop(&self) {
        self.inner.stop.raise();
        {
            let mut backlog = self.inner.backlog.lock();
            backlog.queue.clear();
            backlog.outstanding.clear();
        }
        self.inner.available.notify_all();

        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        debug!(pool = %self.inner.name, "Worker pool stopped");
    }

    /// Whether `stop` has been called.
    pub fn must_stop(&self) -> bool {
        self.inner.stop.must_stop()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.inner.stop.clone()
    }

    /// Items waiting to start.
    pub fn pending_count(&self) -> usize {
        self.inner.backlog.lock().queue.len()
    }

    /// Items currently running.
    pub fn active_count(&self) -> usize {
        self.inner.backlog.lock().busy
    }

    /// True while any item is queued or running.
    pub fn is_busy(&self) -> bool {
        let backlog = self.inner.backlog.lock();
        !backlog.queue.is_empty() || backlog.busy > 0
    }

    fn spawn_worker(&self, worker_id: usize) -> bool {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.inner.name, worker_id))
            .spawn(move || worker_loop(worker_id, &inner));
        match spawned {
            Ok(handle) => {
                self.inner.handles.lock().push(handle);
                true
            }
            Err(e) => {
                error!(pool = %self.inner.name, error = %e, "Failed to spawn worker thread");
                false
            }
        }
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<T: Clone + Eq + Hash + Send + 'static>(worker_id: usize, inner: &Inner<T>) {
    trace!(pool = %inner.name, worker_id, "Worker started");

    loop {
        let item = {
            let mut backlog = inner.backlog.lock();
            loop {
                if inner.stop.must_stop() {
                    backlog.threads -= 1;
                    trace!(pool = %inner.name, worker_id, "Worker stopped");
                    return;
                }
                if let Some(item) = backlog.queue.pop_front() {
                    backlog.busy += 1;
                    break item;
                }
                inner.available.wait(&mut backlog);
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            (inner.worker_fn)(item.clone(), &inner.stop)
        }));

        {
            let mut backlog = inner.backlog.lock();
            backlog.busy -= 1;
            if inner.unique_orders {
                backlog.outstanding.remove(&item);
            }
        }

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(pool = %inner.name, worker_id, error = ?e, "Worker item failed"),
            Err(_) => error!(pool = %inner.name, worker_id, "Worker item panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_idle<T: Clone + Eq + Hash + Send + 'static>(pool: &WorkerPool<T>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.is_busy() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!pool.is_busy(), "pool did not drain");
    }

    #[test]
    fn test_concurrency_bound() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            WorkerPool::start("bound", 3, false, move |_: u32, _| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        };

        assert_eq!(pool.extend(0..12), 12);
        wait_idle(&pool);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_unique_orders_skip_duplicates() {
        let (started_tx, started_rx) = flume::unbounded();
        let (release_tx, release_rx) = flume::unbounded::<()>();
        let pool = WorkerPool::start("unique", 1, true, move |item: &'static str, _| {
            started_tx.send(item)?;
            release_rx.recv()?;
            Ok(())
        });

        assert!(pool.append("a"));
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
        // running
        assert!(!pool.append("a"));
        assert!(pool.append("b"));
        // queued
        assert!(!pool.append("b"));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        wait_idle(&pool);
        assert!(pool.append("a"));
        release_tx.send(()).unwrap();
        wait_idle(&pool);
    }

    #[test]
    fn test_clear_drops_queued_items() {
        let done = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = flume::unbounded::<()>();
        let pool = {
            let done = Arc::clone(&done);
            WorkerPool::start("clear", 1, true, move |item: u32, _| {
                release_rx.recv()?;
                done.lock().push(item);
                Ok(())
            })
        };

        pool.extend([1, 2, 3]);
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.active_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        pool.clear();
        assert_eq!(pool.pending_count(), 0);
        // cleared items may be queued again
        assert!(pool.append(3));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        wait_idle(&pool);
        assert_eq!(*done.lock(), vec![1, 3]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let never_used: WorkerPool<u32> = WorkerPool::start("idle", 2, false, |_, _| Ok(()));
        never_used.stop();
        never_used.stop();

        let pool = WorkerPool::start("stop", 2, false, |_: u32, stop: &StopSignal| {
            while !stop.must_stop() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        pool.extend([1, 2, 3]);
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        pool.stop();
        pool.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(pool.must_stop());
        assert!(!pool.append(4));
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_extend_racing_stop_leaves_nothing_queued() {
        for _ in 0..20 {
            let pool = Arc::new(WorkerPool::start("race", 2, false, |_: u32, stop: &StopSignal| {
                while !stop.must_stop() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }));
            let feeder = {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut item = 0;
                    while pool.append(item) {
                        item += 1;
                    }
                })
            };
            thread::sleep(Duration::from_millis(2));
            pool.stop();
            feeder.join().unwrap();

            assert_eq!(pool.pending_count(), 0);
            assert!(pool.inner.handles.lock().is_empty());
            assert!(!pool.append(u32::MAX));
        }
    }

    #[test]
    fn test_errors_and_panics_do_not_kill_workers() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = {
            let done = Arc::clone(&done);
            WorkerPool::start("faulty", 1, false, move |item: u32, _| {
                match item {
                    0 => anyhow::bail!("broken item"),
                    1 => panic!("worker panic"),
                    _ => {
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            })
        };

        pool.extend([0, 1, 2, 3]);
        wait_idle(&pool);
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_from_worker_does_not_self_join() {
        let slot: Arc<Mutex<Option<WorkerPool<u32>>>> = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = flume::unbounded();
        let pool = {
            let slot = Arc::clone(&slot);
            WorkerPool::start("self-stop", 1, false, move |_: u32, _| {
                if let Some(pool) = slot.lock().as_ref() {
                    pool.stop();
                }
                done_tx.send(())?;
                Ok(())
            })
        };
        let signal = pool.stop_signal();
        *slot.lock() = Some(pool);

        if let Some(pool) = slot.lock().as_ref() {
            pool.append(1);
        }
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(signal.must_stop());
        slot.lock().take();
    }
}
