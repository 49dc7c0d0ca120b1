//! Worker thread pool
//!
//! A fixed set of OS threads consuming a FIFO queue of boxed jobs
//! under a mutex + condition variable. Jobs are dispatched in queue
//! order; concurrent workers may interleave their execution.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use strand_core::error::{SchedError, SchedResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    stopped: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size FIFO job pool.
pub struct JobPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a packaged job's result.
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the job produces its value.
    ///
    /// Returns `TaskPanicked` if the job panicked before sending.
    pub fn wait(self) -> SchedResult<T> {
        self.rx.recv().map_err(|_| SchedError::TaskPanicked)
    }
}

impl JobPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> JobPool {
        let threads = threads.max(1);
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{}", i))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }

        JobPool {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Package `f` and push it onto the queue.
    ///
    /// Fails with `PoolStopped` after `stop`.
    pub fn enqueue<F, T>(&self, f: F) -> SchedResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let value = f();
            // The submitter may have dropped the handle
            let _ = tx.send(value);
        });

        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(SchedError::PoolStopped);
            }
            state.queue.push_back(job);
        }
        self.inner.available.notify_one();
        Ok(TaskHandle { rx })
    }

    /// Set the stop flag and wake all workers. Idempotent.
    ///
    /// Workers finish the jobs already queued, then exit.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        drop(state);
        self.inner.available.notify_all();
    }

    /// Wait for every worker to exit.
    pub fn join(&self) {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Number of jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut state = inner.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.stopped {
                    return;
                }
                inner.available.wait(&mut state);
            }
        };
        // A panicking job must not take the worker down; packaged
        // handles observe the panic as a dropped sender.
        let _ = catch_unwind(AssertUnwindSafe(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_enqueue_returns_value() {
        let pool = JobPool::new(2);
        let handle = pool.enqueue(|| 21 * 2).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_fifo_dispatch_single_worker() {
        let pool = JobPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let order = order.clone();
            handles.push(pool.enqueue(move || order.lock().push(i)).unwrap());
        }
        for h in handles {
            h.wait().unwrap();
        }
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_enqueue_after_stop_fails() {
        let pool = JobPool::new(1);
        pool.stop();
        assert!(matches!(pool.enqueue(|| ()), Err(SchedError::PoolStopped)));
    }

    #[test]
    fn test_panicking_job_reports_and_pool_survives() {
        let pool = JobPool::new(1);
        let bad = pool.enqueue(|| panic!("job failed")).unwrap();
        assert_eq!(bad.wait().unwrap_err(), SchedError::TaskPanicked);
        // Worker is still alive
        let ok = pool.enqueue(|| 7).unwrap();
        assert_eq!(ok.wait().unwrap(), 7);
    }

    #[test]
    fn test_stop_drains_queued_jobs() {
        let pool = JobPool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = ran.clone();
            pool.enqueue(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.stop();
        pool.join();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }
}
