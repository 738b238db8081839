use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{ExecutorError, Result};

/// A unit of work: here, one connection's whole lifetime.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of worker threads draining a FIFO job queue.
///
/// - Exactly `workers` threads are spawned up front and live until
///   [`shutdown`](Executor::shutdown)
/// - Idle workers take jobs in submission order
/// - A job that panics is logged and the worker goes back to waiting
pub struct Executor {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Internal state shared between the executor and its worker threads
struct Inner {
    /// Shared state protected by a mutex
    shared: Mutex<Shared>,
    /// Condition variable for worker thread synchronization
    condvar: Condvar,
    workers: usize,
}

/// Shared state for the thread pool
struct Shared {
    /// Queue of pending jobs
    queue: VecDeque<Job>,
    /// Set once teardown begins
    stopped: bool,
}

impl Executor {
    /// Creates a pool and spawns its `workers` threads.
    ///
    /// # Errors
    /// - `InvalidWorkerCount` if `workers` is zero
    /// - `ThreadSpawn` if a worker thread cannot be started; workers already
    ///   spawned are stopped and joined before returning
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ExecutorError::InvalidWorkerCount);
        }

        let executor = Executor {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: VecDeque::new(),
                    stopped: false,
                }),
                condvar: Condvar::new(),
                workers,
            }),
            handles: Mutex::new(Vec::with_capacity(workers)),
        };

        for id in 0..workers {
            if let Err(e) = executor.spawn_worker(id) {
                executor.shutdown();
                return Err(e);
            }
        }

        Ok(executor)
    }

    /// Spawns a new worker thread that will process jobs from the queue.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    fn spawn_worker(&self, id: usize) -> Result<()> {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ferrule-worker-{}", id))
            .spawn(move || {
                if let Err(e) = inner.run() {
                    log::error!("Worker thread error: {}", e);
                }
            })
            .map_err(ExecutorError::ThreadSpawn)?;

        self.handles
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .push(handle);
        Ok(())
    }

    /// Number of worker threads in the pool.
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Appends a job to the queue and wakes one idle worker.
    ///
    /// # Errors
    /// Returns `ShutDown` once teardown has begun. Submitting after
    /// shutdown is a bug in the caller, so it is also logged.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut shared = self
                .inner
                .shared
                .lock()
                .map_err(|_| ExecutorError::LockPoisoned)?;

            if shared.stopped {
                log::error!("job submitted after executor shutdown");
                return Err(ExecutorError::ShutDown);
            }

            shared.queue.push_back(Box::new(job));
        }

        self.inner.condvar.notify_one();
        Ok(())
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner
            .shared
            .lock()
            .map(|shared| shared.queue.len())
            .unwrap_or(0)
    }

    /// Stops the pool: running jobs finish, queued jobs are dropped without
    /// running, and every worker is joined before this returns.
    ///
    /// Safe to call more than once; only the first call does any work.
    pub fn shutdown(&self) {
        let dropped = match self.inner.shared.lock() {
            Ok(mut shared) => {
                if shared.stopped {
                    return;
                }
                shared.stopped = true;
                std::mem::take(&mut shared.queue)
            }
            Err(poisoned) => {
                let mut shared = poisoned.into_inner();
                shared.stopped = true;
                std::mem::take(&mut shared.queue)
            }
        };

        if !dropped.is_empty() {
            log::debug!("dropping {} queued jobs on shutdown", dropped.len());
        }
        drop(dropped);

        self.inner.condvar.notify_all();

        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for handle in handles {
            if handle.join().is_err() {
                log::error!("worker thread panicked outside of a job");
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    /// Main worker thread loop.
    ///
    /// The worker will:
    /// 1. Wait on the condition variable until a job arrives or the pool stops
    /// 2. Run the job outside the lock, catching any panic
    /// 3. Exit as soon as the stop flag is seen, even with jobs still queued
    ///
    /// # Errors
    /// Returns an error if mutex operations fail
    fn run(&self) -> Result<()> {
        loop {
            let job = {
                let mut shared = self
                    .shared
                    .lock()
                    .map_err(|_| ExecutorError::LockPoisoned)?;

                loop {
                    if shared.stopped {
                        return Ok(());
                    }
                    if let Some(job) = shared.queue.pop_front() {
                        break job;
                    }
                    shared = self
                        .condvar
                        .wait(shared)
                        .map_err(|_| ExecutorError::LockPoisoned)?;
                }
            };

            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                log::error!("job panicked: {}", panic_message(&*panic));
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
