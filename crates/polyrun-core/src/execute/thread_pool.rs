//! Fixed-size worker thread pool with a FIFO task queue.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

use super::handle::TaskHandle;
use super::result::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    stop: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// A fixed set of worker threads consuming tasks in submission order.
///
/// After [`shutdown`](Self::shutdown) no new tasks are accepted, but tasks
/// already queued are still run before the workers exit.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Start a pool with `num_threads` workers (at least one).
    pub fn new(num_threads: usize) -> Result<Self> {
        let size = num_threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("polyrun-pool-{}", index))
                .spawn(move || worker_loop(index, &worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    stop_and_join(&shared, workers);
                    return Err(Error::Io(e));
                }
            }
        }

        tracing::debug!("Started thread pool with {} workers", size);

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Queue `task` and return a handle to its result.
    ///
    /// Returns [`Error::ThreadPoolStopped`] once shutdown has begun. If the
    /// task panics, the handle reports [`Error::TaskLost`].
    pub fn enqueue<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, handle) = TaskHandle::pair();
        let job: Job = Box::new(move || {
            let _ = tx.send(task());
        });

        {
            let mut queue = self.lock_queue();
            if queue.stop {
                return Err(Error::ThreadPoolStopped);
            }
            queue.jobs.push_back(job);
        }
        self.shared.available.notify_one();

        Ok(handle)
    }

    pub fn num_threads(&self) -> usize {
        self.size
    }

    /// Tasks waiting for a worker (not counting running ones).
    pub fn queued_tasks(&self) -> usize {
        self.lock_queue().jobs.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_queue().stop
    }

    /// Stop accepting tasks, drain the queue and join the workers.
    ///
    /// Idempotent. When called from one of the pool's own workers, that worker
    /// is not joined.
    pub fn shutdown(&self) {
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if workers.is_empty() {
            return;
        }
        tracing::debug!("Shutting down thread pool ({} queued)", self.queued_tasks());
        stop_and_join(&self.shared, workers);
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.size)
            .field("queued_tasks", &self.queued_tasks())
            .finish()
    }
}

fn stop_and_join(shared: &Shared, workers: Vec<JoinHandle<()>>) {
    shared
        .queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .stop = true;
    shared.available.notify_all();

    let current = thread::current().id();
    for worker in workers {
        if worker.thread().id() == current {
            continue;
        }
        if worker.join().is_err() {
            tracing::error!("Thread pool worker exited abnormally");
        }
    }
}

fn worker_loop(index: usize, shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.stop {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            let msg = panic_message(payload.as_ref()).unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Thread pool worker {} caught panic: {}", index, msg);
        }
    }
}
