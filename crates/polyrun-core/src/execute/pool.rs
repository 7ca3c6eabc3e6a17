//! Bounded pool of unit executors with admission backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::audit::{AuditSink, default_sink};
use crate::error::{Error, Result};

use super::handle::ResultHandle;
use super::result::CallbackUnit;
use super::unit::UnitExecutor;

/// Interval at which blocked callers re-scan for finished executors.
const RESCAN_INTERVAL: Duration = Duration::from_millis(10);

struct PoolShared {
    active: Mutex<Vec<Arc<UnitExecutor>>>,
    /// Signalled by every executor as it reaches a terminal state.
    changed: Condvar,
    completed: AtomicUsize,
    shutdown: AtomicBool,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<UnitExecutor>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop finished executors, counting each exactly once.
    fn reclaim(&self, active: &mut Vec<Arc<UnitExecutor>>) {
        let before = active.len();
        active.retain(|exec| !exec.is_done());
        let reclaimed = before - active.len();
        if reclaimed > 0 {
            self.completed.fetch_add(reclaimed, Ordering::SeqCst);
        }
    }
}

/// Runs at most `max_concurrent` units at once.
///
/// [`submit`](Self::submit) blocks while the pool is full. Completions wake
/// blocked submitters through a condition variable; a short periodic re-scan
/// covers wakeups that race with the admission check.
pub struct CallbackPool {
    shared: Arc<PoolShared>,
    max_concurrent: usize,
    drain_timeout: Duration,
    audit: Arc<dyn AuditSink>,
}

impl CallbackPool {
    /// Default time [`Drop`] waits for in-flight units.
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(max_concurrent: usize) -> Self {
        Self::with_audit(max_concurrent, default_sink())
    }

    pub fn with_audit(max_concurrent: usize, audit: Arc<dyn AuditSink>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        audit.log_block_execute(
            "pool",
            "created",
            &format!("CallbackPool created (max_concurrent={})", max_concurrent),
        );
        Self {
            shared: Arc::new(PoolShared {
                active: Mutex::new(Vec::new()),
                changed: Condvar::new(),
                completed: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
            max_concurrent,
            drain_timeout: Self::DEFAULT_DRAIN_TIMEOUT,
            audit,
        }
    }

    /// Override how long shutdown waits for in-flight units.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Admit `unit` once a slot is free, start it, and return its handle.
    ///
    /// Returns [`Error::PoolShutdown`] if the pool is (or becomes) shut down
    /// while waiting.
    pub fn submit(
        &self,
        unit: CallbackUnit,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Result<ResultHandle> {
        let name = name.into();
        let mut active = self.shared.lock();

        loop {
            self.shared.reclaim(&mut active);
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(Error::PoolShutdown);
            }
            if active.len() < self.max_concurrent {
                break;
            }
            active = self
                .shared
                .changed
                .wait_timeout(active, RESCAN_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let weak: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let exec = Arc::new(
            UnitExecutor::with_audit(unit, name.clone(), timeout, Arc::clone(&self.audit))
                .on_done(Arc::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.changed.notify_all();
                    }
                })),
        );
        let handle = exec.execute_async();
        active.push(exec);

        self.audit.log_block_execute(
            "pool",
            "submit",
            &format!("Submitted '{}' to pool (active: {})", name, active.len()),
        );

        Ok(handle)
    }

    /// Request cancellation of every tracked executor.
    pub fn cancel_all(&self) {
        let active = self.shared.lock();
        for exec in active.iter() {
            exec.cancel();
        }
        self.audit.log_block_execute(
            "pool",
            "cancel_all",
            &format!("Cancelled all callbacks in pool (count: {})", active.len()),
        );
    }

    /// Wait until no executor is in flight, or `budget` elapses.
    ///
    /// Returns `true` if the pool drained. On timeout a violation is logged and
    /// running units are left alone.
    pub fn wait_all(&self, budget: Duration) -> bool {
        let started = Instant::now();
        let mut active = self.shared.lock();

        loop {
            self.shared.reclaim(&mut active);
            if active.is_empty() {
                return true;
            }

            let elapsed = started.elapsed();
            if elapsed >= budget {
                self.audit.log_security_violation(&format!(
                    "async_pool_wait_timeout: wait_all() timed out after {}ms",
                    elapsed.as_millis()
                ));
                return false;
            }

            let wait = (budget - elapsed).min(RESCAN_INTERVAL);
            active = self
                .shared
                .changed
                .wait_timeout(active, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Executors admitted and not yet reclaimed.
    pub fn active_count(&self) -> usize {
        let mut active = self.shared.lock();
        self.shared.reclaim(&mut active);
        active.len()
    }

    /// Executors reclaimed after finishing. Never decreases.
    pub fn completed_count(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Stop admitting, cancel everything in flight, and wait up to the drain timeout.
    ///
    /// Returns whether the pool drained in time.
    pub fn shutdown(&self) -> bool {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return self.active_count() == 0;
        }
        self.shared.changed.notify_all();
        self.cancel_all();
        self.wait_all(self.drain_timeout)
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        if !self.shutdown() {
            tracing::warn!(
                "Callback pool dropped with {} units still running",
                self.active_count()
            );
        }
    }
}

impl std::fmt::Debug for CallbackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackPool")
            .field("max_concurrent", &self.max_concurrent)
            .field("active", &self.shared.lock().len())
            .field("completed", &self.completed_count())
            .finish()
    }
}
