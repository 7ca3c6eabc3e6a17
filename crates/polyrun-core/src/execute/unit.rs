//! Single-unit executor with timeout and cooperative cancellation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};

use crate::audit::{AuditSink, default_sink};

use super::context::CancelToken;
use super::handle::ResultHandle;
use super::result::{CallbackUnit, ErrorKind, ExecutionResult, classify};

type DoneHook = Arc<dyn Fn() + Send + Sync>;

/// Runs one [`CallbackUnit`] at most once, on its own thread, under a timeout.
///
/// The executor reports exactly one terminal outcome: success, failure,
/// timeout or cancellation. When the timeout fires the unit's token is
/// cancelled and its thread is detached; the unit keeps running until it
/// notices the token, but its eventual result is discarded.
///
/// Dropping an executor does not cancel a running unit.
pub struct UnitExecutor {
    unit: Mutex<Option<CallbackUnit>>,
    name: String,
    timeout: Duration,
    state: Arc<ExecState>,
    audit: Arc<dyn AuditSink>,
    on_done: Option<DoneHook>,
}

struct ExecState {
    done: AtomicBool,
    token: CancelToken,
    /// Orders `cancel` against the transition to done.
    transition: Mutex<()>,
}

impl ExecState {
    fn finish(&self, on_done: Option<&DoneHook>) {
        {
            let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
            self.done.store(true, Ordering::SeqCst);
        }
        if let Some(hook) = on_done {
            hook();
        }
    }
}

impl UnitExecutor {
    /// Create an executor. A zero `timeout` waits indefinitely.
    pub fn new(unit: CallbackUnit, name: impl Into<String>, timeout: Duration) -> Self {
        Self::with_audit(unit, name, timeout, default_sink())
    }

    pub fn with_audit(
        unit: CallbackUnit,
        name: impl Into<String>,
        timeout: Duration,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let name = name.into();
        audit.log_block_execute(&name, "created", "Async callback wrapper initialized");
        Self {
            unit: Mutex::new(Some(unit)),
            name,
            timeout,
            state: Arc::new(ExecState {
                done: AtomicBool::new(false),
                token: CancelToken::new(),
                transition: Mutex::new(()),
            }),
            audit,
            on_done: None,
        }
    }

    /// Hook invoked once the executor reaches a terminal state.
    pub(crate) fn on_done(mut self, hook: DoneHook) -> Self {
        self.on_done = Some(hook);
        self
    }

    /// Start the unit and return a handle to its eventual result.
    ///
    /// The unit runs at most once: a second call resolves immediately with an
    /// `IllegalStateException` failure.
    pub fn execute_async(&self) -> ResultHandle {
        let taken = self
            .unit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(unit) = taken else {
            return ResultHandle::ready(ExecutionResult::failure(
                ErrorKind::IllegalState,
                format!("Callback '{}' has already been started", self.name),
                Duration::ZERO,
            ));
        };

        let (tx, handle) = ResultHandle::pair();
        let fallback = tx.clone();
        let supervisor = Supervisor {
            unit,
            name: self.name.clone(),
            timeout: self.timeout,
            state: Arc::clone(&self.state),
            audit: Arc::clone(&self.audit),
            on_done: self.on_done.clone(),
        };

        let spawned = thread::Builder::new()
            .name("polyrun-unit".to_string())
            .spawn(move || {
                let result = supervisor.run();
                let _ = tx.send(result);
            });

        if let Err(e) = spawned {
            tracing::error!("Failed to spawn supervisor for '{}': {}", self.name, e);
            self.state.finish(self.on_done.as_ref());
            let _ = fallback.send(ExecutionResult::failure(
                ErrorKind::Unknown,
                format!("Failed to start callback '{}': {}", self.name, e),
                Duration::ZERO,
            ));
        }

        handle
    }

    /// Start the unit and wait for its outcome.
    pub fn execute_blocking(&self) -> ExecutionResult {
        self.audit
            .log_block_execute(&self.name, "execute_blocking", "Starting blocking execution");
        self.execute_async().join()
    }

    /// Request cancellation. Has no effect once the executor is done.
    pub fn cancel(&self) {
        let _guard = self
            .state
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.state.done.load(Ordering::SeqCst) {
            self.state.token.cancel();
            self.audit
                .log_block_execute(&self.name, "cancelled", "Execution cancelled by user");
            self.audit.log_security_violation(&format!(
                "async_callback_cancelled: Async callback '{}' was cancelled",
                self.name
            ));
        }
    }

    /// Whether a terminal outcome has been reached.
    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::SeqCst)
    }

    /// Whether cancellation was requested (explicitly or by the timeout).
    pub fn is_cancelled(&self) -> bool {
        self.state.token.is_cancel_requested()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for UnitExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitExecutor")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Owns everything the supervising thread needs.
struct Supervisor {
    unit: CallbackUnit,
    name: String,
    timeout: Duration,
    state: Arc<ExecState>,
    audit: Arc<dyn AuditSink>,
    on_done: Option<DoneHook>,
}

impl Supervisor {
    fn run(self) -> ExecutionResult {
        let started = Instant::now();

        if self.state.token.is_cancel_requested() {
            self.audit.log_block_execute(
                &self.name,
                "cancelled",
                "Callback cancelled before execution",
            );
            self.state.finish(self.on_done.as_ref());
            return ExecutionResult::failure(
                ErrorKind::Cancelled,
                "Callback cancelled before execution",
                started.elapsed(),
            );
        }

        self.audit
            .log_block_execute(&self.name, "started", "Beginning execution");

        let (tx, rx) = bounded(1);
        let token = self.state.token.clone();
        let unit = self.unit;
        let worker = thread::Builder::new()
            .name("polyrun-worker".to_string())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| unit.call(&token)));
                let _ = tx.send(outcome);
            });

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.state.finish(self.on_done.as_ref());
                return ExecutionResult::failure(
                    ErrorKind::Unknown,
                    format!("Failed to start worker thread: {}", e),
                    started.elapsed(),
                );
            }
        };

        let received = if self.timeout.is_zero() {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(self.timeout)
        };

        let result = match received {
            Ok(outcome) => {
                let _ = worker.join();
                let result = classify(outcome, started.elapsed());
                if result.is_success() {
                    self.audit.log_block_execute(
                        &self.name,
                        "completed",
                        &format!("Execution completed in {}ms", result.elapsed().as_millis()),
                    );
                } else {
                    self.audit.log_block_execute(
                        &self.name,
                        "failed",
                        &format!("{}: {}", result.error_kind(), result.error_message()),
                    );
                    if matches!(result.kind(), Some(ErrorKind::Panic | ErrorKind::Unknown)) {
                        self.audit.log_security_violation(&format!(
                            "async_callback_exception: Callback '{}' panicked: {}",
                            self.name,
                            result.error_message()
                        ));
                    }
                }
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                self.state.token.cancel();
                // Detached; the worker exits whenever the unit observes the token.
                drop(worker);

                let ms = self.timeout.as_millis();
                self.audit.log_block_execute(
                    &self.name,
                    "timeout",
                    &format!("Execution exceeded {}ms", ms),
                );
                self.audit.log_security_violation(&format!(
                    "async_callback_timeout: Callback '{}' exceeded timeout of {}ms",
                    self.name, ms
                ));
                self.audit
                    .log_timeout(&format!("Async callback '{}'", self.name), self.timeout);

                ExecutionResult::failure(
                    ErrorKind::Timeout,
                    format!("Callback timed out after {}ms", ms),
                    started.elapsed(),
                )
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                ExecutionResult::failure(
                    ErrorKind::Unknown,
                    "Worker thread exited without a result",
                    started.elapsed(),
                )
            }
        };

        self.state.finish(self.on_done.as_ref());
        result
    }
}

/// Run `unit` on the calling thread with a deadline token.
///
/// Used for thread-pool tasks, where the caller already owns a worker thread.
/// A run that overshoots `timeout` reports `TimeoutException` regardless of
/// what the unit returned.
pub(crate) fn run_inline(
    unit: &CallbackUnit,
    name: &str,
    timeout: Duration,
    audit: &dyn AuditSink,
) -> ExecutionResult {
    let started = Instant::now();
    let token = CancelToken::with_deadline(timeout);

    audit.log_block_execute(name, "started", "Beginning pooled execution");
    let outcome = catch_unwind(AssertUnwindSafe(|| unit.call(&token)));

    if token.is_expired() {
        let ms = timeout.as_millis();
        audit.log_timeout(&format!("Pooled callback '{}'", name), timeout);
        return ExecutionResult::failure(
            ErrorKind::Timeout,
            format!("Callback timed out after {}ms", ms),
            started.elapsed(),
        );
    }

    let result = classify(outcome, started.elapsed());
    if result.is_success() {
        audit.log_block_execute(name, "completed", "Pooled execution completed");
    } else {
        audit.log_block_execute(
            name,
            "failed",
            &format!("{}: {}", result.error_kind(), result.error_message()),
        );
    }
    result
}
