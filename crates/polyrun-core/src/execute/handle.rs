//! One-shot handles for results produced on other threads.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};

use crate::error::{Error, Result};

use super::result::{ErrorKind, ExecutionResult};

/// Receiving side of a single result.
///
/// The producing thread holds the matching `Sender`; dropping it without
/// sending (a lost task) makes [`wait`](Self::wait) return
/// [`Error::TaskLost`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Create a connected sender/handle pair.
    pub(crate) fn pair() -> (Sender<T>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx })
    }

    /// Block until the result is available.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| Error::TaskLost)
    }

    /// Wait up to `timeout`. `Ok(None)` means the result is not ready yet;
    /// the handle stays usable.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::TaskLost),
        }
    }

    /// Wait until `deadline`.
    pub fn wait_deadline(&self, deadline: Instant) -> Result<Option<T>> {
        self.wait_timeout(deadline.saturating_duration_since(Instant::now()))
    }

    /// Take the result if it is already there.
    pub fn try_take(&self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::TaskLost),
        }
    }

    /// Whether a result is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }

    pub(crate) fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

/// Handle to a pending [`ExecutionResult`].
pub type ResultHandle = TaskHandle<ExecutionResult>;

impl TaskHandle<ExecutionResult> {
    /// Block until the result is available, folding a lost task into a failed result.
    pub fn join(self) -> ExecutionResult {
        let started = Instant::now();
        self.wait().unwrap_or_else(|e| {
            ExecutionResult::failure(ErrorKind::Unknown, e.to_string(), started.elapsed())
        })
    }

    /// Handle that is already resolved with `result`.
    pub(crate) fn ready(result: ExecutionResult) -> Self {
        let (tx, handle) = Self::pair();
        let _ = tx.send(result);
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_wait_receives_value() {
        let (tx, handle) = TaskHandle::pair();
        std::thread::spawn(move || tx.send(5_i32).unwrap());
        assert_eq!(handle.wait().unwrap(), 5);
    }

    #[test]
    fn test_dropped_sender_is_task_lost() {
        let (tx, handle) = TaskHandle::<i32>::pair();
        drop(tx);
        assert!(matches!(handle.wait(), Err(Error::TaskLost)));
    }

    #[test]
    fn test_wait_timeout_not_ready() {
        let (_tx, handle) = TaskHandle::<i32>::pair();
        assert!(handle.wait_timeout(Duration::from_millis(5)).unwrap().is_none());
        assert!(!handle.is_ready());
    }

    #[test]
    fn test_join_lost_task() {
        let (tx, handle) = ResultHandle::pair();
        drop(tx);
        let result = handle.join();
        assert!(!result.is_success());
        assert_eq!(result.error_kind(), "UnknownException");
    }

    #[test]
    fn test_ready_handle() {
        let handle = ResultHandle::ready(ExecutionResult::success(Value::Bool(true), Duration::ZERO));
        assert!(handle.is_ready());
        assert_eq!(handle.join().value(), Some(&Value::Bool(true)));
    }
}
