//! Cooperative cancellation for running units.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Handle for cooperative cancellation of a unit.
///
/// `CancelToken` is shared between the supervisor that enforces a timeout and
/// the code doing the work. It can be cloned freely; cancelling any clone is
/// visible to all of them. A token may also carry a deadline, after which it
/// reports itself cancelled without anyone calling [`cancel`](Self::cancel).
///
/// Units are expected to poll [`is_cancelled`](Self::is_cancelled) (or call
/// [`check`](Self::check)) between steps. Nothing forcibly stops a thread.
///
/// # Example
///
/// ```
/// use polyrun_core::execute::CancelToken;
///
/// let token = CancelToken::new();
/// let observer = token.clone();
///
/// assert!(!observer.is_cancelled());
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenState>,
}

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Create a token with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that expires `timeout` from now. A zero timeout means no deadline.
    pub fn with_deadline(timeout: Duration) -> Self {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        Self {
            inner: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                deadline,
            }),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called, ignoring the deadline.
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the unit should stop: cancellation was requested or the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.is_cancel_requested() || self.is_expired()
    }

    /// Whether the deadline (if any) has passed.
    pub fn is_expired(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// `Err(Error::Cancelled)` once the unit should stop.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancel_requested())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_new() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.deadline().is_none());
    }

    #[test]
    fn test_cancel_token_cancel() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.is_cancel_requested());
    }

    #[test]
    fn test_cancel_token_clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();

        assert!(!token.is_cancelled());
        assert!(!clone.is_cancelled());

        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_token_across_threads() {
        let token = CancelToken::new();
        let clone = token.clone();

        let handle = std::thread::spawn(move || {
            clone.cancel();
        });

        handle.join().unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_deadline_expires() {
        let token = CancelToken::with_deadline(Duration::from_millis(10));
        assert!(!token.is_expired());
        std::thread::sleep(Duration::from_millis(30));
        assert!(token.is_expired());
        assert!(token.is_cancelled());
        assert!(!token.is_cancel_requested());
        assert_eq!(token.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_zero_deadline_never_expires() {
        let token = CancelToken::with_deadline(Duration::ZERO);
        assert!(token.deadline().is_none());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_check_reports_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
