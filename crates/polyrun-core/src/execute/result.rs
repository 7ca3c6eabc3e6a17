//! Outcomes of unit execution.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::value::Value;

use super::context::CancelToken;

/// Classification of a failed execution.
///
/// The string form (see [`as_str`](Self::as_str)) is what hosts see as
/// `error_kind`; the built-in names are stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Cancelled before or during execution.
    Cancelled,
    /// The unit exceeded its timeout.
    Timeout,
    /// Every retry attempt failed.
    RetryExhausted,
    /// No race participant succeeded in time.
    RaceTimeout,
    /// A race was started with no participants.
    EmptyRace,
    /// The operation is not valid in the executor's current state.
    IllegalState,
    /// The unit panicked with a message.
    Panic,
    /// The unit panicked with a non-string payload.
    Unknown,
    /// Failure type reported by the unit itself.
    Foreign(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::Cancelled => "CancelledException",
            ErrorKind::Timeout => "TimeoutException",
            ErrorKind::RetryExhausted => "RetryExhaustedException",
            ErrorKind::RaceTimeout => "RaceTimeoutException",
            ErrorKind::EmptyRace => "EmptyRaceException",
            ErrorKind::IllegalState => "IllegalStateException",
            ErrorKind::Panic => "Panic",
            ErrorKind::Unknown => "UnknownException",
            ErrorKind::Foreign(name) => name,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UnitError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Failure with a caller-defined kind name.
    pub fn foreign(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Foreign(kind.into()), message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Callback cancelled during execution")
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for UnitError {}

impl From<Error> for UnitError {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::Cancelled => ErrorKind::Cancelled,
            ref other => ErrorKind::Foreign(other.kind_name().to_string()),
        };
        Self::new(kind, e.to_string())
    }
}

/// What a unit returns.
pub type UnitResult = std::result::Result<Value, UnitError>;

/// Outcome record of one execution.
///
/// Exactly one of `value` / `error_message` is meaningful, selected by
/// [`is_success`](Self::is_success).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    success: bool,
    value: Option<Value>,
    error_message: String,
    error_kind: Option<ErrorKind>,
    elapsed: Duration,
}

impl ExecutionResult {
    pub(crate) fn success(value: Value, elapsed: Duration) -> Self {
        Self {
            success: true,
            value: Some(value),
            error_message: String::new(),
            error_kind: None,
            elapsed,
        }
    }

    pub(crate) fn failure(kind: ErrorKind, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            value: None,
            error_message: message.into(),
            error_kind: Some(kind),
            elapsed,
        }
    }

    pub(crate) fn from_unit_error(err: UnitError, elapsed: Duration) -> Self {
        Self::failure(err.kind, err.message, elapsed)
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// The produced value; `None` for failures.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<Value> {
        self.value
    }

    /// Empty on success.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Failure type name; empty on success.
    pub fn error_kind(&self) -> &str {
        self.error_kind.as_ref().map(ErrorKind::as_str).unwrap_or("")
    }

    pub fn kind(&self) -> Option<&ErrorKind> {
        self.error_kind.as_ref()
    }

    /// Wall time from start of execution to completion or timeout.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// JSON rendering used by the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        if self.success {
            serde_json::json!({
                "success": true,
                "value": self.value.as_ref().map(Value::to_json),
                "elapsed_ms": self.elapsed.as_millis() as u64,
            })
        } else {
            serde_json::json!({
                "success": false,
                "error_message": self.error_message,
                "error_kind": self.error_kind(),
                "elapsed_ms": self.elapsed.as_millis() as u64,
            })
        }
    }
}

type UnitFn = dyn Fn(&CancelToken) -> UnitResult + Send + Sync;

/// A unit of deferred work.
///
/// Wraps a closure that receives the cancellation token of its execution.
/// Cloning is cheap, which lets retry re-run the same unit.
#[derive(Clone)]
pub struct CallbackUnit {
    f: Arc<UnitFn>,
}

impl CallbackUnit {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CancelToken) -> UnitResult + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Unit that always produces `value`.
    pub fn constant(value: Value) -> Self {
        Self::new(move |_| Ok(value.clone()))
    }

    pub fn call(&self, token: &CancelToken) -> UnitResult {
        (self.f)(token)
    }
}

impl fmt::Debug for CallbackUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackUnit")
    }
}

/// Turn the caught outcome of a unit into an [`ExecutionResult`].
pub(crate) fn classify(
    outcome: std::thread::Result<UnitResult>,
    elapsed: Duration,
) -> ExecutionResult {
    match outcome {
        Ok(Ok(value)) => ExecutionResult::success(value, elapsed),
        Ok(Err(err)) => ExecutionResult::from_unit_error(err, elapsed),
        Err(payload) => match panic_message(payload.as_ref()) {
            Some(msg) => ExecutionResult::failure(ErrorKind::Panic, msg, elapsed),
            None => ExecutionResult::failure(ErrorKind::Unknown, "Unknown exception", elapsed),
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}
