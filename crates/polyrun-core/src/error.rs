//! Error types for polyrun-core.

use thiserror::Error;

/// Result type for polyrun-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in polyrun-core.
///
/// Data-dependent failures inside a callback unit never surface as `Error`
/// to dispatch callers; they are folded into an
/// [`ExecutionResult`](crate::execute::ExecutionResult). The variants that do
/// reach callers directly are configuration mistakes (unknown language,
/// missing template) and lifecycle misuse (submitting to a stopped pool).
#[derive(Debug, Error)]
pub enum Error {
    /// No backend is registered for the language tag.
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    /// Generic subprocess languages need an explicit command template.
    #[error("language '{0}' requires a command template (use a subprocess spec)")]
    MissingTemplate(String),

    /// A backend failed while running code.
    #[error("{language} backend error: {message}")]
    Backend { language: String, message: String },

    /// A backend's interpreter or compiler could not be found or started.
    #[error("{language} backend unavailable: {reason}")]
    Unavailable { language: String, reason: String },

    /// Compiling a source fragment failed.
    #[error("compilation failed for {language}: {message}")]
    Compilation { language: String, message: String },

    /// The callback pool no longer admits work.
    #[error("callback pool is shutting down")]
    PoolShutdown,

    /// The thread pool no longer accepts tasks.
    #[error("thread pool is stopped")]
    ThreadPoolStopped,

    /// A task was dropped before it produced a result.
    #[error("task dropped before producing a result")]
    TaskLost,

    /// Execution observed a cancellation request.
    #[error("execution cancelled")]
    Cancelled,

    /// Invalid operation for the current state or arguments.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Type name reported as `error_kind` when this error escapes a callback unit.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::UnknownLanguage(_) => "UnknownLanguageError",
            Error::MissingTemplate(_) => "MissingTemplateError",
            Error::Backend { .. } => "BackendError",
            Error::Unavailable { .. } => "BackendUnavailableError",
            Error::Compilation { .. } => "CompilationError",
            Error::PoolShutdown => "PoolShutdownError",
            Error::ThreadPoolStopped => "ThreadPoolStoppedError",
            Error::TaskLost => "TaskLostError",
            Error::Cancelled => "CancelledException",
            Error::InvalidOperation(_) => "InvalidOperationError",
            Error::Serialization(_) => "SerializationError",
            Error::Io(_) => "IoError",
        }
    }

    pub(crate) fn backend(language: &str, message: impl Into<String>) -> Self {
        Error::Backend {
            language: language.to_string(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(Error::Cancelled.kind_name(), "CancelledException");
        assert_eq!(Error::backend("shell", "boom").kind_name(), "BackendError");
        let io = Error::from(std::io::Error::other("disk"));
        assert_eq!(io.kind_name(), "IoError");
    }

    #[test]
    fn test_display_includes_language() {
        let err = Error::Compilation {
            language: "rust".to_string(),
            message: "expected `;`".to_string(),
        };
        assert_eq!(err.to_string(), "compilation failed for rust: expected `;`");
    }
}
