//! Audit trail for unit lifecycle and security-relevant events.
//!
//! Every executor and pool writes through an [`AuditSink`]. The default sink
//! forwards to `tracing`; tests use [`MemoryAudit`] to assert on what was
//! recorded, and long-running hosts can persist to a [`JsonFileAudit`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Category of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEvent {
    /// Lifecycle of a unit: started, completed, failed, retried.
    BlockExecute,
    /// Cancellations, timeouts and panics.
    SecurityViolation,
    /// An operation exceeded its time budget.
    Timeout,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::BlockExecute => "BLOCK_EXECUTE",
            AuditEvent::SecurityViolation => "SECURITY_VIOLATION",
            AuditEvent::Timeout => "TIMEOUT",
        }
    }
}

/// Destination for audit records.
///
/// Implementations must not fail loudly: a sink that cannot write logs the
/// problem and drops the record.
pub trait AuditSink: Send + Sync {
    /// Record a raw event.
    fn record(&self, event: AuditEvent, details: &str);

    /// Lifecycle record for a named unit, formatted `[unit] event: details`.
    fn log_block_execute(&self, unit: &str, event: &str, details: &str) {
        self.record(
            AuditEvent::BlockExecute,
            &format!("[{}] {}: {}", unit, event, details),
        );
    }

    fn log_security_violation(&self, reason: &str) {
        self.record(AuditEvent::SecurityViolation, reason);
    }

    fn log_timeout(&self, operation: &str, timeout: Duration) {
        self.record(
            AuditEvent::Timeout,
            &format!("{} exceeded {}ms", operation, timeout.as_millis()),
        );
    }
}

/// Sink that forwards records to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent, details: &str) {
        match event {
            AuditEvent::BlockExecute => {
                tracing::debug!(target: "polyrun::audit", event = event.as_str(), "{}", details)
            }
            AuditEvent::SecurityViolation | AuditEvent::Timeout => {
                tracing::warn!(target: "polyrun::audit", event = event.as_str(), "{}", details)
            }
        }
    }
}

/// The sink used when a caller does not provide one.
pub fn default_sink() -> Arc<dyn AuditSink> {
    Arc::new(TracingAudit)
}

/// In-memory sink, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    records: Mutex<Vec<(AuditEvent, String)>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<(AuditEvent, String)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of records of the given category.
    pub fn count(&self, event: AuditEvent) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(e, _)| *e == event)
            .count()
    }

    /// Whether any record of `event` contains `needle`.
    pub fn contains(&self, event: AuditEvent, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(e, details)| *e == event && details.contains(needle))
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, event: AuditEvent, details: &str) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event, details.to_string()));
    }
}

/// Append-only JSON-lines sink with single-generation rotation.
///
/// Once the file grows past `max_bytes` it is renamed to `<name>.1`
/// (replacing any previous generation) and a fresh file is started.
#[derive(Debug)]
pub struct JsonFileAudit {
    path: PathBuf,
    max_bytes: u64,
    write_lock: Mutex<()>,
}

impl JsonFileAudit {
    /// Default rotation threshold: 10 MiB.
    pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_max_bytes(path, Self::DEFAULT_MAX_BYTES)
    }

    pub fn with_max_bytes(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the rotated generation.
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".1");
        self.path.with_file_name(name)
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size > 0 && size + line.len() as u64 > self.max_bytes {
            fs::rename(&self.path, self.rotated_path())?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }
}

impl AuditSink for JsonFileAudit {
    fn record(&self, event: AuditEvent, details: &str) {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let line = serde_json::json!({
            "timestamp_ms": timestamp_ms,
            "event": event.as_str(),
            "details": details,
        })
        .to_string();

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = self.append(&line) {
            tracing::warn!("Failed to write audit record to {}: {}", self.path.display(), e);
        }
    }
}
