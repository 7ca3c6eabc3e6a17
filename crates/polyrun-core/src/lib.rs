//! Core engine for the polyrun polyglot execution runtime.
//!
//! This crate provides:
//! - Single-unit execution with timeout and cooperative cancellation
//! - A bounded callback pool and a fixed-size thread pool
//! - Per-language dispatch with blocking, async, parallel, race and retry modes
//! - Subprocess and compiled-language backends
//! - A content-addressed cache of compiled artifacts

pub mod audit;
pub mod backends;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod execute;
pub mod paths;
pub mod value;

pub use audit::{AuditEvent, AuditSink, JsonFileAudit, MemoryAudit, TracingAudit};
pub use backends::{
    CompiledSpec, DispatchMode, ExecContext, ExecutorFactory, LanguageExecutor, SubprocessSpec,
};
pub use cache::{ArtifactCache, CacheEntry, CacheStats};
pub use config::EngineConfig;
pub use dispatch::{Block, Dispatcher, LanguageRegistry};
pub use error::{Error, Result};
pub use execute::{
    CallbackPool, CallbackUnit, CancelToken, ErrorKind, ExecutionResult, ResultHandle, TaskHandle,
    ThreadPool, UnitError, UnitExecutor, UnitResult,
};
pub use paths::EngineDirs;
pub use value::{Value, parse_output};
