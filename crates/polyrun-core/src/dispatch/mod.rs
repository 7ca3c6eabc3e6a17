//! Per-language routing and composition.
//!
//! The [`Dispatcher`] resolves a language tag to a backend factory and runs
//! the resulting unit in one of five modes: blocking, async, parallel,
//! race or retry.
//!
//! ```text
//! execute_async(lang, code)
//!     │
//!     └── LanguageRegistry::resolve(lang) ── factory
//!             │
//!             ├── DispatchMode::Pooled    → ThreadPool::enqueue (deadline token)
//!             └── DispatchMode::Dedicated → CallbackPool::submit (bounded)
//! ```
//!
//! Configuration mistakes (unknown tag, missing template) are returned as
//! `Err`; everything that goes wrong while a unit runs is an
//! [`ExecutionResult`] failure.

mod registry;

pub use registry::{GENERIC_TAG, LanguageRegistry};

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::audit::{AuditSink, default_sink};
use crate::backends::{DispatchMode, ExecutorFactory, SubprocessFactory, SubprocessSpec, make_unit};
use crate::cache::ArtifactCache;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::execute::{
    CallbackPool, CallbackUnit, ExecutionResult, ResultHandle, ThreadPool, UnitExecutor,
    execute_race, execute_with_retry, join_in_order, run_inline,
};
use crate::value::Value;

/// A source fragment to run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Block {
    pub language: String,
    pub code: String,
    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<Value>,
}

impl Block {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

fn deserialize_args<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(Value::from_json).collect())
}

/// Routes code to language backends.
pub struct Dispatcher {
    registry: LanguageRegistry,
    pool: Arc<ThreadPool>,
    callbacks: CallbackPool,
    cache: Option<Arc<ArtifactCache>>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
    scratch_dir: PathBuf,
    sequence: AtomicU64,
}

impl Dispatcher {
    /// Build a dispatcher with every preset backend, its own thread pool and
    /// (if enabled) an artifact cache below `config.home`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let dirs = config.dirs()?;
        let cache = config
            .cache_enabled
            .then(|| Arc::new(ArtifactCache::open(&dirs.cache_dir)));
        let registry = LanguageRegistry::with_defaults(&dirs, cache.clone());
        let pool = Arc::new(ThreadPool::new(config.worker_threads)?);

        tracing::info!(
            "Dispatcher ready: {} workers, {} languages, cache {}",
            pool.num_threads(),
            registry.languages().len(),
            if cache.is_some() { "on" } else { "off" }
        );

        Ok(Self::with_parts(config, registry, pool, cache, default_sink()))
    }

    /// Assemble a dispatcher from existing parts.
    pub fn with_parts(
        config: EngineConfig,
        registry: LanguageRegistry,
        pool: Arc<ThreadPool>,
        cache: Option<Arc<ArtifactCache>>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let scratch_dir = config.home.join("scratch");
        let callbacks = CallbackPool::with_audit(config.max_concurrent, Arc::clone(&audit))
            .with_drain_timeout(config.drain_timeout);
        Self {
            registry,
            pool,
            callbacks,
            cache,
            audit,
            config,
            scratch_dir,
            sequence: AtomicU64::new(0),
        }
    }

    /// Replace the audit sink.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.callbacks = CallbackPool::with_audit(self.config.max_concurrent, Arc::clone(&audit))
            .with_drain_timeout(self.config.drain_timeout);
        self.audit = audit;
        self
    }

    pub fn register(&mut self, factory: Arc<dyn ExecutorFactory>) {
        self.registry.register(factory);
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    pub fn cache(&self) -> Option<&Arc<ArtifactCache>> {
        self.cache.as_ref()
    }

    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Admission pool for backends that run on their own threads.
    pub fn callback_pool(&self) -> &CallbackPool {
        &self.callbacks
    }

    /// The unit `language` would run for `code`, for custom composition.
    pub fn unit_for(&self, language: &str, code: &str, args: Vec<Value>) -> Result<CallbackUnit> {
        let factory = self.registry.resolve(language)?;
        Ok(make_unit(factory, code.to_string(), args))
    }

    /// Start `code` and return a handle to its result.
    pub fn execute_async(
        &self,
        language: &str,
        code: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<ResultHandle> {
        let factory = self.registry.resolve(language)?;
        self.launch(factory, code, args, timeout)
    }

    /// Run `code` and wait for its outcome, bounded by `timeout`.
    pub fn execute_blocking(
        &self,
        language: &str,
        code: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let factory = self.registry.resolve(language)?;
        let name = self.unit_name(factory.language());
        let unit = make_unit(factory, code.to_string(), args);
        Ok(UnitExecutor::with_audit(unit, name, timeout, Arc::clone(&self.audit)).execute_blocking())
    }

    /// Start `code` on a template-driven backend.
    pub fn execute_subprocess_async(
        &self,
        spec: SubprocessSpec,
        code: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<ResultHandle> {
        spec.validate()?;
        let factory: Arc<dyn ExecutorFactory> =
            Arc::new(SubprocessFactory::dedicated(spec, &self.scratch_dir));
        self.launch(factory, code, args, timeout)
    }

    pub fn execute_subprocess_blocking(
        &self,
        spec: SubprocessSpec,
        code: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        Ok(self
            .execute_subprocess_async(spec, code, args, timeout)?
            .join())
    }

    /// Run every block concurrently; results come back in input order.
    ///
    /// All language tags are resolved before anything starts, so a bad tag
    /// fails the call without launching any block.
    pub fn execute_parallel(
        &self,
        blocks: &[Block],
        timeout: Duration,
    ) -> Result<Vec<ExecutionResult>> {
        let factories = blocks
            .iter()
            .map(|block| self.registry.resolve(&block.language))
            .collect::<Result<Vec<_>>>()?;

        let handles = factories
            .into_iter()
            .zip(blocks)
            .map(|(factory, block)| self.launch(factory, &block.code, block.args.clone(), timeout))
            .collect::<Result<Vec<_>>>()?;

        let results = join_in_order(handles);
        self.audit.log_block_execute(
            "dispatcher",
            "parallel",
            &format!("Parallel group completed ({} blocks)", blocks.len()),
        );
        Ok(results)
    }

    /// First successful result among `units`; losers are abandoned.
    pub fn execute_race(&self, units: Vec<CallbackUnit>, timeout: Duration) -> ExecutionResult {
        let group = self.unit_name("race");
        execute_race(units, &group, timeout, &self.audit)
    }

    /// Race blocks (possibly in different languages) against each other.
    ///
    /// Every participant starts at once on its own executor, whatever the
    /// backend's dispatch mode.
    pub fn execute_race_blocks(&self, blocks: &[Block], timeout: Duration) -> Result<ExecutionResult> {
        let units = blocks
            .iter()
            .map(|block| self.unit_for(&block.language, &block.code, block.args.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(self.execute_race(units, timeout))
    }

    /// Retry an arbitrary unit.
    pub fn execute_with_retry(
        &self,
        unit: &CallbackUnit,
        name: &str,
        max_retries: usize,
        retry_delay: Duration,
        timeout: Duration,
    ) -> ExecutionResult {
        execute_with_retry(unit, name, max_retries, retry_delay, timeout, &self.audit)
    }

    /// Retry `code` in `language`.
    pub fn execute_with_retry_language(
        &self,
        language: &str,
        code: &str,
        args: Vec<Value>,
        max_retries: usize,
        retry_delay: Duration,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let unit = self.unit_for(language, code, args)?;
        let name = self.unit_name(&self.registry.canonical(language));
        Ok(self.execute_with_retry(&unit, &name, max_retries, retry_delay, timeout))
    }

    /// Drain both pools and persist cache metadata.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        if !self.callbacks.shutdown() {
            tracing::warn!(
                "Callback pool did not drain within {}ms",
                self.config.drain_timeout.as_millis()
            );
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save_metadata() {
                tracing::warn!("Failed to save cache metadata: {}", e);
            }
        }
    }

    fn launch(
        &self,
        factory: Arc<dyn ExecutorFactory>,
        code: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<ResultHandle> {
        let name = self.unit_name(factory.language());
        let mode = factory.mode();
        let unit = make_unit(factory, code.to_string(), args);

        match mode {
            DispatchMode::Pooled => {
                let audit = Arc::clone(&self.audit);
                self.pool
                    .enqueue(move || run_inline(&unit, &name, timeout, audit.as_ref()))
            }
            DispatchMode::Dedicated => self.callbacks.submit(unit, name, timeout),
        }
    }

    fn unit_name(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}#{}", prefix, n)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("callbacks", &self.callbacks)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
