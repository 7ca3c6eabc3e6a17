//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::paths::EngineDirs;

/// Configuration for the dispatcher and its pools.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads in the shared thread pool.
    pub worker_threads: usize,

    /// Concurrency ceiling for a callback pool.
    pub max_concurrent: usize,

    /// Timeout applied when a caller does not pass one. Zero waits forever.
    pub default_timeout: Duration,

    /// How long shutdown waits for in-flight units before giving up.
    pub drain_timeout: Duration,

    /// Engine home (cache and scratch directories live below it).
    pub home: PathBuf,

    /// Consult and populate the compiled-artifact cache.
    pub cache_enabled: bool,

    /// Size budget for the compiled-artifact cache, in megabytes.
    pub cache_max_mb: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_concurrent: 10,
            default_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(60),
            home: EngineDirs::default_home(),
            cache_enabled: true,
            cache_max_mb: 500,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `POLYRUN_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Recognised keys: `POLYRUN_WORKERS`, `POLYRUN_MAX_CONCURRENT`,
    /// `POLYRUN_TIMEOUT_MS`, `POLYRUN_HOME`, `POLYRUN_CACHE_MAX_MB`,
    /// `POLYRUN_NO_CACHE`. Unparsable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var(&lookup, "POLYRUN_WORKERS") {
            config.worker_threads = n;
        }
        if let Some(n) = parse_var(&lookup, "POLYRUN_MAX_CONCURRENT") {
            config.max_concurrent = n;
        }
        if let Some(ms) = parse_var(&lookup, "POLYRUN_TIMEOUT_MS") {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(mb) = parse_var(&lookup, "POLYRUN_CACHE_MAX_MB") {
            config.cache_max_mb = mb;
        }
        if let Some(home) = lookup("POLYRUN_HOME").filter(|h| !h.is_empty()) {
            config.home = PathBuf::from(home);
        }
        if let Some(flag) = lookup("POLYRUN_NO_CACHE") {
            config.cache_enabled = matches!(flag.as_str(), "" | "0" | "false");
        }

        config
    }

    /// Builder-style override of the home directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    /// Create (if needed) and return the directory layout below `home`.
    pub fn dirs(&self) -> crate::Result<EngineDirs> {
        EngineDirs::from_home(&self.home)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}
