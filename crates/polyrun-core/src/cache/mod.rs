//! Content-addressed cache of compiled artifacts.
//!
//! Compiled backends look up `(language, source)` before invoking a
//! compiler and store the produced binary afterwards, so identical fragments
//! compile once.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── metadata.txt
//! ├── rust/
//! │   ├── <hash>.bin
//! │   └── <hash>.rs
//! └── cpp/
//!     ├── <hash>.bin
//!     └── <hash>.cpp
//! ```
//!
//! Cache failures never reach callers: a copy or I/O problem is logged and
//! reported as a miss. The cache assumes a single writing process.

mod metadata;

pub use metadata::CacheEntry;

use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use rustc_hash::{FxHashMap, FxHasher};

use crate::error::Result;

/// Name of the metadata file inside the cache root.
pub const METADATA_FILE: &str = "metadata.txt";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Aggregate figures for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub total_accesses: u64,
}

impl CacheStats {
    pub fn total_mb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_MB as f64
    }

    pub fn avg_accesses(&self) -> f64 {
        if self.entries == 0 {
            0.0
        } else {
            self.total_accesses as f64 / self.entries as f64
        }
    }
}

/// Compiled-artifact cache rooted at a directory.
#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    entries: Mutex<FxHashMap<String, CacheEntry>>,
}

impl ArtifactCache {
    /// Open (or create) a cache at `root`, loading any persisted metadata.
    ///
    /// Never fails: an unusable directory yields an empty cache that simply
    /// misses.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if let Err(e) = fs::create_dir_all(&root) {
            tracing::warn!("Failed to create cache directory {:?}: {}", root, e);
        }
        let entries = metadata::load(&root.join(METADATA_FILE));
        Self {
            root,
            entries: Mutex::new(entries),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fast, non-cryptographic digest of `code`, as 16 hex characters.
    ///
    /// An Fx hash of the bytes, XORed with a mix of the length and the
    /// first, middle and last bytes.
    pub fn hash_code(code: &str) -> String {
        let bytes = code.as_bytes();

        let mut hasher = FxHasher::default();
        hasher.write(bytes);
        let base = hasher.finish();

        let mut mix = bytes.len() as u64;
        if let (Some(&first), Some(&last)) = (bytes.first(), bytes.last()) {
            mix ^= u64::from(first) << 16;
            mix ^= u64::from(bytes[bytes.len() / 2]) << 8;
            mix ^= u64::from(last);
        }

        format!("{:016x}", base ^ (mix << 1))
    }

    /// `language:hash`.
    pub fn cache_key(language: &str, code: &str) -> String {
        format!("{}:{}", language, Self::hash_code(code))
    }

    /// Whether an entry exists and its binary is still on disk.
    pub fn is_cached(&self, language: &str, code: &str) -> bool {
        let key = Self::cache_key(language, code);
        self.lock()
            .get(&key)
            .is_some_and(|entry| entry.binary_path.exists())
    }

    /// Path of the cached binary, or `None` on a miss.
    ///
    /// A hit bumps `last_access` and `access_count`. An entry whose binary was
    /// deleted behind the cache's back is evicted and reported as a miss.
    pub fn get_cached_binary(&self, language: &str, code: &str) -> Option<PathBuf> {
        let key = Self::cache_key(language, code);
        let mut entries = self.lock();

        let entry = entries.get_mut(&key)?;
        if !entry.binary_path.exists() {
            tracing::debug!("Cached binary for {} vanished, evicting", key);
            entries.remove(&key);
            return None;
        }

        entry.last_access = SystemTime::now();
        entry.access_count += 1;
        tracing::debug!("Cache hit for {}", key);
        Some(entry.binary_path.clone())
    }

    /// Copy a freshly compiled binary (and its source) into the cache.
    ///
    /// Returns the cached binary path, or `None` if nothing was stored.
    pub fn store_binary(
        &self,
        language: &str,
        code: &str,
        binary: &Path,
        source: &Path,
    ) -> Option<PathBuf> {
        let hash = Self::hash_code(code);
        let key = format!("{}:{}", language, hash);

        if !binary.exists() {
            tracing::warn!("Not caching {}: binary {:?} does not exist", key, binary);
            return None;
        }

        let cached_binary = self.binary_path(language, &hash);
        let cached_source = self.source_path(language, &hash);

        let mut entries = self.lock();

        if let Err(e) = fs::copy(binary, &cached_binary) {
            tracing::error!("Failed to cache binary for {}: {}", key, e);
            return None;
        }
        if source.exists() {
            if let Err(e) = fs::copy(source, &cached_source) {
                tracing::warn!("Failed to cache source for {}: {}", key, e);
            }
        }

        let now = SystemTime::now();
        entries.insert(
            key.clone(),
            CacheEntry {
                language: language.to_string(),
                hash,
                binary_path: cached_binary.clone(),
                source_path: cached_source,
                created: now,
                last_access: now,
                access_count: 1,
                code_size: code.len(),
            },
        );

        tracing::debug!("Stored {} in cache", key);
        Some(cached_binary)
    }

    /// Snapshot of the entry for `(language, code)`, without touching access data.
    pub fn entry(&self, language: &str, code: &str) -> Option<CacheEntry> {
        self.lock()
            .get(&Self::cache_key(language, code))
            .cloned()
    }

    /// Per-language directory, created on demand.
    pub fn cache_dir(&self, language: &str) -> PathBuf {
        let dir = self.root.join(language);
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!("Failed to create cache directory {:?}: {}", dir, e);
        }
        dir
    }

    pub fn binary_path(&self, language: &str, hash: &str) -> PathBuf {
        let ext = match language {
            "csharp" | "cs" => "exe",
            _ => "bin",
        };
        self.cache_dir(language).join(format!("{}.{}", hash, ext))
    }

    pub fn source_path(&self, language: &str, hash: &str) -> PathBuf {
        let ext = match language {
            "cpp" | "c++" => "cpp",
            "rust" => "rs",
            "go" => "go",
            "csharp" | "cs" => "cs",
            _ => "src",
        };
        self.cache_dir(language).join(format!("{}.{}", hash, ext))
    }

    /// Evict least-recently-used entries until the cache fits in `max_size_mb`.
    ///
    /// Returns the number of entries removed.
    pub fn clean_cache(&self, max_size_mb: u64) -> usize {
        self.clean_cache_bytes(max_size_mb.saturating_mul(BYTES_PER_MB))
    }

    /// Byte-granular variant of [`clean_cache`](Self::clean_cache).
    pub fn clean_cache_bytes(&self, max_bytes: u64) -> usize {
        let mut entries = self.lock();

        let mut current = total_size(&entries);
        if current <= max_bytes {
            return 0;
        }

        let mut lru: Vec<(String, SystemTime)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_access))
            .collect();
        lru.sort_by_key(|(_, last_access)| *last_access);

        let mut removed = 0;
        for (key, _) in lru {
            if current <= max_bytes {
                break;
            }
            if let Some(entry) = entries.remove(&key) {
                current = current.saturating_sub(entry.disk_size());
                remove_files(&entry);
                removed += 1;
            }
        }

        tracing::debug!(
            "Cache cleanup removed {} entries, {} bytes remain",
            removed,
            current
        );
        removed
    }

    /// Remove every entry and its files. Returns the number removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let removed = entries.len();
        for (_, entry) in entries.drain() {
            remove_files(&entry);
        }
        removed
    }

    /// Total bytes on disk across entries.
    pub fn cache_size(&self) -> u64 {
        total_size(&self.lock())
    }

    pub fn entry_count(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.lock();
        CacheStats {
            entries: entries.len(),
            total_bytes: total_size(&entries),
            total_accesses: entries.values().map(|e| e.access_count).sum(),
        }
    }

    /// Persist metadata now. Also done on drop.
    pub fn save_metadata(&self) -> Result<()> {
        metadata::save(&self.root.join(METADATA_FILE), &self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ArtifactCache {
    fn drop(&mut self) {
        if let Err(e) = self.save_metadata() {
            tracing::warn!("Failed to save cache metadata: {}", e);
        }
    }
}

fn total_size(entries: &FxHashMap<String, CacheEntry>) -> u64 {
    entries.values().map(CacheEntry::disk_size).sum()
}

fn remove_files(entry: &CacheEntry) {
    for path in [&entry.binary_path, &entry.source_path] {
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!("Failed to remove cached file {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn compiled(dir: &Path, name: &str, size: usize) -> (PathBuf, PathBuf) {
        let bin = dir.join(format!("{}.out", name));
        let src = dir.join(format!("{}.rs", name));
        fs::write(&bin, vec![0u8; size]).unwrap();
        fs::write(&src, format!("fn main() {{ /* {} */ }}", name)).unwrap();
        (bin, src)
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let a = ArtifactCache::hash_code("fn main() {}");
        let b = ArtifactCache::hash_code("fn main() {}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, ArtifactCache::hash_code("fn main() { }"));
        assert_eq!(ArtifactCache::hash_code("").len(), 16);
    }

    #[test]
    fn test_cache_key() {
        let key = ArtifactCache::cache_key("rust", "x");
        assert!(key.starts_with("rust:"));
        assert_eq!(key.len(), "rust:".len() + 16);
    }

    #[test]
    fn test_store_and_hit() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path().join("cache"));
        let (bin, src) = compiled(temp.path(), "a", 64);

        assert!(!cache.is_cached("rust", "code a"));
        let stored = cache.store_binary("rust", "code a", &bin, &src).unwrap();
        assert!(stored.ends_with(format!("rust/{}.bin", ArtifactCache::hash_code("code a"))));

        assert!(cache.is_cached("rust", "code a"));
        assert_eq!(cache.get_cached_binary("rust", "code a"), Some(stored));
        assert_eq!(cache.entry("rust", "code a").unwrap().access_count, 2);
        assert!(cache.get_cached_binary("cpp", "code a").is_none());
    }

    #[test]
    fn test_store_missing_binary() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path());
        let stored = cache.store_binary(
            "rust",
            "code",
            &temp.path().join("missing"),
            &temp.path().join("missing.rs"),
        );
        assert!(stored.is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_external_deletion_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path().join("cache"));
        let (bin, src) = compiled(temp.path(), "a", 8);
        let stored = cache.store_binary("rust", "code a", &bin, &src).unwrap();

        fs::remove_file(&stored).unwrap();
        assert!(!cache.is_cached("rust", "code a"));
        assert!(cache.get_cached_binary("rust", "code a").is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_clean_cache_evicts_lru() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path().join("cache"));

        for name in ["a", "b", "c"] {
            let (bin, src) = compiled(temp.path(), name, 1000);
            cache.store_binary("rust", name, &bin, &src).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        // Touch "a" so "b" becomes least recently used.
        cache.get_cached_binary("rust", "a").unwrap();

        let per_entry = cache.entry("rust", "c").unwrap().disk_size();
        let removed = cache.clean_cache_bytes(per_entry * 2);

        assert_eq!(removed, 1);
        assert!(cache.is_cached("rust", "a"));
        assert!(!cache.is_cached("rust", "b"));
        assert!(cache.is_cached("rust", "c"));
        assert!(cache.cache_size() <= per_entry * 2);
    }

    #[test]
    fn test_clean_cache_within_budget_is_noop() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path());
        let (bin, src) = compiled(temp.path(), "a", 10);
        cache.store_binary("rust", "a", &bin, &src).unwrap();

        assert_eq!(cache.clean_cache(1), 0);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_metadata_persists_across_open() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        {
            let cache = ArtifactCache::open(&root);
            let (bin, src) = compiled(temp.path(), "a", 10);
            cache.store_binary("cpp", "int main(){}", &bin, &src).unwrap();
        }

        assert!(root.join(METADATA_FILE).exists());
        let reopened = ArtifactCache::open(&root);
        assert!(reopened.is_cached("cpp", "int main(){}"));
        assert_eq!(reopened.stats().total_accesses, 1);
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path().join("cache"));
        let (bin, src) = compiled(temp.path(), "a", 10);
        let stored = cache.store_binary("go", "package main", &bin, &src).unwrap();

        assert_eq!(cache.clear(), 1);
        assert!(!stored.exists());
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
