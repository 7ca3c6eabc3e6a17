//! On-disk metadata for the artifact cache.
//!
//! One line per entry:
//!
//! ```text
//! language:hash|binary_path|source_path|access_count|last_access_epoch_secs
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;

use crate::error::Result;

/// A cached compiled artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub language: String,
    pub hash: String,
    pub binary_path: PathBuf,
    pub source_path: PathBuf,
    pub created: SystemTime,
    pub last_access: SystemTime,
    pub access_count: u64,
    /// Length of the source text in bytes (zero when loaded from disk).
    pub code_size: usize,
}

impl CacheEntry {
    pub fn key(&self) -> String {
        format!("{}:{}", self.language, self.hash)
    }

    /// Bytes on disk for the binary and source copies.
    pub fn disk_size(&self) -> u64 {
        file_size(&self.binary_path) + file_size(&self.source_path)
    }
}

pub(crate) fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn encode_line(key: &str, entry: &CacheEntry) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        key,
        entry.binary_path.display(),
        entry.source_path.display(),
        entry.access_count,
        epoch_secs(entry.last_access)
    )
}

/// Parse one metadata line. Malformed lines yield `None`.
pub(crate) fn decode_line(line: &str) -> Option<(String, CacheEntry)> {
    let mut tail = line.rsplitn(3, '|');
    let last_access: u64 = tail.next()?.trim().parse().ok()?;
    let access_count: u64 = tail.next()?.trim().parse().ok()?;
    let head = tail.next()?;

    let mut fields = head.splitn(3, '|');
    let key = fields.next()?;
    let binary = fields.next()?;
    let source = fields.next()?;

    let (language, hash) = key.split_once(':')?;
    if language.is_empty() || hash.is_empty() {
        return None;
    }

    let last_access = UNIX_EPOCH + Duration::from_secs(last_access);
    Some((
        key.to_string(),
        CacheEntry {
            language: language.to_string(),
            hash: hash.to_string(),
            binary_path: PathBuf::from(binary),
            source_path: PathBuf::from(source),
            created: last_access,
            last_access,
            access_count,
            code_size: 0,
        },
    ))
}

/// Read entries from `path`, keeping only those whose binary still exists.
pub(crate) fn load(path: &Path) -> FxHashMap<String, CacheEntry> {
    let mut entries = FxHashMap::default();

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No cache metadata at {:?}", path);
            return entries;
        }
        Err(e) => {
            tracing::warn!("Failed to read cache metadata {:?}: {}", path, e);
            return entries;
        }
    };

    let mut dropped = 0usize;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match decode_line(line) {
            Some((key, entry)) if entry.binary_path.exists() => {
                entries.insert(key, entry);
            }
            _ => dropped += 1,
        }
    }

    tracing::debug!(
        "Loaded cache metadata: {} entries ({} dropped)",
        entries.len(),
        dropped
    );
    entries
}

/// Write entries atomically (temp file, fsync, rename).
pub(crate) fn save(path: &Path, entries: &FxHashMap<String, CacheEntry>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut keys: Vec<&String> = entries.keys().collect();
    keys.sort();

    let mut content = String::new();
    for key in keys {
        content.push_str(&encode_line(key, &entries[key]));
        content.push('\n');
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    tracing::debug!("Saved cache metadata: {} entries", entries.len());
    Ok(())
}
