//! Integration tests for the compiled-artifact cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use polyrun_core::cache::{ArtifactCache, METADATA_FILE};
use tempfile::TempDir;

/// Write a fake compiled binary and its source into `dir`.
fn fake_build(dir: &Path, name: &str, bytes: &[u8]) -> (PathBuf, PathBuf) {
    let binary = dir.join(format!("{}.out", name));
    let source = dir.join(format!("{}.cpp", name));
    fs::write(&binary, bytes).unwrap();
    fs::write(&source, format!("// {}\nint main() {{ return 0; }}\n", name)).unwrap();
    (binary, source)
}

#[test]
fn test_hit_returns_copy_of_binary() {
    let temp = TempDir::new().unwrap();
    let cache = ArtifactCache::open(temp.path().join("cache"));
    let (binary, source) = fake_build(temp.path(), "hello", b"binary-bytes");

    cache.store_binary("cpp", "int main() {}", &binary, &source).unwrap();

    let hit = cache.get_cached_binary("cpp", "int main() {}").unwrap();
    assert!(hit.exists());
    assert_eq!(fs::read(&hit).unwrap(), b"binary-bytes");
    assert!(hit.starts_with(temp.path().join("cache").join("cpp")));

    assert!(cache.get_cached_binary("cpp", "int main() { return 1; }").is_none());
}

#[test]
fn test_out_of_band_deletion_evicts_entry() {
    let temp = TempDir::new().unwrap();
    let cache = ArtifactCache::open(temp.path().join("cache"));
    let (binary, source) = fake_build(temp.path(), "gone", b"x");

    let cached = cache.store_binary("rust", "fn main() {}", &binary, &source).unwrap();
    assert_eq!(cache.entry_count(), 1);

    fs::remove_file(&cached).unwrap();
    assert!(cache.get_cached_binary("rust", "fn main() {}").is_none());
    assert_eq!(cache.entry_count(), 0);
}

#[test]
fn test_clean_cache_evicts_in_lru_order() {
    let temp = TempDir::new().unwrap();
    let cache = ArtifactCache::open(temp.path().join("cache"));

    let codes = ["one", "two", "three", "four"];
    for code in codes {
        let (binary, source) = fake_build(temp.path(), code, &vec![7u8; 4096]);
        cache.store_binary("cpp", code, &binary, &source).unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    // Access order now: two, three, four, one (oldest first).
    cache.get_cached_binary("cpp", "one").unwrap();

    let budget = cache.cache_size() / 2;
    let removed = cache.clean_cache_bytes(budget);

    assert_eq!(removed, 2);
    assert!(cache.cache_size() <= budget);
    assert!(!cache.is_cached("cpp", "two"));
    assert!(!cache.is_cached("cpp", "three"));
    assert!(cache.is_cached("cpp", "four"));
    assert!(cache.is_cached("cpp", "one"));
}

#[test]
fn test_reopen_drops_entries_with_missing_binaries() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("cache");

    let doomed = {
        let cache = ArtifactCache::open(&root);
        let (b1, s1) = fake_build(temp.path(), "keep", b"k");
        let (b2, s2) = fake_build(temp.path(), "lose", b"l");
        cache.store_binary("go", "keep", &b1, &s1).unwrap();
        cache.store_binary("go", "lose", &b2, &s2).unwrap()
    };

    let metadata = fs::read_to_string(root.join(METADATA_FILE)).unwrap();
    assert_eq!(metadata.lines().count(), 2);
    assert!(metadata.lines().all(|line| line.starts_with("go:")));

    fs::remove_file(doomed).unwrap();

    let reopened = ArtifactCache::open(&root);
    assert_eq!(reopened.entry_count(), 1);
    assert!(reopened.is_cached("go", "keep"));
    assert!(!reopened.is_cached("go", "lose"));
}

#[test]
fn test_source_extension_follows_language() {
    let temp = TempDir::new().unwrap();
    let cache = ArtifactCache::open(temp.path());
    let hash = ArtifactCache::hash_code("x");

    assert!(cache.source_path("rust", &hash).ends_with(format!("rust/{}.rs", hash)));
    assert!(cache.source_path("cpp", &hash).ends_with(format!("cpp/{}.cpp", hash)));
    assert!(cache.binary_path("csharp", &hash).ends_with(format!("csharp/{}.exe", hash)));
    assert!(cache.source_path("zig", &hash).ends_with(format!("zig/{}.src", hash)));
}
