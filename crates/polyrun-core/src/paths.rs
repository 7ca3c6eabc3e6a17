//! Engine directory management.
//!
//! Provides a consistent directory structure for the engine so the CLI and
//! embedding hosts agree on where artifacts live.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Directory structure for an engine home.
///
/// ```text
/// <home>/
/// ├── cache/      # Compiled-artifact cache (one subdirectory per language)
/// │   └── metadata.txt
/// └── scratch/    # Temporary source files handed to interpreters/compilers
/// ```
#[derive(Debug, Clone)]
pub struct EngineDirs {
    /// The home directory itself.
    pub home: PathBuf,

    /// Root of the compiled-artifact cache.
    pub cache_dir: PathBuf,

    /// Scratch space for temporary sources and build outputs.
    pub scratch_dir: PathBuf,
}

impl EngineDirs {
    /// Create the directory structure under `home`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn from_home(home: &Path) -> Result<Self> {
        let dirs = Self {
            home: home.to_path_buf(),
            cache_dir: home.join("cache"),
            scratch_dir: home.join("scratch"),
        };
        dirs.create()?;
        Ok(dirs)
    }

    /// Default home: the user's cache directory, or the temp dir when there is none.
    pub fn default_home() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("polyrun")
    }

    /// Remove everything under the home and recreate the structure.
    pub fn clean(&self) -> Result<()> {
        if self.home.exists() {
            fs::remove_dir_all(&self.home)?;
        }
        self.create()
    }

    fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        fs::create_dir_all(&self.scratch_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_home_creates_dirs() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = EngineDirs::from_home(&temp.path().join("home")).expect("Failed to create dirs");

        assert!(dirs.cache_dir.exists());
        assert!(dirs.scratch_dir.exists());
        assert!(dirs.cache_dir.starts_with(&dirs.home));
    }

    #[test]
    fn test_clean() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = EngineDirs::from_home(temp.path()).expect("Failed to create dirs");

        let stale = dirs.scratch_dir.join("stale.py");
        fs::write(&stale, "print(1)").expect("Failed to write test file");

        dirs.clean().expect("Failed to clean");
        assert!(!stale.exists());
        assert!(dirs.scratch_dir.exists());
    }

    #[test]
    fn test_default_home_is_named() {
        assert!(EngineDirs::default_home().ends_with("polyrun"));
    }
}
