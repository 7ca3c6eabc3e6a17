//! Language tag → backend factory mapping.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::backends::{CompiledFactory, CompiledSpec, ExecutorFactory, SubprocessFactory, SubprocessSpec};
use crate::cache::ArtifactCache;
use crate::error::{Error, Result};
use crate::paths::EngineDirs;

/// Tag reserved for template-driven subprocess backends.
pub const GENERIC_TAG: &str = "generic";

const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("sh", "shell"),
    ("bash", "shell"),
    ("py", "python"),
    ("python3", "python"),
    ("js", "javascript"),
    ("node", "javascript"),
    ("rs", "rust"),
    ("c++", "cpp"),
];

/// Registered backends, keyed by canonical lower-case tag.
#[derive(Clone)]
pub struct LanguageRegistry {
    factories: FxHashMap<String, Arc<dyn ExecutorFactory>>,
    aliases: FxHashMap<String, String>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageRegistry {
    /// Empty registry with the standard aliases.
    pub fn new() -> Self {
        let aliases = DEFAULT_ALIASES
            .iter()
            .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
            .collect();
        Self {
            factories: FxHashMap::default(),
            aliases,
        }
    }

    /// Registry with every interpreter and compiler preset.
    pub fn with_defaults(dirs: &EngineDirs, cache: Option<Arc<ArtifactCache>>) -> Self {
        let mut registry = Self::new();
        for spec in SubprocessSpec::presets() {
            registry.register(Arc::new(SubprocessFactory::new(spec, &dirs.scratch_dir)));
        }
        for spec in [CompiledSpec::rust(), CompiledSpec::cpp()] {
            registry.register(Arc::new(CompiledFactory::new(
                spec,
                &dirs.scratch_dir,
                cache.clone(),
            )));
        }
        registry
    }

    /// Register `factory` under its own language tag, replacing any previous one.
    pub fn register(&mut self, factory: Arc<dyn ExecutorFactory>) {
        let tag = normalize(factory.language());
        tracing::debug!("Registered backend for {}", tag);
        self.factories.insert(tag, factory);
    }

    pub fn unregister(&mut self, tag: &str) -> Option<Arc<dyn ExecutorFactory>> {
        let canonical = self.canonical(tag);
        self.factories.remove(&canonical)
    }

    /// Make `alias` resolve to `canonical`.
    pub fn alias(&mut self, alias: &str, canonical: &str) {
        self.aliases.insert(normalize(alias), normalize(canonical));
    }

    /// Canonical form of `tag` (alias resolved, lower-cased).
    pub fn canonical(&self, tag: &str) -> String {
        let tag = normalize(tag);
        self.aliases.get(&tag).cloned().unwrap_or(tag)
    }

    pub fn is_supported(&self, tag: &str) -> bool {
        self.factories.contains_key(&self.canonical(tag))
    }

    /// Registered canonical tags, sorted.
    pub fn languages(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.factories.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Factory for `tag`.
    ///
    /// # Errors
    /// `MissingTemplate` for the generic tag (it needs an explicit
    /// [`SubprocessSpec`]); `UnknownLanguage` for anything unregistered.
    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn ExecutorFactory>> {
        let canonical = self.canonical(tag);
        if let Some(factory) = self.factories.get(&canonical) {
            return Ok(Arc::clone(factory));
        }
        if canonical == GENERIC_TAG {
            return Err(Error::MissingTemplate(canonical));
        }
        Err(Error::UnknownLanguage(tag.to_string()))
    }
}

impl std::fmt::Debug for LanguageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageRegistry")
            .field("languages", &self.languages())
            .finish()
    }
}

fn normalize(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn defaults() -> (TempDir, LanguageRegistry) {
        let temp = TempDir::new().unwrap();
        let dirs = EngineDirs::from_home(temp.path()).unwrap();
        let registry = LanguageRegistry::with_defaults(&dirs, None);
        (temp, registry)
    }

    #[test]
    fn test_default_languages() {
        let (_temp, registry) = defaults();
        assert_eq!(
            registry.languages(),
            vec!["cpp", "go", "javascript", "python", "ruby", "rust", "shell"]
        );
    }

    #[test]
    fn test_aliases_resolve() {
        let (_temp, registry) = defaults();
        assert_eq!(registry.resolve("bash").unwrap().language(), "shell");
        assert_eq!(registry.resolve("PY").unwrap().language(), "python");
        assert_eq!(registry.resolve("c++").unwrap().language(), "cpp");
        assert!(registry.is_supported(" node "));
    }

    #[test]
    fn test_unknown_and_generic() {
        let (_temp, registry) = defaults();
        assert!(matches!(
            registry.resolve("cobol"),
            Err(Error::UnknownLanguage(tag)) if tag == "cobol"
        ));
        assert!(matches!(
            registry.resolve("generic"),
            Err(Error::MissingTemplate(_))
        ));
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = LanguageRegistry::new();
        registry.register(Arc::new(SubprocessFactory::new(
            SubprocessSpec::new("lua", "lua {}", ".lua"),
            "/tmp",
        )));
        registry.alias("luajit", "lua");

        assert!(registry.is_supported("luajit"));
        assert!(registry.unregister("lua").is_some());
        assert!(!registry.is_supported("lua"));
    }
}
