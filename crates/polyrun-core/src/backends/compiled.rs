//! Compiled languages: compile once (cached), then run the binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::ArtifactCache;
use crate::error::{Error, Result};
use crate::value::Value;

use super::{
    ARGS_ENV, CommandOutput, ExecContext, ExecutorFactory, LanguageExecutor, TempFile,
    program_available, run_command,
};

/// How to compile a language into a standalone executable.
///
/// The compiler is invoked as `compiler [compile_args...] <source> -o <binary>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSpec {
    pub language: String,
    pub compiler: String,
    pub source_extension: String,
    pub compile_args: Vec<String>,
}

impl CompiledSpec {
    pub fn rust() -> Self {
        Self {
            language: "rust".to_string(),
            compiler: "rustc".to_string(),
            source_extension: ".rs".to_string(),
            compile_args: vec!["--edition=2021".to_string(), "-O".to_string()],
        }
    }

    pub fn cpp() -> Self {
        Self {
            language: "cpp".to_string(),
            compiler: "c++".to_string(),
            source_extension: ".cpp".to_string(),
            compile_args: vec!["-std=c++17".to_string(), "-O2".to_string()],
        }
    }

    fn compile_argv(&self, source: &Path, binary: &Path) -> Vec<String> {
        let mut argv = self.compile_args.clone();
        argv.push(source.to_string_lossy().into_owned());
        argv.push("-o".to_string());
        argv.push(binary.to_string_lossy().into_owned());
        argv
    }
}

/// A runnable binary, possibly owned by a scratch guard.
struct Binary {
    path: PathBuf,
    _guard: Option<TempFile>,
}

/// Executor for one unit of a [`CompiledSpec`] language.
pub struct CompiledExecutor {
    spec: Arc<CompiledSpec>,
    ctx: ExecContext,
    scratch_dir: PathBuf,
    cache: Option<Arc<ArtifactCache>>,
    last_output: String,
}

impl CompiledExecutor {
    pub fn new(
        spec: Arc<CompiledSpec>,
        ctx: ExecContext,
        scratch_dir: PathBuf,
        cache: Option<Arc<ArtifactCache>>,
    ) -> Self {
        Self {
            spec,
            ctx,
            scratch_dir,
            cache,
            last_output: String::new(),
        }
    }

    /// Cached binary for `code`, compiling it on a miss.
    fn binary_for(&mut self, code: &str) -> Result<Binary> {
        let language = self.spec.language.clone();

        if let Some(cache) = &self.cache {
            if let Some(path) = cache.get_cached_binary(&language, code) {
                return Ok(Binary { path, _guard: None });
            }
        }

        let source = TempFile::write(&self.scratch_dir, &self.spec.source_extension, code)?;
        let binary = TempFile::reserve(&self.scratch_dir, ".bin")?;
        let argv = self.spec.compile_argv(source.path(), binary.path());

        tracing::debug!("Compiling {} fragment with {}", language, self.spec.compiler);
        let output = run_command(&language, &self.spec.compiler, &argv, &[], &self.ctx.token)?;
        if !output.status.success() {
            self.last_output = output.combined(&language);
            return Err(Error::Compilation {
                language,
                message: output.stderr.trim().to_string(),
            });
        }

        if let Some(cache) = &self.cache {
            if let Some(path) = cache.store_binary(&language, code, binary.path(), source.path()) {
                return Ok(Binary { path, _guard: None });
            }
        }

        Ok(Binary {
            path: binary.path().to_path_buf(),
            _guard: Some(binary),
        })
    }

    fn run(&mut self, code: &str) -> Result<CommandOutput> {
        let binary = self.binary_for(code)?;
        let program = binary.path.to_string_lossy().into_owned();
        let envs = [(ARGS_ENV, self.ctx.args_json()?)];

        let output = run_command(&self.spec.language, &program, &[], &envs, &self.ctx.token)?;
        self.last_output = output.combined(&self.spec.language);
        Ok(output)
    }
}

impl LanguageExecutor for CompiledExecutor {
    fn language(&self) -> &str {
        &self.spec.language
    }

    fn execute(&mut self, code: &str) -> Result<bool> {
        Ok(self.run(code)?.status.success())
    }

    fn execute_with_return(&mut self, code: &str) -> Result<Value> {
        let output = self.run(code)?;
        output.into_value(&self.spec.language)
    }

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        match (name, args.first()) {
            ("exec", Some(Value::String(code))) => {
                let code = code.clone();
                Ok(Value::Bool(self.execute(&code)?))
            }
            _ => Err(Error::InvalidOperation(format!(
                "{} backend only supports exec(code_string), not '{}'",
                self.spec.language, name
            ))),
        }
    }

    fn is_initialized(&self) -> bool {
        program_available(&self.spec.compiler)
    }

    fn captured_output(&self) -> String {
        self.last_output.clone()
    }
}

/// Factory for a [`CompiledSpec`], sharing one artifact cache.
#[derive(Debug, Clone)]
pub struct CompiledFactory {
    spec: Arc<CompiledSpec>,
    scratch_dir: PathBuf,
    cache: Option<Arc<ArtifactCache>>,
}

impl CompiledFactory {
    pub fn new(
        spec: CompiledSpec,
        scratch_dir: impl Into<PathBuf>,
        cache: Option<Arc<ArtifactCache>>,
    ) -> Self {
        Self {
            spec: Arc::new(spec),
            scratch_dir: scratch_dir.into(),
            cache,
        }
    }

    pub fn spec(&self) -> &CompiledSpec {
        &self.spec
    }
}

impl ExecutorFactory for CompiledFactory {
    fn language(&self) -> &str {
        &self.spec.language
    }

    fn is_available(&self) -> bool {
        program_available(&self.spec.compiler)
    }

    fn create(&self, ctx: ExecContext) -> Result<Box<dyn LanguageExecutor>> {
        Ok(Box::new(CompiledExecutor::new(
            Arc::clone(&self.spec),
            ctx,
            self.scratch_dir.clone(),
            self.cache.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compile_argv() {
        let argv = CompiledSpec::cpp().compile_argv(Path::new("/s/a.cpp"), Path::new("/s/a.bin"));
        assert_eq!(argv, vec!["-std=c++17", "-O2", "/s/a.cpp", "-o", "/s/a.bin"]);
    }

    #[test]
    fn test_missing_compiler_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let spec = CompiledSpec {
            compiler: "polyrun-no-such-compiler".to_string(),
            ..CompiledSpec::rust()
        };
        let factory = CompiledFactory::new(spec, temp.path(), None);
        assert!(!factory.is_available());

        let mut exec = factory.create(ExecContext::default()).unwrap();
        let err = exec.execute_with_return("fn main() {}").unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
    }

    #[test]
    #[ignore = "Requires rustc on PATH"]
    fn test_rust_compiles_once() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(ArtifactCache::open(temp.path().join("cache")));
        let factory = CompiledFactory::new(CompiledSpec::rust(), temp.path().join("scratch"), Some(cache.clone()));
        let code = r#"fn main() { println!("{}", 6 * 7); }"#;

        let mut exec = factory.create(ExecContext::default()).unwrap();
        assert_eq!(exec.execute_with_return(code).unwrap(), Value::Int(42));
        assert!(cache.is_cached("rust", code));

        let mut again = factory.create(ExecContext::default()).unwrap();
        assert_eq!(again.execute_with_return(code).unwrap(), Value::Int(42));
        assert_eq!(cache.entry("rust", code).unwrap().access_count, 2);
    }

    #[test]
    #[ignore = "Requires rustc on PATH"]
    fn test_rust_compile_error() {
        let temp = TempDir::new().unwrap();
        let factory = CompiledFactory::new(CompiledSpec::rust(), temp.path(), None);
        let mut exec = factory.create(ExecContext::default()).unwrap();

        let err = exec.execute_with_return("fn main() { let x: i32 = ; }").unwrap_err();
        assert!(matches!(err, Error::Compilation { .. }));
    }
}
