//! Interpreters driven through a command template.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::Value;

use super::{
    ARGS_ENV, CommandOutput, DispatchMode, ExecContext, ExecutorFactory, LanguageExecutor,
    TempFile, program_available, run_command,
};

/// Placeholder substituted in a command template.
const PLACEHOLDER: &str = "{}";

/// How to run a language as a subprocess.
///
/// With an empty `file_extension` the placeholder is replaced by the code
/// itself (`sh -c {}`); otherwise the code is written to a temporary file and
/// the placeholder is replaced by its path (`python3 {}` with `.py`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessSpec {
    pub language: String,
    pub command_template: String,
    pub file_extension: String,
}

impl SubprocessSpec {
    pub fn new(
        language: impl Into<String>,
        command_template: impl Into<String>,
        file_extension: impl Into<String>,
    ) -> Self {
        Self {
            language: language.into(),
            command_template: command_template.into(),
            file_extension: file_extension.into(),
        }
    }

    pub fn shell() -> Self {
        Self::new("shell", "sh -c {}", "")
    }

    pub fn python() -> Self {
        Self::new("python", "python3 {}", ".py")
    }

    pub fn javascript() -> Self {
        Self::new("javascript", "node {}", ".js")
    }

    pub fn ruby() -> Self {
        Self::new("ruby", "ruby {}", ".rb")
    }

    pub fn go() -> Self {
        Self::new("go", "go run {}", ".go")
    }

    /// Every built-in interpreter preset.
    pub fn presets() -> Vec<Self> {
        vec![
            Self::shell(),
            Self::python(),
            Self::javascript(),
            Self::ruby(),
            Self::go(),
        ]
    }

    /// The program named by the template.
    pub fn program(&self) -> Option<&str> {
        self.command_template.split_whitespace().next()
    }

    /// Reject templates that cannot be run.
    pub fn validate(&self) -> Result<()> {
        if self.command_template.trim().is_empty() {
            return Err(Error::MissingTemplate(self.language.clone()));
        }
        if !self.command_template.contains(PLACEHOLDER) {
            return Err(Error::InvalidOperation(format!(
                "command template for '{}' has no {} placeholder",
                self.language, PLACEHOLDER
            )));
        }
        Ok(())
    }

    /// Tokenise the template, then substitute `replacement` into every token.
    ///
    /// Tokenising first keeps a replacement containing whitespace as one argument.
    pub(crate) fn build_argv(&self, replacement: &str) -> Result<Vec<String>> {
        self.validate()?;
        Ok(self
            .command_template
            .split_whitespace()
            .map(|token| token.replace(PLACEHOLDER, replacement))
            .collect())
    }
}

/// Executor for one unit of a [`SubprocessSpec`] language.
pub struct SubprocessExecutor {
    spec: Arc<SubprocessSpec>,
    ctx: ExecContext,
    scratch_dir: PathBuf,
    last_output: String,
}

impl SubprocessExecutor {
    pub fn new(spec: Arc<SubprocessSpec>, ctx: ExecContext, scratch_dir: PathBuf) -> Self {
        Self {
            spec,
            ctx,
            scratch_dir,
            last_output: String::new(),
        }
    }

    fn run(&mut self, code: &str) -> Result<CommandOutput> {
        // Keeps the source file alive for the duration of the run.
        let source = if self.spec.file_extension.is_empty() {
            None
        } else {
            Some(TempFile::write(
                &self.scratch_dir,
                &self.spec.file_extension,
                code,
            )?)
        };
        let replacement = match &source {
            Some(file) => file.path().to_string_lossy().into_owned(),
            None => code.to_string(),
        };

        let argv = self.spec.build_argv(&replacement)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::MissingTemplate(self.spec.language.clone()))?;

        let envs = [(ARGS_ENV, self.ctx.args_json()?)];
        let output = run_command(&self.spec.language, program, args, &envs, &self.ctx.token)?;
        self.last_output = output.combined(&self.spec.language);

        if !output.status.success() {
            tracing::debug!(
                "{} command failed with {}: {}",
                self.spec.language,
                output.status,
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

impl LanguageExecutor for SubprocessExecutor {
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
        if name == "exec" {
            let code = match args.first() {
                Some(Value::String(code)) => code.clone(),
                Some(Value::Int(n)) => n.to_string(),
                _ => {
                    return Err(Error::InvalidOperation(format!(
                        "{} backend only supports exec(string_code) or exec(number)",
                        self.spec.language
                    )));
                }
            };
            return Ok(Value::Bool(self.execute(&code)?));
        }
        Err(Error::InvalidOperation(format!(
            "{} backend only supports exec(code_string), not '{}'",
            self.spec.language, name
        )))
    }

    fn is_initialized(&self) -> bool {
        self.spec.program().is_some_and(program_available)
    }

    fn captured_output(&self) -> String {
        self.last_output.clone()
    }
}

/// Factory for a [`SubprocessSpec`].
#[derive(Debug, Clone)]
pub struct SubprocessFactory {
    spec: Arc<SubprocessSpec>,
    scratch_dir: PathBuf,
    mode: DispatchMode,
}

impl SubprocessFactory {
    /// Registry factory; its units run on the shared thread pool.
    pub fn new(spec: SubprocessSpec, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec: Arc::new(spec),
            scratch_dir: scratch_dir.into(),
            mode: DispatchMode::Pooled,
        }
    }

    /// Ad-hoc factory; each unit gets its own executor thread.
    pub fn dedicated(spec: SubprocessSpec, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: DispatchMode::Dedicated,
            ..Self::new(spec, scratch_dir)
        }
    }

    pub fn spec(&self) -> &SubprocessSpec {
        &self.spec
    }
}

impl ExecutorFactory for SubprocessFactory {
    fn language(&self) -> &str {
        &self.spec.language
    }

    fn mode(&self) -> DispatchMode {
        self.mode
    }

    fn is_available(&self) -> bool {
        self.spec.program().is_some_and(program_available)
    }

    fn create(&self, ctx: ExecContext) -> Result<Box<dyn LanguageExecutor>> {
        self.spec.validate()?;
        Ok(Box::new(SubprocessExecutor::new(
            Arc::clone(&self.spec),
            ctx,
            self.scratch_dir.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::CancelToken;
    use tempfile::TempDir;

    fn shell(temp: &TempDir) -> SubprocessExecutor {
        SubprocessExecutor::new(
            Arc::new(SubprocessSpec::shell()),
            ExecContext::default(),
            temp.path().to_path_buf(),
        )
    }

    #[test]
    fn test_build_argv_keeps_code_as_one_argument() {
        let argv = SubprocessSpec::shell().build_argv("echo hello world").unwrap();
        assert_eq!(argv, vec!["sh", "-c", "echo hello world"]);
    }

    #[test]
    fn test_build_argv_replaces_every_placeholder() {
        let spec = SubprocessSpec::new("twice", "tool --in {} --log {}.log", ".txt");
        let argv = spec.build_argv("/tmp/x.txt").unwrap();
        assert_eq!(argv, vec!["tool", "--in", "/tmp/x.txt", "--log", "/tmp/x.txt.log"]);
    }

    #[test]
    fn test_template_validation() {
        let empty = SubprocessSpec::new("generic", "  ", "");
        assert!(matches!(empty.validate(), Err(Error::MissingTemplate(_))));

        let no_placeholder = SubprocessSpec::new("odd", "cat", "");
        assert!(matches!(
            no_placeholder.validate(),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_presets() {
        let presets = SubprocessSpec::presets();
        assert_eq!(presets.len(), 5);
        assert_eq!(SubprocessSpec::go().program(), Some("go"));
        assert!(presets.iter().all(|p| p.validate().is_ok()));
    }

    #[test]
    fn test_factory_modes() {
        let pooled = SubprocessFactory::new(SubprocessSpec::shell(), "/tmp");
        let dedicated = SubprocessFactory::dedicated(SubprocessSpec::shell(), "/tmp");
        assert_eq!(pooled.mode(), DispatchMode::Pooled);
        assert_eq!(dedicated.mode(), DispatchMode::Dedicated);
        assert_eq!(dedicated.language(), "shell");
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_returns_parsed_output() {
        let temp = TempDir::new().unwrap();
        let mut exec = shell(&temp);
        assert!(exec.is_initialized());

        assert_eq!(exec.execute_with_return("echo 42").unwrap(), Value::Int(42));
        assert_eq!(
            exec.execute_with_return("echo hello world").unwrap(),
            Value::from("hello world")
        );
        assert_eq!(exec.captured_output(), "hello world\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_failure() {
        let temp = TempDir::new().unwrap();
        let mut exec = shell(&temp);

        assert!(!exec.execute("exit 1").unwrap());
        let err = exec.execute_with_return("echo bad >&2; exit 2").unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert!(exec.captured_output().contains("[shell stderr]: bad"));
    }

    #[cfg(unix)]
    #[test]
    fn test_call_function_exec() {
        let temp = TempDir::new().unwrap();
        let mut exec = shell(&temp);

        assert_eq!(
            exec.call_function("exec", &[Value::from("true")]).unwrap(),
            Value::Bool(true)
        );
        assert!(exec.call_function("run", &[]).is_err());
        assert!(exec.call_function("exec", &[Value::Bool(true)]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_args_are_exported() {
        let temp = TempDir::new().unwrap();
        let ctx = ExecContext::new(CancelToken::new(), vec![Value::Int(5)]);
        let mut exec =
            SubprocessExecutor::new(Arc::new(SubprocessSpec::shell()), ctx, temp.path().into());

        let value = exec.execute_with_return("printf '%s' \"$POLYRUN_ARGS\"").unwrap();
        assert_eq!(value, Value::List(vec![Value::Int(5)]));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_based_template_cleans_up() {
        let temp = TempDir::new().unwrap();
        let spec = SubprocessSpec::new("sh-file", "sh {}", ".sh");
        let mut exec = SubprocessExecutor::new(
            Arc::new(spec),
            ExecContext::default(),
            temp.path().to_path_buf(),
        );

        assert_eq!(exec.execute_with_return("echo from file").unwrap(), Value::from("from file"));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
