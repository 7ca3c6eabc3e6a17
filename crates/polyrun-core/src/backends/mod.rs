//! Per-language backends.
//!
//! Every backend implements [`LanguageExecutor`] and is built per unit by an
//! [`ExecutorFactory`]. The dispatcher only ever sees factories; it turns a
//! factory plus source text into a [`CallbackUnit`] with [`make_unit`].
//!
//! # Backends
//!
//! - **Subprocess** - interpreters driven through a command template
//!   (`sh -c {}`, `python3 {}`, ...).
//! - **Compiled** - source compiled with `rustc`/`c++`, cached in the
//!   [`ArtifactCache`](crate::cache::ArtifactCache), then executed.
//!
//! Child processes run in their own process group and are killed as a group
//! once the unit's [`CancelToken`] fires.

mod compiled;
mod subprocess;

pub use compiled::{CompiledExecutor, CompiledFactory, CompiledSpec};
pub use subprocess::{SubprocessExecutor, SubprocessFactory, SubprocessSpec};

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::execute::{CallbackUnit, CancelToken};
use crate::value::{Value, parse_output};

/// Environment variable carrying unit arguments (JSON array) to child processes.
pub const ARGS_ENV: &str = "POLYRUN_ARGS";

/// How often a waiting unit checks its child and its token.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Contract every language backend fulfils.
pub trait LanguageExecutor: Send {
    /// Canonical language tag.
    fn language(&self) -> &str;

    /// Run `code`; `Ok(false)` means it ran but reported failure.
    fn execute(&mut self, code: &str) -> Result<bool>;

    /// Run `code` and convert its output into a [`Value`].
    fn execute_with_return(&mut self, code: &str) -> Result<Value>;

    /// Invoke a named entry point.
    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value>;

    /// Whether the backend's runtime is usable.
    fn is_initialized(&self) -> bool;

    /// Output captured by the most recent run.
    fn captured_output(&self) -> String;
}

/// Whether a factory's units go through the shared thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Registry singleton; units are queued on the shared thread pool.
    Pooled,
    /// Parameterized backend; each unit gets its own executor thread.
    Dedicated,
}

/// Per-unit execution context handed to a factory.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub token: CancelToken,
    pub args: Vec<Value>,
}

impl ExecContext {
    pub fn new(token: CancelToken, args: Vec<Value>) -> Self {
        Self { token, args }
    }

    /// Arguments as the JSON text exported in [`ARGS_ENV`].
    pub fn args_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.args)?)
    }
}

/// Builds [`LanguageExecutor`]s for one language.
pub trait ExecutorFactory: Send + Sync {
    fn language(&self) -> &str;

    fn mode(&self) -> DispatchMode {
        DispatchMode::Pooled
    }

    /// Whether the backend's interpreter or compiler can be found.
    fn is_available(&self) -> bool {
        true
    }

    fn create(&self, ctx: ExecContext) -> Result<Box<dyn LanguageExecutor>>;
}

/// Unit that builds a fresh executor from `factory` and runs `code` with `args`.
pub fn make_unit(factory: Arc<dyn ExecutorFactory>, code: String, args: Vec<Value>) -> CallbackUnit {
    CallbackUnit::new(move |token| {
        token.check()?;
        let mut executor = factory.create(ExecContext::new(token.clone(), args.clone()))?;
        Ok(executor.execute_with_return(&code)?)
    })
}

/// Output of a finished child process.
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// `stdout`, plus a tagged `stderr` section when there is one.
    pub fn combined(&self, language: &str) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n[{} stderr]: {}", self.stdout, language, self.stderr)
        }
    }

    /// Parsed stdout, or a `Backend` error for a non-zero exit.
    pub fn into_value(self, language: &str) -> Result<Value> {
        if !self.status.success() {
            let code = self
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(Error::backend(
                language,
                format!("command failed with code {}: {}", code, self.stderr.trim()),
            ));
        }
        Ok(parse_output(&self.stdout))
    }
}

/// Spawn `program` with `args` and wait for it, honouring `token`.
///
/// The child gets its own process group; on cancellation or deadline the whole
/// group is killed and `Error::Cancelled` is returned. This also covers
/// background processes that keep the output pipes open after the child exits.
pub(crate) fn run_command(
    language: &str,
    program: &str,
    args: &[String],
    envs: &[(&str, String)],
    token: &CancelToken,
) -> Result<CommandOutput> {
    token.check()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Unavailable {
                language: language.to_string(),
                reason: format!("'{}' not found", program),
            }
        } else {
            Error::Io(e)
        }
    })?;

    tracing::debug!("Spawned {} (pid {}) for {}", program, child.id(), language);

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill_process_group(&mut child);
                return Err(Error::Io(e));
            }
        }
        if token.is_cancelled() {
            tracing::debug!("Killing {} (pid {}): cancelled", program, child.id());
            kill_process_group(&mut child);
            let _ = child.wait();
            let _ = stdout.join();
            let _ = stderr.join();
            return Err(Error::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    };

    // Background children may still hold the pipes after the leader exits.
    while !(stdout.is_finished() && stderr.is_finished()) {
        if token.is_cancelled() {
            tracing::debug!("Killing process group of {}: cancelled after exit", program);
            kill_process_group(&mut child);
            let _ = stdout.join();
            let _ = stderr.join();
            return Err(Error::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    }

    Ok(CommandOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        // SIGKILL the group so interpreters' own children go too.
        unsafe {
            libc::kill(-(child.id() as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
}

/// Whether `program` resolves on `PATH` (or is an existing path).
pub(crate) fn program_available(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Scratch file removed on drop.
#[derive(Debug)]
pub(crate) struct TempFile {
    path: PathBuf,
}

impl TempFile {
    /// Unique path in `dir` with `extension` (e.g. `.py`), not yet created.
    pub fn reserve(dir: &Path, extension: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let name = format!("polyrun-{}{}", uuid::Uuid::new_v4().simple(), extension);
        Ok(Self {
            path: dir.join(name),
        })
    }

    /// Unique file in `dir` containing `contents`.
    pub fn write(dir: &Path, extension: &str, contents: &str) -> Result<Self> {
        let file = Self::reserve(dir, extension)?;
        fs::write(&file.path, contents)?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::debug!("Failed to remove temp file {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_file_removed_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = {
            let file = TempFile::write(temp.path(), ".py", "print(1)").unwrap();
            assert!(file.path().exists());
            assert_eq!(file.path().extension().unwrap(), "py");
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_args_json() {
        let ctx = ExecContext::new(CancelToken::new(), vec![Value::Int(1), Value::from("a")]);
        assert_eq!(ctx.args_json().unwrap(), r#"[1,"a"]"#);
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let err = run_command(
            "ghost",
            "polyrun-definitely-missing-binary",
            &[],
            &[],
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
    }

    #[test]
    fn test_cancelled_token_skips_spawn() {
        let token = CancelToken::new();
        token.cancel();
        let err = run_command("shell", "sh", &[], &[], &token).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_captures_output() {
        let out = run_command(
            "shell",
            "sh",
            &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            &[],
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.status.code(), Some(3));
        assert!(out.combined("shell").contains("[shell stderr]: err"));

        let err = out.into_value("shell").unwrap_err();
        assert!(err.to_string().contains("command failed with code 3: err"));
    }

    #[cfg(unix)]
    #[test]
    fn test_deadline_kills_child() {
        let token = CancelToken::with_deadline(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let err = run_command(
            "shell",
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            &[],
            &token,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_deadline_kills_background_children() {
        let token = CancelToken::with_deadline(Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = run_command(
            "shell",
            "sh",
            &["-c".to_string(), "sleep 4 & echo hi".to_string()],
            &[],
            &token,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_background_output_is_collected() {
        let out = run_command(
            "shell",
            "sh",
            &["-c".to_string(), "(sleep 0.1; echo late) & echo early".to_string()],
            &[],
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.stdout, "early\nlate\n");
    }
}
