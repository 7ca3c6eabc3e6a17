//! Execution commands: run, exec, parallel, race and languages.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use polyrun_core::{Block, Dispatcher, EngineConfig, SubprocessSpec, Value};

use crate::colors;
use crate::output::{print_result, print_results};

/// Arguments of `polyrun run`.
pub struct RunRequest {
    pub lang: String,
    pub code: Option<String>,
    pub file: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub args: Vec<String>,
    pub retries: usize,
    pub retry_delay_ms: u64,
    pub json: bool,
}

/// Run one fragment. Returns whether it succeeded.
pub fn execute(config: EngineConfig, request: RunRequest) -> anyhow::Result<bool> {
    let code = match (request.code, &request.file) {
        (Some(code), _) => code,
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("Provide code inline or with --file"),
    };
    let args = parse_args(&request.args)?;

    let dispatcher = Dispatcher::new(config)?;
    let timeout = timeout_or_default(&dispatcher, request.timeout_ms);

    let result = if request.retries > 0 {
        dispatcher.execute_with_retry_language(
            &request.lang,
            &code,
            args,
            request.retries,
            Duration::from_millis(request.retry_delay_ms),
            timeout,
        )?
    } else {
        dispatcher.execute_blocking(&request.lang, &code, args, timeout)?
    };
    print_result(&request.lang, &result, request.json);
    dispatcher.shutdown();

    Ok(result.is_success())
}

/// Run one fragment through an ad-hoc command template.
pub fn exec(
    config: EngineConfig,
    name: &str,
    template: &str,
    ext: &str,
    code: &str,
    timeout_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<bool> {
    let dispatcher = Dispatcher::new(config)?;
    let timeout = timeout_or_default(&dispatcher, timeout_ms);
    let spec = SubprocessSpec::new(name, template, ext);

    let result = dispatcher.execute_subprocess_blocking(spec, code, Vec::new(), timeout)?;
    print_result(name, &result, json);
    dispatcher.shutdown();

    Ok(result.is_success())
}

/// Run every block of a JSON file concurrently. Returns whether all succeeded.
pub fn parallel(
    config: EngineConfig,
    path: &Path,
    timeout_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<bool> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let blocks: Vec<Block> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of blocks", path.display()))?;

    if blocks.is_empty() {
        println!("{}No blocks found.{}", colors::YELLOW, colors::RESET);
        return Ok(true);
    }

    let dispatcher = Dispatcher::new(config)?;
    let timeout = timeout_or_default(&dispatcher, timeout_ms);
    let results = dispatcher.execute_parallel(&blocks, timeout)?;
    print_results("block", &results, json);
    dispatcher.shutdown();

    Ok(results.iter().all(|r| r.is_success()))
}

/// Race fragments in one language.
pub fn race(
    config: EngineConfig,
    lang: &str,
    codes: &[String],
    timeout_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<bool> {
    let blocks: Vec<Block> = codes.iter().map(|code| Block::new(lang, code.as_str())).collect();

    let dispatcher = Dispatcher::new(config)?;
    let timeout = timeout_or_default(&dispatcher, timeout_ms);
    let result = dispatcher.execute_race_blocks(&blocks, timeout)?;
    print_result("race", &result, json);
    dispatcher.shutdown();

    Ok(result.is_success())
}

/// List registered languages and whether their toolchain is on PATH.
pub fn languages(config: EngineConfig) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(config)?;
    let registry = dispatcher.registry();

    println!("{}Languages:{}", colors::BOLD, colors::RESET);
    for tag in registry.languages() {
        let available = registry.resolve(&tag).map(|f| f.is_available()).unwrap_or(false);
        let (color, status) = if available {
            (colors::GREEN, "available")
        } else {
            (colors::DIM, "not found")
        };
        println!("  {:<12} {}{}{}", tag, color, status, colors::RESET);
    }

    dispatcher.shutdown();
    Ok(())
}

fn timeout_or_default(dispatcher: &Dispatcher, timeout_ms: Option<u64>) -> Duration {
    timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| dispatcher.default_timeout())
}

/// Each `--arg` is a JSON document.
fn parse_args(raw: &[String]) -> anyhow::Result<Vec<Value>> {
    raw.iter()
        .map(|arg| {
            serde_json::from_str::<serde_json::Value>(arg)
                .map(Value::from_json)
                .with_context(|| format!("--arg {:?} is not valid JSON", arg))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args_accepts_json() {
        let args = parse_args(&["1".to_string(), "\"two\"".to_string(), "[true]".to_string()])
            .unwrap();
        assert_eq!(
            args,
            vec![
                Value::Int(1),
                Value::from("two"),
                Value::List(vec![Value::Bool(true)])
            ]
        );
    }

    #[test]
    fn test_parse_args_rejects_bare_words() {
        let err = parse_args(&["hello".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }
}
