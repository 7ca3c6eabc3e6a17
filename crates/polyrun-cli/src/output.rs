//! Result formatting for terminal display.

use polyrun_core::ExecutionResult;

use crate::colors;

/// Print one execution result.
///
/// Successful values go to stdout, indented under a `label` header. Failures
/// go to stderr with their error kind. With `json`, the result record is
/// printed as a single JSON line on stdout either way.
pub fn print_result(label: &str, result: &ExecutionResult, json: bool) {
    if json {
        println!("{}", result.to_json());
        return;
    }

    let elapsed = format!("{}ms", result.elapsed().as_millis());
    if let Some(value) = result.value() {
        println!(
            "{}{}:{} {}{} {}{}",
            colors::CYAN,
            label,
            colors::RESET,
            colors::DIM,
            value.type_name(),
            elapsed,
            colors::RESET
        );
        for line in value.to_string().lines() {
            println!("  {}", line);
        }
    } else if result.is_success() {
        println!(
            "{}{}:{} {}(no value) {}{}",
            colors::CYAN,
            label,
            colors::RESET,
            colors::DIM,
            elapsed,
            colors::RESET
        );
    } else {
        eprintln!(
            "{}{} failed{} {}[{}]{} {}",
            colors::RED,
            label,
            colors::RESET,
            colors::YELLOW,
            result.error_kind(),
            colors::RESET,
            result.error_message()
        );
    }
}

/// Print several results in order, followed by a one-line summary.
pub fn print_results(group: &str, results: &[ExecutionResult], json: bool) {
    if json {
        let records: Vec<_> = results.iter().map(ExecutionResult::to_json).collect();
        println!("{}", serde_json::Value::Array(records));
        return;
    }

    for (i, result) in results.iter().enumerate() {
        print_result(&format!("{}[{}]", group, i), result, false);
    }

    let failed = results.iter().filter(|r| !r.is_success()).count();
    let color = if failed == 0 { colors::GREEN } else { colors::RED };
    println!(
        "\n{}Completed{} {} blocks, {}{} failed{}",
        color,
        colors::RESET,
        results.len(),
        colors::BOLD,
        failed,
        colors::RESET
    );
}
