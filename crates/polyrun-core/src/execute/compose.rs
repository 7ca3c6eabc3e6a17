//! Retry, parallel fan-out and race over unit executors.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Select;

use crate::audit::AuditSink;

use super::handle::ResultHandle;
use super::result::{CallbackUnit, ErrorKind, ExecutionResult};
use super::unit::UnitExecutor;

/// Run `unit` until it succeeds, at most `max_retries + 1` times.
///
/// Each attempt gets a fresh [`UnitExecutor`] bounded by `timeout`; failed
/// attempts are followed by a `retry_delay` sleep.
pub fn execute_with_retry(
    unit: &CallbackUnit,
    name: &str,
    max_retries: usize,
    retry_delay: Duration,
    timeout: Duration,
    audit: &Arc<dyn AuditSink>,
) -> ExecutionResult {
    let started = Instant::now();
    let total = max_retries + 1;

    for attempt in 1..=total {
        let exec = UnitExecutor::with_audit(unit.clone(), name, timeout, Arc::clone(audit));
        let result = exec.execute_blocking();

        if result.is_success() {
            audit.log_block_execute(
                name,
                "retry",
                &format!("'{}' succeeded after {} attempts", name, attempt),
            );
            return result;
        }

        if attempt < total {
            audit.log_block_execute(
                name,
                "retry",
                &format!(
                    "'{}' failed (attempt {}/{}), retrying in {}ms",
                    name,
                    attempt,
                    total,
                    retry_delay.as_millis()
                ),
            );
            thread::sleep(retry_delay);
        }
    }

    audit.log_security_violation(&format!(
        "async_callback_retry_exhausted: '{}' failed after {} attempts",
        name, total
    ));
    ExecutionResult::failure(
        ErrorKind::RetryExhausted,
        format!("All {} retry attempts failed", total),
        started.elapsed(),
    )
}

/// Start every unit, then collect results in input order.
///
/// Unit `i` is named `group[i]`. A failing unit never affects its siblings.
pub fn execute_parallel(
    units: Vec<CallbackUnit>,
    group: &str,
    timeout: Duration,
    audit: &Arc<dyn AuditSink>,
) -> Vec<ExecutionResult> {
    let count = units.len();
    let handles = start_all(units, group, timeout, audit);
    let results = join_in_order(handles);

    audit.log_block_execute(
        group,
        "parallel",
        &format!("Parallel group '{}' completed ({} callbacks)", group, count),
    );
    results
}

/// Wait on handles in order, regardless of completion order.
pub(crate) fn join_in_order(handles: Vec<ResultHandle>) -> Vec<ExecutionResult> {
    handles.into_iter().map(ResultHandle::join).collect()
}

/// Start every unit and return the first successful result.
///
/// Failed finishers are skipped. Once a winner is found the remaining units
/// are abandoned, not cancelled. If nothing succeeds within `timeout` (or
/// every unit has already failed) the outcome is a `RaceTimeoutException`.
/// A zero `timeout` waits until a unit succeeds or all have failed.
pub fn execute_race(
    units: Vec<CallbackUnit>,
    group: &str,
    timeout: Duration,
    audit: &Arc<dyn AuditSink>,
) -> ExecutionResult {
    if units.is_empty() {
        return ExecutionResult::failure(
            ErrorKind::EmptyRace,
            "No callbacks provided to race",
            Duration::ZERO,
        );
    }

    let handles = start_all(units, group, timeout, audit);
    race_handles(handles, group, timeout, audit.as_ref())
}

/// First successful result among `handles`.
fn race_handles(
    handles: Vec<ResultHandle>,
    group: &str,
    timeout: Duration,
    audit: &dyn AuditSink,
) -> ExecutionResult {
    if handles.is_empty() {
        return ExecutionResult::failure(
            ErrorKind::EmptyRace,
            "No callbacks provided to race",
            Duration::ZERO,
        );
    }

    let started = Instant::now();
    let deadline = (!timeout.is_zero()).then(|| started + timeout);
    let mut pending: Vec<(usize, ResultHandle)> = handles.into_iter().enumerate().collect();

    while !pending.is_empty() {
        let ready = {
            let mut select = Select::new();
            for (_, handle) in &pending {
                select.recv(handle.receiver());
            }
            match deadline {
                Some(deadline) => select.ready_deadline(deadline).ok(),
                None => Some(select.ready()),
            }
        };
        let Some(ready) = ready else {
            break;
        };

        // A disconnected channel is also "ready"; try_take reports it as lost.
        let (index, handle) = pending.swap_remove(ready);
        match handle.try_take() {
            Ok(Some(result)) if result.is_success() => {
                audit.log_block_execute(
                    group,
                    "race",
                    &format!("Race group '{}' won by callback {}", group, index),
                );
                return result;
            }
            Ok(Some(result)) => {
                tracing::debug!(
                    "Race participant {}[{}] failed: {}",
                    group,
                    index,
                    result.error_message()
                );
            }
            Ok(None) => pending.push((index, handle)),
            Err(_) => {}
        }
    }

    let elapsed = started.elapsed();
    audit.log_security_violation(&format!(
        "async_race_timeout: Race group '{}' timed out after {}ms",
        group,
        elapsed.as_millis()
    ));
    ExecutionResult::failure(
        ErrorKind::RaceTimeout,
        format!("Race timed out after {}ms", elapsed.as_millis()),
        elapsed,
    )
}

fn start_all(
    units: Vec<CallbackUnit>,
    group: &str,
    timeout: Duration,
    audit: &Arc<dyn AuditSink>,
) -> Vec<ResultHandle> {
    units
        .into_iter()
        .enumerate()
        .map(|(i, unit)| {
            UnitExecutor::with_audit(unit, format!("{}[{}]", group, i), timeout, Arc::clone(audit))
                .execute_async()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAudit, default_sink};
    use crate::execute::UnitError;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delayed(ms: u64, value: i64) -> CallbackUnit {
        CallbackUnit::new(move |_| {
            thread::sleep(Duration::from_millis(ms));
            Ok(Value::Int(value))
        })
    }

    fn failing(ms: u64) -> CallbackUnit {
        CallbackUnit::new(move |_| {
            thread::sleep(Duration::from_millis(ms));
            Err(UnitError::foreign("RuntimeError", "nope"))
        })
    }

    #[test]
    fn test_retry_succeeds_on_third_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let unit = CallbackUnit::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(UnitError::foreign("RuntimeError", "flaky"))
            } else {
                Ok(Value::from("ok"))
            }
        });

        let result = execute_with_retry(
            &unit,
            "flaky",
            3,
            Duration::from_millis(1),
            Duration::from_secs(1),
            &default_sink(),
        );
        assert!(result.is_success());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_exhausted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let unit = CallbackUnit::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(UnitError::foreign("RuntimeError", "always"))
        });

        let audit: Arc<dyn AuditSink> = Arc::new(MemoryAudit::new());
        let result = execute_with_retry(
            &unit,
            "doomed",
            2,
            Duration::from_millis(1),
            Duration::from_secs(1),
            &audit,
        );
        assert_eq!(result.error_kind(), "RetryExhaustedException");
        assert_eq!(result.error_message(), "All 3 retry attempts failed");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parallel_preserves_order() {
        let units = vec![delayed(60, 0), delayed(5, 1), failing(20), delayed(30, 3)];
        let results = execute_parallel(units, "group", Duration::from_secs(2), &default_sink());

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].value(), Some(&Value::Int(0)));
        assert_eq!(results[1].value(), Some(&Value::Int(1)));
        assert_eq!(results[2].error_kind(), "RuntimeError");
        assert_eq!(results[3].value(), Some(&Value::Int(3)));
    }

    #[test]
    fn test_parallel_empty() {
        let results = execute_parallel(Vec::new(), "none", Duration::ZERO, &default_sink());
        assert!(results.is_empty());
    }

    #[test]
    fn test_race_skips_early_failure() {
        let units = vec![failing(5), delayed(40, 2), delayed(400, 3)];
        let result = execute_race(units, "race", Duration::from_secs(2), &default_sink());
        assert_eq!(result.value(), Some(&Value::Int(2)));
    }

    #[test]
    fn test_race_empty() {
        let result = execute_race(Vec::new(), "race", Duration::from_secs(1), &default_sink());
        assert_eq!(result.error_kind(), "EmptyRaceException");
        assert_eq!(result.error_message(), "No callbacks provided to race");
    }

    #[test]
    fn test_race_times_out() {
        let units = vec![delayed(500, 1), delayed(500, 2)];
        let started = Instant::now();
        let result = execute_race(units, "slow", Duration::from_millis(50), &default_sink());

        assert_eq!(result.error_kind(), "RaceTimeoutException");
        assert!(result.error_message().starts_with("Race timed out after"));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_race_all_failed() {
        let units = vec![failing(5), failing(10)];
        let result = execute_race(units, "losers", Duration::from_secs(5), &default_sink());
        assert_eq!(result.error_kind(), "RaceTimeoutException");
    }
}
