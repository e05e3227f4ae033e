//! C5 — Retrace Driver (user coredump).
//!
//! Invokes GDB inside a provisioned environment and splits its output
//! around the fixed delimiters [`environment::gdb_script`] emits, yielding
//! a backtrace plus an optional exploitability verdict.

use retrace_worker_process::{Invocation, run};
use retrace_worker_types::{RetraceDriverError, Task};

use crate::environment::{Backend, EnvironmentHandle};

/// Parsed sections of a GDB batch run driven by `environment::gdb_script`.
pub struct RetraceOutput {
    pub backtrace: String,
    pub exploitable: Option<String>,
}

/// Split raw GDB stdout around the `EXPLOITABLE_SEPARATOR` delimiter: the
/// backtrace is everything before it, the exploitability verdict is
/// whatever follows.
pub fn split_output(raw: &str) -> RetraceOutput {
    match raw.split_once("EXPLOITABLE_SEPARATOR") {
        Some((backtrace, rest)) => RetraceOutput {
            backtrace: backtrace.trim_end().to_string(),
            exploitable: {
                let verdict = rest.trim();
                if verdict.is_empty() {
                    None
                } else {
                    Some(verdict.to_string())
                }
            },
        },
        None => RetraceOutput {
            backtrace: raw.trim_end().to_string(),
            exploitable: None,
        },
    }
}

/// Run GDB against the task's coredump inside `handle`, persist the
/// backtrace (and verdict, when present) onto the task, and return the
/// parsed output.
pub fn run_retrace(
    task: &mut dyn Task,
    handle: &EnvironmentHandle,
    backend: &dyn Backend,
    gdb_script_path: &str,
    coredump_path: &str,
) -> Result<RetraceOutput, RetraceDriverError> {
    let argv = vec![gdb_script_path.to_string(), coredump_path.to_string()];
    let wrapped = backend.wrap_debugger_argv(handle, argv);
    let program = wrapped.first().cloned().unwrap_or_default();
    let rest: Vec<&str> = wrapped[1..].iter().map(String::as_str).collect();

    let output = run(Invocation::new(&program, &rest))
        .map_err(|e| RetraceDriverError::DebuggerFailed(e.to_string()))?;
    if !output.success() {
        return Err(RetraceDriverError::DebuggerFailed(output.stderr.trim().to_string()));
    }

    let parsed = split_output(&output.stdout);
    task.set_backtrace(&parsed.backtrace)?;
    if let Some(verdict) = &parsed.exploitable {
        task.set_result("exploitable", verdict)?;
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_output_separates_backtrace_and_verdict() {
        let raw = "#0 foo()\n#1 bar()\nEXPLOITABLE_SEPARATOR\nNOT_EXPLOITABLE\n";
        let parsed = split_output(raw);
        assert!(parsed.backtrace.contains("#0 foo()"));
        assert_eq!(parsed.exploitable.as_deref(), Some("NOT_EXPLOITABLE"));
    }

    #[test]
    fn split_output_without_separator_has_no_verdict() {
        let parsed = split_output("#0 foo()\n");
        assert!(parsed.exploitable.is_none());
        assert!(parsed.backtrace.contains("foo"));
    }

    #[test]
    fn split_output_empty_verdict_is_none() {
        let parsed = split_output("#0 foo()\nEXPLOITABLE_SEPARATOR\n   \n");
        assert!(parsed.exploitable.is_none());
    }
}
