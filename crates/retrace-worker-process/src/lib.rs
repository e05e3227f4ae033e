//! Subprocess execution helpers for the retrace worker.
//!
//! Every external tool the worker shells out to (`mock`, `podman`, `gdb`,
//! `crash`, `makedumpfile`, `coredump2packages`, `sendmail`) goes through
//! [`run`], which captures stdout/stderr, optionally feeds stdin, and
//! supports an optional wall-clock timeout.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Captured result of running an external command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was killed (timeout).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn ok(&self) -> Result<&Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {}: {}",
                self.exit_code,
                self.stderr.trim()
            ))
        }
    }
}

/// Everything needed to invoke an external tool.
pub struct Invocation<'a> {
    pub program: &'a str,
    pub args: &'a [&'a str],
    pub working_dir: Option<&'a Path>,
    pub stdin: Option<&'a [u8]>,
    pub timeout: Option<Duration>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a str, args: &'a [&'a str]) -> Self {
        Self {
            program,
            args,
            working_dir: None,
            stdin: None,
            timeout: None,
        }
    }

    pub fn in_dir(mut self, dir: &'a Path) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Feed `stdin` as text.
    pub fn with_stdin(mut self, stdin: &'a str) -> Self {
        self.stdin = Some(stdin.as_bytes());
        self
    }

    /// Feed `stdin` as raw bytes, for tools (e.g. `makedumpfile`) that
    /// consume binary data — text-only `with_stdin` would corrupt it via
    /// lossy UTF-8 conversion.
    pub fn with_stdin_bytes(mut self, stdin: &'a [u8]) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Run a command to completion, capturing output.
///
/// Polling (rather than a blocking `wait`) is used so an optional timeout
/// can kill the child; the worker pipeline itself always passes
/// `timeout: None` (external subprocesses may legitimately run for a long
/// time), but the CLI and tests rely on the timeout path.
pub fn run(inv: Invocation<'_>) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut command = Command::new(inv.program);
    command.args(inv.args);
    if let Some(dir) = inv.working_dir {
        command.current_dir(dir);
    }
    command
        .stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {}", inv.program))?;

    if let Some(input) = inv.stdin {
        if let Some(mut pipe) = child.stdin.take() {
            let _ = pipe.write_all(input);
        }
    }

    let Some(timeout) = inv.timeout else {
        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for command: {}", inv.program))?;
        return Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
            duration: start.elapsed(),
        });
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {}", inv.program))?
        {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\n{} timed out after {}",
                        inv.program,
                        humantime::format_duration(timeout)
                    ));
                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Check whether a program exists in `PATH`.
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}
