//! `Reporter` implementations.
//!
//! The worker carries no global logging framework (the teacher codebase
//! this crate is grounded on carries none either); instead every
//! loud/quiet decision goes through the small [`Reporter`] trait. Two
//! implementors are provided: [`TaskLogger`], which formats records into a
//! per-task log file the way the upstream worker's `begin_logging` /
//! `end_logging` pair does, and [`CliReporter`], which writes to stderr
//! for operator-facing CLI runs.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use retrace_worker_types::Reporter;

/// File-backed per-task logger. Format: `[<timestamp>] [<level>] <message>`.
pub struct TaskLogger {
    path: PathBuf,
    file: Option<File>,
}

impl TaskLogger {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    /// Open the log file for appending. Idempotent.
    pub fn begin_logging(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening log file {}", self.path.display()))?;
        self.file = Some(file);
        Ok(())
    }

    /// Close the log file. Idempotent.
    pub fn end_logging(&mut self) {
        self.file = None;
    }

    fn write_record(&mut self, level: char, msg: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(file, "[{timestamp}] [{level}] {msg}");
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Reporter for TaskLogger {
    fn info(&mut self, msg: &str) {
        self.write_record('I', msg);
    }
    fn warn(&mut self, msg: &str) {
        self.write_record('W', msg);
    }
    fn error(&mut self, msg: &str) {
        self.write_record('E', msg);
    }
}

/// Operator-facing reporter for the CLI binary.
#[derive(Default)]
pub struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }
    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }
    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}
