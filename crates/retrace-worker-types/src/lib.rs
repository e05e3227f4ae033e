//! # Types
//!
//! Core domain types for the retrace worker: task descriptors, releases,
//! kernel versions, crash statistics, and the error enum returned by the
//! pipeline.
//!
//! ## Modules
//!
//! - [`Task`] / [`TaskType`] / [`TaskStatus`] — the per-task state contract
//! - [`Release`] / [`KernelVer`] — distribution/version/arch identification
//! - [`StatsRecord`] — the crash-statistics row accumulated across a run
//! - [`Reporter`] — the worker's logging seam (no global logger)
//! - [`WorkerError`] — the typed error surfaced by a failed task
//!
//! ## Stability
//!
//! These types are considered stable unless otherwise noted.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of crash artifact a task carries, and how it should be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Userspace coredump, non-interactive.
    Retrace,
    /// Userspace coredump, keeps the environment around for operator use.
    RetraceInteractive,
    /// Like `Retrace` but skips cleanup for local debugging.
    Debug,
    /// Kernel vmcore, non-interactive.
    Vmcore,
    /// Kernel vmcore, keeps the environment around for operator use.
    VmcoreInteractive,
}

impl TaskType {
    /// Whether this task type is a vmcore (kernel) pipeline as opposed to a
    /// userspace coredump pipeline.
    pub fn is_vmcore(self) -> bool {
        matches!(self, TaskType::Vmcore | TaskType::VmcoreInteractive)
    }

    /// Whether `clean_task` should be skipped for this task type on both the
    /// success and failure paths (interactive/debug task types retain their
    /// artifacts for operator inspection).
    pub fn skips_cleanup(self) -> bool {
        matches!(
            self,
            TaskType::Debug | TaskType::RetraceInteractive | TaskType::VmcoreInteractive
        )
    }

    /// The fixed set of crash-directory files required before the pipeline
    /// may begin, keyed by task type.
    pub fn required_files(self) -> &'static [&'static str] {
        match self {
            TaskType::Retrace | TaskType::RetraceInteractive | TaskType::Debug => {
                &["coredump", "package", "executable"]
            }
            TaskType::Vmcore | TaskType::VmcoreInteractive => &["vmcore"],
        }
    }
}

/// Status phases a task moves through. Transitions are monotonic along
/// `Init -> Analyze -> Backtrace -> Cleanup -> Stats -> Success`, or may
/// shortcut to `Fail` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskStatus {
    Init,
    Analyze,
    Backtrace,
    Cleanup,
    Stats,
    Success,
    Fail,
}

impl TaskStatus {
    /// The documented ordering, terminal states last. Used by tests to
    /// assert that observed statuses form a prefix of this sequence (or end
    /// in `Fail`).
    pub const ORDER: [TaskStatus; 6] = [
        TaskStatus::Init,
        TaskStatus::Analyze,
        TaskStatus::Backtrace,
        TaskStatus::Cleanup,
        TaskStatus::Stats,
        TaskStatus::Success,
    ];
}

/// Suffixes recognised as flattened/compressed vmcore snapshots; a required
/// file named `vmcore` is also satisfied by `vmcore.<suffix>`.
pub const VMCORE_SNAPSHOT_SUFFIXES: &[&str] = &["flattened", "gz", "xz", "zst"];

/// Byte caps applied when reading small crash-directory metadata files.
pub fn allowed_file_cap(file: &str) -> Option<u64> {
    match file {
        "package" => Some(256),
        "executable" => Some(4096),
        "rootdir" => Some(4096),
        "os_release" | "os_release_in_rootdir" | "release" => Some(4096),
        _ => None,
    }
}

/// A resolved distribution/version/architecture/release-name tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub distribution: String,
    pub version: String,
    pub architecture: String,
    pub release_name: String,
    pub is_rawhide: bool,
    /// Numeric version preceding a rawhide remap, retained for GPG-key
    /// fallback lookups. `None` unless `is_rawhide` is true.
    pub pre_rawhide_version: Option<String>,
}

impl Release {
    /// `distribution-version-architecture`, used as repo id and image tag
    /// suffix.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.distribution, self.version, self.architecture)
    }
}

/// A parsed kernel-release identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelVer {
    pub release: String,
    pub architecture: String,
}

impl KernelVer {
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.release, self.architecture)
    }
}

/// Mutable crash-statistics record accumulated across a run and persisted
/// via `retrace_worker::stats::CrashStatsStore`. The `rootsize` field is
/// carried for compatibility but always written as 0 (see DESIGN.md).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsRecord {
    pub taskid: u64,
    pub package: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub starttime: Option<i64>,
    pub duration: Option<i64>,
    pub coresize: Option<u64>,
    pub status: TaskStatus,
}

impl StatsRecord {
    pub fn new(taskid: u64, starttime: i64) -> Self {
        Self {
            taskid,
            starttime: Some(starttime),
            status: TaskStatus::Fail,
            ..Default::default()
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Init
    }
}

/// The worker's logging seam. One implementor is file-backed (per task),
/// another writes to the CLI's stderr; there is no global logging
/// framework underneath either.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A `Reporter` that discards everything; useful in tests that don't care
/// about log output.
#[derive(Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Narrow trait over the external task-storage surface. A `Task` owns a
/// save directory, a crash subdirectory, and a handful of named file slots;
/// the worker reads crash inputs and writes results/log/crashrc through
/// this trait rather than assuming a particular storage engine.
pub trait Task {
    fn taskid(&self) -> u64;
    fn task_type(&self) -> TaskType;
    fn save_dir(&self) -> &Path;
    fn crash_dir(&self) -> PathBuf {
        self.save_dir().join("crash")
    }
    fn results_dir(&self) -> PathBuf {
        self.save_dir().join("results")
    }
    fn log_path(&self) -> PathBuf {
        self.save_dir().join("retrace.log")
    }

    fn status(&self) -> TaskStatus;
    fn set_status(&mut self, status: TaskStatus);

    fn started_at(&self) -> Option<i64>;
    fn set_started_at(&mut self, ts: i64);
    fn finished_at(&self) -> Option<i64>;
    fn set_finished_at(&mut self, ts: i64);

    /// Recipients to notify, if notification was requested for this task.
    fn notify_list(&self) -> &[String];
    fn has_notify(&self) -> bool {
        !self.notify_list().is_empty()
    }

    fn url(&self) -> Option<&str>;
    fn remote_files(&self) -> &[String];

    fn md5sum(&self) -> Option<&str>;
    fn set_md5sum(&mut self, md5: String);

    /// Crash command override (vmcore pipelines may append `--minimal`
    /// here on a degraded run so future invocations on this task reuse it).
    fn crash_cmd(&self) -> Option<&str>;
    fn set_crash_cmd(&mut self, cmd: String);

    fn custom_executable(&self) -> Option<&str> {
        None
    }
    fn custom_package(&self) -> Option<&str> {
        None
    }
    fn custom_os_release(&self) -> Option<&str> {
        None
    }

    /// Best-effort remote download of any `remote_files`/`url` content into
    /// the crash directory. Individual failures are the caller's concern
    /// to log; this returns per-file errors rather than failing outright.
    fn download_remote(&self) -> Vec<(String, io::Result<()>)> {
        Vec::new()
    }

    fn set_backtrace(&mut self, text: &str) -> io::Result<()> {
        fs::create_dir_all(self.results_dir())?;
        fs::write(self.results_dir().join("backtrace"), text)
    }

    fn set_result(&mut self, key: &str, text: &str) -> io::Result<()> {
        fs::create_dir_all(self.results_dir())?;
        fs::write(self.results_dir().join(key), text)
    }

    fn set_crashrc(&mut self, text: &str) -> io::Result<()> {
        fs::write(self.save_dir().join("crashrc"), text)
    }

    /// Remove this task's persisted save directory. A separate top-level
    /// operation from the pipeline driven by `start()`: it is invoked by
    /// retention sweeps or an explicit operator command, never from a
    /// running task.
    fn remove(&mut self) -> io::Result<()> {
        match fs::remove_dir_all(self.save_dir()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A filesystem-backed `Task` implementation, suitable for the CLI and for
/// tests. Lays out the same file slots the external task store documents.
#[derive(Debug, Clone)]
pub struct FsTask {
    pub taskid: u64,
    pub task_type: TaskType,
    pub save_dir: PathBuf,
    pub status: TaskStatus,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub notify: Vec<String>,
    pub url: Option<String>,
    pub remote_files: Vec<String>,
    pub md5sum: Option<String>,
    pub crash_cmd: Option<String>,
    pub custom_executable: Option<String>,
    pub custom_package: Option<String>,
    pub custom_os_release: Option<String>,
}

impl FsTask {
    pub fn new(taskid: u64, task_type: TaskType, save_dir: PathBuf) -> Self {
        Self {
            taskid,
            task_type,
            save_dir,
            status: TaskStatus::Init,
            started_at: None,
            finished_at: None,
            notify: Vec::new(),
            url: None,
            remote_files: Vec::new(),
            md5sum: None,
            crash_cmd: None,
            custom_executable: None,
            custom_package: None,
            custom_os_release: None,
        }
    }
}

impl Task for FsTask {
    fn taskid(&self) -> u64 {
        self.taskid
    }
    fn task_type(&self) -> TaskType {
        self.task_type
    }
    fn save_dir(&self) -> &Path {
        &self.save_dir
    }
    fn status(&self) -> TaskStatus {
        self.status
    }
    fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }
    fn started_at(&self) -> Option<i64> {
        self.started_at
    }
    fn set_started_at(&mut self, ts: i64) {
        self.started_at = Some(ts);
    }
    fn finished_at(&self) -> Option<i64> {
        self.finished_at
    }
    fn set_finished_at(&mut self, ts: i64) {
        self.finished_at = Some(ts);
    }
    fn notify_list(&self) -> &[String] {
        &self.notify
    }
    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
    fn remote_files(&self) -> &[String] {
        &self.remote_files
    }
    fn md5sum(&self) -> Option<&str> {
        self.md5sum.as_deref()
    }
    fn set_md5sum(&mut self, md5: String) {
        self.md5sum = Some(md5);
    }
    fn crash_cmd(&self) -> Option<&str> {
        self.crash_cmd.as_deref()
    }
    fn set_crash_cmd(&mut self, cmd: String) {
        self.crash_cmd = Some(cmd);
    }
    fn custom_executable(&self) -> Option<&str> {
        self.custom_executable.as_deref()
    }
    fn custom_package(&self) -> Option<&str> {
        self.custom_package.as_deref()
    }
    fn custom_os_release(&self) -> Option<&str> {
        self.custom_os_release.as_deref()
    }
}

/// Errors surfaced by individual pipeline components. These compose into
/// [`WorkerError`] at the lifecycle boundary.
#[derive(Debug, Error)]
pub enum CrashInputError {
    #[error("required file missing: {0}")]
    MissingFile(String),
    #[error("file too large: {0}")]
    TooLarge(String),
    #[error("malformed package name: {0:?}")]
    MalformedPackage(String),
    #[error("unknown release")]
    UnknownRelease,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("environment build failed: {0}")]
    BuildFailed(String),
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RetraceDriverError {
    #[error("debugger invocation failed: {0}")]
    DebuggerFailed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum VmcoreError {
    #[error("vmcore missing")]
    Missing,
    #[error("kernel version could not be resolved")]
    UnknownKernelVersion,
    #[error("small kernellog size = {0} bytes")]
    SmallKernelLog(usize),
    #[error("debuginfo preparation failed: {0}")]
    DebuginfoFailed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    CrashInput(#[from] CrashInputError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Retrace(#[from] RetraceDriverError),
    #[error(transparent)]
    Vmcore(#[from] VmcoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// The error surfaced out of a failed task run, carrying the same integer
/// error code contract the pipeline's fail path guarantees.
#[derive(Debug, Error)]
#[error("retrace worker task {taskid} failed: {source}")]
pub struct RetraceWorkerError {
    pub taskid: u64,
    pub errorcode: i32,
    #[source]
    pub source: LifecycleError,
}

/// Two-section output of a `coredump2packages` run: required packages and
/// unresolved `(soname, build_id)` pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageResolution {
    pub packages: Vec<String>,
    pub missing: Vec<(String, String)>,
}

/// A strategy describing how to analyse crashes for one distribution
/// (§9: tagged strategy replacing a dynamic plugin registry).
#[derive(Debug, Clone)]
pub struct ReleaseStrategy {
    pub distribution: &'static str,
    /// Patterns matched against release-file contents, e.g. `r"Fedora release (\d+|Rawhide)"`.
    pub release_patterns: &'static [&'static str],
    /// Patterns matched against a package NVR when release files are absent.
    pub package_patterns: &'static [&'static str],
    /// GPG key URL templates containing a `{version}` placeholder.
    pub gpg_key_templates: &'static [&'static str],
    pub gdb_binary: &'static str,
    pub gdb_package: &'static str,
}

/// Which isolation technology provisions the analysis environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentBackend {
    Mock,
    Podman,
    Native,
}

/// Map of extra metadata the results bag accumulates besides backtrace/sys.
pub type ResultsBag = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_id_format() {
        let r = Release {
            distribution: "fedora".into(),
            version: "38".into(),
            architecture: "x86_64".into(),
            release_name: "Fedora release 38".into(),
            is_rawhide: false,
            pre_rawhide_version: None,
        };
        assert_eq!(r.id(), "fedora-38-x86_64");
    }

    #[test]
    fn status_order_is_monotonic_prefix() {
        assert_eq!(TaskStatus::ORDER[0], TaskStatus::Init);
        assert_eq!(*TaskStatus::ORDER.last().unwrap(), TaskStatus::Success);
    }

    #[test]
    fn required_files_vmcore_vs_retrace() {
        assert_eq!(TaskType::Vmcore.required_files(), &["vmcore"]);
        assert!(TaskType::Retrace.required_files().contains(&"coredump"));
    }

    #[test]
    fn skips_cleanup_only_for_interactive_and_debug() {
        assert!(TaskType::Debug.skips_cleanup());
        assert!(TaskType::RetraceInteractive.skips_cleanup());
        assert!(!TaskType::Retrace.skips_cleanup());
    }

    #[test]
    fn fs_task_default_slots() {
        let t = FsTask::new(1, TaskType::Retrace, PathBuf::from("/tmp/x"));
        assert_eq!(t.crash_dir(), PathBuf::from("/tmp/x/crash"));
        assert_eq!(t.results_dir(), PathBuf::from("/tmp/x/results"));
        assert!(!t.has_notify());
    }
}
