//! C8 — Task Lifecycle.
//!
//! Drives the documented status DAG (`Init -> Analyze -> Backtrace ->
//! Cleanup -> Stats -> Success`, or a shortcut to `Fail`), owning hook
//! dispatch, per-task logging, failure semantics, e-mail notification, and
//! statistics persistence. This module composes C1-C7 but does not
//! reimplement them.

use retrace_worker_types::{
    LifecycleError, Reporter, RetraceWorkerError, StatsRecord, Task, TaskStatus, TaskType,
};

use crate::email::notify_email;
use crate::logging::TaskLogger;
use crate::stats::CrashStatsStore;

/// Fixed hook names invoked in sequence around the pipeline (§4.8). A
/// failing hook must not mask a pipeline outcome; implementors should log
/// and continue rather than propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    PreStart,
    Start,
    PrePrepareDebuginfo,
    PostPrepareDebuginfo,
    PrePrepareEnvironment,
    PostPrepareEnvironment,
    PreRetrace,
    PostRetrace,
    Success,
    Fail,
    PreCleanTask,
    PostCleanTask,
    PreRemoveTask,
    PostRemoveTask,
}

/// Dispatch point for hooks. The default implementation is a no-op;
/// callers wire up whatever side channel (metrics, audit log, cleanup)
/// they need.
pub trait HookDispatcher {
    fn dispatch(&mut self, _hook: Hook, _task: &dyn Task) {}
}

/// A `HookDispatcher` that does nothing, for callers with no extension
/// points registered.
#[derive(Default)]
pub struct NullHooks;
impl HookDispatcher for NullHooks {}

/// Count of tasks active right now, excluding the one currently starting —
/// `prerunning` in §4.8's `start()`.
pub fn prerunning_count(active_task_count: i64) -> i64 {
    active_task_count - 1
}

/// Drive a task's stats record to the `Fail` terminal state: set status,
/// finished time, `duration`, and return the record ready for persistence.
/// Mirrors §4.8's fail path field-filling (everything except the actual
/// side effects, which the caller sequences per its own I/O boundary).
pub fn finalize_fail_stats(mut record: StatsRecord, finished_at: i64) -> StatsRecord {
    record.status = TaskStatus::Fail;
    if let Some(started) = record.starttime {
        record.duration = Some(finished_at - started);
    }
    record
}

pub fn finalize_success_stats(mut record: StatsRecord, finished_at: i64) -> StatsRecord {
    record.status = TaskStatus::Success;
    if let Some(started) = record.starttime {
        record.duration = Some(finished_at - started);
    }
    record
}

/// Remove a task's persisted save directory, dispatching the surrounding
/// hooks. Unlike `Run::execute`, this is its own top-level operation —
/// retention sweeps and explicit operator removal call it directly rather
/// than going through the pipeline.
pub fn remove_task(task: &mut dyn Task, hooks: &mut dyn HookDispatcher) -> std::io::Result<()> {
    hooks.dispatch(Hook::PreRemoveTask, task);
    task.remove()?;
    hooks.dispatch(Hook::PostRemoveTask, task);
    Ok(())
}

/// Symlink the task's log file into its results directory as
/// `retrace-log`. Mirrors `_symlink_log`: `AlreadyExists` is swallowed,
/// any other I/O error propagates.
pub fn symlink_log(log_path: &std::path::Path, results_dir: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(results_dir)?;
    let link = results_dir.join("retrace-log");
    match std::os::unix::fs::symlink(log_path, &link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// What `notify_email` needs beyond the task itself. Carried on `Run`
/// rather than threaded through the pipeline closure, since every task
/// type sends the same way regardless of which C1-C7 steps it ran.
pub struct EmailConfig {
    pub enabled: bool,
    pub sendmail_bin: String,
    pub hostname: String,
    pub from: String,
    pub repo_dir: String,
}

/// Drive a task to completion. Callers supply everything environment- and
/// backend-specific (C1-C7 outputs) via `pipeline`; this function owns
/// only the status DAG, hooks, and the logging/notification/stats
/// bookkeeping the lifecycle contract requires.
pub struct Run<'a> {
    pub task: &'a mut dyn Task,
    pub logger: &'a mut TaskLogger,
    pub hooks: &'a mut dyn HookDispatcher,
    pub stats: &'a mut dyn CrashStatsStore,
    pub email: &'a EmailConfig,
}

impl<'a> Run<'a> {
    /// Execute `pipeline`, translating its `Result` into the documented
    /// status transitions, logging, hook dispatch, and stats persistence.
    /// `now` supplies the current epoch-seconds timestamp (injected rather
    /// than read from the clock, so callers can test deterministically).
    /// `active_task_count` is the number of tasks active right now,
    /// including this one.
    pub fn execute<F>(
        &mut self,
        now: impl Fn() -> i64,
        active_task_count: i64,
        pipeline: F,
    ) -> Result<(), RetraceWorkerError>
    where
        F: FnOnce(
            &mut dyn Task,
            &mut TaskLogger,
            &mut dyn HookDispatcher,
        ) -> Result<PipelineOutcome, LifecycleError>,
    {
        self.logger.begin_logging().ok();
        self.hooks.dispatch(Hook::PreStart, self.task);

        let start_ts = now();
        self.task.set_started_at(start_ts);
        self.task.set_status(TaskStatus::Analyze);

        self.hooks.dispatch(Hook::Start, self.task);

        let mut record = StatsRecord::new(self.task.taskid(), start_ts);
        record.status = TaskStatus::Fail;

        match pipeline(self.task, self.logger, self.hooks) {
            Ok(outcome) => {
                self.task.set_status(TaskStatus::Cleanup);
                self.task.set_status(TaskStatus::Stats);

                let finished_ts = now();
                self.task.set_finished_at(finished_ts);

                record.package = outcome.package.clone();
                record.version = outcome.version.clone();
                record.arch = outcome.arch.clone();
                record.coresize = outcome.coresize;
                let record = finalize_success_stats(record, finished_ts);

                let statsid = self
                    .stats
                    .save_crashstats(&record)
                    .map_err(|e| self.to_worker_error(LifecycleError::Other(e.to_string())))?;
                self.stats
                    .save_crashstats_success(statsid, prerunning_count(active_task_count), active_task_count, 0)
                    .map_err(|e| self.to_worker_error(LifecycleError::Other(e.to_string())))?;
                if outcome.packages.len() > 1 {
                    self.stats
                        .save_crashstats_packages(statsid, &outcome.packages[1..])
                        .map_err(|e| self.to_worker_error(LifecycleError::Other(e.to_string())))?;
                }
                if !outcome.missing.is_empty() {
                    self.stats
                        .save_crashstats_build_ids(statsid, &outcome.missing)
                        .map_err(|e| self.to_worker_error(LifecycleError::Other(e.to_string())))?;
                }

                self.task.set_status(TaskStatus::Success);
                notify_email(
                    self.task,
                    self.email.enabled,
                    &self.email.sendmail_bin,
                    &self.email.hostname,
                    &self.email.from,
                    self.task.task_type().is_vmcore(),
                    &self.email.repo_dir,
                    outcome.kernelver.as_deref(),
                    self.task.md5sum(),
                    self.logger,
                );
                self.hooks.dispatch(Hook::Success, self.task);
                self.logger.end_logging();
                Ok(())
            }
            Err(err) => {
                self.task.set_status(TaskStatus::Fail);
                let finished_ts = now();
                self.task.set_finished_at(finished_ts);
                self.logger.error(&err.to_string());

                notify_email(
                    self.task,
                    self.email.enabled,
                    &self.email.sendmail_bin,
                    &self.email.hostname,
                    &self.email.from,
                    self.task.task_type().is_vmcore(),
                    &self.email.repo_dir,
                    None,
                    self.task.md5sum(),
                    self.logger,
                );

                let record = finalize_fail_stats(record, finished_ts);
                if let Err(e) = self.stats.save_crashstats(&record) {
                    self.logger.warn(&format!("failed to persist crash stats: {e}"));
                }

                if symlink_log(&self.task.log_path(), &self.task.results_dir()).is_err() {
                    self.logger.warn("failed to symlink log into results directory");
                }

                if !self.task.task_type().skips_cleanup() {
                    self.hooks.dispatch(Hook::PreCleanTask, self.task);
                    self.hooks.dispatch(Hook::PostCleanTask, self.task);
                }

                self.hooks.dispatch(Hook::Fail, self.task);
                self.logger.end_logging();
                Err(self.to_worker_error(err))
            }
        }
    }

    fn to_worker_error(&self, source: LifecycleError) -> RetraceWorkerError {
        RetraceWorkerError {
            taskid: self.task.taskid(),
            errorcode: 1,
            source,
        }
    }
}

/// What a successful pipeline run hands back to the lifecycle driver for
/// statistics persistence.
#[derive(Default)]
pub struct PipelineOutcome {
    pub package: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub coresize: Option<u64>,
    /// Resolved package list; index 0 is the crash's own package and is
    /// excluded from persisted packages (property 4).
    pub packages: Vec<String>,
    pub missing: Vec<(String, String)>,
    /// Kernel release string, for vmcore tasks — threaded through to
    /// `notify_email` rather than re-read off the task.
    pub kernelver: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MemoryCrashStatsStore;
    use retrace_worker_types::{FsTask, TaskType};
    use std::path::PathBuf;

    fn fresh_task(dir: &std::path::Path) -> FsTask {
        FsTask::new(1, TaskType::Retrace, dir.to_path_buf())
    }

    fn no_email() -> EmailConfig {
        EmailConfig {
            enabled: false,
            sendmail_bin: "/bin/true".to_string(),
            hostname: "worker1".to_string(),
            from: "retrace@localhost".to_string(),
            repo_dir: "/repo".to_string(),
        }
    }

    #[test]
    fn successful_pipeline_reaches_success_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = fresh_task(dir.path());
        let mut logger = TaskLogger::new(dir.path().join("log"));
        let mut hooks = NullHooks;
        let mut stats = MemoryCrashStatsStore::default();
        let email = no_email();
        let mut run = Run {
            task: &mut task,
            logger: &mut logger,
            hooks: &mut hooks,
            stats: &mut stats,
            email: &email,
        };
        let result = run.execute(|| 1000, 1, |_task, _logger, _hooks| {
            Ok(PipelineOutcome {
                package: Some("firefox".into()),
                packages: vec!["firefox".into(), "mesa-libGL".into()],
                ..Default::default()
            })
        });
        assert!(result.is_ok());
        assert_eq!(task.status(), TaskStatus::Success);
        assert_eq!(stats.packages[0].1, vec!["mesa-libGL".to_string()]);
    }

    #[test]
    fn failing_pipeline_reaches_fail_status_and_symlinks_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = fresh_task(dir.path());
        let mut logger = TaskLogger::new(dir.path().join("log"));
        let mut hooks = NullHooks;
        let mut stats = MemoryCrashStatsStore::default();
        let email = no_email();
        let mut run = Run {
            task: &mut task,
            logger: &mut logger,
            hooks: &mut hooks,
            stats: &mut stats,
            email: &email,
        };
        let result = run.execute(|| 1000, 1, |_task, _logger, _hooks| {
            Err(LifecycleError::Other("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(task.status(), TaskStatus::Fail);
        assert!(task.results_dir().join("retrace-log").exists());
    }

    #[test]
    fn failing_pipeline_skips_cleanup_hooks_for_interactive_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = FsTask::new(2, TaskType::RetraceInteractive, dir.path().to_path_buf());
        let mut logger = TaskLogger::new(dir.path().join("log"));

        struct CountingHooks {
            clean_calls: usize,
        }
        impl HookDispatcher for CountingHooks {
            fn dispatch(&mut self, hook: Hook, _task: &dyn Task) {
                if matches!(hook, Hook::PreCleanTask | Hook::PostCleanTask) {
                    self.clean_calls += 1;
                }
            }
        }
        let mut hooks = CountingHooks { clean_calls: 0 };
        let mut stats = MemoryCrashStatsStore::default();
        let email = no_email();
        let mut run = Run {
            task: &mut task,
            logger: &mut logger,
            hooks: &mut hooks,
            stats: &mut stats,
            email: &email,
        };
        let _ = run.execute(|| 1000, 1, |_task, _logger, _hooks| Err(LifecycleError::Other("x".into())));
        assert_eq!(hooks.clean_calls, 0);
    }

    #[test]
    fn remove_task_deletes_save_dir_and_dispatches_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let save_dir = dir.path().join("task-1");
        std::fs::create_dir_all(save_dir.join("crash")).unwrap();
        let mut task = FsTask::new(1, TaskType::Retrace, save_dir.clone());

        struct CountingHooks {
            pre: usize,
            post: usize,
        }
        impl HookDispatcher for CountingHooks {
            fn dispatch(&mut self, hook: Hook, _task: &dyn Task) {
                match hook {
                    Hook::PreRemoveTask => self.pre += 1,
                    Hook::PostRemoveTask => self.post += 1,
                    _ => {}
                }
            }
        }
        let mut hooks = CountingHooks { pre: 0, post: 0 };

        remove_task(&mut task, &mut hooks).unwrap();
        assert!(!save_dir.exists());
        assert_eq!(hooks.pre, 1);
        assert_eq!(hooks.post, 1);
    }

    #[test]
    fn prerunning_excludes_the_starting_task() {
        assert_eq!(prerunning_count(3), 2);
    }

    #[test]
    fn finalize_fail_stats_computes_duration() {
        let record = StatsRecord::new(1, 100);
        let record = finalize_fail_stats(record, 150);
        assert_eq!(record.duration, Some(50));
        assert_eq!(record.status, TaskStatus::Fail);
    }
}
