use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use retrace_worker::config::WorkerConfig;
use retrace_worker::dedup;
use retrace_worker::lifecycle::{EmailConfig, NullHooks, Run};
use retrace_worker::logging::{CliReporter, TaskLogger};
use retrace_worker::orchestrate::{self, StartConfig};
use retrace_worker::stats::SqliteCrashStatsStore;
use retrace_worker_types::{FsTask, Reporter, Task, TaskType};

#[derive(Parser, Debug)]
#[command(name = "retrace-worker-cli", version)]
#[command(about = "Operator CLI for the retrace worker")]
struct Cli {
    /// Path to retrace-worker.toml (searched in the current directory by default).
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive one task end to end from a task save directory.
    Run {
        /// Task save directory (must contain a `crash` subdirectory).
        save_dir: PathBuf,
        /// Task type: retrace, retrace-interactive, debug, vmcore, vmcore-interactive.
        #[arg(long, default_value = "retrace")]
        task_type: String,
        /// Numeric task id.
        #[arg(long, default_value_t = 1)]
        taskid: u64,
    },
    /// Hardlink a candidate vmcore onto an identical primary vmcore.
    Dedup {
        candidate_vmcore: PathBuf,
        primary_vmcore: PathBuf,
    },
    /// Permanently delete a task's save directory.
    Remove {
        /// Task save directory to delete.
        save_dir: PathBuf,
        /// Task type: retrace, retrace-interactive, debug, vmcore, vmcore-interactive.
        #[arg(long, default_value = "retrace")]
        task_type: String,
        /// Numeric task id.
        #[arg(long, default_value_t = 1)]
        taskid: u64,
    },
    /// Print resolved configuration and report which backend binaries are on PATH.
    Doctor {
        /// Write a documented retrace-worker.toml template to stdout and exit.
        #[arg(long)]
        init: bool,
    },
}

fn parse_task_type(s: &str) -> Result<TaskType> {
    Ok(match s {
        "retrace" => TaskType::Retrace,
        "retrace-interactive" => TaskType::RetraceInteractive,
        "debug" => TaskType::Debug,
        "vmcore" => TaskType::Vmcore,
        "vmcore-interactive" => TaskType::VmcoreInteractive,
        other => bail!("unknown task type: {other}"),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut reporter = CliReporter;

    match cli.command {
        Command::Run {
            save_dir,
            task_type,
            taskid,
        } => run_task(&cli.config_dir, &save_dir, &task_type, taskid, &mut reporter),
        Command::Dedup {
            candidate_vmcore,
            primary_vmcore,
        } => run_dedup(&candidate_vmcore, &primary_vmcore, &mut reporter),
        Command::Remove {
            save_dir,
            task_type,
            taskid,
        } => run_remove(&save_dir, &task_type, taskid, &mut reporter),
        Command::Doctor { init } => run_doctor(&cli.config_dir, init),
    }
}

fn worker_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn run_task(
    config_dir: &std::path::Path,
    save_dir: &std::path::Path,
    task_type: &str,
    taskid: u64,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let task_type = parse_task_type(task_type)?;
    let config = WorkerConfig::load_from_dir(config_dir).context("loading configuration")?;
    let backend = config.environment_backend()?;

    reporter.info(&format!(
        "task #{taskid} ({task_type:?}) staged at {} using backend {backend:?}",
        save_dir.display(),
    ));

    let mut task = FsTask::new(taskid, task_type, save_dir.to_path_buf());
    let mut logger = TaskLogger::new(task.log_path());
    let mut hooks = NullHooks;
    let mut stats = SqliteCrashStatsStore::open(&save_dir.join("stats.db")).context("opening stats database")?;
    let email = EmailConfig {
        enabled: config.email_notify,
        sendmail_bin: config.bins.resolved("sendmail"),
        hostname: worker_hostname(),
        from: config.email_notify_from.clone(),
        repo_dir: config.repo_dir.clone(),
    };

    let start_cfg = StartConfig {
        architecture: "x86_64".to_string(),
        repo_dir: config.repo_dir_path(),
        save_dir: config.save_dir_path(),
        backend,
        require_gpg_check: config.require_gpg_check,
        use_faf_packages: config.use_faf_packages,
        faf_link_dir: config.faf_link_dir.clone().map(PathBuf::from),
        coredump2packages_bin: config.bins.resolved("coredump2packages"),
        makedumpfile_bin: config.bins.resolved("makedumpfile"),
        crash_bin: config.bins.resolved("crash"),
        mock_bin: config.bins.resolved("mock"),
        podman_bin: config.bins.resolved("podman"),
        dedup_primary: None,
    };

    let mut run = Run {
        task: &mut task,
        logger: &mut logger,
        hooks: &mut hooks,
        stats: &mut stats,
        email: &email,
    };

    run.execute(
        || chrono::Utc::now().timestamp(),
        1,
        |task, logger, hooks| orchestrate::start(task, logger, hooks, &start_cfg),
    )?;

    reporter.info(&format!("task #{taskid} finished with status {:?}", task.status()));
    Ok(())
}

fn run_dedup(candidate: &std::path::Path, primary: &std::path::Path, reporter: &mut dyn Reporter) -> Result<()> {
    let candidate_md5 = dedup::md5_of_file(candidate).context("hashing candidate vmcore")?;
    let primary_md5 = dedup::md5_of_file(primary).context("hashing primary vmcore")?;
    let saved = dedup::dedup_vmcore(candidate, primary, &candidate_md5, &primary_md5);
    if saved > 0 {
        reporter.info(&format!("deduplicated, saved {saved} bytes"));
    } else {
        reporter.warn("dedup skipped (size/md5 mismatch or already shared)");
    }
    println!("{saved}");
    Ok(())
}

fn run_remove(save_dir: &std::path::Path, task_type: &str, taskid: u64, reporter: &mut dyn Reporter) -> Result<()> {
    let task_type = parse_task_type(task_type)?;
    let mut task = FsTask::new(taskid, task_type, save_dir.to_path_buf());
    let mut hooks = NullHooks;
    retrace_worker::lifecycle::remove_task(&mut task, &mut hooks).context("removing task save directory")?;
    reporter.info(&format!("task #{taskid} removed from {}", save_dir.display()));
    Ok(())
}

fn run_doctor(config_dir: &std::path::Path, init: bool) -> Result<()> {
    if init {
        println!("{}", WorkerConfig::default_toml_template());
        return Ok(());
    }

    let config = WorkerConfig::load_from_dir(config_dir)?;
    println!("{}", toml::to_string_pretty(&config)?);

    for bin in ["coredump2packages", "makedumpfile", "crash", "mock", "podman", "gdb"] {
        let resolved = config.bins.resolved(bin);
        let available = retrace_worker_process::command_exists(&resolved);
        println!("{bin}: {resolved} ({})", if available { "found" } else { "missing" });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_task_type_covers_all_named_variants() {
        assert!(matches!(parse_task_type("retrace").unwrap(), TaskType::Retrace));
        assert!(matches!(parse_task_type("vmcore-interactive").unwrap(), TaskType::VmcoreInteractive));
        assert!(parse_task_type("bogus").is_err());
    }
}
