//! §4.8 `start()` — composes C1 through C7 into the pipeline closure
//! [`lifecycle::Run::execute`] drives. This module owns no status/hook
//! bookkeeping of its own beyond the mid-pipeline hooks the lifecycle
//! contract documents around debuginfo preparation, environment
//! provisioning, and retrace; `Run::execute` owns everything else
//! (`PreStart`/`Start`/`Success`/`Fail`/cleanup, logging, notification,
//! stats).

use std::fs;
use std::path::PathBuf;

use retrace_worker_types::{EnvironmentBackend, LifecycleError, Task};

use crate::crash_input;
use crate::dedup;
use crate::environment::{self, ProvisionConfig};
use crate::lifecycle::{Hook, HookDispatcher, PipelineOutcome};
use crate::logging::TaskLogger;
use crate::packages;
use crate::release;
use crate::retrace;
use crate::vmcore;

/// Everything the orchestrator needs beyond the task itself: binary paths,
/// provisioning knobs, and the backend chosen by configuration.
pub struct StartConfig {
    pub architecture: String,
    pub repo_dir: PathBuf,
    pub save_dir: PathBuf,
    pub backend: EnvironmentBackend,
    pub require_gpg_check: bool,
    pub use_faf_packages: bool,
    pub faf_link_dir: Option<PathBuf>,
    pub coredump2packages_bin: String,
    pub makedumpfile_bin: String,
    pub crash_bin: String,
    pub mock_bin: String,
    pub podman_bin: String,
    /// Known-identical primary vmcore to dedup a vmcore task's candidate
    /// against. Locating a sibling task by kernel version is not
    /// implemented (see DESIGN.md); callers that want C7 to run supply the
    /// primary explicitly.
    pub dedup_primary: Option<(PathBuf, String)>,
}

impl StartConfig {
    fn provision_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            repo_dir: self.repo_dir.clone(),
            require_gpg_check: self.require_gpg_check,
            use_faf_packages: self.use_faf_packages,
            faf_link_dir: self.faf_link_dir.clone(),
            save_dir: self.save_dir.clone(),
            mock_bin: self.mock_bin.clone(),
            podman_bin: self.podman_bin.clone(),
        }
    }
}

/// Overlay the task's custom-file overrides (operator-supplied package
/// name, executable path, or OS release text) onto the crash directory
/// before C1 reads it.
fn apply_custom_overlays(task: &dyn Task, crash_dir: &std::path::Path) -> std::io::Result<()> {
    if let Some(package) = task.custom_package() {
        fs::write(crash_dir.join("package"), package)?;
    }
    if let Some(executable) = task.custom_executable() {
        fs::write(crash_dir.join("executable"), executable)?;
    }
    if let Some(os_release) = task.custom_os_release() {
        fs::write(crash_dir.join("os_release"), os_release)?;
    }
    Ok(())
}

/// Drive one task through C1 -> C2 -> C3 -> C4 -> (C5 | C6 -> C7), ready to
/// be handed to [`lifecycle::Run::execute`] as its pipeline closure.
pub fn start(
    task: &mut dyn Task,
    logger: &mut TaskLogger,
    hooks: &mut dyn HookDispatcher,
    cfg: &StartConfig,
) -> Result<PipelineOutcome, LifecycleError> {
    let crash_dir = task.crash_dir();
    fs::create_dir_all(&crash_dir)?;

    apply_custom_overlays(task, &crash_dir)?;

    for (name, result) in task.download_remote() {
        if let Err(err) = result {
            logger.warn(&format!("failed to download remote file {name}: {err}"));
        }
    }

    crash_input::verify_required(&crash_dir, task.task_type().required_files())?;

    if task.task_type().is_vmcore() {
        run_vmcore(task, logger, hooks, cfg, &crash_dir)
    } else {
        run_retrace(task, logger, hooks, cfg, &crash_dir)
    }
}

fn run_retrace(
    task: &mut dyn Task,
    logger: &mut TaskLogger,
    hooks: &mut dyn HookDispatcher,
    cfg: &StartConfig,
    crash_dir: &std::path::Path,
) -> Result<PipelineOutcome, LifecycleError> {
    let coredump_path = crash_dir.join("coredump");
    let coresize = fs::metadata(&coredump_path).ok().map(|m| m.len());

    let package = crash_input::read_package(crash_dir)?;
    let release_input = crash_input::read_release(crash_dir).ok();
    let release = release::guess_release(
        release_input.as_ref().map(|r| r.text.as_str()),
        &cfg.architecture,
        Some(&package.raw),
    )?;

    hooks.dispatch(Hook::PrePrepareDebuginfo, task);
    let resolution = packages::resolve(
        crash_dir,
        &coredump_path,
        &release,
        &cfg.repo_dir,
        &cfg.coredump2packages_bin,
    )
    .map_err(|e| LifecycleError::Other(e.to_string()))?;
    hooks.dispatch(Hook::PostPrepareDebuginfo, task);

    hooks.dispatch(Hook::PrePrepareEnvironment, task);
    let strategy = crate::strategies::ALL
        .iter()
        .find(|s| s.distribution == release.distribution)
        .ok_or_else(|| LifecycleError::Other(format!("no strategy for distribution {}", release.distribution)))?;
    let backend = environment::backend_for(cfg.backend);
    let provision_cfg = cfg.provision_config();
    let handle = backend
        .build_environment(&release, strategy, &resolution.packages, &provision_cfg)
        .map_err(|e| LifecycleError::Other(e.to_string()))?;
    hooks.dispatch(Hook::PostPrepareEnvironment, task);

    hooks.dispatch(Hook::PreRetrace, task);
    let gdb_script_path = crash_dir.join("gdb.sh");
    fs::write(&gdb_script_path, environment::gdb_script(strategy.gdb_binary, false))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&gdb_script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&gdb_script_path, perms)?;
    }
    let gdb_script_arg = gdb_script_path.to_string_lossy().to_string();
    let coredump_arg = coredump_path.to_string_lossy().to_string();
    retrace::run_retrace(task, &handle, backend.as_ref(), &gdb_script_arg, &coredump_arg)?;
    hooks.dispatch(Hook::PostRetrace, task);

    Ok(PipelineOutcome {
        package: Some(package.name),
        version: Some(release.version),
        arch: Some(cfg.architecture.clone()),
        coresize,
        packages: resolution.packages,
        missing: resolution.missing,
        kernelver: None,
    })
}

fn run_vmcore(
    task: &mut dyn Task,
    logger: &mut TaskLogger,
    hooks: &mut dyn HookDispatcher,
    cfg: &StartConfig,
    crash_dir: &std::path::Path,
) -> Result<PipelineOutcome, LifecycleError> {
    let vmcore_path = vmcore::locate_vmcore(crash_dir)?;
    let coresize = fs::metadata(&vmcore_path).ok().map(|m| m.len());

    let flattened = vmcore::is_flattened_format(&vmcore_path).map_err(|e| LifecycleError::Other(e.to_string()))?;
    if flattened {
        logger.info("converting flattened vmcore via makedumpfile");
        vmcore::convert_flattened(&vmcore_path, &cfg.makedumpfile_bin)
            .map_err(|e| LifecycleError::Other(e.to_string()))?;
    }

    let kernelver = vmcore::detect_kernel_release(&cfg.crash_bin, &vmcore_path, &cfg.architecture)?;

    hooks.dispatch(Hook::PrePrepareDebuginfo, task);
    hooks.dispatch(Hook::PostPrepareDebuginfo, task);

    hooks.dispatch(Hook::PrePrepareEnvironment, task);
    let release = release::guess_release(Some(&kernelver.release), &cfg.architecture, None)?;
    let strategy = crate::strategies::ALL
        .iter()
        .find(|s| s.distribution == release.distribution)
        .ok_or_else(|| LifecycleError::Other(format!("no strategy for distribution {}", release.distribution)))?;
    let backend = environment::backend_for(cfg.backend);
    let provision_cfg = cfg.provision_config();
    let handle = backend
        .build_environment(&release, strategy, &[], &provision_cfg)
        .map_err(|e| LifecycleError::Other(e.to_string()))?;
    hooks.dispatch(Hook::PostPrepareEnvironment, task);

    hooks.dispatch(Hook::PreRetrace, task);
    let vmlinux = PathBuf::new();
    let outcome = vmcore::run_crash_commands(&cfg.crash_bin, &vmcore_path, &vmlinux, backend.as_ref(), &handle)?;

    if vmcore::ensure_group_readable(&vmcore_path).is_err() {
        logger.warn("vmcore is not group readable and chmod failed");
    }

    let crashrc = vmcore::build_crashrc(None, &task.results_dir());
    vmcore::finalize(task, &outcome, &crashrc)?;
    hooks.dispatch(Hook::PostRetrace, task);

    if let Some((primary_path, primary_md5)) = &cfg.dedup_primary {
        match dedup::md5_of_file(&vmcore_path) {
            Ok(candidate_md5) => {
                let saved = dedup::dedup_vmcore(&vmcore_path, primary_path, &candidate_md5, primary_md5);
                if saved > 0 {
                    logger.info(&format!("deduplicated vmcore, saved {saved} bytes"));
                }
            }
            Err(err) => logger.warn(&format!("failed to hash vmcore for dedup: {err}")),
        }
    }

    Ok(PipelineOutcome {
        package: Some("kernel".to_string()),
        version: Some(kernelver.canonical()),
        arch: Some(cfg.architecture.clone()),
        coresize,
        packages: Vec::new(),
        missing: Vec::new(),
        kernelver: Some(kernelver.release.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_worker_types::{FsTask, TaskType};

    #[test]
    fn apply_custom_overlays_writes_only_present_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = FsTask::new(1, TaskType::Retrace, dir.path().to_path_buf());
        task.custom_package = Some("firefox-1-1.fc38".to_string());
        apply_custom_overlays(&task, dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("package")).unwrap(), "firefox-1-1.fc38");
        assert!(!dir.path().join("executable").exists());
    }
}
