//! C6 — Vmcore Driver (kernel).
//!
//! Drives the `crash` utility twice — a minimal run for the kernel log,
//! a full run for `sys` — against a (possibly flattened, possibly
//! oversized) kernel vmcore, applying the small-kernellog sanity check and
//! the degraded `--minimal` persistence path described in §4.6.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use retrace_worker_process::{Invocation, run};
use retrace_worker_types::{KernelVer, Task, VmcoreError};

use crate::environment::{Backend, EnvironmentHandle};

/// Minimum acceptable kernel-log size; below this, a non-zero `sys` exit
/// is treated as a truncated/partial vmcore and the task fails outright
/// rather than silently degrading.
pub const SMALL_KERNELLOG_THRESHOLD: usize = 1024;

/// Outcome of the two `crash` invocations.
pub struct VmcoreRunOutcome {
    pub kernel_log: String,
    pub sys_output: Option<String>,
    /// Set when `sys` failed but the kernel log was large enough: the
    /// caller should persist `--minimal` onto the task's crash command for
    /// future runs.
    pub degraded_minimal: bool,
}

/// Detect whether `vmcore` is in flattened (makedumpfile `-F`) form. A
/// cheap, conservative check: flattened dumps start with the 16-byte ASCII
/// magic `makedumpfile`.
pub fn is_flattened_format(vmcore: &Path) -> Result<bool> {
    let mut buf = [0u8; 16];
    use std::io::Read;
    let mut file = fs::File::open(vmcore).with_context(|| format!("opening {}", vmcore.display()))?;
    let n = file.read(&mut buf).unwrap_or(0);
    Ok(n >= 13 && &buf[..13] == b"makedumpfile")
}

/// Convert a flattened-format vmcore in place via `makedumpfile -R`.
/// Returns `(old_size, new_size)` for logging.
pub fn convert_flattened(vmcore: &Path, makedumpfile_bin: &str) -> Result<(u64, u64)> {
    let old_size = fs::metadata(vmcore)?.len();
    let converted = vmcore.with_extension("converted");
    let flattened_bytes = fs::read(vmcore).with_context(|| format!("reading {}", vmcore.display()))?;
    let converted_arg = converted.to_string_lossy().to_string();
    let output = run(
        Invocation::new(makedumpfile_bin, &["-R", &converted_arg]).with_stdin_bytes(&flattened_bytes),
    )?;
    if !output.success() {
        anyhow::bail!("makedumpfile conversion failed: {}", output.stderr.trim());
    }
    fs::rename(&converted, vmcore)?;
    let new_size = fs::metadata(vmcore)?.len();
    Ok((old_size, new_size))
}

/// Parse a kernel release string (as printed by `crash -v` or a
/// caller-supplied override) into a [`KernelVer`].
pub fn parse_kernel_release(text: &str, architecture: &str) -> Option<KernelVer> {
    let release = text.trim();
    if release.is_empty() {
        return None;
    }
    Some(KernelVer {
        release: release.to_string(),
        architecture: architecture.to_string(),
    })
}

/// Determine the kernel release of `vmcore` by starting `crash` against it
/// with no vmlinux and reading the `RELEASE:` line off its startup banner.
pub fn detect_kernel_release(crash_bin: &str, vmcore: &Path, architecture: &str) -> Result<KernelVer, VmcoreError> {
    let vmcore_arg = vmcore.to_string_lossy().to_string();
    let output = run(Invocation::new(crash_bin, &["-s", &vmcore_arg]).with_stdin("quit\n"))
        .map_err(|e| VmcoreError::DebuginfoFailed(e.to_string()))?;
    output
        .stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("RELEASE:").map(str::trim))
        .and_then(|release| parse_kernel_release(release, architecture))
        .ok_or(VmcoreError::UnknownKernelVersion)
}

/// Build the `crash` argv (sans backend wrapping) for either the minimal
/// kernel-log run or the full `sys` run.
pub fn crash_argv(crash_bin: &str, vmcore: &Path, vmlinux: &Path, minimal: bool) -> Vec<String> {
    let mut argv = vec![crash_bin.to_string()];
    if minimal {
        argv.push("--minimal".to_string());
    }
    argv.push("-s".to_string());
    argv.push(vmcore.to_string_lossy().to_string());
    argv.push(vmlinux.to_string_lossy().to_string());
    argv
}

/// Run the minimal (`log`) and full (`sys`) `crash` invocations and apply
/// the small-kernellog / degraded-minimal branching from §4.6 step 6-7.
pub fn run_crash_commands(
    crash_bin: &str,
    vmcore: &Path,
    vmlinux: &Path,
    backend: &dyn Backend,
    handle: &EnvironmentHandle,
) -> Result<VmcoreRunOutcome, VmcoreError> {
    let minimal_argv = backend.wrap_debugger_argv(handle, crash_argv(crash_bin, vmcore, vmlinux, true));
    let program = minimal_argv.first().cloned().unwrap_or_default();
    let rest: Vec<&str> = minimal_argv[1..].iter().map(String::as_str).collect();
    let log_output = run(Invocation::new(&program, &rest).with_stdin("log\nquit\n"))?;
    let kernel_log = log_output.stdout;

    let full_argv = backend.wrap_debugger_argv(handle, crash_argv(crash_bin, vmcore, vmlinux, false));
    let program = full_argv.first().cloned().unwrap_or_default();
    let rest: Vec<&str> = full_argv[1..].iter().map(String::as_str).collect();
    let sys_output = run(Invocation::new(&program, &rest).with_stdin("sys\nquit\n"))?;

    if !sys_output.success() {
        if kernel_log.len() < SMALL_KERNELLOG_THRESHOLD {
            return Err(VmcoreError::SmallKernelLog(kernel_log.len()));
        }
        return Ok(VmcoreRunOutcome {
            kernel_log,
            sys_output: None,
            degraded_minimal: true,
        });
    }

    if sys_output.stdout.trim().is_empty() {
        return Ok(VmcoreRunOutcome {
            kernel_log,
            sys_output: None,
            degraded_minimal: !(kernel_log.len() >= SMALL_KERNELLOG_THRESHOLD),
        });
    }

    Ok(VmcoreRunOutcome {
        kernel_log,
        sys_output: Some(sys_output.stdout),
        degraded_minimal: false,
    })
}

/// Strip pages the identified kernel no longer needs via a second
/// `makedumpfile` pass. Returns `(old_size, new_size)`.
pub fn strip_extra_pages(vmcore: &Path, makedumpfile_bin: &str) -> Result<(u64, u64)> {
    let old_size = fs::metadata(vmcore)?.len();
    let stripped = vmcore.with_extension("stripped");
    let vmcore_arg = vmcore.to_string_lossy().to_string();
    let stripped_arg = stripped.to_string_lossy().to_string();
    let output = run(Invocation::new(
        makedumpfile_bin,
        &["-d", "31", &vmcore_arg, &stripped_arg],
    ))?;
    if !output.success() {
        // Non-fatal: stripping is best-effort.
        return Ok((old_size, old_size));
    }
    fs::rename(&stripped, vmcore)?;
    let new_size = fs::metadata(vmcore)?.len();
    Ok((old_size, new_size))
}

/// Ensure the vmcore file is group-readable, matching the permission fixup
/// in §4.6 step 9. Failures are swallowed (logged by the caller).
pub fn ensure_group_readable(vmcore: &Path) -> std::io::Result<()> {
    let metadata = fs::metadata(vmcore)?;
    let mut perms = metadata.permissions();
    let mode = perms.mode();
    if mode & 0o040 == 0 {
        perms.set_mode(mode | 0o040);
        fs::set_permissions(vmcore, perms)?;
    }
    Ok(())
}

/// Build the `crashrc` file contents: an optional `mod -S <dir>` line for
/// `vmlinux`'s containing directory, always followed by `cd <results_dir>`.
pub fn build_crashrc(vmlinux: Option<&Path>, results_dir: &Path) -> String {
    let mut out = String::new();
    if let Some(path) = vmlinux {
        if let Some(dir) = path.parent() {
            out.push_str(&format!("mod -S {} > /dev/null\n", dir.display()));
        }
    }
    out.push_str(&format!("cd {}\n", results_dir.display()));
    out
}

/// Locate the task's vmcore, matching any recognised snapshot suffix.
pub fn locate_vmcore(crash_dir: &Path) -> Result<PathBuf, VmcoreError> {
    let plain = crash_dir.join("vmcore");
    if plain.is_file() {
        return Ok(plain);
    }
    for suffix in retrace_worker_types::VMCORE_SNAPSHOT_SUFFIXES {
        let candidate = crash_dir.join(format!("vmcore.{suffix}"));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(VmcoreError::Missing)
}

/// Finalise a successful vmcore run onto the task: persist kernel log as
/// the backtrace, `sys` output (if present) under results key `sys`, and
/// the crashrc. On a degraded run, append ` --minimal` to the task's
/// persisted crash command.
pub fn finalize(task: &mut dyn Task, outcome: &VmcoreRunOutcome, crashrc: &str) -> std::io::Result<()> {
    task.set_backtrace(&outcome.kernel_log)?;
    if let Some(sys) = &outcome.sys_output {
        task.set_result("sys", sys)?;
    }
    if outcome.degraded_minimal {
        let mut cmd = task.crash_cmd().unwrap_or("crash").to_string();
        if !cmd.ends_with("--minimal") {
            cmd.push_str(" --minimal");
        }
        task.set_crash_cmd(cmd);
    }
    task.set_crashrc(crashrc)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn locate_vmcore_plain_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("vmcore"), b"x").unwrap();
        assert_eq!(locate_vmcore(dir.path()).unwrap(), dir.path().join("vmcore"));
    }

    #[test]
    fn locate_vmcore_snapshot_suffix() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("vmcore.xz"), b"x").unwrap();
        assert_eq!(locate_vmcore(dir.path()).unwrap(), dir.path().join("vmcore.xz"));
    }

    #[test]
    fn locate_vmcore_missing() {
        let dir = tempdir().unwrap();
        assert!(matches!(locate_vmcore(dir.path()), Err(VmcoreError::Missing)));
    }

    #[test]
    fn is_flattened_format_detects_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vmcore");
        fs::write(&path, b"makedumpfile flattened format dump...").unwrap();
        assert!(is_flattened_format(&path).unwrap());
    }

    #[test]
    fn is_flattened_format_false_for_plain_dump() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vmcore");
        fs::write(&path, b"ELFplainvmcoredata").unwrap();
        assert!(!is_flattened_format(&path).unwrap());
    }

    #[test]
    fn crash_argv_minimal_flag() {
        let argv = crash_argv("crash", Path::new("/c/vmcore"), Path::new("/c/vmlinux"), true);
        assert_eq!(argv, vec!["crash", "--minimal", "-s", "/c/vmcore", "/c/vmlinux"]);
    }

    #[test]
    fn crash_argv_without_minimal() {
        let argv = crash_argv("crash", Path::new("/c/vmcore"), Path::new("/c/vmlinux"), false);
        assert_eq!(argv, vec!["crash", "-s", "/c/vmcore", "/c/vmlinux"]);
    }

    #[test]
    fn build_crashrc_includes_mod_line_and_cd() {
        let rc = build_crashrc(Some(Path::new("/usr/lib/debug/vmlinux")), Path::new("/results"));
        assert!(rc.contains("mod -S /usr/lib/debug"));
        assert!(rc.contains("cd /results"));
    }

    #[test]
    fn build_crashrc_without_vmlinux() {
        let rc = build_crashrc(None, Path::new("/results"));
        assert!(!rc.contains("mod -S"));
        assert!(rc.contains("cd /results"));
    }

    #[test]
    fn ensure_group_readable_sets_bit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vmcore");
        fs::write(&path, b"x").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms).unwrap();
        ensure_group_readable(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_ne!(mode & 0o040, 0);
    }
}
