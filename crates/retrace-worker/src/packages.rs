//! C3 — Package Resolver.
//!
//! Enumerates required RPM packages and unresolved `(soname, build-id)`
//! pairs for a coredump, either from a pre-supplied `packages` file or by
//! invoking the external `coredump2packages` tool and parsing its
//! two-section output.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use retrace_worker_process::{Invocation, run};
use retrace_worker_types::{PackageResolution, Release};

/// Repository-id prefix used when writing the scratch repo file passed to
/// `coredump2packages --repos`.
pub const REPO_PREFIX: &str = "retrace-";

/// Resolve the package list for a coredump. If `crash_dir/packages`
/// exists, its whitespace-separated contents are used verbatim and no
/// external tool is invoked.
pub fn resolve(
    crash_dir: &Path,
    coredump_path: &Path,
    release: &Release,
    repo_dir: &Path,
    coredump2packages_bin: &str,
) -> Result<PackageResolution> {
    let packages_file = crash_dir.join("packages");
    if packages_file.is_file() {
        let contents = fs::read_to_string(&packages_file)
            .with_context(|| format!("reading {}", packages_file.display()))?;
        return Ok(PackageResolution {
            packages: contents.split_whitespace().map(str::to_string).collect(),
            missing: Vec::new(),
        });
    }

    let repo_id = format!("{REPO_PREFIX}{}", release.id());
    let config_path = crash_dir.join("coredump2packages.conf");
    fs::write(&config_path, format!("[{repo_id}]\nbaseurl=file://{}/\n", repo_dir.display()))
        .context("writing coredump2packages repo config")?;
    let log_path = crash_dir.join("coredump2packages.log");

    let coredump_arg = coredump_path.to_string_lossy().to_string();
    let repos_arg = format!("--repos={repo_id}");
    let config_arg = format!("--config={}", config_path.display());
    let log_arg = format!("--log={}", log_path.display());
    let output = run(Invocation::new(
        coredump2packages_bin,
        &[&coredump_arg, &repos_arg, &config_arg, &log_arg],
    ))?;

    if !output.stderr.trim().is_empty() {
        // Non-empty stderr is logged by the caller (lifecycle), never fatal
        // on its own.
    }
    if !output.success() {
        bail!("coredump2packages exited with {}: {}", output.exit_code, output.stderr.trim());
    }

    Ok(parse_output(&output.stdout, release.distribution.as_str()))
}

/// Parse the two-section, blank-line-separated `coredump2packages` output.
pub fn parse_output(stdout: &str, distribution: &str) -> PackageResolution {
    let mut sections = stdout.splitn(2, "\n\n");
    let packages_section = sections.next().unwrap_or_default();
    let missing_section = sections.next().unwrap_or_default();

    let mut packages = Vec::new();
    let mut seen_db_debuginfo = false;
    for line in packages_section.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        packages.push(line.to_string());
        if distribution == "fedora" && line.starts_with("gnome") {
            packages.push("desktop-backgrounds-gnome".to_string());
        }
        if distribution == "fedora" && (line == "db4-debuginfo" || line == "libdb-debuginfo") {
            if seen_db_debuginfo {
                packages.pop();
            } else {
                seen_db_debuginfo = true;
            }
        }
    }

    let mut missing = Vec::new();
    for line in missing_section.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let soname = parts.next().unwrap_or_default();
        let build_id = parts.next().unwrap_or_default().trim();
        let soname = if soname == "-" { "" } else { soname };
        missing.push((soname.to_string(), build_id.to_string()));
    }

    PackageResolution { packages, missing }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_output_two_sections() {
        let stdout = "firefox\nmesa-libGL\n\nlibfoo.so.1 abcdef0123456789\n";
        let resolution = parse_output(stdout, "fedora");
        assert_eq!(resolution.packages, vec!["firefox", "mesa-libGL"]);
        assert_eq!(
            resolution.missing,
            vec![("libfoo.so.1".to_string(), "abcdef0123456789".to_string())]
        );
    }

    #[test]
    fn parse_output_gnome_fixup_only_fedora() {
        let resolution = parse_output("gnome-shell\n\n", "fedora");
        assert!(resolution.packages.contains(&"desktop-backgrounds-gnome".to_string()));

        let resolution = parse_output("gnome-shell\n\n", "rhel");
        assert!(!resolution.packages.contains(&"desktop-backgrounds-gnome".to_string()));
    }

    #[test]
    fn parse_output_db4_debuginfo_first_wins() {
        let resolution = parse_output("db4-debuginfo\nlibdb-debuginfo\n\n", "fedora");
        assert_eq!(
            resolution.packages.iter().filter(|p| p.contains("debuginfo")).count(),
            1
        );
        assert_eq!(resolution.packages[0], "db4-debuginfo");
    }

    #[test]
    fn parse_output_dash_soname_becomes_empty() {
        let resolution = parse_output("\n\n- deadbeef\n", "fedora");
        assert_eq!(resolution.missing, vec![("".to_string(), "deadbeef".to_string())]);
    }

    #[test]
    fn resolve_uses_packages_file_when_present() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("packages"), "firefox mesa-libGL\n").unwrap();
        let release = Release {
            distribution: "fedora".into(),
            version: "38".into(),
            architecture: "x86_64".into(),
            release_name: "Fedora release 38".into(),
            is_rawhide: false,
            pre_rawhide_version: None,
        };
        let resolution = resolve(
            dir.path(),
            &dir.path().join("coredump"),
            &release,
            dir.path(),
            "coredump2packages",
        )
        .unwrap();
        assert_eq!(resolution.packages, vec!["firefox", "mesa-libGL"]);
        assert!(resolution.missing.is_empty());
    }
}
