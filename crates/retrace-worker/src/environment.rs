//! C4 — Environment Provisioner.
//!
//! A three-way strategy dispatch (§9 design note) over `mock`, `podman`,
//! and `native` backends, each materialising an analysis environment for
//! one [`Release`] and producing a handle that [`wrap_debugger_argv`]
//! later uses to route a debugger invocation through the right isolation
//! layer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use retrace_worker_process::{Invocation, run};
use retrace_worker_types::{EnvironmentBackend, Release, ReleaseStrategy};

use crate::strategies;

/// Opaque handle returned by `build_environment`, identifying the
/// provisioned environment for later `wrap_debugger_argv`/`teardown` calls.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    pub backend: EnvironmentBackend,
    pub release_id: String,
    /// `mock` config directory, or empty for other backends.
    pub config_dir: Option<PathBuf>,
    /// `podman` image tag, when applicable.
    pub image_tag: Option<String>,
}

/// The C4 strategy interface (§9): build an environment, wrap a debugger
/// argv to run inside it, and tear it down.
pub trait Backend {
    fn build_environment(
        &self,
        release: &Release,
        strategy: &ReleaseStrategy,
        packages: &[String],
        cfg: &ProvisionConfig,
    ) -> Result<EnvironmentHandle>;

    fn wrap_debugger_argv(&self, handle: &EnvironmentHandle, argv: Vec<String>) -> Vec<String>;

    fn teardown(&self, _handle: &EnvironmentHandle) -> Result<()> {
        Ok(())
    }
}

/// The subset of `WorkerConfig` the provisioner needs, kept separate so
/// environment.rs doesn't depend on the full config module's shape.
pub struct ProvisionConfig {
    pub repo_dir: PathBuf,
    pub require_gpg_check: bool,
    pub use_faf_packages: bool,
    pub faf_link_dir: Option<PathBuf>,
    pub save_dir: PathBuf,
    pub mock_bin: String,
    pub podman_bin: String,
}

pub struct MockBackend;
pub struct PodmanBackend;
pub struct NativeBackend;

/// GDB batch-command script, written as `gdb.sh` in the provisioning
/// scratch directory. Delimiters are bit-exact: downstream parsers split
/// on `PYTHON_LABEL_START`/`PYTHON_LABEL_END`/`EXPLOITABLE_SEPARATOR`.
pub fn gdb_script(gdb_binary: &str, debuginfod_enabled: bool) -> String {
    let file_line = if debuginfod_enabled {
        String::new()
    } else {
        "file $1\n".to_string()
    };
    format!(
        "#!/bin/sh\n{gdb_binary} -batch \\\n  -ex 'python import abrt_exploitable' \\\n  {file_line}  -ex 'core-file /var/spool/abrt/crash/coredump' \\\n  -ex 'echo PYTHON_LABEL_START\\n' \\\n  -ex 'py-bt' \\\n  -ex 'py-list' \\\n  -ex 'py-locals' \\\n  -ex 'echo PYTHON_LABEL_END\\n' \\\n  -ex 'thread apply all -ascending backtrace full 2048' \\\n  -ex 'info sharedlib' \\\n  -ex 'print (char*)__abort_msg' \\\n  -ex 'print (char*)__glib_assert_msg' \\\n  -ex 'info registers' \\\n  -ex 'disassemble' \\\n  -ex 'echo EXPLOITABLE_SEPARATOR\\n' \\\n  -ex 'abrt-exploitable'\n"
    )
}

/// The DNF repository file pointing at the local package cache.
pub fn repo_file(distribution: &str, repo_path: &Path, gpg_keys: &str, gpg_check: bool) -> String {
    format!(
        "[retrace-{distribution}]\nname=retrace-{distribution}\nbaseurl=file://{}/\ngpgcheck={}\ngpgkey={gpg_keys}\n",
        repo_path.display(),
        if gpg_check { 1 } else { 0 }
    )
}

/// The `Containerfile` used by the podman backend to build a per-release
/// retrace image.
pub fn containerfile(release: &Release, strategy: &ReleaseStrategy, gpg_check: bool) -> String {
    let mut out = format!(
        "FROM {}:{}\nRUN useradd -m retrace\nRUN mkdir -p /var/spool/abrt/crash\nCOPY retrace-podman.repo /etc/yum.repos.d/\nCOPY gdb.sh /usr/local/bin/gdb.sh\n",
        release.distribution, release.version
    );
    if gpg_check {
        out.push_str("RUN rpm --import /etc/pki/rpm-gpg/*\n");
    }
    out.push_str(&format!(
        "RUN dnf install --assumeyes --setopt=tsflags=nodocs --releasever={} --repo=retrace-{} abrt-addon-ccpp {}\n",
        release.version, release.distribution, strategy.gdb_package
    ));
    out.push_str("RUN dnf clean all\n");
    out
}

/// `mock`'s `default.cfg`, including the bind-mount plugin wiring the repo
/// and crash directories into the chroot.
pub fn mock_default_cfg(
    release: &Release,
    strategy: &ReleaseStrategy,
    packages: &[String],
    repo_path: &Path,
    gpg_dir: Option<&Path>,
    crash_dir: &Path,
) -> String {
    let mut install_list = packages.to_vec();
    install_list.push("abrt-addon-ccpp".to_string());
    install_list.push("shadow-utils".to_string());
    install_list.push(strategy.gdb_package.to_string());
    install_list.push("rpm".to_string());

    let mut out = String::new();
    out.push_str(&format!("config_opts['root'] = 'retrace-{}'\n", release.id()));
    out.push_str(&format!("config_opts['target_arch'] = '{}'\n", release.architecture));
    out.push_str(&format!(
        "config_opts['chroot_setup_cmd'] = 'install {}'\n",
        install_list.join(" ")
    ));
    out.push_str(&format!("config_opts['releasever'] = '{}'\n", release.version));
    out.push_str("config_opts['package_manager'] = 'dnf'\n");
    out.push_str("config_opts['use_host_resolv'] = False\n");
    out.push_str("config_opts['plugin_conf']['bind_mount_enable'] = True\n");
    out.push_str(&format!(
        "config_opts['plugin_conf']['bind_mount_opts']['dirs'].append(('{}', '{}'))\n",
        repo_path.display(),
        repo_path.display()
    ));
    if let Some(gpg) = gpg_dir {
        out.push_str(&format!(
            "config_opts['plugin_conf']['bind_mount_opts']['dirs'].append(('{}', '{}'))\n",
            gpg.display(),
            gpg.display()
        ));
    }
    out.push_str(&format!(
        "config_opts['plugin_conf']['bind_mount_opts']['dirs'].append(('{}', '/var/spool/abrt/crash'))\n",
        crash_dir.display()
    ));
    out.push_str(&format!(
        "config_opts['yum.conf'] = \"[{}]\\nname={}\\nbaseurl=file://{}/\\n\"\n",
        release.distribution,
        release.distribution,
        repo_path.display()
    ));
    out
}

impl Backend for MockBackend {
    fn build_environment(
        &self,
        release: &Release,
        strategy: &ReleaseStrategy,
        packages: &[String],
        cfg: &ProvisionConfig,
    ) -> Result<EnvironmentHandle> {
        let config_dir = cfg.save_dir.join(format!("{}-mock", release.id()));
        fs::create_dir_all(&config_dir)?;
        let contents = mock_default_cfg(
            release,
            strategy,
            packages,
            &cfg.repo_dir,
            if cfg.require_gpg_check {
                Some(&cfg.repo_dir)
            } else {
                None
            },
            &cfg.repo_dir,
        );
        fs::write(config_dir.join("default.cfg"), contents)?;

        let resultdir = config_dir.join("log").to_string_lossy().to_string();
        let configdir = config_dir.to_string_lossy().to_string();
        let output = run(Invocation::new(
            &cfg.mock_bin,
            &["init", "--resultdir", &resultdir, "--configdir", &configdir],
        ))?;
        if !output.success() {
            bail!("mock init failed: {}", output.stderr.trim());
        }

        Ok(EnvironmentHandle {
            backend: EnvironmentBackend::Mock,
            release_id: release.id(),
            config_dir: Some(config_dir),
            image_tag: None,
        })
    }

    fn wrap_debugger_argv(&self, handle: &EnvironmentHandle, argv: Vec<String>) -> Vec<String> {
        let configdir = handle
            .config_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut wrapped = vec!["mock".to_string(), "--configdir".to_string(), configdir, "chroot".to_string(), "--".to_string()];
        wrapped.extend(argv);
        wrapped
    }
}

impl Backend for PodmanBackend {
    fn build_environment(
        &self,
        release: &Release,
        strategy: &ReleaseStrategy,
        _packages: &[String],
        cfg: &ProvisionConfig,
    ) -> Result<EnvironmentHandle> {
        let tag = format!("localhost/retrace-image:{}", release.id());

        let inspect = run(Invocation::new(&cfg.podman_bin, &["image", "inspect", &tag]))?;
        if inspect.success() {
            return Ok(EnvironmentHandle {
                backend: EnvironmentBackend::Podman,
                release_id: release.id(),
                config_dir: None,
                image_tag: Some(tag),
            });
        }

        let scratch = tempfile::tempdir().context("creating image build scratch dir")?;
        let gpg_keys = strategies::gpg_keys(strategy, &release.version, release.pre_rawhide_version.as_deref());
        fs::write(
            scratch.path().join("retrace-podman.repo"),
            repo_file(&release.distribution, &cfg.repo_dir, &gpg_keys, cfg.require_gpg_check),
        )?;
        fs::write(scratch.path().join("gdb.sh"), gdb_script(strategy.gdb_binary, false))?;
        let containerfile_path = scratch.path().join("Containerfile");
        fs::write(&containerfile_path, containerfile(release, strategy, cfg.require_gpg_check))?;

        let repo_vol = format!("{}:{}:ro", cfg.repo_dir.display(), cfg.repo_dir.display());
        let mut args = vec![
            "build".to_string(),
            "--quiet".to_string(),
            "--force-rm".to_string(),
            "--file".to_string(),
            containerfile_path.to_string_lossy().to_string(),
            "--volume".to_string(),
            repo_vol,
        ];
        if let Some(faf_dir) = &cfg.faf_link_dir {
            if cfg.use_faf_packages {
                args.push("--volume".to_string());
                args.push(format!("{}:{}:ro", faf_dir.display(), faf_dir.display()));
            }
        }
        args.push("--tag".to_string());
        args.push(tag.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run(Invocation::new(&cfg.podman_bin, &arg_refs).in_dir(scratch.path()))?;
        if !output.success() {
            bail!("podman build failed: {}", output.stderr.trim());
        }

        Ok(EnvironmentHandle {
            backend: EnvironmentBackend::Podman,
            release_id: release.id(),
            config_dir: None,
            image_tag: Some(tag),
        })
    }

    fn wrap_debugger_argv(&self, handle: &EnvironmentHandle, argv: Vec<String>) -> Vec<String> {
        let tag = handle.image_tag.clone().unwrap_or_default();
        let mut wrapped = vec!["podman".to_string(), "run".to_string(), "--rm".to_string(), tag];
        wrapped.extend(argv);
        wrapped
    }
}

impl Backend for NativeBackend {
    fn build_environment(
        &self,
        release: &Release,
        _strategy: &ReleaseStrategy,
        _packages: &[String],
        _cfg: &ProvisionConfig,
    ) -> Result<EnvironmentHandle> {
        Ok(EnvironmentHandle {
            backend: EnvironmentBackend::Native,
            release_id: release.id(),
            config_dir: None,
            image_tag: None,
        })
    }

    fn wrap_debugger_argv(&self, _handle: &EnvironmentHandle, argv: Vec<String>) -> Vec<String> {
        argv
    }
}

pub fn backend_for(kind: EnvironmentBackend) -> Box<dyn Backend> {
    match kind {
        EnvironmentBackend::Mock => Box::new(MockBackend),
        EnvironmentBackend::Podman => Box::new(PodmanBackend),
        EnvironmentBackend::Native => Box::new(NativeBackend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::FEDORA;

    fn release() -> Release {
        Release {
            distribution: "fedora".into(),
            version: "38".into(),
            architecture: "x86_64".into(),
            release_name: "Fedora release 38".into(),
            is_rawhide: false,
            pre_rawhide_version: None,
        }
    }

    #[test]
    fn gdb_script_omits_file_line_when_debuginfod_enabled() {
        let with_file = gdb_script("gdb", false);
        let without_file = gdb_script("gdb", true);
        assert!(with_file.contains("core-file /var/spool/abrt/crash/coredump"));
        assert!(with_file.contains("file $1"));
        assert!(!without_file.contains("file $1"));
    }

    #[test]
    fn gdb_script_delimiter_ordering() {
        let script = gdb_script("gdb", false);
        let python_start = script.find("PYTHON_LABEL_START").unwrap();
        let python_end = script.find("PYTHON_LABEL_END").unwrap();
        let py_bt = script.find("py-bt").unwrap();
        let exploitable_sep = script.find("EXPLOITABLE_SEPARATOR").unwrap();
        let exploitable = script.rfind("abrt-exploitable").unwrap();
        assert!(python_start < py_bt);
        assert!(py_bt < python_end);
        assert!(python_end < exploitable_sep);
        assert!(exploitable_sep < exploitable);
    }

    #[test]
    fn containerfile_installs_release_specific_gdb_package() {
        let text = containerfile(&release(), &FEDORA, true);
        assert!(text.contains("FROM fedora:38"));
        assert!(text.contains("gdb"));
        assert!(text.contains("--releasever=38"));
    }

    #[test]
    fn containerfile_skips_gpg_import_when_disabled() {
        let text = containerfile(&release(), &FEDORA, false);
        assert!(!text.contains("rpm --import"));
    }

    #[test]
    fn mock_backend_wraps_argv_with_chroot() {
        let handle = EnvironmentHandle {
            backend: EnvironmentBackend::Mock,
            release_id: "fedora-38-x86_64".into(),
            config_dir: Some(PathBuf::from("/tmp/cfg")),
            image_tag: None,
        };
        let wrapped = MockBackend.wrap_debugger_argv(&handle, vec!["crash".into(), "-s".into()]);
        assert_eq!(wrapped[0], "mock");
        assert!(wrapped.contains(&"chroot".to_string()));
        assert_eq!(wrapped.last().unwrap(), "-s");
    }

    #[test]
    fn native_backend_does_not_wrap() {
        let handle = EnvironmentHandle {
            backend: EnvironmentBackend::Native,
            release_id: "fedora-38-x86_64".into(),
            config_dir: None,
            image_tag: None,
        };
        let argv = vec!["crash".to_string(), "-s".to_string()];
        assert_eq!(NativeBackend.wrap_debugger_argv(&handle, argv.clone()), argv);
    }
}
