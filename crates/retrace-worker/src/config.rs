//! Configuration file support (`retrace-worker.toml`).
//!
//! Mirrors the upstream worker's `Config` object: every key has a
//! `serde(default)`, there is a `validate()` pass that rejects
//! nonsensical values, and binary paths can be overridden per-key by an
//! environment variable so tests can substitute fakes, the same way the
//! teacher's `cargo_program()`/`git_program()` helpers work.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use retrace_worker_types::EnvironmentBackend;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_repo_dir() -> String {
    "/var/cache/retrace-worker/repos".to_string()
}

fn default_save_dir() -> String {
    "/var/spool/retrace-worker".to_string()
}

fn default_kernel_chroot_repo() -> String {
    "https://kojipkgs.fedoraproject.org/repos/rawhide/latest/$ARCH/".to_string()
}

fn default_auth_group() -> String {
    "mock".to_string()
}

fn default_environment() -> String {
    "mock".to_string()
}

fn default_bin(name: &str) -> String {
    name.to_string()
}

/// Top-level configuration, loaded from TOML with every field defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub email_notify: bool,
    pub email_notify_from: String,
    pub repo_dir: String,
    pub require_gpg_check: bool,
    pub use_faf_packages: bool,
    pub faf_link_dir: Option<String>,
    pub retrace_environment: String,
    pub save_dir: String,
    pub kernel_chroot_repo: String,
    pub auth_group: String,

    #[serde(default = "bins_default")]
    pub bins: BinaryPaths,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            email_notify: false,
            email_notify_from: "retrace@localhost".to_string(),
            repo_dir: default_repo_dir(),
            require_gpg_check: default_true(),
            use_faf_packages: false,
            faf_link_dir: None,
            retrace_environment: default_environment(),
            save_dir: default_save_dir(),
            kernel_chroot_repo: default_kernel_chroot_repo(),
            auth_group: default_auth_group(),
            bins: bins_default(),
        }
    }
}

/// Binary-path overrides, one per external tool the worker shells out to.
/// Each is also overridable via an environment variable at call time
/// (`resolved()`), grounded on the teacher's `SHIPPER_CARGO_BIN` idiom.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryPaths {
    pub coredump2packages: String,
    pub makedumpfile: String,
    pub crash: String,
    pub mock: String,
    pub podman: String,
    pub gdb: String,
    pub sendmail: String,
}

fn bins_default() -> BinaryPaths {
    BinaryPaths {
        coredump2packages: default_bin("coredump2packages"),
        makedumpfile: default_bin("makedumpfile"),
        crash: default_bin("crash"),
        mock: default_bin("mock"),
        podman: default_bin("podman"),
        gdb: default_bin("gdb"),
        sendmail: "/usr/sbin/sendmail".to_string(),
    }
}

impl BinaryPaths {
    /// Resolve one binary path, letting an environment variable override
    /// the configured value — e.g. `RETRACE_WORKER_GDB_BIN`.
    pub fn resolved(&self, field: &str) -> String {
        let env_key = format!("RETRACE_WORKER_{}_BIN", field.to_uppercase());
        if let Ok(value) = env::var(&env_key) {
            if !value.is_empty() {
                return value;
            }
        }
        match field {
            "coredump2packages" => self.coredump2packages.clone(),
            "makedumpfile" => self.makedumpfile.clone(),
            "crash" => self.crash.clone(),
            "mock" => self.mock.clone(),
            "podman" => self.podman.clone(),
            "gdb" => self.gdb.clone(),
            "sendmail" => self.sendmail.clone(),
            other => other.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a specific TOML file.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: WorkerConfig =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `retrace-worker.toml` from a directory, falling back to
    /// defaults when absent.
    pub fn load_from_dir(dir: &std::path::Path) -> Result<Self> {
        let path = dir.join("retrace-worker.toml");
        if path.is_file() {
            Self::load_from_file(&path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn environment_backend(&self) -> Result<EnvironmentBackend> {
        match self.retrace_environment.as_str() {
            "mock" => Ok(EnvironmentBackend::Mock),
            "podman" => Ok(EnvironmentBackend::Podman),
            "native" => Ok(EnvironmentBackend::Native),
            other => bail!("unknown RetraceEnvironment: {other}"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.repo_dir.trim().is_empty() {
            bail!("RepoDir must not be empty");
        }
        if self.save_dir.trim().is_empty() {
            bail!("SaveDir must not be empty");
        }
        self.environment_backend()?;
        if self.use_faf_packages && self.faf_link_dir.as_deref().unwrap_or("").is_empty() {
            bail!("FafLinkDir must be set when UseFafPackages is enabled");
        }
        Ok(())
    }

    pub fn repo_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.repo_dir)
    }

    pub fn save_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.save_dir)
    }

    /// A `retrace-worker.toml` template with every key documented, for
    /// `retrace-worker-cli doctor --init`.
    pub fn default_toml_template() -> String {
        r#"# retrace-worker.toml
email_notify = false
email_notify_from = "retrace@localhost"
repo_dir = "/var/cache/retrace-worker/repos"
require_gpg_check = true
use_faf_packages = false
# faf_link_dir = "/var/cache/faf"
retrace_environment = "mock" # one of: mock, podman, native
save_dir = "/var/spool/retrace-worker"
kernel_chroot_repo = "https://kojipkgs.fedoraproject.org/repos/rawhide/latest/$ARCH/"
auth_group = "mock"

[bins]
coredump2packages = "coredump2packages"
makedumpfile = "makedumpfile"
crash = "crash"
mock = "mock"
podman = "podman"
gdb = "gdb"
sendmail = "/usr/sbin/sendmail"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_validates() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn unknown_environment_fails_validation() {
        let mut config = WorkerConfig::default();
        config.retrace_environment = "bogus".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn faf_requires_link_dir() {
        let mut config = WorkerConfig::default();
        config.use_faf_packages = true;
        assert!(config.validate().is_err());
        config.faf_link_dir = Some("/var/cache/faf".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_dir_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.retrace_environment, "mock");
    }

    #[test]
    fn load_from_file_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retrace-worker.toml");
        std::fs::write(&path, WorkerConfig::default_toml_template()).unwrap();
        let config = WorkerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.auth_group, "mock");
    }

    #[test]
    #[serial]
    #[allow(unsafe_code)]
    fn binary_path_env_override() {
        let bins = bins_default();
        unsafe {
            env::set_var("RETRACE_WORKER_GDB_BIN", "/opt/custom/gdb");
        }
        assert_eq!(bins.resolved("gdb"), "/opt/custom/gdb");
        unsafe {
            env::remove_var("RETRACE_WORKER_GDB_BIN");
        }
        assert_eq!(bins.resolved("gdb"), "gdb");
    }
}
