//! C1 — Crash Input Reader.
//!
//! Validates required files and reads the small metadata files
//! (`package`, `executable`, `rootdir`, `os_release`) a crash directory
//! carries, under the byte caps in [`retrace_worker_types::allowed_file_cap`].

use std::fs;
use std::path::Path;

use regex::Regex;
use retrace_worker_types::{CrashInputError, VMCORE_SNAPSHOT_SUFFIXES, allowed_file_cap};

/// A parsed RPM-style `name-version-release` package tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPackage {
    pub raw: String,
    pub name: String,
    pub version: String,
    pub release: String,
}

/// `check_required`: a required file is present iff it's a regular file in
/// `dir`, or — only for `file == "vmcore"` — a sibling `vmcore.<suffix>`
/// exists for a recognised snapshot suffix.
pub fn check_required(dir: &Path, file: &str) -> bool {
    if dir.join(file).is_file() {
        return true;
    }
    if file == "vmcore" {
        return VMCORE_SNAPSHOT_SUFFIXES
            .iter()
            .any(|suffix| dir.join(format!("vmcore.{suffix}")).is_file());
    }
    false
}

/// Verify every file `required_files` names is present, returning the
/// first missing one as an error.
pub fn verify_required(dir: &Path, required_files: &[&str]) -> Result<(), CrashInputError> {
    for file in required_files {
        if !check_required(dir, file) {
            return Err(CrashInputError::MissingFile((*file).to_string()));
        }
    }
    Ok(())
}

fn read_capped(dir: &Path, file: &str) -> Result<String, CrashInputError> {
    let path = dir.join(file);
    let metadata = fs::metadata(&path)?;
    if let Some(cap) = allowed_file_cap(file) {
        if metadata.len() > cap {
            return Err(CrashInputError::TooLarge(file.to_string()));
        }
    }
    Ok(fs::read_to_string(&path)?.trim().to_string())
}

static PACKAGE_RE: &str = r"^([^\s]+)-([^-\s]+)-([^-\s]+)$";

/// `read_package`: reads `dir/package`, validating RPM-NVR grammar.
pub fn read_package(dir: &Path) -> Result<ParsedPackage, CrashInputError> {
    let raw = read_capped(dir, "package")?;
    let re = Regex::new(PACKAGE_RE).expect("valid regex");
    let caps = re
        .captures(&raw)
        .ok_or_else(|| CrashInputError::MalformedPackage(raw.clone()))?;
    let name = caps[1].to_string();
    if name.is_empty() {
        return Err(CrashInputError::MalformedPackage(raw));
    }
    Ok(ParsedPackage {
        version: caps[2].to_string(),
        release: caps[3].to_string(),
        raw,
        name,
    })
}

/// Result of resolving which release-describing text to hand to the
/// strategy matcher (C2), after the rootdir/executable-prefix handling in
/// §4.1's `read_release`.
pub struct ReleaseInput {
    pub text: String,
    /// Rewritten `executable` contents, when a `rootdir` prefix was
    /// stripped.
    pub rewritten_executable: Option<String>,
}

/// `read_release`: resolution order is (a) `rootdir` + `executable`
/// prefix-stripping with `os_release_in_rootdir` preferred, (b)
/// `os_release`, (c) `release`. When a `rootdir` prefix is stripped from
/// `executable`, the stripped value is written back to `dir/executable`
/// immediately (matching the upstream pipeline's own side effect), not
/// just returned for the caller to act on.
pub fn read_release(dir: &Path) -> Result<ReleaseInput, CrashInputError> {
    if dir.join("rootdir").is_file() {
        let rootdir = read_capped(dir, "rootdir")?;
        let mut rewritten_executable = None;
        if dir.join("executable").is_file() {
            let executable = read_capped(dir, "executable")?;
            if let Some(stripped) = executable.strip_prefix(&rootdir) {
                let stripped = stripped.to_string();
                fs::write(dir.join("executable"), &stripped)?;
                rewritten_executable = Some(stripped);
            }
        }
        if dir.join("os_release_in_rootdir").is_file() {
            return Ok(ReleaseInput {
                text: read_capped(dir, "os_release_in_rootdir")?,
                rewritten_executable,
            });
        }
    }
    if dir.join("os_release").is_file() {
        return Ok(ReleaseInput {
            text: read_capped(dir, "os_release")?,
            rewritten_executable: None,
        });
    }
    if dir.join("release").is_file() {
        return Ok(ReleaseInput {
            text: read_capped(dir, "release")?,
            rewritten_executable: None,
        });
    }
    Err(CrashInputError::UnknownRelease)
}
