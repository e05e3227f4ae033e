//! The closed per-distribution strategy table.
//!
//! Replaces a dynamic, loadable-module plugin registry with a fixed set of
//! [`ReleaseStrategy`] values compiled into this crate. Selection is
//! first-match on a release-file regex, with a package-NVR regex as a
//! second chance when no release file is present.

use regex::Regex;
use retrace_worker_types::ReleaseStrategy;

pub const FEDORA: ReleaseStrategy = ReleaseStrategy {
    distribution: "fedora",
    release_patterns: &[r"Fedora release (\d+|Rawhide)"],
    package_patterns: &[r"\.fc(\d+)\."],
    gpg_key_templates: &["file:///etc/pki/rpm-gpg/RPM-GPG-KEY-fedora-{version}-primary"],
    gdb_binary: "gdb",
    gdb_package: "gdb",
};

pub const RHEL: ReleaseStrategy = ReleaseStrategy {
    distribution: "rhel",
    release_patterns: &[r"Red Hat Enterprise Linux.*release (\d+)"],
    package_patterns: &[r"\.el(\d+)"],
    gpg_key_templates: &["file:///etc/pki/rpm-gpg/RPM-GPG-KEY-redhat-release"],
    gdb_binary: "gdb",
    gdb_package: "gdb",
};

pub const CENTOS: ReleaseStrategy = ReleaseStrategy {
    distribution: "centos",
    release_patterns: &[r"CentOS(?: Linux)? release (\d+)"],
    package_patterns: &[r"\.el(\d+)\.centos"],
    gpg_key_templates: &["file:///etc/pki/rpm-gpg/RPM-GPG-KEY-CentOS-{version}"],
    gdb_binary: "gdb",
    gdb_package: "gdb",
};

/// All compiled-in strategies, tried in order.
pub const ALL: &[ReleaseStrategy] = &[FEDORA, RHEL, CENTOS];

/// First strategy whose release-file regex matches `release_text`.
pub fn match_release_text(release_text: &str) -> Option<&'static ReleaseStrategy> {
    ALL.iter().find(|strategy| {
        strategy
            .release_patterns
            .iter()
            .any(|pat| Regex::new(pat).map(|re| re.is_match(release_text)).unwrap_or(false))
    })
}

/// First strategy whose package-NVR regex matches `package`, used as the
/// fall-back guess when no release file could be read.
pub fn match_package_name(package: &str) -> Option<&'static ReleaseStrategy> {
    ALL.iter().find(|strategy| {
        strategy
            .package_patterns
            .iter()
            .any(|pat| Regex::new(pat).map(|re| re.is_match(package)).unwrap_or(false))
    })
}

/// Extract the numeric (or `rawhide`) version token a strategy's release
/// pattern captured, given the matched strategy and the original text.
pub fn extract_version(strategy: &ReleaseStrategy, text: &str) -> Option<String> {
    strategy.release_patterns.iter().find_map(|pat| {
        let re = Regex::new(pat).ok()?;
        let caps = re.captures(text)?;
        caps.get(1).map(|m| m.as_str().to_string())
    })
}

/// Extract the numeric version token from a package NVR using a strategy's
/// package pattern.
pub fn extract_version_from_package(strategy: &ReleaseStrategy, package: &str) -> Option<String> {
    strategy.package_patterns.iter().find_map(|pat| {
        let re = Regex::new(pat).ok()?;
        let caps = re.captures(package)?;
        caps.get(1).map(|m| m.as_str().to_string())
    })
}

/// Render the GPG key string for a release: the strategy's templates with
/// `{version}` substituted, space-joined, plus — for rawhide releases — the
/// first template rendered with the pre-rawhide fallback version appended.
pub fn gpg_keys(strategy: &ReleaseStrategy, version: &str, pre_rawhide_version: Option<&str>) -> String {
    let mut parts: Vec<String> = strategy
        .gpg_key_templates
        .iter()
        .map(|tpl| tpl.replace("{version}", version))
        .collect();
    if let (Some(pre), Some(first)) = (pre_rawhide_version, strategy.gpg_key_templates.first()) {
        parts.push(first.replace("{version}", pre));
    }
    parts.join(" ")
}
