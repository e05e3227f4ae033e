//! C2 — Release Identifier.
//!
//! Resolves a [`Release`] from release-file text or, failing that, from a
//! package NVR, applying the rawhide remap along the way.

use retrace_worker_types::{CrashInputError, Release};

use crate::strategies::{self};

/// `guess_release`: match release-file text against every strategy's
/// release patterns; on no match, fall back to the package NVR if given.
/// Returns the matched strategy's distribution alongside the resolved
/// `Release`.
pub fn guess_release(
    release_text: Option<&str>,
    architecture: &str,
    package: Option<&str>,
) -> Result<Release, CrashInputError> {
    if let Some(text) = release_text {
        if let Some(strategy) = strategies::match_release_text(text) {
            let version = strategies::extract_version(strategy, text)
                .ok_or(CrashInputError::UnknownRelease)?;
            return Ok(build_release(strategy.distribution, &version, architecture, text));
        }
    }
    if let Some(pkg) = package {
        if let Some(strategy) = strategies::match_package_name(pkg) {
            let version = strategies::extract_version_from_package(strategy, pkg)
                .ok_or(CrashInputError::UnknownRelease)?;
            return Ok(build_release(
                strategy.distribution,
                &version,
                architecture,
                pkg,
            ));
        }
    }
    Err(CrashInputError::UnknownRelease)
}

fn build_release(distribution: &str, version: &str, architecture: &str, release_name: &str) -> Release {
    // Rawhide is keyed off the release *name*, not the captured version: the
    // Fedora release pattern's alternation prefers the numeric branch, so
    // "Fedora release 41 (Rawhide)" captures "41" even though the release is
    // rawhide. The captured digits, when present, are the pre-rawhide
    // version (41 -> pre-rawhide "40"); the caller fills in the fallback
    // from configuration when no digits were captured at all.
    let is_rawhide = release_name.to_ascii_lowercase().contains("rawhide") || version.eq_ignore_ascii_case("rawhide");
    if is_rawhide {
        let pre_rawhide_version = version
            .parse::<i64>()
            .ok()
            .map(|n| (n - 1).to_string());
        Release {
            distribution: distribution.to_string(),
            version: "rawhide".to_string(),
            architecture: architecture.to_string(),
            release_name: release_name.to_string(),
            is_rawhide: true,
            pre_rawhide_version,
        }
    } else {
        Release {
            distribution: distribution.to_string(),
            version: version.to_string(),
            architecture: architecture.to_string(),
            release_name: release_name.to_string(),
            is_rawhide: false,
            pre_rawhide_version: None,
        }
    }
}

/// Fallback fill for `pre_rawhide_version` when the release text carried no
/// digits of its own (plain "Rawhide" with no numeric remnant) — given the
/// current stable version number (e.g. `"41"` yields pre-rawhide `"40"`).
/// A no-op when `build_release` already derived it from captured digits.
pub fn with_pre_rawhide_version(mut release: Release, current_stable: &str) -> Release {
    if release.is_rawhide && release.pre_rawhide_version.is_none() {
        if let Ok(n) = current_stable.parse::<i64>() {
            release.pre_rawhide_version = Some((n - 1).to_string());
        }
    }
    release
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_from_release_text() {
        let release = guess_release(Some("Fedora release 38 (Thirty Eight)"), "x86_64", None).unwrap();
        assert_eq!(release.distribution, "fedora");
        assert_eq!(release.version, "38");
        assert!(!release.is_rawhide);
    }

    #[test]
    fn guess_rawhide_remap() {
        let release = guess_release(Some("Fedora release Rawhide (Rawhide)"), "x86_64", None).unwrap();
        assert_eq!(release.version, "rawhide");
        assert!(release.is_rawhide);
        let release = with_pre_rawhide_version(release, "41");
        assert_eq!(release.pre_rawhide_version.as_deref(), Some("40"));
    }

    #[test]
    fn guess_rawhide_remap_from_numbered_release_text() {
        // The canonical rawhide form: the numeric branch of the release
        // pattern's alternation matches first, so "41" is captured even
        // though the release is rawhide — detection must key off the name.
        let release = guess_release(Some("Fedora release 41 (Rawhide)"), "x86_64", None).unwrap();
        assert!(release.is_rawhide);
        assert_eq!(release.version, "rawhide");
        assert_eq!(release.pre_rawhide_version.as_deref(), Some("40"));
    }

    #[test]
    fn guess_falls_back_to_package_name() {
        let release = guess_release(None, "x86_64", Some("firefox-115.0-1.fc38")).unwrap();
        assert_eq!(release.distribution, "fedora");
        assert_eq!(release.version, "38");
    }

    #[test]
    fn guess_fails_with_nothing_to_go_on() {
        assert!(guess_release(None, "x86_64", None).is_err());
    }

    #[test]
    fn release_id_uses_version_and_arch() {
        let release = guess_release(Some("Fedora release 38"), "x86_64", None).unwrap();
        assert_eq!(release.id(), "fedora-38-x86_64");
    }
}
