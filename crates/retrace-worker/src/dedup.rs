//! C7 — Vmcore Deduplicator.
//!
//! Replaces a vmcore file with a hardlink to a byte-identical one from a
//! sibling task, following the exact guard order from §4.7: stat both,
//! skip on any mismatch or shared inode, hardlink, unlink, rename.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Returns the number of bytes saved (the shared size) on a successful
/// dedup, or 0 on any skip/failure path — never an error, matching the
/// upstream "log and abort" semantics.
pub fn dedup_vmcore(candidate: &Path, primary: &Path, candidate_md5: &str, primary_md5: &str) -> u64 {
    let Ok(candidate_meta) = fs::metadata(candidate) else {
        return 0;
    };
    let Ok(primary_meta) = fs::metadata(primary) else {
        return 0;
    };

    if candidate_meta.ino() == primary_meta.ino() && candidate_meta.dev() == primary_meta.dev() {
        return 0;
    }
    if candidate_meta.len() != primary_meta.len() {
        return 0;
    }
    if !is_valid_md5(candidate_md5) || !is_valid_md5(primary_md5) {
        return 0;
    }
    if !candidate_md5.eq_ignore_ascii_case(primary_md5) {
        return 0;
    }

    let link_path = candidate.with_extension("link");
    if fs::hard_link(primary, &link_path).is_err() {
        return 0;
    }
    if fs::remove_file(candidate).is_err() {
        let _ = fs::remove_file(&link_path);
        return 0;
    }
    if fs::rename(&link_path, candidate).is_err() {
        let _ = fs::remove_file(&link_path);
        return 0;
    }

    candidate_meta.len()
}

fn is_valid_md5(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Compute the MD5 hex digest of a file, for use as `candidate_md5`/
/// `primary_md5` inputs to [`dedup_vmcore`].
pub fn md5_of_file(path: &Path) -> std::io::Result<String> {
    use md5::{Digest, Md5};
    let bytes = fs::read(path)?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt as _;
    use tempfile::tempdir;

    #[test]
    fn dedup_links_identical_files() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary");
        let candidate = dir.path().join("candidate");
        fs::write(&primary, vec![0u8; 1024]).unwrap();
        fs::write(&candidate, vec![0u8; 1024]).unwrap();
        let md5 = md5_of_file(&primary).unwrap();

        let saved = dedup_vmcore(&candidate, &primary, &md5, &md5);
        assert_eq!(saved, 1024);
        let primary_meta = fs::metadata(&primary).unwrap();
        let candidate_meta = fs::metadata(&candidate).unwrap();
        assert_eq!(primary_meta.ino(), candidate_meta.ino());
    }

    #[test]
    fn dedup_skips_on_size_mismatch() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary");
        let candidate = dir.path().join("candidate");
        fs::write(&primary, vec![0u8; 2048]).unwrap();
        fs::write(&candidate, vec![0u8; 1024]).unwrap();
        let saved = dedup_vmcore(&candidate, &primary, "a".repeat(32).as_str(), "a".repeat(32).as_str());
        assert_eq!(saved, 0);
    }

    #[test]
    fn dedup_skips_on_md5_mismatch() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary");
        let candidate = dir.path().join("candidate");
        fs::write(&primary, vec![1u8; 1024]).unwrap();
        fs::write(&candidate, vec![1u8; 1024]).unwrap();
        let saved = dedup_vmcore(&candidate, &primary, &"a".repeat(32), &"b".repeat(32));
        assert_eq!(saved, 0);
    }

    #[test]
    fn dedup_skips_on_invalid_md5_length() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary");
        let candidate = dir.path().join("candidate");
        fs::write(&primary, vec![1u8; 1024]).unwrap();
        fs::write(&candidate, vec![1u8; 1024]).unwrap();
        let saved = dedup_vmcore(&candidate, &primary, "short", "short");
        assert_eq!(saved, 0);
    }

    #[test]
    fn dedup_skips_when_already_shared_inode() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary");
        let candidate = dir.path().join("candidate");
        fs::write(&primary, vec![1u8; 1024]).unwrap();
        fs::hard_link(&primary, &candidate).unwrap();
        let md5 = md5_of_file(&primary).unwrap();
        let saved = dedup_vmcore(&candidate, &primary, &md5, &md5);
        assert_eq!(saved, 0);
    }

    #[test]
    fn dedup_skips_when_primary_missing() {
        let dir = tempdir().unwrap();
        let candidate = dir.path().join("candidate");
        fs::write(&candidate, vec![1u8; 1024]).unwrap();
        let saved = dedup_vmcore(&candidate, &dir.path().join("missing"), &"a".repeat(32), &"a".repeat(32));
        assert_eq!(saved, 0);
    }
}
