//! Release directories and the `current` indirection.
//!
//! Layout under the releases root:
//!
//! ```text
//! <root>/0.1.0/                     one directory per verified version
//! <root>/0.2.0/
//! <root>/current -> 0.2.0           relative symlink, swapped atomically
//! <root>/.staging-0.3.0-<uuid>/     in-progress copy, never referenced
//! ```
//!
//! Everything here is synchronous filesystem work; async callers run it on
//! the blocking pool.

use std::{
    fs,
    io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hostguard_contracts::{
    error::{AgentError, AgentResult, ValidationCode},
    release::{LedgerDocument, ReleaseStatus},
};

use crate::ledger::sync_dir;

pub const CURRENT_LINK: &str = "current";
const STAGING_PREFIX: &str = ".staging-";
const LINK_TEMP_PREFIX: &str = "current.tmp-";

fn io_error(action: &str, path: &Path, e: io::Error) -> AgentError {
    AgentError::execution(format!("cannot {action} '{}': {e}", path.display()))
}

fn verification_error(detail: impl Into<String>) -> AgentError {
    AgentError::UpdateVerification { detail: detail.into() }
}

/// Check that `version` is `MAJOR.MINOR.PATCH` with an optional
/// `-pre.release` and `+build` suffix.
pub fn validate_version(version: &str) -> AgentResult<()> {
    let bad = |why: &str| {
        AgentError::validation(ValidationCode::BadArguments, format!("version '{version}' {why}"))
    };

    let (rest, build) = match version.split_once('+') {
        Some((rest, build)) => (rest, Some(build)),
        None => (version, None),
    };
    let (core, pre) = match rest.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (rest, None),
    };

    let numbers: Vec<&str> = core.split('.').collect();
    if numbers.len() != 3 {
        return Err(bad("is not MAJOR.MINOR.PATCH"));
    }
    for n in numbers {
        if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad("has a non-numeric component"));
        }
        if n.len() > 1 && n.starts_with('0') {
            return Err(bad("has a leading zero"));
        }
    }

    for suffix in [pre, build].into_iter().flatten() {
        let valid = suffix.split('.').all(|ident| {
            !ident.is_empty() && ident.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
        if !valid {
            return Err(bad("has an invalid pre-release or build suffix"));
        }
    }
    Ok(())
}

/// SHA-256 over every regular file below `dir`, in sorted path order. Each
/// file contributes its `/`-separated relative path, a NUL byte, its length
/// as 8 little-endian bytes, and its contents.
///
/// Symlinks and special files are rejected.
pub fn compute_checksum(dir: &Path) -> AgentResult<String> {
    let mut files = Vec::new();
    collect_files(dir, "", &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for relative in &files {
        let path = dir.join(relative);
        let len = fs::metadata(&path).map_err(|e| io_error("stat", &path, e))?.len();
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(len.to_le_bytes());
        let mut file = fs::File::open(&path).map_err(|e| io_error("open", &path, e))?;
        io::copy(&mut file, &mut hasher).map_err(|e| io_error("read", &path, e))?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<String>) -> AgentResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| io_error("read directory", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error("read directory", dir, e))?;
        let name = entry.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| verification_error(format!("non UTF-8 file name in '{}'", dir.display())))?;
        let relative = if prefix.is_empty() { name.to_string() } else { format!("{prefix}/{name}") };

        let file_type = entry.file_type().map_err(|e| io_error("stat", &entry.path(), e))?;
        if file_type.is_symlink() {
            return Err(verification_error(format!("release contains a symlink: {relative}")));
        } else if file_type.is_dir() {
            collect_files(&entry.path(), &relative, out)?;
        } else if file_type.is_file() {
            out.push(relative);
        } else {
            return Err(verification_error(format!("release contains a special file: {relative}")));
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> AgentResult<()> {
    fs::create_dir(dest).map_err(|e| io_error("create", dest, e))?;
    let entries = fs::read_dir(source).map_err(|e| io_error("read directory", source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error("read directory", source, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| io_error("stat", &from, e))?;
        if file_type.is_symlink() {
            return Err(verification_error(format!(
                "release source contains a symlink: {}",
                from.display()
            )));
        } else if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to).map_err(|e| io_error("copy", &from, e))?;
        } else {
            return Err(verification_error(format!(
                "release source contains a special file: {}",
                from.display()
            )));
        }
    }
    Ok(())
}

/// A copy of a release that has not been verified or made visible yet.
#[derive(Debug, Clone)]
pub struct StagedRelease {
    pub version: String,
    pub dir: PathBuf,
    pub checksum: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The symlink was pointed back at the ledger's current version.
    pub repointed: bool,
    pub removed_leftovers: usize,
}

#[derive(Debug, Clone)]
pub struct ReleaseManager {
    root: PathBuf,
    keep_releases: usize,
}

impl ReleaseManager {
    pub fn new(root: impl Into<PathBuf>, keep_releases: usize) -> Self {
        Self { root: root.into(), keep_releases }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.root.join(version)
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    /// The version the `current` symlink points at, if any.
    pub fn current_target(&self) -> AgentResult<Option<String>> {
        let link = self.current_link();
        match fs::read_link(&link) {
            Ok(target) => Ok(target.file_name().and_then(|n| n.to_str()).map(str::to_string)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read link", &link, e)),
        }
    }

    /// Copy `source` into a fresh staging directory and hash it.
    pub fn stage(&self, version: &str, source: &Path) -> AgentResult<StagedRelease> {
        validate_version(version)?;
        if !source.is_dir() {
            return Err(AgentError::validation(
                ValidationCode::BadArguments,
                format!("release source '{}' is not a directory", source.display()),
            ));
        }
        fs::create_dir_all(&self.root).map_err(|e| io_error("create", &self.root, e))?;

        let dir = self.root.join(format!("{STAGING_PREFIX}{version}-{}", Uuid::new_v4()));
        let staged = copy_tree(source, &dir).and_then(|()| compute_checksum(&dir));
        match staged {
            Ok(checksum) => {
                debug!(version = %version, dir = %dir.display(), "release staged");
                Ok(StagedRelease { version: version.to_string(), dir, checksum })
            }
            Err(e) => {
                remove_tree(&dir);
                Err(e)
            }
        }
    }

    /// Compare the staged checksum with the declared one. A mismatch
    /// discards the staging directory.
    pub fn verify(&self, staged: &StagedRelease, expected: &str) -> AgentResult<()> {
        if staged.checksum.eq_ignore_ascii_case(expected.trim()) {
            return Ok(());
        }
        self.discard(staged);
        warn!(
            version = %staged.version,
            expected = %expected,
            actual = %staged.checksum,
            "staged release failed checksum verification"
        );
        Err(verification_error(format!(
            "checksum mismatch for {}: declared {expected}, computed {}",
            staged.version, staged.checksum
        )))
    }

    pub fn discard(&self, staged: &StagedRelease) {
        remove_tree(&staged.dir);
    }

    /// Remove a finalized release directory the ledger no longer tracks.
    pub fn remove_release(&self, version: &str) {
        remove_tree(&self.release_dir(version));
    }

    /// Move a verified staging directory to its version-named place.
    ///
    /// A leftover directory for the same version (an earlier failed or
    /// retired install) is replaced; the directory `current` points at
    /// never is.
    pub fn finalize(&self, staged: StagedRelease) -> AgentResult<PathBuf> {
        let target = self.release_dir(&staged.version);
        if self.current_target()?.as_deref() == Some(staged.version.as_str()) {
            self.discard(&staged);
            return Err(AgentError::validation(
                ValidationCode::BadArguments,
                format!("release {} is the active release", staged.version),
            ));
        }
        if target.exists() {
            fs::remove_dir_all(&target).map_err(|e| io_error("remove", &target, e))?;
        }
        if let Err(e) = fs::rename(&staged.dir, &target) {
            self.discard(&staged);
            return Err(io_error("rename staging directory to", &target, e));
        }
        sync_dir(&self.root)?;
        Ok(target)
    }

    /// Point `current` at `version` with one rename.
    pub fn activate(&self, version: &str) -> AgentResult<()> {
        let dir = self.release_dir(version);
        if !dir.is_dir() {
            return Err(AgentError::execution(format!(
                "release directory '{}' does not exist",
                dir.display()
            )));
        }

        let temp = self.root.join(format!("{LINK_TEMP_PREFIX}{}", Uuid::new_v4()));
        symlink(version, &temp).map_err(|e| io_error("create symlink", &temp, e))?;
        if let Err(e) = fs::rename(&temp, self.current_link()) {
            let _ = fs::remove_file(&temp);
            return Err(io_error("swap", &self.current_link(), e));
        }
        sync_dir(&self.root)?;

        info!(version = %version, "current release switched");
        Ok(())
    }

    /// Bring the directory tree in line with the ledger after a restart.
    /// The ledger wins: a disagreeing `current` link is repointed.
    pub fn reconcile(&self, ledger: &LedgerDocument) -> AgentResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if !self.root.is_dir() {
            return Ok(report);
        }

        let entries = fs::read_dir(&self.root).map_err(|e| io_error("read directory", &self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error("read directory", &self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) {
                remove_tree(&entry.path());
                report.removed_leftovers += 1;
            } else if name.starts_with(LINK_TEMP_PREFIX) {
                let _ = fs::remove_file(entry.path());
                report.removed_leftovers += 1;
            }
        }

        if let Some(expected) = ledger.current_version.as_deref() {
            let actual = self.current_target()?;
            if actual.as_deref() != Some(expected) {
                warn!(
                    ledger = %expected,
                    link = ?actual,
                    "current link disagrees with the ledger, repointing"
                );
                self.activate(expected)?;
                report.repointed = true;
            }
        }
        Ok(report)
    }

    /// Remove failed and retired release directories beyond the newest
    /// `keep_releases`. Ledger entries are kept. Returns the removed
    /// versions.
    pub fn gc(&self, ledger: &LedgerDocument) -> Vec<String> {
        let mut candidates: Vec<_> = ledger
            .installed_versions
            .iter()
            .filter(|r| matches!(r.status, ReleaseStatus::Failed | ReleaseStatus::Retired))
            .filter(|r| self.release_dir(&r.version).is_dir())
            .collect();
        candidates.sort_by(|a, b| b.staged_at.cmp(&a.staged_at));

        let mut removed = Vec::new();
        for release in candidates.into_iter().skip(self.keep_releases) {
            let dir = self.release_dir(&release.version);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    debug!(version = %release.version, "release directory removed");
                    removed.push(release.version.clone());
                }
                Err(e) => warn!(version = %release.version, error = %e, "cannot remove release directory"),
            }
        }
        removed
    }
}

fn remove_tree(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "cannot remove directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn write_release(dir: &Path, marker: &str) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/frontend"), format!("#!/bin/sh\necho {marker}\n")).unwrap();
        fs::write(dir.join("VERSION"), marker).unwrap();
    }

    #[test]
    fn version_validation() {
        for ok in ["0.1.0", "10.20.30", "1.0.0-rc.1", "1.0.0+build.5", "1.0.0-alpha-2+sha.1f"] {
            assert!(validate_version(ok).is_ok(), "{ok}");
        }
        for bad in ["", "1.0", "1.0.0.0", "01.0.0", "1.a.0", "1.0.0-", "1.0.0-rc..1", "../1.0.0", "1.0.0/x"] {
            assert!(validate_version(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn checksum_depends_on_content_and_names_only() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_release(a.path(), "0.2.0");
        write_release(b.path(), "0.2.0");
        assert_eq!(compute_checksum(a.path()).unwrap(), compute_checksum(b.path()).unwrap());

        fs::write(b.path().join("VERSION"), "0.2.1").unwrap();
        assert_ne!(compute_checksum(a.path()).unwrap(), compute_checksum(b.path()).unwrap());

        fs::rename(a.path().join("VERSION"), a.path().join("VERSION.txt")).unwrap();
        write_release(b.path(), "0.2.0");
        assert_ne!(compute_checksum(a.path()).unwrap(), compute_checksum(b.path()).unwrap());
    }

    #[test]
    fn symlinks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_release(dir.path(), "x");
        symlink("/etc/passwd", dir.path().join("passwd")).unwrap();
        let err = compute_checksum(dir.path()).unwrap_err();
        assert!(matches!(err, AgentError::UpdateVerification { .. }));
    }

    #[test]
    fn staging_never_touches_the_active_release() {
        let root = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write_release(source.path(), "0.1.0");
        let manager = ReleaseManager::new(root.path(), 3);

        let staged = manager.stage("0.1.0", source.path()).unwrap();
        assert!(staged.dir.starts_with(root.path()));
        assert!(!manager.release_dir("0.1.0").exists());
        manager.verify(&staged, &compute_checksum(source.path()).unwrap()).unwrap();

        let dir = manager.finalize(staged).unwrap();
        manager.activate("0.1.0").unwrap();
        assert_eq!(dir, manager.release_dir("0.1.0"));
        assert_eq!(manager.current_target().unwrap().as_deref(), Some("0.1.0"));
        assert_eq!(fs::read_to_string(manager.current_link().join("VERSION")).unwrap(), "0.1.0");
    }

    #[test]
    fn checksum_mismatch_discards_the_staging_directory() {
        let root = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write_release(source.path(), "0.2.0");
        let manager = ReleaseManager::new(root.path(), 3);

        let staged = manager.stage("0.2.0", source.path()).unwrap();
        let err = manager.verify(&staged, &"0".repeat(64)).unwrap_err();
        assert!(matches!(err, AgentError::UpdateVerification { .. }));
        assert!(!staged.dir.exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn activate_requires_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let manager = ReleaseManager::new(root.path(), 3);
        assert!(manager.activate("0.9.0").is_err());
        assert!(manager.current_target().unwrap().is_none());
    }

    #[test]
    fn reconcile_repoints_and_cleans_up() {
        use chrono::Utc;
        use hostguard_contracts::release::Release;

        let root = tempfile::tempdir().unwrap();
        let manager = ReleaseManager::new(root.path(), 3);
        for v in ["0.1.0", "0.2.0"] {
            write_release(&manager.release_dir(v), v);
        }
        manager.activate("0.2.0").unwrap();
        fs::create_dir(root.path().join(".staging-0.3.0-abc")).unwrap();

        let ledger = LedgerDocument {
            current_version: Some("0.1.0".into()),
            installed_versions: vec![Release {
                version: "0.1.0".into(),
                path: manager.release_dir("0.1.0"),
                checksum: String::new(),
                status: ReleaseStatus::Active,
                staged_at: Utc::now(),
            }],
            ..LedgerDocument::default()
        };

        let report = manager.reconcile(&ledger).unwrap();
        assert!(report.repointed);
        assert_eq!(report.removed_leftovers, 1);
        assert_eq!(manager.current_target().unwrap().as_deref(), Some("0.1.0"));
    }

    #[test]
    fn gc_keeps_the_newest_abandoned_releases() {
        use chrono::{Duration, Utc};
        use hostguard_contracts::release::Release;

        let root = tempfile::tempdir().unwrap();
        let manager = ReleaseManager::new(root.path(), 1);
        let now = Utc::now();
        let release = |v: &str, status, age: i64| Release {
            version: v.to_string(),
            path: manager.release_dir(v),
            checksum: String::new(),
            status,
            staged_at: now - Duration::minutes(age),
        };
        let ledger = LedgerDocument {
            current_version: Some("0.4.0".into()),
            installed_versions: vec![
                release("0.1.0", ReleaseStatus::Retired, 40),
                release("0.2.0", ReleaseStatus::Failed, 30),
                release("0.3.0", ReleaseStatus::Retired, 20),
                release("0.4.0", ReleaseStatus::Active, 10),
            ],
            ..LedgerDocument::default()
        };
        for r in &ledger.installed_versions {
            write_release(&r.path, &r.version);
        }

        let mut removed = manager.gc(&ledger);
        removed.sort();
        assert_eq!(removed, vec!["0.1.0".to_string(), "0.2.0".to_string()]);
        assert!(manager.release_dir("0.3.0").is_dir());
        assert!(manager.release_dir("0.4.0").is_dir());
    }
}
