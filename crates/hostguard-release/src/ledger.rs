//! The persisted version ledger.
//!
//! Every transition is built on a copy of the current document, checked,
//! written to disk (temp file, fsync, rename, directory fsync) and only
//! then swapped in. A failed persist leaves both the file and the in-memory
//! copy exactly as they were.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use tracing::{debug, info};

use hostguard_contracts::{
    error::{AgentError, AgentResult},
    release::{LastUpdate, LedgerDocument, LedgerTransition, Release, ReleaseStatus, UpdateOutcome},
};

pub const LEDGER_FILE_NAME: &str = "ledger.json";

fn ledger_error(reason: impl Into<String>) -> AgentError {
    AgentError::Ledger { reason: reason.into() }
}

#[derive(Debug)]
pub struct VersionLedger {
    path: PathBuf,
    document: LedgerDocument,
}

impl VersionLedger {
    /// Load the ledger at `path`. A missing file is an empty ledger; it is
    /// not written until the first transition.
    pub fn load(path: impl Into<PathBuf>) -> AgentResult<Self> {
        let path = path.into();
        let document = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<LedgerDocument>(&bytes).map_err(|e| {
                ledger_error(format!("'{}' is not a valid ledger: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerDocument::default(),
            Err(e) => return Err(ledger_error(format!("cannot read '{}': {e}", path.display()))),
        };
        check_invariants(&document)?;

        info!(
            path = %path.display(),
            current_version = ?document.current_version,
            previous_good_version = ?document.previous_good_version,
            "version ledger loaded"
        );
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &LedgerDocument {
        &self.document
    }

    pub fn current_version(&self) -> Option<&str> {
        self.document.current_version.as_deref()
    }

    pub fn previous_good_version(&self) -> Option<&str> {
        self.document.previous_good_version.as_deref()
    }

    pub fn pending_health_check(&self) -> Option<&str> {
        self.document.pending_health_check.as_deref()
    }

    /// Record a verified release directory with status `staged`.
    ///
    /// A version that previously failed or was retired may be staged again;
    /// its entry is replaced. The active and previous-good releases may not.
    pub fn record_staged(&mut self, version: &str, path: &Path, checksum: &str) -> AgentResult<()> {
        self.commit(|doc| {
            let from = match doc.release(version).map(|r| r.status) {
                Some(status @ (ReleaseStatus::Active | ReleaseStatus::PreviousGood)) => {
                    return Err(ledger_error(format!(
                        "release {version} is {} and cannot be staged again",
                        status_name(status)
                    )));
                }
                other => other,
            };
            doc.installed_versions.retain(|r| r.version != version);
            doc.installed_versions.push(Release {
                version: version.to_string(),
                path: path.to_path_buf(),
                checksum: checksum.to_string(),
                status: ReleaseStatus::Staged,
                staged_at: Utc::now(),
            });
            push_history(doc, version, from, ReleaseStatus::Staged, "checksum verified");
            Ok(())
        })
    }

    /// Drop a staged release whose directory was removed before promotion.
    /// The entry leaves `installed_versions`; the history keeps it.
    pub fn record_discarded(&mut self, version: &str, reason: &str) -> AgentResult<()> {
        self.commit(|doc| {
            expect_status(doc, version, ReleaseStatus::Staged)?;
            doc.installed_versions.retain(|r| r.version != version);
            push_history(doc, version, Some(ReleaseStatus::Staged), ReleaseStatus::Failed, reason);
            Ok(())
        })
    }

    /// First install: make a staged release active with nothing to demote.
    pub fn activate_initial(&mut self, version: &str) -> AgentResult<()> {
        self.commit(|doc| {
            if let Some(current) = &doc.current_version {
                return Err(ledger_error(format!(
                    "release {current} is already active; bootstrap only runs on an empty ledger"
                )));
            }
            expect_status(doc, version, ReleaseStatus::Staged)?;
            set_status(doc, version, ReleaseStatus::Active, "initial install");
            doc.current_version = Some(version.to_string());
            Ok(())
        })
    }

    /// Promote a staged release. The active release becomes previous-good,
    /// the old previous-good is retired, and the new version is flagged as
    /// awaiting its health check.
    pub fn promote(&mut self, version: &str) -> AgentResult<()> {
        self.commit(|doc| {
            expect_status(doc, version, ReleaseStatus::Staged)?;

            if let Some(old_previous) = doc.previous_good_version.take() {
                set_status(doc, &old_previous, ReleaseStatus::Retired, "displaced by a newer previous-good");
            }
            if let Some(old_current) = doc.current_version.take() {
                set_status(doc, &old_current, ReleaseStatus::PreviousGood, "demoted by promotion");
                doc.previous_good_version = Some(old_current);
            }
            set_status(doc, version, ReleaseStatus::Active, "promoted");
            doc.current_version = Some(version.to_string());
            doc.pending_health_check = Some(version.to_string());
            Ok(())
        })
    }

    /// The promoted release passed its health check.
    pub fn confirm_healthy(&mut self, version: &str) -> AgentResult<()> {
        self.commit(|doc| {
            if doc.current_version.as_deref() != Some(version) {
                return Err(ledger_error(format!("release {version} is not the active release")));
            }
            doc.pending_health_check = None;
            push_history(doc, version, Some(ReleaseStatus::Active), ReleaseStatus::Active, "health check passed");
            Ok(())
        })
    }

    /// Mark a release that is neither active nor previous-good as failed.
    pub fn mark_failed(&mut self, version: &str, reason: &str) -> AgentResult<()> {
        self.commit(|doc| {
            if doc.current_version.as_deref() == Some(version)
                || doc.previous_good_version.as_deref() == Some(version)
            {
                return Err(ledger_error(format!(
                    "release {version} is still referenced; roll back instead"
                )));
            }
            if doc.release(version).is_none() {
                return Err(ledger_error(format!("release {version} is not in the ledger")));
            }
            set_status(doc, version, ReleaseStatus::Failed, reason);
            Ok(())
        })
    }

    /// Make the previous-good release active again. The abandoned release
    /// takes `abandoned` (`failed` after a failed health check, `retired`
    /// for a manual rollback). Returns the version now active.
    pub fn rollback(&mut self, abandoned: ReleaseStatus, reason: &str) -> AgentResult<String> {
        let target = self
            .document
            .previous_good_version
            .clone()
            .ok_or_else(|| ledger_error("no previous-good release to roll back to"))?;

        self.commit(|doc| {
            if let Some(current) = doc.current_version.take() {
                set_status(doc, &current, abandoned, reason);
            }
            doc.previous_good_version = None;
            set_status(doc, &target, ReleaseStatus::Active, "restored by rollback");
            doc.current_version = Some(target.clone());
            doc.pending_health_check = None;
            Ok(())
        })?;
        Ok(target)
    }

    /// Persist the outcome of the last update attempt.
    pub fn record_outcome(
        &mut self,
        from_version: Option<String>,
        to_version: &str,
        status: UpdateOutcome,
        detail: Option<String>,
    ) -> AgentResult<()> {
        self.commit(|doc| {
            doc.last_update = Some(LastUpdate {
                timestamp: Utc::now(),
                from_version,
                to_version: to_version.to_string(),
                status,
                detail,
            });
            Ok(())
        })
    }

    fn commit<F>(&mut self, transition: F) -> AgentResult<()>
    where
        F: FnOnce(&mut LedgerDocument) -> AgentResult<()>,
    {
        let mut next = self.document.clone();
        transition(&mut next)?;
        check_invariants(&next)?;

        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| ledger_error(format!("cannot serialize ledger: {e}")))?;
        atomic_write(&self.path, &bytes)?;

        debug!(
            current_version = ?next.current_version,
            previous_good_version = ?next.previous_good_version,
            "ledger persisted"
        );
        self.document = next;
        Ok(())
    }
}

fn status_name(status: ReleaseStatus) -> &'static str {
    match status {
        ReleaseStatus::Staged => "staged",
        ReleaseStatus::Active => "active",
        ReleaseStatus::PreviousGood => "previous_good",
        ReleaseStatus::Failed => "failed",
        ReleaseStatus::Retired => "retired",
    }
}

fn expect_status(doc: &LedgerDocument, version: &str, expected: ReleaseStatus) -> AgentResult<()> {
    match doc.release(version) {
        Some(release) if release.status == expected => Ok(()),
        Some(release) => Err(ledger_error(format!(
            "release {version} is {}, expected {}",
            status_name(release.status),
            status_name(expected)
        ))),
        None => Err(ledger_error(format!("release {version} is not in the ledger"))),
    }
}

fn set_status(doc: &mut LedgerDocument, version: &str, to: ReleaseStatus, reason: &str) {
    let from = doc
        .installed_versions
        .iter_mut()
        .find(|r| r.version == version)
        .map(|release| std::mem::replace(&mut release.status, to));
    push_history(doc, version, from, to, reason);
}

fn push_history(
    doc: &mut LedgerDocument,
    version: &str,
    from: Option<ReleaseStatus>,
    to: ReleaseStatus,
    reason: &str,
) {
    doc.history.push(LedgerTransition {
        at: Utc::now(),
        version: version.to_string(),
        from,
        to,
        reason: reason.to_string(),
    });
}

/// Structural consistency of a ledger document.
pub fn check_invariants(doc: &LedgerDocument) -> AgentResult<()> {
    let active: Vec<&str> = doc
        .releases_with_status(ReleaseStatus::Active)
        .map(|r| r.version.as_str())
        .collect();
    let previous: Vec<&str> = doc
        .releases_with_status(ReleaseStatus::PreviousGood)
        .map(|r| r.version.as_str())
        .collect();

    if active.len() > 1 {
        return Err(ledger_error(format!("more than one active release: {active:?}")));
    }
    if active.first().copied() != doc.current_version.as_deref() {
        return Err(ledger_error(format!(
            "current_version {:?} does not match the active release {:?}",
            doc.current_version,
            active.first()
        )));
    }
    if previous.len() > 1 {
        return Err(ledger_error(format!("more than one previous-good release: {previous:?}")));
    }
    if previous.first().copied() != doc.previous_good_version.as_deref() {
        return Err(ledger_error(format!(
            "previous_good_version {:?} does not match {:?}",
            doc.previous_good_version,
            previous.first()
        )));
    }
    if doc.current_version.is_some() && doc.current_version == doc.previous_good_version {
        return Err(ledger_error("current and previous-good versions must differ"));
    }
    Ok(())
}

fn reject_symlink(path: &Path) -> AgentResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(ledger_error(format!(
            "refusing to replace symlink at '{}'",
            path.display()
        ))),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ledger_error(format!("cannot stat '{}': {e}", path.display()))),
    }
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// contents, never a mix, and the rename survives power loss.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> AgentResult<()> {
    use std::os::unix::fs::PermissionsExt;

    reject_symlink(path)?;
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir,
        None => Path::new("."),
    };
    fs::create_dir_all(dir)
        .map_err(|e| ledger_error(format!("cannot create '{}': {e}", dir.display())))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ledger_error(format!("cannot create temp file in '{}': {e}", dir.display())))?;
    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(|e| ledger_error(format!("cannot set temp file permissions: {e}")))?;
    temp.as_file_mut()
        .write_all(bytes)
        .map_err(|e| ledger_error(format!("cannot write temp file: {e}")))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| ledger_error(format!("cannot sync temp file: {e}")))?;
    temp.persist(path)
        .map_err(|e| ledger_error(format!("cannot rename temp file to '{}': {e}", path.display())))?;

    sync_dir(dir)
}

pub(crate) fn sync_dir(dir: &Path) -> AgentResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| ledger_error(format!("cannot sync directory '{}': {e}", dir.display())))
}
