//! Release and version-ledger data types.
//!
//! These are the persisted shapes only. The transitions that keep them
//! consistent live in `hostguard-release`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one installed release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Staged,
    Active,
    PreviousGood,
    Failed,
    /// A former previous-good release displaced by a newer one.
    Retired,
}

/// One release directory known to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub version: String,
    pub path: PathBuf,
    /// Hex SHA-256 of the release contents.
    pub checksum: String,
    pub status: ReleaseStatus,
    pub staged_at: DateTime<Utc>,
}

/// Final outcome of an update attempt, as persisted in `last_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastUpdate {
    pub timestamp: DateTime<Utc>,
    pub from_version: Option<String>,
    pub to_version: String,
    pub status: UpdateOutcome,
    #[serde(default)]
    pub detail: Option<String>,
}

/// One status change, appended to the ledger history and never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransition {
    pub at: DateTime<Utc>,
    pub version: String,
    pub from: Option<ReleaseStatus>,
    pub to: ReleaseStatus,
    pub reason: String,
}

/// The persisted ledger document (`ledger.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub current_version: Option<String>,
    pub previous_good_version: Option<String>,
    /// Every release ever staged, in staging order.
    #[serde(default)]
    pub installed_versions: Vec<Release>,
    #[serde(default)]
    pub history: Vec<LedgerTransition>,
    #[serde(default)]
    pub last_update: Option<LastUpdate>,
    /// Version promoted but not yet confirmed healthy.
    #[serde(default)]
    pub pending_health_check: Option<String>,
}

impl LedgerDocument {
    pub fn release(&self, version: &str) -> Option<&Release> {
        self.installed_versions.iter().find(|r| r.version == version)
    }

    pub fn releases_with_status(&self, status: ReleaseStatus) -> impl Iterator<Item = &Release> {
        self.installed_versions.iter().filter(move |r| r.status == status)
    }
}

/// What the caller declares about a release it asks the agent to install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub version: String,
    /// Hex SHA-256 the staged contents must hash to.
    pub checksum: String,
}
