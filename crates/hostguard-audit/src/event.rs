//! Audit event type.
//!
//! `AuditEvent` is a single line of the audit log: an `AuditEntry` wrapped
//! with its position in the chain and the SHA-256 hashes that make
//! tampering detectable.

use serde::{Deserialize, Serialize};

use hostguard_contracts::audit::AuditEntry;

/// A single entry in the SHA-256 hash chain.
///
/// Each event commits to the previous event via `prev_hash`. Modifying any
/// field, including those of the embedded `entry`, invalidates `this_hash`
/// and every subsequent `prev_hash`, which `verify_chain` detects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Position in the chain, starting at 0 and never reused.
    pub sequence: u64,

    pub entry: AuditEntry,

    /// SHA-256 hash (hex) of the previous event, or `GENESIS_HASH` for the
    /// first event.
    pub prev_hash: String,

    /// SHA-256 hash (hex) over (sequence, prev_hash, canonical JSON of entry).
    pub this_hash: String,
}

impl AuditEvent {
    /// The sentinel `prev_hash` of the first event in a log.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";
}
