//! Hash-chain primitives: hashing, appending and integrity verification.
//!
//! Hash input layout (bytes, in order):
//!   1. sequence as 8-byte little-endian
//!   2. prev_hash as UTF-8 bytes (64 ASCII hex chars)
//!   3. canonical JSON of the entry (serde_json, no pretty-printing)

use sha2::{Digest, Sha256};

use hostguard_contracts::{
    audit::AuditEntry,
    error::{AgentError, AgentResult},
};

use crate::event::AuditEvent;

/// Compute the SHA-256 hash for a single audit event.
///
/// Returns a lowercase 64-character hex string.
pub fn hash_event(sequence: u64, entry: &AuditEntry, prev_hash: &str) -> AgentResult<String> {
    let entry_json = serde_json::to_vec(entry).map_err(|e| AgentError::AuditWriteFailed {
        reason: format!("audit entry is not serializable: {e}"),
    })?;

    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(&entry_json);

    Ok(hex::encode(hasher.finalize()))
}

/// Where the next event attaches to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub next_sequence: u64,
    pub last_hash: String,
}

impl ChainHead {
    pub fn genesis() -> Self {
        Self {
            next_sequence: 0,
            last_hash: AuditEvent::GENESIS_HASH.to_string(),
        }
    }

    /// The head that follows `event`.
    pub fn after(event: &AuditEvent) -> Self {
        Self {
            next_sequence: event.sequence + 1,
            last_hash: event.this_hash.clone(),
        }
    }

    /// Link `entry` into the chain. The head only advances once the caller
    /// commits the returned event with [`ChainHead::advance`].
    pub fn link(&self, entry: &AuditEntry) -> AgentResult<AuditEvent> {
        let this_hash = hash_event(self.next_sequence, entry, &self.last_hash)?;
        Ok(AuditEvent {
            sequence: self.next_sequence,
            entry: entry.clone(),
            prev_hash: self.last_hash.clone(),
            this_hash,
        })
    }

    pub fn advance(&mut self, event: &AuditEvent) {
        *self = Self::after(event);
    }
}

/// Sequence number of the first event that breaks the chain, if any.
///
/// An event breaks the chain when its sequence is out of order, its
/// `prev_hash` does not equal the previous event's `this_hash` (or
/// `GENESIS_HASH` for the first), or its `this_hash` does not match the
/// value recomputed from its own fields.
pub fn find_break(events: &[AuditEvent]) -> Option<u64> {
    let mut head = ChainHead::genesis();

    for event in events {
        if event.sequence != head.next_sequence || event.prev_hash != head.last_hash {
            return Some(event.sequence);
        }
        match hash_event(event.sequence, &event.entry, &event.prev_hash) {
            Ok(recomputed) if recomputed == event.this_hash => {}
            _ => return Some(event.sequence),
        }
        head.advance(event);
    }

    None
}

/// True when the whole chain verifies. An empty chain is valid.
pub fn verify_chain(events: &[AuditEvent]) -> bool {
    find_break(events).is_none()
}
