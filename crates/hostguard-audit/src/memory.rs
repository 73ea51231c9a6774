//! In-memory implementation of `AuditWriter`.
//!
//! Keeps all events in a `Vec` behind a `Mutex`. Nothing survives a
//! restart; the agent itself uses `JsonlAuditWriter`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use hostguard_contracts::{audit::AuditEntry, error::AgentResult};
use hostguard_core::traits::AuditWriter;

use crate::{
    chain::{verify_chain, ChainHead},
    event::AuditEvent,
};

pub(crate) struct InMemoryState {
    pub(crate) events: Vec<AuditEvent>,
    head: ChainHead,
}

/// An in-memory, append-only audit writer backed by a SHA-256 hash chain.
pub struct InMemoryAuditWriter {
    pub(crate) state: Mutex<InMemoryState>,
}

impl InMemoryAuditWriter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState {
                events: Vec::new(),
                head: ChainHead::genesis(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All events written so far, in chain order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.lock().events.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify that the in-memory chain has not been tampered with.
    pub fn verify_integrity(&self) -> bool {
        verify_chain(&self.lock().events)
    }
}

impl Default for InMemoryAuditWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditWriter for InMemoryAuditWriter {
    fn write(&self, entry: &AuditEntry) -> AgentResult<()> {
        let mut state = self.lock();
        let event = state.head.link(entry)?;
        state.head.advance(&event);
        state.events.push(event);
        Ok(())
    }
}
