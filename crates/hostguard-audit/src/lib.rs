//! # hostguard-audit
//!
//! Append-only, SHA-256 hash-chained audit log for the HOSTGUARD agent.
//!
//! ## Overview
//!
//! Every entry the dispatcher records is wrapped in an `AuditEvent` that
//! links to the previous event via its SHA-256 hash. Tampering with any
//! event, even a single byte, breaks the chain and is detected by
//! `verify_chain` / `verify_file`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hostguard_audit::JsonlAuditWriter;
//! use hostguard_core::traits::AuditWriter;
//!
//! let writer = JsonlAuditWriter::open("/var/lib/hostguard/audit.jsonl")?;
//! writer.write(&entry)?;
//! ```

pub mod chain;
pub mod event;
pub mod file;
pub mod memory;

pub use chain::{find_break, hash_event, verify_chain, ChainHead};
pub use event::AuditEvent;
pub use file::{verify_file, JsonlAuditWriter, VerifiedLog};
pub use memory::InMemoryAuditWriter;

// ── Tests ─────────────────────────────────────────────────────────────────────
