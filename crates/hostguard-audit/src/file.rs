//! Durable audit log: one JSON `AuditEvent` per line.
//!
//! Every `write` appends a line and fsyncs before returning, so an entry
//! the dispatcher reported as written survives power loss. On open, the
//! chain head is recovered from the last line so sequence numbers and hash
//! links continue across restarts.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, error, info};

use hostguard_contracts::{
    audit::AuditEntry,
    error::{AgentError, AgentResult},
};
use hostguard_core::traits::AuditWriter;

use crate::{
    chain::{find_break, ChainHead},
    event::AuditEvent,
};

/// Audit files are readable by the agent's group, never by others.
const AUDIT_FILE_MODE: u32 = 0o640;

struct FileState {
    file: File,
    head: ChainHead,
}

/// Append-only JSONL audit writer.
pub struct JsonlAuditWriter {
    path: PathBuf,
    state: Mutex<FileState>,
}

fn write_failed(path: &Path, action: &str, e: impl std::fmt::Display) -> AgentError {
    AgentError::AuditWriteFailed {
        reason: format!("failed to {action} '{}': {e}", path.display()),
    }
}

impl JsonlAuditWriter {
    /// Open (or create) the log at `path` and resume its chain.
    ///
    /// Fails if the last line is not a valid event: appending after a
    /// damaged tail would bury the damage.
    pub fn open(path: impl Into<PathBuf>) -> AgentResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_failed(parent, "create directory", e))?;
        }

        let head = match read_last_event(&path)? {
            Some(event) => ChainHead::after(&event),
            None => ChainHead::genesis(),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(AUDIT_FILE_MODE)
            .open(&path)
            .map_err(|e| write_failed(&path, "open", e))?;

        info!(
            path = %path.display(),
            next_sequence = head.next_sequence,
            "audit log opened"
        );
        Ok(Self {
            path,
            state: Mutex::new(FileState { file, head }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditWriter for JsonlAuditWriter {
    fn write(&self, entry: &AuditEntry) -> AgentResult<()> {
        let mut state = self.lock();
        let event = state.head.link(entry)?;

        let mut line = serde_json::to_vec(&event).map_err(|e| write_failed(&self.path, "encode entry for", e))?;
        line.push(b'\n');

        let written = state.file.write_all(&line).and_then(|()| state.file.sync_data());
        if let Err(e) = written {
            error!(path = %self.path.display(), error = %e, "audit append failed");
            return Err(write_failed(&self.path, "append to", e));
        }

        debug!(sequence = event.sequence, operation_id = %entry.operation_id, "audit entry written");
        state.head.advance(&event);
        Ok(())
    }
}

fn read_events(path: &Path) -> AgentResult<Vec<AuditEvent>> {
    let file = File::open(path).map_err(|e| write_failed(path, "open", e))?;
    let mut events = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| write_failed(path, "read", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent = serde_json::from_str(&line).map_err(|e| AgentError::AuditWriteFailed {
            reason: format!("line {} of '{}' is not an audit event: {e}", n + 1, path.display()),
        })?;
        events.push(event);
    }
    Ok(events)
}

fn read_last_event(path: &Path) -> AgentResult<Option<AuditEvent>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path).map_err(|e| write_failed(path, "open", e))?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| write_failed(path, "read", e))?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    last.map(|line| {
        serde_json::from_str(&line).map_err(|e| AgentError::AuditWriteFailed {
            reason: format!("last line of '{}' is not an audit event: {e}", path.display()),
        })
    })
    .transpose()
}

/// Summary of a verified audit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedLog {
    pub entries: usize,
    /// `this_hash` of the last event, `GENESIS_HASH` for an empty log.
    pub terminal_hash: String,
}

/// Read and verify the whole chain at `path`.
pub fn verify_file(path: &Path) -> AgentResult<VerifiedLog> {
    let events = read_events(path)?;
    if let Some(sequence) = find_break(&events) {
        return Err(AgentError::AuditWriteFailed {
            reason: format!("audit chain in '{}' breaks at sequence {sequence}", path.display()),
        });
    }
    Ok(VerifiedLog {
        entries: events.len(),
        terminal_hash: events
            .last()
            .map(|e| e.this_hash.clone())
            .unwrap_or_else(|| AuditEvent::GENESIS_HASH.to_string()),
    })
}
