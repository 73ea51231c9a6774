//! Operation requests and caller identity.
//!
//! An `OperationRequest` is what the front end sends over the IPC channel.
//! It is immutable once received; the dispatcher only ever borrows it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request for a catalogued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationRequest {
    /// Identifier from the operation catalogue (e.g. `"reboot"`).
    pub operation_id: String,

    /// Operation arguments, validated against the catalogue schema.
    #[serde(default = "empty_arguments")]
    pub arguments: Value,

    /// Caller-supplied key. Retries with the same key replay the original
    /// result instead of executing again.
    pub idempotency_key: String,

    /// Token returned by a previous bare request for a two-phase operation.
    #[serde(default)]
    pub confirmation_token: Option<String>,
}

fn empty_arguments() -> Value {
    Value::Object(serde_json::Map::new())
}

impl OperationRequest {
    pub fn new(
        operation_id: impl Into<String>,
        arguments: Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            arguments,
            idempotency_key: idempotency_key.into(),
            confirmation_token: None,
        }
    }

    /// Attach a confirmation token.
    pub fn with_confirmation(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }
}

/// The authenticated identity of the peer on the other end of the socket.
///
/// Taken from the kernel (`SO_PEERCRED`), never from anything the client
/// asserts in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl CallerIdentity {
    pub fn new(uid: u32, gid: u32, pid: Option<i32>) -> Self {
        Self { uid, gid, pid }
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "uid={} gid={} pid={}", self.uid, self.gid, pid),
            None => write!(f, "uid={} gid={}", self.uid, self.gid),
        }
    }
}
