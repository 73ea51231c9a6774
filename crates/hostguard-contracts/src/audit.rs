//! Audit entry types.
//!
//! Every accepted request produces exactly one `AuditEntry` of kind
//! `Request`, written before the response leaves the agent. Actions that
//! complete later (after an abort window) add a `DeferredExecution` entry,
//! and a failed automatic rollback adds an `OperatorAlert`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{guardrail::GuardrailDecision, request::CallerIdentity, result::OperationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryKind {
    Request,
    DeferredExecution,
    OperatorAlert,
}

/// An immutable record of one request (or one deferred outcome).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEntryKind,
    pub operation_id: String,
    pub caller: CallerIdentity,
    pub idempotency_key: Option<String>,
    /// Request arguments with policy-listed fields redacted.
    pub arguments: Value,
    pub result: OperationResult,
    pub guardrail: Vec<GuardrailDecision>,
}
