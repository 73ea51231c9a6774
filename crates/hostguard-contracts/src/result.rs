//! Operation results.
//!
//! Exactly one `OperationResult` is produced per request. The same value is
//! replayed verbatim for retries carrying the same idempotency key, so the
//! type serializes deterministically (struct field order, no maps with
//! unstable ordering).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, ErrorKind};

/// Coarse outcome of a request.
///
/// - `Ok`       → the operation ran (or was scheduled) successfully
/// - `Rejected` → refused before any side effect (validation, authorization, guardrail)
/// - `Failed`   → accepted, but the underlying action failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Ok,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: OperationStatus,

    /// Operation-specific body. `null` when there is nothing to return.
    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub error_kind: Option<ErrorKind>,

    /// Machine-readable sub-code (e.g. `"operation_in_progress"`).
    #[serde(default)]
    pub error_code: Option<String>,

    /// Human-readable explanation.
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl OperationResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: OperationStatus::Ok,
            payload,
            error_kind: None,
            error_code: None,
            error_detail: None,
        }
    }

    /// Build the wire result for an error. Refusal classes become
    /// `Rejected`; everything else becomes `Failed`.
    pub fn from_error(err: &AgentError) -> Self {
        let status = if err.is_rejection() {
            OperationStatus::Rejected
        } else {
            OperationStatus::Failed
        };
        Self {
            status,
            payload: Value::Null,
            error_kind: Some(err.kind()),
            error_code: err.code().map(str::to_string),
            error_detail: Some(err.detail().to_string()),
        }
    }

    /// Replace the payload, keeping status and error fields.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == OperationStatus::Ok
    }
}

impl From<Result<Value, AgentError>> for OperationResult {
    fn from(result: Result<Value, AgentError>) -> Self {
        match result {
            Ok(payload) => OperationResult::ok(payload),
            Err(err) => OperationResult::from_error(&err),
        }
    }
}
