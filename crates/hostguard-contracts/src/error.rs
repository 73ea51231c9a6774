//! The HOSTGUARD error taxonomy.
//!
//! Every fallible operation in the agent returns `AgentResult<T>`. Each
//! variant maps onto one wire-level [`ErrorKind`] and, for the rejecting
//! classes, a machine-readable sub-code so callers can branch without
//! parsing prose.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error class reported on the wire in `OperationResult::error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    AuthorizationError,
    GuardrailViolation,
    ExecutionError,
    UpdateVerificationError,
    RollbackError,
    IpcProtocolError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AuthorizationError => "authorization_error",
            ErrorKind::GuardrailViolation => "guardrail_violation",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::UpdateVerificationError => "update_verification_error",
            ErrorKind::RollbackError => "rollback_error",
            ErrorKind::IpcProtocolError => "ipc_protocol_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request was rejected before any side effect ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    UnknownOperation,
    BadArguments,
    MissingIdempotencyKey,
    /// The idempotency key was already used for a different operation or
    /// different arguments.
    IdempotencyConflict,
}

impl ValidationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationCode::UnknownOperation => "unknown_operation",
            ValidationCode::BadArguments => "bad_arguments",
            ValidationCode::MissingIdempotencyKey => "missing_idempotency_key",
            ValidationCode::IdempotencyConflict => "idempotency_conflict",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the safety guardrail layer refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailCode {
    /// A two-phase operation was requested without a token. The result
    /// payload carries a freshly issued token.
    ConfirmationRequired,
    TokenMismatch,
    TokenExpired,
    /// A token was presented while the class was not awaiting confirmation.
    NoPendingConfirmation,
    CooldownActive,
    OperationInProgress,
    RateLimited,
    UnknownHandle,
    /// The handle exists but its action has already started executing.
    NotCancellable,
}

impl GuardrailCode {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardrailCode::ConfirmationRequired => "confirmation_required",
            GuardrailCode::TokenMismatch => "token_mismatch",
            GuardrailCode::TokenExpired => "token_expired",
            GuardrailCode::NoPendingConfirmation => "no_pending_confirmation",
            GuardrailCode::CooldownActive => "cooldown_active",
            GuardrailCode::OperationInProgress => "operation_in_progress",
            GuardrailCode::RateLimited => "rate_limited",
            GuardrailCode::UnknownHandle => "unknown_handle",
            GuardrailCode::NotCancellable => "not_cancellable",
        }
    }
}

impl fmt::Display for GuardrailCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unified error type for the HOSTGUARD agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Unknown operation, malformed arguments, or a bad idempotency key.
    /// Always raised before any side effect.
    #[error("validation failed ({code}): {detail}")]
    Validation { code: ValidationCode, detail: String },

    /// The authenticated peer is not permitted to invoke the operation.
    #[error("caller not authorized: {detail}")]
    Authorization { detail: String },

    /// Confirmation, cooldown, rate-limit or exclusivity refusal. Handled
    /// locally and never escalated.
    #[error("guardrail violation ({code}): {detail}")]
    Guardrail { code: GuardrailCode, detail: String },

    /// The underlying OS action failed.
    #[error("execution failed: {detail}")]
    Execution { detail: String },

    /// A staged release did not match its declared checksum or layout.
    #[error("update verification failed: {detail}")]
    UpdateVerification { detail: String },

    /// Automatic recovery itself failed. The only class that requires
    /// operator intervention.
    #[error("rollback failed: {detail}")]
    Rollback { detail: String },

    /// Transport framing was malformed.
    #[error("IPC protocol error: {detail}")]
    IpcProtocol { detail: String },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// The audit writer could not persist an entry.
    #[error("audit write failed: {reason}")]
    AuditWriteFailed { reason: String },

    /// The version ledger could not be persisted or loaded.
    #[error("ledger error: {reason}")]
    Ledger { reason: String },
}

impl AgentError {
    pub fn validation(code: ValidationCode, detail: impl Into<String>) -> Self {
        AgentError::Validation { code, detail: detail.into() }
    }

    pub fn guardrail(code: GuardrailCode, detail: impl Into<String>) -> Self {
        AgentError::Guardrail { code, detail: detail.into() }
    }

    pub fn execution(detail: impl Into<String>) -> Self {
        AgentError::Execution { detail: detail.into() }
    }

    /// The wire-level class for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Validation { .. } => ErrorKind::ValidationError,
            AgentError::Authorization { .. } => ErrorKind::AuthorizationError,
            AgentError::Guardrail { .. } => ErrorKind::GuardrailViolation,
            AgentError::Execution { .. } | AgentError::Ledger { .. } => ErrorKind::ExecutionError,
            AgentError::UpdateVerification { .. } => ErrorKind::UpdateVerificationError,
            AgentError::Rollback { .. } => ErrorKind::RollbackError,
            AgentError::IpcProtocol { .. } => ErrorKind::IpcProtocolError,
            AgentError::Config { .. } | AgentError::AuditWriteFailed { .. } => {
                ErrorKind::InternalError
            }
        }
    }

    /// The machine-readable sub-code, if the class has one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            AgentError::Validation { code, .. } => Some(code.as_str()),
            AgentError::Guardrail { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// The human-readable part of the error, without the class prefix.
    pub fn detail(&self) -> &str {
        match self {
            AgentError::Validation { detail, .. }
            | AgentError::Authorization { detail }
            | AgentError::Guardrail { detail, .. }
            | AgentError::Execution { detail }
            | AgentError::UpdateVerification { detail }
            | AgentError::Rollback { detail }
            | AgentError::IpcProtocol { detail } => detail,
            AgentError::Config { reason }
            | AgentError::AuditWriteFailed { reason }
            | AgentError::Ledger { reason } => reason,
        }
    }

    /// True for the refusal classes, which map to `status = rejected`.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AgentError::Validation { .. }
                | AgentError::Authorization { .. }
                | AgentError::Guardrail { .. }
        )
    }
}

/// Convenience alias used throughout the HOSTGUARD crates.
pub type AgentResult<T> = Result<T, AgentError>;
