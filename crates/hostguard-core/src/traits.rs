//! Core trait definitions for the HOSTGUARD agent.
//!
//! These traits are the seams between the trusted dispatcher and everything
//! it delegates to:
//!
//! - `PolicyEngine`     — operation catalogue lookup (pure, loaded at startup)
//! - `ArgumentVerifier` — argument schema validation
//! - `AuditWriter`      — append-only audit sink
//! - `HostActions`      — the OS actions themselves (systemctl, sysfs, ...)
//! - `UpdateService`    — self-update, rollback, ledger view
//! - `ServiceControl`   — restart of the service a release belongs to
//! - `HealthProbe`      — liveness check of a newly promoted release
//!
//! The dispatcher wires them together in the correct order. `HostActions`
//! and `UpdateService` are never called unless the policy lookup, argument
//! validation, idempotency check, and guardrails have all passed.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hostguard_contracts::{
    audit::AuditEntry,
    error::AgentResult,
    policy::{HandlerKind, OperationPolicy},
    verify::{ArgumentSchema, ValidationReport},
};

/// The operation catalogue.
///
/// Implementations are loaded once at startup and must be immutable
/// afterwards. Lookups must not perform I/O.
pub trait PolicyEngine: Send + Sync {
    /// Resolve an operation id. Unknown ids return
    /// `AgentError::Validation { code: UnknownOperation, .. }`.
    fn resolve(&self, operation_id: &str) -> AgentResult<&OperationPolicy>;

    /// Every catalogued operation, in declaration order.
    fn operations(&self) -> Vec<&OperationPolicy>;
}

/// Validates request arguments against an operation's schema.
pub trait ArgumentVerifier: Send + Sync {
    /// Return a report with `passed = false` and populated `failures` when
    /// any check fails. `Err` is reserved for verifier malfunction.
    fn verify(&self, arguments: &Value, schema: &ArgumentSchema) -> AgentResult<ValidationReport>;
}

/// The audit sink.
///
/// Every accepted request produces exactly one entry, written before the
/// response is sent. Entries are never modified or deleted.
pub trait AuditWriter: Send + Sync {
    fn write(&self, entry: &AuditEntry) -> AgentResult<()>;
}

/// The host-level actions the agent is the sole authority for.
#[async_trait]
pub trait HostActions: Send + Sync {
    /// Perform `handler` with already-validated `arguments`.
    ///
    /// Only host-action handlers (`HandlerKind::is_host_action`) are routed
    /// here.
    async fn perform(&self, handler: HandlerKind, arguments: &Value) -> AgentResult<Value>;
}

/// Self-update lifecycle, backed by the version ledger.
#[async_trait]
pub trait UpdateService: Send + Sync {
    /// Stage, verify, promote and health-check a release. Rolls back
    /// automatically when the health check fails.
    ///
    /// `cancel` fires on agent shutdown; the ledger must be left at its
    /// last committed state.
    async fn apply_update(&self, arguments: &Value, cancel: CancellationToken) -> AgentResult<Value>;

    /// Return to the previous-good release.
    async fn rollback(&self, cancel: CancellationToken) -> AgentResult<Value>;

    /// Read-only view of the ledger.
    fn status(&self) -> AgentResult<Value>;
}

/// Restarts the service that runs the active release.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn restart(&self, unit: &str) -> AgentResult<()>;
}

/// One liveness probe of the active release.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Err` carries the failure reason; the caller counts failures.
    async fn probe(&self, version: &str) -> AgentResult<()>;
}
