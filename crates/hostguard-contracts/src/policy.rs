//! Operation policy types.
//!
//! The policy engine resolves an `operation_id` to an `OperationPolicy`: the
//! handler it dispatches to, how it must be confirmed, whether it takes the
//! process-wide exclusive lock, and the schema its arguments must satisfy.
//! Unknown operations never get this far.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{request::CallerIdentity, verify::ArgumentSchema};

/// How much confirmation an operation needs before it runs.
///
/// Example in TOML:
/// ```toml
/// confirmation = "none"
/// confirmation = "immediate"
/// confirmation = "two-phase"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationClass {
    /// Runs directly (under the exclusive lock if the operation is exclusive).
    None,
    /// Runs within the same request under the exclusive lock, subject to
    /// the class cooldown.
    Immediate,
    /// Token round-trip, then an abort window, then execution.
    TwoPhase,
}

/// The static handler registry. Every catalogue entry names exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Agent status: version pointers, guardrail phases.
    Status,
    ServiceRestart,
    Reboot,
    Shutdown,
    DeviceRead,
    DeviceWrite,
    SelfUpdate,
    /// Read-only view of the version ledger.
    UpdateStatus,
    /// Manual rollback to the previous-good release.
    Rollback,
    /// Cancel a scheduled action during its abort window.
    Cancel,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Status => "status",
            HandlerKind::ServiceRestart => "service_restart",
            HandlerKind::Reboot => "reboot",
            HandlerKind::Shutdown => "shutdown",
            HandlerKind::DeviceRead => "device_read",
            HandlerKind::DeviceWrite => "device_write",
            HandlerKind::SelfUpdate => "self_update",
            HandlerKind::UpdateStatus => "update_status",
            HandlerKind::Rollback => "rollback",
            HandlerKind::Cancel => "cancel",
        }
    }

    /// Handlers that act on the host itself rather than on agent state.
    pub fn is_host_action(self) -> bool {
        matches!(
            self,
            HandlerKind::ServiceRestart
                | HandlerKind::Reboot
                | HandlerKind::Shutdown
                | HandlerKind::DeviceRead
                | HandlerKind::DeviceWrite
        )
    }
}

/// At most `max_executions` executions within any `window_secs` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_executions: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Everything the dispatcher needs to know about one catalogued operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPolicy {
    pub operation_id: String,
    pub description: String,
    pub handler: HandlerKind,
    pub confirmation: ConfirmationClass,
    /// Takes the process-wide exclusive lock while running.
    pub exclusive: bool,
    /// Operations sharing a class share one confirmation/cooldown state
    /// machine.
    pub guardrail_class: String,
    /// Minimum interval between two executions of the class.
    pub cooldown_secs: u64,
    pub rate_limit: Option<RateLimit>,
    pub arguments: ArgumentSchema,
    /// Argument fields replaced by `"[REDACTED]"` in the audit log.
    pub redact: Vec<String>,
    /// Empty means any authenticated peer.
    pub allowed_uids: Vec<u32>,
    /// Empty means any authenticated peer.
    pub allowed_gids: Vec<u32>,
}

impl OperationPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// True when the operation goes through the guardrail state machine.
    pub fn is_guarded(&self) -> bool {
        self.confirmation != ConfirmationClass::None
    }

    /// Whether `caller` may invoke this operation.
    ///
    /// With both allow-lists empty every authenticated peer is permitted.
    /// Otherwise the caller must match at least one listed uid or gid.
    pub fn permits(&self, caller: &CallerIdentity) -> bool {
        if self.allowed_uids.is_empty() && self.allowed_gids.is_empty() {
            return true;
        }
        self.allowed_uids.contains(&caller.uid) || self.allowed_gids.contains(&caller.gid)
    }
}
