//! Guardrail state and decision types.
//!
//! The state machine itself lives in `hostguard-core`; this module holds the
//! externally visible pieces: the phase names reported by `status`, the
//! handle returned when an abort window opens, and the decisions recorded
//! in every audit entry.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GuardrailCode;

/// Externally visible phase of one guardrail class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailPhase {
    Idle,
    AwaitingConfirmation,
    AbortWindow,
    Executing,
    Cooldown,
}

impl fmt::Display for GuardrailPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardrailPhase::Idle => "idle",
            GuardrailPhase::AwaitingConfirmation => "awaiting_confirmation",
            GuardrailPhase::AbortWindow => "abort_window",
            GuardrailPhase::Executing => "executing",
            GuardrailPhase::Cooldown => "cooldown",
        };
        f.write_str(name)
    }
}

/// Identifies one scheduled action during its abort window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(pub uuid::Uuid);

impl OperationHandle {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// Point-in-time view of one guardrail class, reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSnapshot {
    pub class: String,
    pub phase: GuardrailPhase,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_ms: u64,
}

/// One decision taken while processing a request, recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GuardrailDecision {
    LockAcquired,
    LockBusy { held_by: String },
    TokenIssued { class: String, replaced_previous: bool },
    TokenAccepted { class: String, handle: OperationHandle },
    TokenRejected { class: String, code: GuardrailCode },
    CooldownActive { class: String, remaining_ms: u64 },
    RateLimited { operation_id: String },
    AbortWindowOpened { class: String, handle: OperationHandle, delay_ms: u64 },
    Cancelled { class: String, handle: OperationHandle },
    Executed { class: String },
    IdempotentReplay,
}
