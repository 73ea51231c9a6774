//! The per-class guardrail state machine.
//!
//! Each guardrail class (e.g. `power`) moves through
//!
//!   Idle → AwaitingConfirmation → AbortWindow → Executing → Idle (+ cooldown)
//!
//! A wrong or expired token sends the class back to Idle. Cancelling during
//! the abort window sends it back to Idle without executing. Cooldown is not
//! a stored phase: it is derived from the time of the last execution.
//!
//! All transitions happen under one short, synchronous lock. Callers never
//! hold it across an `.await`.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hostguard_contracts::{
    error::{AgentError, AgentResult, GuardrailCode},
    guardrail::{ClassSnapshot, GuardrailPhase, OperationHandle},
};

/// Raw entropy behind each confirmation token.
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    /// How long an issued confirmation token stays valid.
    pub token_ttl: Duration,
    /// Delay between accepted confirmation and execution.
    pub abort_window: Duration,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(60),
            abort_window: Duration::from_secs(5),
        }
    }
}

/// A freshly issued confirmation token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
    /// True when a live token for the class was invalidated by this one.
    pub replaced_previous: bool,
}

/// An accepted confirmation: the action is now in its abort window.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub handle: OperationHandle,
    /// Fires on `cancel(handle)` or on agent shutdown.
    pub cancel: CancellationToken,
    pub delay: Duration,
}

enum Phase {
    Idle,
    AwaitingConfirmation {
        token: String,
        operation_id: String,
        expires_at: Instant,
    },
    AbortWindow {
        handle: OperationHandle,
        cancel: CancellationToken,
    },
    Executing {
        handle: OperationHandle,
    },
}

struct ClassState {
    phase: Phase,
    last_executed_at: Option<DateTime<Utc>>,
    cooldown_until: Option<Instant>,
}

impl ClassState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            last_executed_at: None,
            cooldown_until: None,
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn external_phase(&self, now: Instant) -> GuardrailPhase {
        match self.phase {
            Phase::Idle if !self.cooldown_remaining(now).is_zero() => GuardrailPhase::Cooldown,
            Phase::Idle => GuardrailPhase::Idle,
            Phase::AwaitingConfirmation { expires_at, .. } if now >= expires_at => {
                GuardrailPhase::Idle
            }
            Phase::AwaitingConfirmation { .. } => GuardrailPhase::AwaitingConfirmation,
            Phase::AbortWindow { .. } => GuardrailPhase::AbortWindow,
            Phase::Executing { .. } => GuardrailPhase::Executing,
        }
    }
}

/// Guardrail state for every class seen since startup.
pub struct GuardrailLayer {
    config: GuardrailConfig,
    shutdown: CancellationToken,
    classes: Mutex<HashMap<String, ClassState>>,
}

impl GuardrailLayer {
    /// `shutdown` is the agent-wide token; every abort window is cancelled
    /// with it.
    pub fn new(config: GuardrailConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            shutdown,
            classes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClassState>> {
        self.classes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject with `cooldown_active` if the class executed too recently.
    pub fn check_cooldown(&self, class: &str) -> AgentResult<()> {
        let classes = self.lock();
        match classes.get(class) {
            Some(state) => cooldown_check(class, state, Instant::now()),
            None => Ok(()),
        }
    }

    /// Remaining cooldown for `class`, zero when none is active.
    pub fn cooldown_remaining(&self, class: &str) -> Duration {
        self.lock()
            .get(class)
            .map(|state| state.cooldown_remaining(Instant::now()))
            .unwrap_or_default()
    }

    /// Issue a confirmation token for `operation_id` in `class`.
    ///
    /// A live token for the class is replaced: only the newest one can
    /// confirm.
    pub fn issue_token(&self, class: &str, operation_id: &str) -> AgentResult<IssuedToken> {
        let now = Instant::now();
        let mut classes = self.lock();
        let state = classes.entry(class.to_string()).or_insert_with(ClassState::new);

        cooldown_check(class, state, now)?;

        let replaced_previous = match &state.phase {
            Phase::Idle => false,
            Phase::AwaitingConfirmation { expires_at, .. } => now < *expires_at,
            Phase::AbortWindow { .. } | Phase::Executing { .. } => {
                return Err(AgentError::guardrail(
                    GuardrailCode::OperationInProgress,
                    format!("an action in guardrail class '{class}' is already scheduled"),
                ));
            }
        };

        let token = generate_token();
        state.phase = Phase::AwaitingConfirmation {
            token: token.clone(),
            operation_id: operation_id.to_string(),
            expires_at: now + self.config.token_ttl,
        };

        debug!(class = %class, operation_id = %operation_id, replaced_previous, "confirmation token issued");
        Ok(IssuedToken {
            token,
            expires_in: self.config.token_ttl,
            replaced_previous,
        })
    }

    /// Check a presented token and, if it matches, open the abort window.
    ///
    /// A mismatching or expired token consumes the pending confirmation: the
    /// class returns to Idle and a fresh token must be requested.
    pub fn confirm(
        &self,
        class: &str,
        operation_id: &str,
        presented: &str,
    ) -> AgentResult<ScheduledAction> {
        let now = Instant::now();
        let mut classes = self.lock();
        let state = classes.entry(class.to_string()).or_insert_with(ClassState::new);

        cooldown_check(class, state, now)?;

        let (expected, bound_to, expires_at) = match &state.phase {
            Phase::AwaitingConfirmation { token, operation_id, expires_at } => {
                (token.clone(), operation_id.clone(), *expires_at)
            }
            Phase::Idle => {
                return Err(AgentError::guardrail(
                    GuardrailCode::NoPendingConfirmation,
                    format!("guardrail class '{class}' has no pending confirmation"),
                ));
            }
            Phase::AbortWindow { .. } | Phase::Executing { .. } => {
                return Err(AgentError::guardrail(
                    GuardrailCode::OperationInProgress,
                    format!("an action in guardrail class '{class}' is already scheduled"),
                ));
            }
        };

        if now >= expires_at {
            state.phase = Phase::Idle;
            return Err(AgentError::guardrail(
                GuardrailCode::TokenExpired,
                format!("confirmation token for '{class}' has expired"),
            ));
        }

        let token_matches: bool = expected.as_bytes().ct_eq(presented.as_bytes()).into();
        if !token_matches || bound_to != operation_id {
            state.phase = Phase::Idle;
            return Err(AgentError::guardrail(
                GuardrailCode::TokenMismatch,
                format!("confirmation token does not match the pending '{class}' request"),
            ));
        }

        let handle = OperationHandle::new();
        let cancel = self.shutdown.child_token();
        state.phase = Phase::AbortWindow { handle, cancel: cancel.clone() };

        info!(class = %class, operation_id = %operation_id, handle = %handle, "confirmation accepted, abort window open");
        Ok(ScheduledAction {
            handle,
            cancel,
            delay: self.config.abort_window,
        })
    }

    /// Return an accepted action to Idle without executing it. Used when a
    /// later check refuses the confirmed request.
    pub fn revoke(&self, class: &str, handle: OperationHandle) {
        let mut classes = self.lock();
        if let Some(state) = classes.get_mut(class) {
            if matches!(state.phase, Phase::AbortWindow { handle: h, .. } if h == handle) {
                state.phase = Phase::Idle;
            }
        }
    }

    /// Cancel the action identified by `handle` during its abort window.
    ///
    /// Returns the class it belonged to.
    pub fn cancel(&self, handle: OperationHandle) -> AgentResult<String> {
        let mut classes = self.lock();
        for (class, state) in classes.iter_mut() {
            match &state.phase {
                Phase::AbortWindow { handle: h, cancel } if *h == handle => {
                    cancel.cancel();
                    state.phase = Phase::Idle;
                    info!(class = %class, handle = %handle, "scheduled action cancelled");
                    return Ok(class.clone());
                }
                Phase::Executing { handle: h } if *h == handle => {
                    return Err(AgentError::guardrail(
                        GuardrailCode::NotCancellable,
                        format!("action {handle} has already started executing"),
                    ));
                }
                _ => {}
            }
        }
        Err(AgentError::guardrail(
            GuardrailCode::UnknownHandle,
            format!("no scheduled action with handle {handle}"),
        ))
    }

    /// Move a scheduled action from its abort window into execution.
    ///
    /// Returns false if the action was cancelled in the meantime.
    pub fn begin_execution(&self, class: &str, handle: OperationHandle) -> bool {
        let mut classes = self.lock();
        match classes.get_mut(class) {
            Some(state) => match &state.phase {
                Phase::AbortWindow { handle: h, cancel } if *h == handle && !cancel.is_cancelled() => {
                    state.phase = Phase::Executing { handle };
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Mark a deferred action finished and start the class cooldown.
    pub fn finish_execution(&self, class: &str, handle: OperationHandle, cooldown: Duration) {
        let mut classes = self.lock();
        if let Some(state) = classes.get_mut(class) {
            if matches!(state.phase, Phase::Executing { handle: h } if h == handle) {
                state.phase = Phase::Idle;
                record_execution(state, cooldown);
            }
        }
    }

    /// Record an execution of an immediate-class operation.
    pub fn record_immediate(&self, class: &str, cooldown: Duration) {
        let mut classes = self.lock();
        let state = classes.entry(class.to_string()).or_insert_with(ClassState::new);
        record_execution(state, cooldown);
    }

    pub fn phase(&self, class: &str) -> GuardrailPhase {
        self.lock()
            .get(class)
            .map(|state| state.external_phase(Instant::now()))
            .unwrap_or(GuardrailPhase::Idle)
    }

    /// Every known class, sorted by name.
    pub fn snapshot(&self) -> Vec<ClassSnapshot> {
        let now = Instant::now();
        let classes = self.lock();
        let mut snapshot: Vec<ClassSnapshot> = classes
            .iter()
            .map(|(class, state)| ClassSnapshot {
                class: class.clone(),
                phase: state.external_phase(now),
                last_executed_at: state.last_executed_at,
                cooldown_remaining_ms: duration_ms(state.cooldown_remaining(now)),
            })
            .collect();
        snapshot.sort_by(|a, b| a.class.cmp(&b.class));
        snapshot
    }
}

fn cooldown_check(class: &str, state: &ClassState, now: Instant) -> AgentResult<()> {
    let remaining = state.cooldown_remaining(now);
    if remaining.is_zero() {
        return Ok(());
    }
    Err(AgentError::guardrail(
        GuardrailCode::CooldownActive,
        format!("guardrail class '{class}' is cooling down for another {}ms", duration_ms(remaining)),
    ))
}

fn record_execution(state: &mut ClassState, cooldown: Duration) {
    state.last_executed_at = Some(Utc::now());
    state.cooldown_until = (!cooldown.is_zero()).then(|| Instant::now() + cooldown);
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
