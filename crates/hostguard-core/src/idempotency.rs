//! Idempotency-key cache.
//!
//! The first request carrying a key executes; its result is stored and
//! replayed verbatim to every later request with the same key and the same
//! intent: operation id, arguments and confirmation token. A retry that arrives while the
//! first is still running waits for it instead of executing again. A key
//! reused for a different intent is rejected with `idempotency_conflict`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, warn};

use hostguard_contracts::{
    error::{AgentError, AgentResult, ValidationCode},
    result::OperationResult,
};

type Pending = watch::Receiver<Option<OperationResult>>;

enum SlotState {
    InFlight(Pending),
    Done { result: OperationResult, completed_at: Instant },
}

struct Slot {
    operation_id: String,
    arguments: Value,
    confirmation: Option<String>,
    state: SlotState,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// Outcome of looking a key up.
pub enum Lookup {
    /// First use of the key: execute, then `complete` the ticket.
    Fresh(IdempotencyTicket),
    /// The key already completed; return this result unchanged.
    Replay(OperationResult),
    /// The first request with this key is still running.
    InFlight(PendingResult),
}

/// Waits for the original request of an in-flight key.
pub struct PendingResult {
    key: String,
    rx: Pending,
}

impl PendingResult {
    /// Resolve to the original request's result.
    pub async fn wait(mut self) -> OperationResult {
        match self.rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or_else(abandoned),
            Err(_) => {
                warn!(idempotency_key = %self.key, "original request was abandoned before completing");
                abandoned()
            }
        }
    }
}

fn abandoned() -> OperationResult {
    OperationResult::from_error(&AgentError::execution(
        "the original request with this idempotency key did not complete",
    ))
}

/// Exclusive right to execute the first request with a key.
///
/// Dropping the ticket without completing it forgets the key, so a retry
/// executes afresh.
pub struct IdempotencyTicket {
    key: String,
    slots: Slots,
    tx: watch::Sender<Option<OperationResult>>,
    completed: bool,
}

impl IdempotencyTicket {
    /// Store `result` for replay and wake any waiting retries.
    pub fn complete(mut self, result: &OperationResult) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.state = SlotState::Done {
                result: result.clone(),
                completed_at: Instant::now(),
            };
        }
        drop(slots);
        self.tx.send_replace(Some(result.clone()));
        self.completed = true;
    }
}

impl Drop for IdempotencyTicket {
    fn drop(&mut self) {
        if !self.completed {
            lock(&self.slots).remove(&self.key);
        }
    }
}

pub struct IdempotencyCache {
    retention: Duration,
    slots: Slots,
}

impl IdempotencyCache {
    /// Completed results are kept for at least `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Look `key` up for a request. A bare two-phase request and its
    /// confirmation are different intents; reusing the key across them is
    /// a conflict, not a replay.
    pub fn begin(
        &self,
        key: &str,
        operation_id: &str,
        arguments: &Value,
        confirmation: Option<&str>,
    ) -> AgentResult<Lookup> {
        let mut slots = lock(&self.slots);
        purge_expired(&mut slots, self.retention);

        if let Some(slot) = slots.get(key) {
            if slot.operation_id != operation_id
                || slot.arguments != *arguments
                || slot.confirmation.as_deref() != confirmation
            {
                return Err(AgentError::validation(
                    ValidationCode::IdempotencyConflict,
                    format!(
                        "idempotency key '{key}' was already used for a different '{}' request",
                        slot.operation_id
                    ),
                ));
            }
            debug!(idempotency_key = %key, operation_id = %operation_id, "idempotent replay");
            return Ok(match &slot.state {
                SlotState::Done { result, .. } => Lookup::Replay(result.clone()),
                SlotState::InFlight(rx) => Lookup::InFlight(PendingResult {
                    key: key.to_string(),
                    rx: rx.clone(),
                }),
            });
        }

        let (tx, rx) = watch::channel(None);
        slots.insert(
            key.to_string(),
            Slot {
                operation_id: operation_id.to_string(),
                arguments: arguments.clone(),
                confirmation: confirmation.map(str::to_string),
                state: SlotState::InFlight(rx),
            },
        );
        Ok(Lookup::Fresh(IdempotencyTicket {
            key: key.to_string(),
            slots: Arc::clone(&self.slots),
            tx,
            completed: false,
        }))
    }

    /// Number of remembered keys, in flight or completed.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

fn purge_expired(slots: &mut HashMap<String, Slot>, retention: Duration) {
    let now = Instant::now();
    slots.retain(|_, slot| match &slot.state {
        SlotState::InFlight(_) => true,
        SlotState::Done { completed_at, .. } => now.duration_since(*completed_at) < retention,
    });
}
