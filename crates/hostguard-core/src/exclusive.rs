//! The process-wide exclusive execution lock.
//!
//! At most one exclusive operation runs at a time. A request that finds the
//! lock held is rejected immediately with `operation_in_progress`; the gate
//! never queues.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use hostguard_contracts::error::{AgentError, AgentResult, GuardrailCode};

/// Single-permit, non-queuing lock shared by every exclusive operation.
#[derive(Clone)]
pub struct ExclusiveGate {
    permits: Arc<Semaphore>,
    holder: Arc<Mutex<Option<String>>>,
}

/// Proof of holding the exclusive lock. Dropping it releases the lock.
///
/// The guard is `Send + 'static` so it can move into the task that owns a
/// deferred action and stay held through its abort window and execution.
#[must_use = "the exclusive lock is released as soon as the guard is dropped"]
pub struct ExclusiveGuard {
    holder: Arc<Mutex<Option<String>>>,
    _permit: OwnedSemaphorePermit,
}

impl ExclusiveGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the lock for `operation_id`, or fail without waiting.
    pub fn try_acquire(&self, operation_id: &str) -> AgentResult<ExclusiveGuard> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                *self.holder.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(operation_id.to_string());
                Ok(ExclusiveGuard {
                    holder: Arc::clone(&self.holder),
                    _permit: permit,
                })
            }
            Err(TryAcquireError::NoPermits) => {
                let held_by = self.holder().unwrap_or_else(|| "another operation".to_string());
                Err(AgentError::guardrail(
                    GuardrailCode::OperationInProgress,
                    format!("exclusive operation '{held_by}' is in progress"),
                ))
            }
            Err(TryAcquireError::Closed) => Err(AgentError::guardrail(
                GuardrailCode::OperationInProgress,
                "agent is shutting down",
            )),
        }
    }

    /// Operation id of the current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for ExclusiveGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        // Clear the holder before the permit field drops and frees the lock.
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_while_held() {
        let gate = ExclusiveGate::new();
        let guard = gate.try_acquire("reboot").unwrap();
        assert!(gate.is_held());
        assert_eq!(gate.holder().as_deref(), Some("reboot"));

        let err = gate.try_acquire("device_write").err().unwrap();
        assert_eq!(err.code(), Some("operation_in_progress"));
        assert!(err.detail().contains("reboot"));

        drop(guard);
        assert!(!gate.is_held());
        assert!(gate.holder().is_none());
        assert!(gate.try_acquire("device_write").is_ok());
    }

    #[tokio::test]
    async fn guard_can_be_held_by_another_task() {
        let gate = ExclusiveGate::new();
        let guard = gate.try_acquire("self_update").unwrap();

        let task = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        });

        assert!(gate.try_acquire("reboot").is_err());
        task.await.unwrap();
        assert!(gate.try_acquire("reboot").is_ok());
    }
}
