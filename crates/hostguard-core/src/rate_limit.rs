//! Sliding-window rate limiting per operation.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
};

use tokio::time::Instant;

use hostguard_contracts::{
    error::{AgentError, AgentResult, GuardrailCode},
    policy::RateLimit,
};

/// Execution timestamps per operation id.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject with `rate_limited` if `operation_id` already used its quota
    /// in the current window. Does not consume quota.
    pub fn check(&self, operation_id: &str, limit: &RateLimit) -> AgentResult<()> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(window) = windows.get_mut(operation_id) else {
            return Ok(());
        };
        prune(window, now, limit);

        if window.len() >= limit.max_executions as usize {
            return Err(AgentError::guardrail(
                GuardrailCode::RateLimited,
                format!(
                    "'{operation_id}' is limited to {} executions per {}s",
                    limit.max_executions, limit.window_secs
                ),
            ));
        }
        Ok(())
    }

    /// Consume one unit of quota.
    pub fn record(&self, operation_id: &str, limit: &RateLimit) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(operation_id.to_string()).or_default();
        prune(window, now, limit);
        window.push_back(now);
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, limit: &RateLimit) {
    while let Some(oldest) = window.front() {
        if now.duration_since(*oldest) >= limit.window() {
            window.pop_front();
        } else {
            break;
        }
    }
}
