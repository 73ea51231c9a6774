//! Post-promotion health checking.

use std::{sync::Arc, time::Duration};

use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostguard_core::traits::HealthProbe;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Pause before each probe.
    pub interval: Duration,
    /// Total time allowed to reach a healthy verdict.
    pub budget: Duration,
    pub max_consecutive_failures: u32,
    pub required_successes: u32,
    pub probe_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            budget: Duration::from_secs(30),
            max_consecutive_failures: 3,
            required_successes: 1,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// `max_consecutive_failures` probes failed in a row.
    Unhealthy { failures: u32, last_error: String },
    /// The budget ran out before enough probes passed.
    BudgetExhausted { last_error: Option<String> },
    /// Agent shutdown interrupted the check.
    Cancelled,
}

impl HealthVerdict {
    pub fn reason(&self) -> String {
        match self {
            HealthVerdict::Healthy => "healthy".to_string(),
            HealthVerdict::Unhealthy { failures, last_error } => {
                format!("{failures} consecutive health probes failed, last: {last_error}")
            }
            HealthVerdict::BudgetExhausted { last_error: Some(e) } => {
                format!("health check budget exhausted, last failure: {e}")
            }
            HealthVerdict::BudgetExhausted { last_error: None } => {
                "health check budget exhausted".to_string()
            }
            HealthVerdict::Cancelled => "health check cancelled".to_string(),
        }
    }
}

pub struct HealthCheckController {
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
}

impl HealthCheckController {
    pub fn new(probe: Arc<dyn HealthProbe>, config: HealthCheckConfig) -> Self {
        Self { probe, config }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Probe `version` until it is healthy, fails too often, runs out of
    /// budget, or `cancel` fires.
    pub async fn run(&self, version: &str, cancel: &CancellationToken) -> HealthVerdict {
        let deadline = Instant::now() + self.config.budget;
        let required = self.config.required_successes.max(1);
        let mut successes = 0u32;
        let mut failures = 0u32;
        let mut last_error: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return HealthVerdict::Cancelled,
                _ = sleep(self.config.interval) => {}
            }
            if Instant::now() >= deadline {
                warn!(version = %version, "health check budget exhausted");
                return HealthVerdict::BudgetExhausted { last_error };
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return HealthVerdict::Cancelled,
                r = timeout(self.config.probe_timeout, self.probe.probe(version)) => r,
            };
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("probe timed out after {:?}", self.config.probe_timeout)),
            };

            match failure {
                None => {
                    successes += 1;
                    failures = 0;
                    debug!(version = %version, successes, "health probe passed");
                    if successes >= required {
                        info!(version = %version, "release is healthy");
                        return HealthVerdict::Healthy;
                    }
                }
                Some(error) => {
                    successes = 0;
                    failures += 1;
                    warn!(version = %version, failures, error = %error, "health probe failed");
                    if failures >= self.config.max_consecutive_failures.max(1) {
                        return HealthVerdict::Unhealthy { failures, last_error: error };
                    }
                    last_error = Some(error);
                }
            }
        }
    }
}
