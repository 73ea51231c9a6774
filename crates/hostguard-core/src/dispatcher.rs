//! The HOSTGUARD dispatcher: the single entry point for every request.
//!
//! The dispatcher enforces the request pipeline:
//!
//!   Resolve → Authorize → Validate → Idempotency → Guardrail → Execute → Audit
//!
//! The security invariant is structural: `HostActions` and `UpdateService`
//! are only reachable after the operation resolved, the caller was
//! authorized, the arguments validated, and every guardrail passed.
//! Exactly one `Request` audit entry is written per request, before the
//! result is returned to the transport.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use hostguard_contracts::{
    audit::{AuditEntry, AuditEntryKind},
    error::{AgentError, AgentResult, GuardrailCode, ValidationCode},
    guardrail::{GuardrailDecision, OperationHandle},
    policy::{ConfirmationClass, HandlerKind, OperationPolicy},
    request::{CallerIdentity, OperationRequest},
    result::OperationResult,
};

use crate::{
    exclusive::{ExclusiveGate, ExclusiveGuard},
    guardrail::{duration_ms, GuardrailConfig, GuardrailLayer, ScheduledAction},
    idempotency::{IdempotencyCache, IdempotencyTicket, Lookup},
    rate_limit::RateLimiter,
    traits::{ArgumentVerifier, AuditWriter, HostActions, PolicyEngine, UpdateService},
};

/// Marker written in place of redacted argument values.
pub const REDACTED: &str = "[REDACTED]";

/// Tracing target for events that need an operator.
pub const OPERATOR_TARGET: &str = "hostguard::operator";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub guardrail: GuardrailConfig,
    /// Minimum time a completed result stays replayable.
    pub idempotency_retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            guardrail: GuardrailConfig::default(),
            idempotency_retention: Duration::from_secs(600),
        }
    }
}

/// The side-effecting handlers behind the catalogue.
#[derive(Clone)]
pub struct Handlers {
    pub host: Arc<dyn HostActions>,
    pub updates: Arc<dyn UpdateService>,
}

impl Handlers {
    /// Run a side-effecting handler. `Status` and `Cancel` act on
    /// dispatcher state and never reach this point.
    async fn run(
        &self,
        handler: HandlerKind,
        arguments: &Value,
        cancel: CancellationToken,
    ) -> AgentResult<Value> {
        match handler {
            HandlerKind::SelfUpdate => self.updates.apply_update(arguments, cancel).await,
            HandlerKind::Rollback => self.updates.rollback(cancel).await,
            HandlerKind::UpdateStatus => self.updates.status(),
            HandlerKind::Status | HandlerKind::Cancel => Err(AgentError::Config {
                reason: format!("handler '{}' cannot run outside the dispatcher", handler.as_str()),
            }),
            host_action => self.host.perform(host_action, arguments).await,
        }
    }
}

/// What the pipeline decided, before auditing.
struct Processed {
    result: OperationResult,
    policy: Option<OperationPolicy>,
    ticket: Option<IdempotencyTicket>,
}

impl Processed {
    fn rejected(err: AgentError, policy: Option<OperationPolicy>) -> Self {
        Self {
            result: OperationResult::from_error(&err),
            policy,
            ticket: None,
        }
    }
}

/// Routes authenticated requests through validation, guardrails, execution
/// and audit.
///
/// One dispatcher serves the whole process and is shared via `Arc` between
/// connection tasks.
pub struct Dispatcher {
    policy: Arc<dyn PolicyEngine>,
    verifier: Arc<dyn ArgumentVerifier>,
    audit: Arc<dyn AuditWriter>,
    handlers: Handlers,
    guardrail: Arc<GuardrailLayer>,
    gate: ExclusiveGate,
    idempotency: IdempotencyCache,
    rate_limiter: RateLimiter,
    shutdown: CancellationToken,
    deferred: TaskTracker,
    started_at: DateTime<Utc>,
}

impl Dispatcher {
    pub fn new(
        policy: Arc<dyn PolicyEngine>,
        verifier: Arc<dyn ArgumentVerifier>,
        audit: Arc<dyn AuditWriter>,
        handlers: Handlers,
        config: DispatcherConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            policy,
            verifier,
            audit,
            handlers,
            guardrail: Arc::new(GuardrailLayer::new(config.guardrail, shutdown.clone())),
            gate: ExclusiveGate::new(),
            idempotency: IdempotencyCache::new(config.idempotency_retention),
            rate_limiter: RateLimiter::new(),
            shutdown,
            deferred: TaskTracker::new(),
            started_at: Utc::now(),
        }
    }

    pub fn guardrail(&self) -> &GuardrailLayer {
        &self.guardrail
    }

    pub fn gate(&self) -> &ExclusiveGate {
        &self.gate
    }

    /// Cancel every open abort window and every in-flight update health
    /// check, then wait for deferred tasks to wind down.
    pub async fn shutdown(&self) {
        info!(pending = self.deferred.len(), "dispatcher shutting down");
        self.shutdown.cancel();
        self.deferred.close();
        self.deferred.wait().await;
    }

    /// Process one request from an authenticated caller.
    ///
    /// Never fails: every outcome, including audit failure, is expressed as
    /// an `OperationResult`.
    pub async fn dispatch(&self, caller: CallerIdentity, request: OperationRequest) -> OperationResult {
        debug!(
            operation_id = %request.operation_id,
            caller = %caller,
            idempotency_key = %request.idempotency_key,
            confirming = request.confirmation_token.is_some(),
            "dispatch starting"
        );

        let mut decisions = Vec::new();
        let processed = self.process(&caller, &request, &mut decisions).await;

        let redact = processed.policy.as_ref().map(|p| p.redact.as_slice()).unwrap_or_default();
        let entry = AuditEntry {
            timestamp: Utc::now(),
            kind: AuditEntryKind::Request,
            operation_id: request.operation_id.clone(),
            caller,
            idempotency_key: Some(request.idempotency_key.clone()).filter(|k| !k.is_empty()),
            arguments: redact_arguments(&request.arguments, redact),
            result: processed.result.clone(),
            guardrail: decisions,
        };

        let result = match self.audit.write(&entry) {
            Ok(()) => processed.result,
            Err(e) => {
                error!(operation_id = %request.operation_id, error = %e, "audit write failed");
                OperationResult::from_error(&e)
            }
        };

        if let Some(ticket) = processed.ticket {
            ticket.complete(&result);
        }

        info!(
            operation_id = %request.operation_id,
            caller = %caller,
            status = ?result.status,
            error_code = result.error_code.as_deref().unwrap_or(""),
            "request complete"
        );
        result
    }

    async fn process(
        &self,
        caller: &CallerIdentity,
        request: &OperationRequest,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> Processed {
        // ── Step 1: Resolve ──────────────────────────────────────────────────
        let policy = match self.policy.resolve(&request.operation_id) {
            Ok(policy) => policy.clone(),
            Err(e) => {
                warn!(operation_id = %request.operation_id, "unknown operation");
                return Processed::rejected(e, None);
            }
        };

        // ── Step 2: Authorize ────────────────────────────────────────────────
        if !policy.permits(caller) {
            warn!(operation_id = %policy.operation_id, caller = %caller, "caller not permitted");
            let err = AgentError::Authorization {
                detail: format!("{caller} may not invoke '{}'", policy.operation_id),
            };
            return Processed::rejected(err, Some(policy));
        }

        // ── Step 3: Validate ─────────────────────────────────────────────────
        if request.idempotency_key.trim().is_empty() {
            let err = AgentError::validation(
                ValidationCode::MissingIdempotencyKey,
                "idempotency_key must not be empty",
            );
            return Processed::rejected(err, Some(policy));
        }

        match self.verifier.verify(&request.arguments, &policy.arguments) {
            Ok(report) if report.passed => {}
            Ok(report) => {
                let summary = report.summary();
                warn!(operation_id = %policy.operation_id, failures = %summary, "argument validation failed");
                let err = AgentError::validation(ValidationCode::BadArguments, summary);
                return Processed::rejected(err, Some(policy));
            }
            Err(e) => return Processed::rejected(e, Some(policy)),
        }

        // ── Step 4: Idempotency ──────────────────────────────────────────────
        let lookup = self.idempotency.begin(
            &request.idempotency_key,
            &policy.operation_id,
            &request.arguments,
            request.confirmation_token.as_deref(),
        );
        let ticket = match lookup {
            Ok(Lookup::Fresh(ticket)) => ticket,
            Ok(Lookup::Replay(result)) => {
                decisions.push(GuardrailDecision::IdempotentReplay);
                return Processed { result, policy: Some(policy), ticket: None };
            }
            Ok(Lookup::InFlight(pending)) => {
                decisions.push(GuardrailDecision::IdempotentReplay);
                let result = pending.wait().await;
                return Processed { result, policy: Some(policy), ticket: None };
            }
            Err(e) => return Processed::rejected(e, Some(policy)),
        };

        // ── Steps 5 & 6: Guardrails, then execution ──────────────────────────
        let result = match policy.confirmation {
            ConfirmationClass::TwoPhase => match request.confirmation_token.as_deref() {
                None => self.request_confirmation(&policy, decisions),
                Some(token) => self
                    .confirm_and_schedule(&policy, caller, request, token, decisions)
                    .into(),
            },
            ConfirmationClass::Immediate => {
                self.execute_immediate(&policy, caller, &request.arguments, decisions).await.into()
            }
            ConfirmationClass::None => {
                self.execute_direct(&policy, caller, &request.arguments, decisions).await.into()
            }
        };

        Processed { result, policy: Some(policy), ticket: Some(ticket) }
    }

    /// Bare request for a two-phase operation: issue a token, run nothing.
    fn request_confirmation(
        &self,
        policy: &OperationPolicy,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> OperationResult {
        let class = &policy.guardrail_class;

        if let Some(held_by) = self.gate.holder() {
            decisions.push(GuardrailDecision::LockBusy { held_by: held_by.clone() });
            return OperationResult::from_error(&AgentError::guardrail(
                GuardrailCode::OperationInProgress,
                format!("exclusive operation '{held_by}' is in progress"),
            ));
        }

        let issued = match self.guardrail.issue_token(class, &policy.operation_id) {
            Ok(issued) => issued,
            Err(e) => {
                self.record_refusal(class, &e, decisions);
                return OperationResult::from_error(&e);
            }
        };

        decisions.push(GuardrailDecision::TokenIssued {
            class: class.clone(),
            replaced_previous: issued.replaced_previous,
        });

        let expires_in_ms = duration_ms(issued.expires_in);
        let err = AgentError::guardrail(
            GuardrailCode::ConfirmationRequired,
            format!(
                "'{}' requires confirmation: resend with confirmation_token within {expires_in_ms}ms",
                policy.operation_id
            ),
        );
        OperationResult::from_error(&err).with_payload(json!({
            "confirmation_token": issued.token,
            "guardrail_class": class,
            "expires_in_ms": expires_in_ms,
        }))
    }

    /// Confirmation of a two-phase operation: lock, check token, open the
    /// abort window and hand the lock to the deferred task.
    fn confirm_and_schedule(
        &self,
        policy: &OperationPolicy,
        caller: &CallerIdentity,
        request: &OperationRequest,
        token: &str,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> AgentResult<Value> {
        let class = &policy.guardrail_class;

        // The lock comes first so that concurrent confirmations resolve to a
        // single winner before any token is examined.
        let guard = self.acquire(policy, decisions)?;

        if let Some(limit) = &policy.rate_limit {
            if let Err(e) = self.rate_limiter.check(&policy.operation_id, limit) {
                decisions.push(GuardrailDecision::RateLimited {
                    operation_id: policy.operation_id.clone(),
                });
                return Err(e);
            }
        }

        let scheduled = match self.guardrail.confirm(class, &policy.operation_id, token) {
            Ok(scheduled) => scheduled,
            Err(e) => {
                self.record_refusal(class, &e, decisions);
                return Err(e);
            }
        };
        if let Some(limit) = &policy.rate_limit {
            self.rate_limiter.record(&policy.operation_id, limit);
        }

        let handle = scheduled.handle;
        let delay_ms = duration_ms(scheduled.delay);
        decisions.push(GuardrailDecision::TokenAccepted { class: class.clone(), handle });
        decisions.push(GuardrailDecision::AbortWindowOpened {
            class: class.clone(),
            handle,
            delay_ms,
        });

        self.spawn_deferred(
            policy.clone(),
            *caller,
            request.arguments.clone(),
            request.idempotency_key.clone(),
            scheduled,
            guard,
        );

        Ok(json!({
            "state": "abort_window",
            "handle": handle.to_string(),
            "guardrail_class": class,
            "executes_in_ms": delay_ms,
        }))
    }

    /// Run a confirmed action after its abort window, unless cancelled.
    ///
    /// The exclusive guard moves into the task and is released only when
    /// the action is cancelled or finished.
    fn spawn_deferred(
        &self,
        policy: OperationPolicy,
        caller: CallerIdentity,
        arguments: Value,
        idempotency_key: String,
        scheduled: ScheduledAction,
        guard: ExclusiveGuard,
    ) {
        let guardrail = Arc::clone(&self.guardrail);
        let audit = Arc::clone(&self.audit);
        let handlers = self.handlers.clone();

        self.deferred.spawn(async move {
            let _guard = guard;
            let class = policy.guardrail_class.clone();
            let ScheduledAction { handle, cancel, delay } = scheduled;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    guardrail.revoke(&class, handle);
                    info!(class = %class, handle = %handle, "scheduled action did not run");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if !guardrail.begin_execution(&class, handle) {
                info!(class = %class, handle = %handle, "scheduled action cancelled at window close");
                return;
            }

            info!(operation_id = %policy.operation_id, handle = %handle, "abort window elapsed, executing");
            let outcome = handlers.run(policy.handler, &arguments, cancel).await;
            guardrail.finish_execution(&class, handle, policy.cooldown());

            if let Err(e @ AgentError::Rollback { .. }) = &outcome {
                raise_operator_alert(audit.as_ref(), &policy, &caller, e);
            }

            let entry = AuditEntry {
                timestamp: Utc::now(),
                kind: AuditEntryKind::DeferredExecution,
                operation_id: policy.operation_id.clone(),
                caller,
                idempotency_key: Some(idempotency_key),
                arguments: redact_arguments(&arguments, &policy.redact),
                result: outcome.into(),
                guardrail: vec![GuardrailDecision::Executed { class: class.clone() }],
            };
            if let Err(e) = audit.write(&entry) {
                error!(operation_id = %policy.operation_id, handle = %handle, error = %e, "deferred audit write failed");
            }
        });
    }

    async fn execute_immediate(
        &self,
        policy: &OperationPolicy,
        caller: &CallerIdentity,
        arguments: &Value,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> AgentResult<Value> {
        let class = &policy.guardrail_class;
        let _guard = self.acquire(policy, decisions)?;

        if let Err(e) = self.guardrail.check_cooldown(class) {
            self.record_refusal(class, &e, decisions);
            return Err(e);
        }
        self.consume_rate_limit(policy, decisions)?;

        let outcome = self.run(policy, caller, arguments, decisions).await;
        self.guardrail.record_immediate(class, policy.cooldown());
        decisions.push(GuardrailDecision::Executed { class: class.clone() });
        outcome
    }

    async fn execute_direct(
        &self,
        policy: &OperationPolicy,
        caller: &CallerIdentity,
        arguments: &Value,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> AgentResult<Value> {
        let _guard = if policy.exclusive {
            Some(self.acquire(policy, decisions)?)
        } else {
            None
        };
        self.consume_rate_limit(policy, decisions)?;
        self.run(policy, caller, arguments, decisions).await
    }

    async fn run(
        &self,
        policy: &OperationPolicy,
        caller: &CallerIdentity,
        arguments: &Value,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> AgentResult<Value> {
        let outcome = match policy.handler {
            HandlerKind::Status => Ok(self.status_payload()),
            HandlerKind::Cancel => self.cancel_scheduled(arguments, decisions),
            handler => self.handlers.run(handler, arguments, self.shutdown.child_token()).await,
        };
        if let Err(e @ AgentError::Rollback { .. }) = &outcome {
            raise_operator_alert(self.audit.as_ref(), policy, caller, e);
        }
        outcome
    }

    fn cancel_scheduled(
        &self,
        arguments: &Value,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> AgentResult<Value> {
        let handle: OperationHandle = arguments
            .get("handle")
            .and_then(Value::as_str)
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| {
                AgentError::validation(ValidationCode::BadArguments, "'handle' must be an operation handle")
            })?;

        let class = self.guardrail.cancel(handle)?;
        decisions.push(GuardrailDecision::Cancelled { class: class.clone(), handle });
        Ok(json!({
            "cancelled": true,
            "handle": handle.to_string(),
            "guardrail_class": class,
        }))
    }

    fn status_payload(&self) -> Value {
        let release = self.handlers.updates.status().unwrap_or_else(|e| {
            warn!(error = %e, "release status unavailable");
            Value::Null
        });
        json!({
            "agent_version": env!("CARGO_PKG_VERSION"),
            "started_at": self.started_at,
            "exclusive_operation": self.gate.holder(),
            "guardrail": self.guardrail.snapshot(),
            "release": release,
        })
    }

    fn acquire(
        &self,
        policy: &OperationPolicy,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> AgentResult<ExclusiveGuard> {
        match self.gate.try_acquire(&policy.operation_id) {
            Ok(guard) => {
                decisions.push(GuardrailDecision::LockAcquired);
                Ok(guard)
            }
            Err(e) => {
                let held_by = self.gate.holder().unwrap_or_default();
                warn!(operation_id = %policy.operation_id, held_by = %held_by, "exclusive lock busy");
                decisions.push(GuardrailDecision::LockBusy { held_by });
                Err(e)
            }
        }
    }

    fn consume_rate_limit(
        &self,
        policy: &OperationPolicy,
        decisions: &mut Vec<GuardrailDecision>,
    ) -> AgentResult<()> {
        let Some(limit) = &policy.rate_limit else {
            return Ok(());
        };
        if let Err(e) = self.rate_limiter.check(&policy.operation_id, limit) {
            decisions.push(GuardrailDecision::RateLimited {
                operation_id: policy.operation_id.clone(),
            });
            return Err(e);
        }
        self.rate_limiter.record(&policy.operation_id, limit);
        Ok(())
    }

    fn record_refusal(&self, class: &str, err: &AgentError, decisions: &mut Vec<GuardrailDecision>) {
        let AgentError::Guardrail { code, .. } = err else {
            return;
        };
        let decision = match code {
            GuardrailCode::CooldownActive => GuardrailDecision::CooldownActive {
                class: class.to_string(),
                remaining_ms: duration_ms(self.guardrail.cooldown_remaining(class)),
            },
            code => GuardrailDecision::TokenRejected { class: class.to_string(), code: *code },
        };
        decisions.push(decision);
    }
}

/// Escalate a failed automatic recovery to the operator channel.
fn raise_operator_alert(
    audit: &dyn AuditWriter,
    policy: &OperationPolicy,
    caller: &CallerIdentity,
    err: &AgentError,
) {
    error!(
        target: OPERATOR_TARGET,
        operation_id = %policy.operation_id,
        error = %err,
        "rollback failed, operator intervention required"
    );
    let entry = AuditEntry {
        timestamp: Utc::now(),
        kind: AuditEntryKind::OperatorAlert,
        operation_id: policy.operation_id.clone(),
        caller: *caller,
        idempotency_key: None,
        arguments: Value::Null,
        result: OperationResult::from_error(err),
        guardrail: vec![],
    };
    if let Err(e) = audit.write(&entry) {
        error!(target: OPERATOR_TARGET, error = %e, "operator alert could not be audited");
    }
}

/// Replace each listed field with [`REDACTED`]. Dotted paths reach into
/// nested objects; missing fields are left alone.
pub fn redact_arguments(arguments: &Value, fields: &[String]) -> Value {
    let mut redacted = arguments.clone();
    for field in fields {
        let pointer: String = field
            .split('.')
            .map(|part| format!("/{}", part.replace('~', "~0").replace('/', "~1")))
            .collect();
        if let Some(value) = redacted.pointer_mut(&pointer) {
            *value = Value::String(REDACTED.to_string());
        }
    }
    redacted
}

// ── Tests ────────────────────────────────────────────────────────────────────
