//! `SelfUpdater`: the `UpdateService` the dispatcher routes `self_update`,
//! `rollback` and `update_status` to.
//!
//! Order of an update:
//!
//! 1. settle a health check an earlier run left unfinished
//! 2. stage and verify (no visible change on failure)
//! 3. record `staged` in the ledger
//! 4. swap `current`, then persist the promotion
//! 5. restart the service and run the health check
//! 6. confirm, or roll back to the previous-good release
//!
//! The dispatcher holds the exclusive lock for the whole call, so ledger
//! transitions never interleave. Directory work and ledger commits run on
//! the blocking pool. The ledger mutex is only taken for the duration of a
//! single transition and never across an `.await`.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hostguard_contracts::{
    error::{AgentError, AgentResult, ValidationCode},
    release::{ReleaseManifest, ReleaseStatus, UpdateOutcome},
};
use hostguard_core::traits::{HealthProbe, ServiceControl, UpdateService};

use crate::{
    health::{HealthCheckConfig, HealthCheckController, HealthVerdict},
    ledger::VersionLedger,
    manager::{validate_version, ReleaseManager},
};

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// The systemd unit that runs the active release.
    pub service_unit: String,
    pub health: HealthCheckConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateArguments {
    version: String,
    source: PathBuf,
    checksum: String,
}

fn bad_arguments(detail: impl Into<String>) -> AgentError {
    AgentError::validation(ValidationCode::BadArguments, detail)
}

fn rollback_error(step: &str, target: &str, e: AgentError) -> AgentError {
    AgentError::Rollback {
        detail: format!("{step} of {target} failed: {}", e.detail()),
    }
}

fn lock(ledger: &Mutex<VersionLedger>) -> MutexGuard<'_, VersionLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SelfUpdater {
    manager: ReleaseManager,
    ledger: Arc<Mutex<VersionLedger>>,
    service: Arc<dyn ServiceControl>,
    health: HealthCheckController,
    service_unit: String,
}

impl SelfUpdater {
    pub fn new(
        manager: ReleaseManager,
        ledger: VersionLedger,
        service: Arc<dyn ServiceControl>,
        probe: Arc<dyn HealthProbe>,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            manager,
            ledger: Arc::new(Mutex::new(ledger)),
            service,
            health: HealthCheckController::new(probe, config.health),
            service_unit: config.service_unit,
        }
    }

    pub fn manager(&self) -> &ReleaseManager {
        &self.manager
    }

    fn ledger(&self) -> MutexGuard<'_, VersionLedger> {
        lock(&self.ledger)
    }

    /// Version whose health check an earlier run left unfinished.
    pub fn pending_health_check(&self) -> Option<String> {
        self.ledger().pending_health_check().map(str::to_string)
    }

    /// Startup reconciliation: repoint `current` to the ledger's version,
    /// drop leftover staging directories, collect old releases.
    pub fn reconcile(&self) -> AgentResult<()> {
        let document = self.ledger().document().clone();
        let report = self.manager.reconcile(&document)?;
        let removed = self.manager.gc(&document);
        info!(
            repointed = report.repointed,
            removed_leftovers = report.removed_leftovers,
            collected = removed.len(),
            "release directory reconciled"
        );
        Ok(())
    }

    /// First install. Only allowed while the ledger has no current version;
    /// no health check runs.
    pub fn bootstrap(&self, manifest: &ReleaseManifest, source: &Path) -> AgentResult<Value> {
        if let Some(current) = self.ledger().current_version() {
            return Err(bad_arguments(format!(
                "release {current} is already installed; use self_update"
            )));
        }

        let checksum =
            stage_release(&self.manager, &self.ledger, &manifest.version, source, &manifest.checksum)?;

        self.manager.activate(&manifest.version)?;
        let mut ledger = self.ledger();
        ledger.activate_initial(&manifest.version)?;
        ledger.record_outcome(None, &manifest.version, UpdateOutcome::Succeeded, None)?;

        info!(version = %manifest.version, "initial release installed");
        Ok(json!({ "current_version": manifest.version, "checksum": checksum }))
    }

    /// Finish a health check interrupted by a restart of the agent.
    /// Returns `None` when nothing was pending.
    pub async fn resume_pending(&self, cancel: CancellationToken) -> AgentResult<Option<Value>> {
        let (pending, previous) = {
            let ledger = self.ledger();
            match (ledger.pending_health_check(), ledger.current_version()) {
                (Some(pending), Some(current)) if pending == current => (
                    pending.to_string(),
                    ledger.previous_good_version().map(str::to_string),
                ),
                _ => return Ok(None),
            }
        };

        info!(version = %pending, "resuming interrupted health check");
        self.health_check_and_settle(&pending, previous, &cancel).await.map(Some)
    }

    /// An unfinished health check is settled before anything is promoted
    /// over it. The update only goes ahead once that release passed.
    async fn settle_pending(&self, target: &str, cancel: &CancellationToken) -> AgentResult<()> {
        let Some(pending) = self.pending_health_check() else {
            return Ok(());
        };
        info!(version = %pending, target = %target, "settling unfinished health check before updating");

        match self.resume_pending(cancel.clone()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(AgentError::execution(format!(
                "release {pending} awaits a health check but is not the active release; update to {target} not started"
            ))),
            Err(AgentError::Execution { detail }) => Err(AgentError::execution(format!(
                "update to {target} not started: {detail}"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Run directory work and ledger commits on the blocking pool.
    async fn on_blocking_pool<T, F>(&self, step: &'static str, work: F) -> AgentResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReleaseManager, &Mutex<VersionLedger>) -> AgentResult<T> + Send + 'static,
    {
        let manager = self.manager.clone();
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || work(&manager, &ledger))
            .await
            .map_err(|e| AgentError::execution(format!("{step} task failed: {e}")))?
    }

    async fn record_outcome(
        &self,
        from: Option<String>,
        to: &str,
        outcome: UpdateOutcome,
        detail: Option<String>,
    ) -> AgentResult<()> {
        let to = to.to_string();
        self.on_blocking_pool("ledger update", move |_, ledger| {
            lock(ledger).record_outcome(from, &to, outcome, detail)
        })
        .await
    }

    async fn restart_service(&self) -> AgentResult<()> {
        self.service.restart(&self.service_unit).await
    }

    async fn health_check_and_settle(
        &self,
        version: &str,
        from: Option<String>,
        cancel: &CancellationToken,
    ) -> AgentResult<Value> {
        let verdict = self.health.run(version, cancel).await;
        match verdict {
            HealthVerdict::Healthy => {
                let (confirmed, previous) = (version.to_string(), from.clone());
                self.on_blocking_pool("health confirmation", move |manager, ledger| {
                    let mut ledger = lock(ledger);
                    ledger.confirm_healthy(&confirmed)?;
                    ledger.record_outcome(previous, &confirmed, UpdateOutcome::Succeeded, None)?;
                    let document = ledger.document().clone();
                    drop(ledger);
                    manager.gc(&document);
                    Ok(())
                })
                .await?;

                info!(version = %version, previous = ?from, "update succeeded");
                Ok(json!({
                    "status": "succeeded",
                    "current_version": version,
                    "previous_good_version": from,
                }))
            }
            HealthVerdict::Cancelled => {
                warn!(version = %version, "health check interrupted, will resume on next start");
                Err(AgentError::execution(format!(
                    "health check of {version} interrupted by shutdown; it resumes on the next start"
                )))
            }
            failed => self.automatic_rollback(version, from, &failed.reason()).await,
        }
    }

    /// Return to the previous-good release after a failed health check.
    async fn automatic_rollback(
        &self,
        failed_version: &str,
        from: Option<String>,
        reason: &str,
    ) -> AgentResult<Value> {
        warn!(version = %failed_version, reason = %reason, "rolling back failed release");
        match self.roll_back_to_previous(ReleaseStatus::Failed, reason).await {
            Ok(restored) => {
                self.record_outcome(
                    from,
                    failed_version,
                    UpdateOutcome::RolledBack,
                    Some(reason.to_string()),
                )
                .await?;
                Err(AgentError::execution(format!(
                    "release {failed_version} failed its health check ({reason}) and was rolled back to {restored}"
                )))
            }
            Err(e) => {
                self.record_failure(from, failed_version, &e).await;
                Err(e)
            }
        }
    }

    /// Swap back, persist, restart. Any failure here is a `Rollback` error.
    async fn roll_back_to_previous(&self, abandoned: ReleaseStatus, reason: &str) -> AgentResult<String> {
        let target = self
            .ledger()
            .previous_good_version()
            .map(str::to_string)
            .ok_or_else(|| AgentError::Rollback {
                detail: "no previous-good release to roll back to".to_string(),
            })?;

        let (restored, reason) = (target.clone(), reason.to_string());
        self.on_blocking_pool("rollback", move |manager, ledger| {
            manager
                .activate(&restored)
                .map_err(|e| rollback_error("symlink swap", &restored, e))?;
            lock(ledger)
                .rollback(abandoned, &reason)
                .map_err(|e| rollback_error("ledger update", &restored, e))?;
            Ok(())
        })
        .await
        .map_err(|e| match e {
            e @ AgentError::Rollback { .. } => e,
            other => rollback_error("rollback", &target, other),
        })?;
        self.restart_service()
            .await
            .map_err(|e| rollback_error("service restart", &target, e))?;

        info!(version = %target, "previous-good release restored");
        Ok(target)
    }

    async fn record_failure(&self, from: Option<String>, to: &str, err: &AgentError) {
        error!(version = %to, error = %err, "update could not be completed");
        let detail = Some(err.detail().to_string());
        if let Err(e) = self.record_outcome(from, to, UpdateOutcome::Failed, detail).await {
            error!(error = %e, "cannot record update failure in the ledger");
        }
    }
}

/// Copy, verify and finalize a release, then record it as staged. Returns
/// the computed checksum.
fn stage_release(
    manager: &ReleaseManager,
    ledger: &Mutex<VersionLedger>,
    version: &str,
    source: &Path,
    checksum: &str,
) -> AgentResult<String> {
    let staged = manager.stage(version, source)?;
    manager.verify(&staged, checksum)?;
    let computed = staged.checksum.clone();
    let dir = manager.finalize(staged)?;

    let recorded = lock(ledger).record_staged(version, &dir, &computed);
    if let Err(e) = recorded {
        manager.remove_release(version);
        return Err(e);
    }
    Ok(computed)
}

/// Point `current` at the staged `version` and persist the promotion.
fn switch_to(
    manager: &ReleaseManager,
    ledger: &Mutex<VersionLedger>,
    version: &str,
    from: &str,
) -> AgentResult<()> {
    if let Err(e) = manager.activate(version) {
        let marked = lock(ledger).mark_failed(version, "symlink swap failed");
        if let Err(le) = marked {
            error!(error = %le, "cannot mark release failed");
        }
        return Err(e);
    }
    let promoted = lock(ledger).promote(version);
    promoted.map_err(|e| abandon_unpromoted(manager, ledger, version, from, e))
}

/// The link moved but the promotion was not persisted: point `current`
/// back at `from`, drop the staged entry and its directory. Returns the
/// error to report; a link that cannot be restored escalates to `Rollback`.
pub(crate) fn abandon_unpromoted(
    manager: &ReleaseManager,
    ledger: &Mutex<VersionLedger>,
    version: &str,
    from: &str,
    cause: AgentError,
) -> AgentError {
    if let Err(back) = manager.activate(from) {
        return AgentError::Rollback {
            detail: format!(
                "ledger promotion failed ({cause}) and the link could not be restored: {}",
                back.detail()
            ),
        };
    }

    let reason = format!("promotion not persisted: {}", cause.detail());
    let discarded = lock(ledger).record_discarded(version, &reason);
    match discarded {
        Ok(()) => manager.remove_release(version),
        Err(e) => warn!(version = %version, error = %e, "cannot drop unpromoted release from the ledger"),
    }
    cause
}

#[async_trait]
impl UpdateService for SelfUpdater {
    async fn apply_update(&self, arguments: &Value, cancel: CancellationToken) -> AgentResult<Value> {
        let args: UpdateArguments = serde_json::from_value(arguments.clone())
            .map_err(|e| bad_arguments(format!("self_update arguments: {e}")))?;
        validate_version(&args.version)?;

        self.settle_pending(&args.version, &cancel).await?;

        let from = {
            let ledger = self.ledger();
            let current = ledger.current_version().map(str::to_string).ok_or_else(|| {
                bad_arguments("no release is installed yet; bootstrap the agent first")
            })?;
            if current == args.version {
                return Err(bad_arguments(format!("release {current} is already active")));
            }
            if ledger.previous_good_version() == Some(args.version.as_str()) {
                return Err(bad_arguments(format!(
                    "release {} is the previous-good release; use rollback",
                    args.version
                )));
            }
            current
        };

        info!(from = %from, to = %args.version, "self-update started");

        let UpdateArguments { version, source, checksum } = args;
        let staging = version.clone();
        self.on_blocking_pool("staging", move |manager, ledger| {
            stage_release(manager, ledger, &staging, &source, &checksum)
        })
        .await?;

        let (promoting, previous) = (version.clone(), from.clone());
        let switched = self
            .on_blocking_pool("promotion", move |manager, ledger| {
                switch_to(manager, ledger, &promoting, &previous)
            })
            .await;
        if let Err(e) = switched {
            self.record_failure(Some(from), &version, &e).await;
            return Err(e);
        }

        if let Err(e) = self.restart_service().await {
            let reason = format!("service restart failed: {}", e.detail());
            return self.automatic_rollback(&version, Some(from), &reason).await;
        }

        self.health_check_and_settle(&version, Some(from), &cancel).await
    }

    async fn rollback(&self, _cancel: CancellationToken) -> AgentResult<Value> {
        let current = {
            let ledger = self.ledger();
            if ledger.previous_good_version().is_none() {
                return Err(bad_arguments("there is no previous-good release to roll back to"));
            }
            ledger.current_version().map(str::to_string)
        };

        let restored = match self.roll_back_to_previous(ReleaseStatus::Retired, "manual rollback").await {
            Ok(restored) => restored,
            Err(e) => {
                if let Some(current) = &current {
                    self.record_failure(Some(current.clone()), current, &e).await;
                }
                return Err(e);
            }
        };

        let abandoned = current.unwrap_or_default();
        self.record_outcome(
            Some(abandoned.clone()),
            &restored,
            UpdateOutcome::RolledBack,
            Some("manual rollback".to_string()),
        )
        .await?;
        Ok(json!({
            "status": "rolled_back",
            "current_version": restored,
            "rolled_back_from": abandoned,
        }))
    }

    fn status(&self) -> AgentResult<Value> {
        let ledger = self.ledger();
        let doc = ledger.document();
        let releases: Vec<Value> = doc
            .installed_versions
            .iter()
            .map(|r| {
                json!({
                    "version": r.version,
                    "status": r.status,
                    "checksum": r.checksum,
                    "staged_at": r.staged_at,
                })
            })
            .collect();

        Ok(json!({
            "current_version": doc.current_version,
            "previous_good_version": doc.previous_good_version,
            "installed_versions": releases,
            "last_update": doc.last_update,
            "pending_health_check": doc.pending_health_check,
        }))
    }
}
