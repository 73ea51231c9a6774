//! # hostguard-release
//!
//! Versioned release directories, the persisted version ledger, the
//! post-promotion health check and automatic rollback.
//!
//! [`SelfUpdater`] implements
//! [`UpdateService`](hostguard_core::traits::UpdateService) on top of:
//!
//! - [`ReleaseManager`]: staging, checksum verification, the atomic
//!   `current` symlink swap, reconciliation and garbage collection
//! - [`VersionLedger`]: all-or-nothing ledger transitions persisted with
//!   write-temp-then-rename
//! - [`HealthCheckController`]: bounded probing of the promoted release

pub mod health;
pub mod ledger;
pub mod manager;
pub mod updater;

pub use health::{HealthCheckConfig, HealthCheckController, HealthVerdict};
pub use ledger::{VersionLedger, LEDGER_FILE_NAME};
pub use manager::{compute_checksum, validate_version, ReleaseManager, StagedRelease};
pub use updater::{SelfUpdater, UpdaterConfig};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        fs,
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use hostguard_contracts::{
        error::{AgentError, AgentResult},
        release::{ReleaseManifest, ReleaseStatus, UpdateOutcome},
    };
    use hostguard_core::traits::{HealthProbe, ServiceControl, UpdateService};

    use super::*;

    // ── Mocks ─────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct MockService {
        restarts: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl MockService {
        fn restarts(&self) -> usize {
            self.restarts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ServiceControl for MockService {
        async fn restart(&self, unit: &str) -> AgentResult<()> {
            self.restarts.lock().unwrap().push(unit.to_string());
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::execution("unit failed to start"));
            }
            Ok(())
        }
    }

    /// Answers from a script, then repeats `fallback`.
    struct ScriptedProbe {
        script: Mutex<VecDeque<bool>>,
        fallback: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn always(healthy: bool) -> Self {
            Self::scripted(vec![], healthy)
        }

        fn scripted(script: Vec<bool>, fallback: bool) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _version: &str) -> AgentResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let healthy = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
            if healthy {
                Ok(())
            } else {
                Err(AgentError::execution("frontend is not answering"))
            }
        }
    }

    // ── Fixture ───────────────────────────────────────────────────────────────

    const UNIT: &str = "hostguard-frontend.service";

    fn fast_health() -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_millis(1),
            budget: Duration::from_secs(5),
            max_consecutive_failures: 3,
            required_successes: 1,
            probe_timeout: Duration::from_millis(500),
        }
    }

    struct Fixture {
        dir: TempDir,
        service: Arc<MockService>,
        probe: Arc<ScriptedProbe>,
        updater: SelfUpdater,
    }

    impl Fixture {
        fn releases(&self) -> PathBuf {
            self.dir.path().join("releases")
        }

        fn ledger_path(&self) -> PathBuf {
            self.dir.path().join(LEDGER_FILE_NAME)
        }

        fn ledger(&self) -> VersionLedger {
            VersionLedger::load(self.ledger_path()).unwrap()
        }

        fn link_target(&self) -> Option<String> {
            self.updater.manager().current_target().unwrap()
        }

        /// Write an unpacked release under `sources/` and return its path
        /// and checksum.
        fn source(&self, version: &str) -> (PathBuf, String) {
            let src = self.dir.path().join("sources").join(version);
            fs::create_dir_all(src.join("bin")).unwrap();
            fs::write(src.join("bin/frontend"), format!("frontend {version}")).unwrap();
            fs::write(src.join("VERSION"), version).unwrap();
            let checksum = compute_checksum(&src).unwrap();
            (src, checksum)
        }

        fn update_args(&self, version: &str) -> Value {
            let (src, checksum) = self.source(version);
            json!({ "version": version, "source": src, "checksum": checksum })
        }
    }

    fn build(dir: TempDir, probe: ScriptedProbe, health: HealthCheckConfig) -> Fixture {
        let service = Arc::new(MockService::default());
        let probe = Arc::new(probe);
        let updater = SelfUpdater::new(
            ReleaseManager::new(dir.path().join("releases"), 3),
            VersionLedger::load(dir.path().join(LEDGER_FILE_NAME)).unwrap(),
            service.clone(),
            probe.clone(),
            UpdaterConfig { service_unit: UNIT.to_string(), health },
        );
        Fixture { dir, service, probe, updater }
    }

    /// A fixture with 0.1.0 bootstrapped.
    fn installed(probe: ScriptedProbe) -> Fixture {
        let fixture = build(tempfile::tempdir().unwrap(), probe, fast_health());
        let (src, checksum) = fixture.source("0.1.0");
        fixture
            .updater
            .bootstrap(&ReleaseManifest { version: "0.1.0".into(), checksum }, &src)
            .unwrap();
        fixture
    }

    fn is_bad_arguments(err: &AgentError) -> bool {
        err.code() == Some("bad_arguments")
    }

    // ── Bootstrap ─────────────────────────────────────────────────────────────

    #[test]
    fn bootstrap_installs_without_health_check() {
        let f = installed(ScriptedProbe::always(false));
        let ledger = f.ledger();
        assert_eq!(ledger.current_version(), Some("0.1.0"));
        assert!(ledger.previous_good_version().is_none());
        assert_eq!(f.link_target().as_deref(), Some("0.1.0"));
        assert_eq!(f.probe.calls(), 0);
        assert_eq!(f.service.restarts(), 0);
    }

    #[test]
    fn bootstrap_refuses_a_second_install() {
        let f = installed(ScriptedProbe::always(true));
        let (src, checksum) = f.source("0.2.0");
        let err = f
            .updater
            .bootstrap(&ReleaseManifest { version: "0.2.0".into(), checksum }, &src)
            .unwrap_err();
        assert!(is_bad_arguments(&err));
    }

    // ── Self-update ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn healthy_update_is_promoted() {
        let f = installed(ScriptedProbe::always(true));
        let args = f.update_args("0.2.0");

        let payload = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap();
        assert_eq!(payload["status"], "succeeded");

        let ledger = f.ledger();
        assert_eq!(ledger.current_version(), Some("0.2.0"));
        assert_eq!(ledger.previous_good_version(), Some("0.1.0"));
        assert!(ledger.pending_health_check().is_none());
        let last = ledger.document().last_update.clone().unwrap();
        assert_eq!(last.status, UpdateOutcome::Succeeded);
        assert_eq!(last.from_version.as_deref(), Some("0.1.0"));

        assert_eq!(f.link_target().as_deref(), Some("0.2.0"));
        assert_eq!(f.service.restarts.lock().unwrap().as_slice(), [UNIT.to_string()]);
    }

    #[tokio::test]
    async fn failing_health_check_rolls_back() {
        let f = installed(ScriptedProbe::always(false));
        let args = f.update_args("0.2.0");

        let err = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Execution { .. }), "{err}");
        assert_eq!(f.probe.calls(), 3);

        let ledger = f.ledger();
        assert_eq!(ledger.current_version(), Some("0.1.0"));
        assert_eq!(ledger.document().release("0.2.0").unwrap().status, ReleaseStatus::Failed);
        assert_eq!(ledger.document().last_update.clone().unwrap().status, UpdateOutcome::RolledBack);
        assert_eq!(f.link_target().as_deref(), Some("0.1.0"));
        assert_eq!(f.service.restarts(), 2, "restart after promotion and after rollback");
    }

    #[tokio::test]
    async fn corrupted_checksum_changes_nothing() {
        let f = installed(ScriptedProbe::always(true));
        let (src, _) = f.source("0.2.0");
        let before = fs::read(f.ledger_path()).unwrap();

        let args = json!({ "version": "0.2.0", "source": src, "checksum": "00".repeat(32) });
        let err = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AgentError::UpdateVerification { .. }));
        assert_eq!(fs::read(f.ledger_path()).unwrap(), before);
        assert!(!f.releases().join("0.2.0").exists());
        assert_eq!(f.link_target().as_deref(), Some("0.1.0"));
        assert_eq!(f.service.restarts(), 0);
    }

    #[tokio::test]
    async fn update_to_the_active_version_is_rejected() {
        let f = installed(ScriptedProbe::always(true));
        let args = f.update_args("0.1.0");
        let err = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap_err();
        assert!(is_bad_arguments(&err));
    }

    #[tokio::test]
    async fn malformed_arguments_are_rejected() {
        let f = installed(ScriptedProbe::always(true));
        for args in [
            json!({ "version": "0.2.0" }),
            json!({ "version": "two", "source": "/tmp", "checksum": "ab" }),
            json!({ "version": "0.2.0", "source": "/no/such/dir", "checksum": "ab" }),
        ] {
            let err = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap_err();
            assert!(is_bad_arguments(&err), "{args}: {err}");
        }
    }

    #[tokio::test]
    async fn update_before_bootstrap_is_rejected() {
        let f = build(tempfile::tempdir().unwrap(), ScriptedProbe::always(true), fast_health());
        let args = f.update_args("0.2.0");
        let err = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap_err();
        assert!(is_bad_arguments(&err));
    }

    #[tokio::test]
    async fn failed_restart_rolls_back() {
        let f = installed(ScriptedProbe::always(true));
        f.service.fail.store(true, Ordering::SeqCst);
        let args = f.update_args("0.2.0");

        let err = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap_err();
        // The restart after the swap back fails too.
        assert!(matches!(err, AgentError::Rollback { .. }), "{err}");
        assert_eq!(f.ledger().current_version(), Some("0.1.0"));
        assert_eq!(f.ledger().document().last_update.clone().unwrap().status, UpdateOutcome::Failed);
    }

    /// Fails every probe and removes the previous release on the first.
    struct SabotagingProbe {
        previous: PathBuf,
    }

    #[async_trait]
    impl HealthProbe for SabotagingProbe {
        async fn probe(&self, _version: &str) -> AgentResult<()> {
            let _ = fs::remove_dir_all(&self.previous);
            Err(AgentError::execution("frontend is not answering"))
        }
    }

    #[tokio::test]
    async fn missing_previous_release_is_a_rollback_error() {
        let f = installed(ScriptedProbe::always(true));
        let probe = Arc::new(SabotagingProbe { previous: f.releases().join("0.1.0") });
        let updater = SelfUpdater::new(
            ReleaseManager::new(f.releases(), 3),
            f.ledger(),
            f.service.clone(),
            probe,
            UpdaterConfig { service_unit: UNIT.to_string(), health: fast_health() },
        );
        let args = f.update_args("0.2.0");

        let err = updater.apply_update(&args, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AgentError::Rollback { .. }), "{err}");
        let ledger = f.ledger();
        assert_eq!(ledger.current_version(), Some("0.2.0"), "ledger keeps its last committed state");
        assert_eq!(ledger.document().last_update.clone().unwrap().status, UpdateOutcome::Failed);
    }

    #[test]
    fn unpersisted_promotion_restores_the_link_and_drops_the_release() {
        let f = installed(ScriptedProbe::always(true));
        let (src, checksum) = f.source("0.2.0");
        let manager = f.updater.manager();
        let staged = manager.stage("0.2.0", &src).unwrap();
        let dir = manager.finalize(staged).unwrap();
        let ledger = Mutex::new(f.ledger());
        ledger.lock().unwrap().record_staged("0.2.0", &dir, &checksum).unwrap();
        manager.activate("0.2.0").unwrap();

        let cause = AgentError::Ledger { reason: "disk full".into() };
        let err = updater::abandon_unpromoted(manager, &ledger, "0.2.0", "0.1.0", cause);

        assert!(matches!(err, AgentError::Ledger { .. }), "{err}");
        assert_eq!(f.link_target().as_deref(), Some("0.1.0"));
        assert!(!dir.exists());
        let persisted = f.ledger();
        assert!(persisted.document().release("0.2.0").is_none());
        let last = persisted.document().history.last().unwrap();
        assert_eq!((last.version.as_str(), last.to), ("0.2.0", ReleaseStatus::Failed));
        assert_eq!(persisted.current_version(), Some("0.1.0"));
    }

    #[tokio::test]
    async fn status_answers_while_an_update_runs() {
        let f = installed(ScriptedProbe {
            delay: Duration::from_millis(50),
            ..ScriptedProbe::always(true)
        });
        let args = f.update_args("0.2.0");

        let watcher = async {
            for _ in 0..1000 {
                let status = f.updater.status().unwrap();
                if status["pending_health_check"] == "0.2.0" {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            false
        };
        let (updated, observed) =
            tokio::join!(f.updater.apply_update(&args, CancellationToken::new()), watcher);

        assert_eq!(updated.unwrap()["status"], "succeeded");
        assert!(observed, "status saw the promoted release awaiting its health check");
        assert!(f.updater.status().unwrap()["pending_health_check"].is_null());
    }

    // ── Manual rollback ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn manual_rollback_retires_the_abandoned_release() {
        let f = installed(ScriptedProbe::always(true));
        let args = f.update_args("0.2.0");
        f.updater.apply_update(&args, CancellationToken::new()).await.unwrap();

        let payload = f.updater.rollback(CancellationToken::new()).await.unwrap();
        assert_eq!(payload["current_version"], "0.1.0");
        assert_eq!(payload["rolled_back_from"], "0.2.0");

        let ledger = f.ledger();
        assert_eq!(ledger.current_version(), Some("0.1.0"));
        assert_eq!(ledger.document().release("0.2.0").unwrap().status, ReleaseStatus::Retired);
        assert_eq!(f.link_target().as_deref(), Some("0.1.0"));

        let err = f.updater.rollback(CancellationToken::new()).await.unwrap_err();
        assert!(is_bad_arguments(&err), "nothing left to roll back to");
    }

    // ── Interrupted health check ──────────────────────────────────────────────

    #[tokio::test]
    async fn interrupted_health_check_resumes_after_restart() {
        let f = installed(ScriptedProbe::always(true));
        let args = f.update_args("0.2.0");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.updater.apply_update(&args, cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Execution { .. }));
        assert_eq!(f.ledger().pending_health_check(), Some("0.2.0"));

        let Fixture { dir, .. } = f;
        let restarted = build(dir, ScriptedProbe::always(true), fast_health());
        let resumed = restarted.updater.resume_pending(CancellationToken::new()).await.unwrap();
        assert_eq!(resumed.unwrap()["status"], "succeeded");

        let ledger = restarted.ledger();
        assert_eq!(ledger.current_version(), Some("0.2.0"));
        assert!(ledger.pending_health_check().is_none());
        assert!(restarted.updater.resume_pending(CancellationToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_settles_an_unfinished_health_check_first() {
        let f = installed(ScriptedProbe::always(true));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let args = f.update_args("0.2.0");
        f.updater.apply_update(&args, cancel).await.unwrap_err();
        assert_eq!(f.ledger().pending_health_check(), Some("0.2.0"));

        let args = f.update_args("0.3.0");
        let payload = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap();
        assert_eq!(payload["status"], "succeeded");
        assert_eq!(f.probe.calls(), 2, "0.2.0 is checked before 0.3.0 is promoted over it");

        let ledger = f.ledger();
        assert_eq!(ledger.current_version(), Some("0.3.0"));
        assert_eq!(ledger.previous_good_version(), Some("0.2.0"));
        assert!(ledger.pending_health_check().is_none());
    }

    #[tokio::test]
    async fn update_is_not_started_over_an_unhealthy_pending_release() {
        let f = installed(ScriptedProbe::always(false));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let args = f.update_args("0.2.0");
        f.updater.apply_update(&args, cancel).await.unwrap_err();

        let args = f.update_args("0.3.0");
        let err = f.updater.apply_update(&args, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Execution { .. }), "{err}");
        assert!(err.detail().contains("not started"), "{err}");

        let ledger = f.ledger();
        assert_eq!(ledger.current_version(), Some("0.1.0"));
        assert!(ledger.previous_good_version().is_none());
        assert!(ledger.pending_health_check().is_none());
        assert_eq!(ledger.document().release("0.1.0").unwrap().status, ReleaseStatus::Active);
        assert_eq!(ledger.document().release("0.2.0").unwrap().status, ReleaseStatus::Failed);
        assert!(ledger.document().release("0.3.0").is_none());
        assert!(!f.releases().join("0.3.0").exists());
        assert_eq!(f.link_target().as_deref(), Some("0.1.0"));
    }

    #[tokio::test]
    async fn reconcile_trusts_the_ledger() {
        let f = installed(ScriptedProbe::always(true));
        let args = f.update_args("0.2.0");
        f.updater.apply_update(&args, CancellationToken::new()).await.unwrap();

        f.updater.manager().activate("0.1.0").unwrap();
        fs::create_dir(f.releases().join(".staging-0.3.0-deadbeef")).unwrap();
        f.updater.reconcile().unwrap();

        assert_eq!(f.link_target().as_deref(), Some("0.2.0"));
        assert!(!f.releases().join(".staging-0.3.0-deadbeef").exists());
    }

    #[tokio::test]
    async fn status_reports_the_ledger() {
        let f = installed(ScriptedProbe::always(true));
        let status = f.updater.status().unwrap();
        assert_eq!(status["current_version"], "0.1.0");
        assert_eq!(status["installed_versions"][0]["status"], "active");
        assert_eq!(status["last_update"]["status"], "succeeded");
    }

    // ── Health check controller ───────────────────────────────────────────────

    #[tokio::test]
    async fn health_requires_consecutive_successes() {
        let probe = Arc::new(ScriptedProbe::scripted(vec![true, false, true, true], false));
        let controller = HealthCheckController::new(
            probe.clone(),
            HealthCheckConfig { required_successes: 2, ..fast_health() },
        );
        let verdict = controller.run("0.2.0", &CancellationToken::new()).await;
        assert_eq!(verdict, HealthVerdict::Healthy);
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test]
    async fn health_budget_bounds_the_check() {
        let probe = Arc::new(ScriptedProbe::always(false));
        let controller = HealthCheckController::new(
            probe,
            HealthCheckConfig {
                interval: Duration::from_millis(5),
                budget: Duration::from_millis(30),
                max_consecutive_failures: 1000,
                ..fast_health()
            },
        );
        let verdict = controller.run("0.2.0", &CancellationToken::new()).await;
        assert!(matches!(verdict, HealthVerdict::BudgetExhausted { last_error: Some(_) }), "{verdict:?}");
    }

    #[tokio::test]
    async fn slow_probe_counts_as_failure() {
        let probe = Arc::new(ScriptedProbe {
            delay: Duration::from_secs(1),
            ..ScriptedProbe::always(true)
        });
        let controller = HealthCheckController::new(
            probe,
            HealthCheckConfig {
                max_consecutive_failures: 2,
                probe_timeout: Duration::from_millis(10),
                ..fast_health()
            },
        );
        match controller.run("0.2.0", &CancellationToken::new()).await {
            HealthVerdict::Unhealthy { failures, last_error } => {
                assert_eq!(failures, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("expected Unhealthy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_probing() {
        let probe = Arc::new(ScriptedProbe::always(false));
        let controller = HealthCheckController::new(
            probe.clone(),
            HealthCheckConfig { interval: Duration::from_secs(60), ..fast_health() },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        assert_eq!(controller.run("0.2.0", &cancel).await, HealthVerdict::Cancelled);
        assert_eq!(probe.calls(), 0);
    }
}
