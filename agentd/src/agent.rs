//! Wiring: configuration in, a running agent out.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hostguard_audit::JsonlAuditWriter;
use hostguard_contracts::{
    audit::{AuditEntry, AuditEntryKind},
    error::AgentError,
    request::CallerIdentity,
    result::OperationResult,
};
use hostguard_core::{
    dispatcher::OPERATOR_TARGET,
    exclusive::ExclusiveGate,
    traits::{AuditWriter, HealthProbe, HostActions, ServiceControl},
    Dispatcher, Handlers,
};
use hostguard_host::{CommandProbe, SystemHost, SystemctlService};
use hostguard_ipc::{IpcServer, RequestHandler};
use hostguard_policy::TomlCatalogue;
use hostguard_release::{ReleaseManager, SelfUpdater, VersionLedger};
use hostguard_verify::SchemaArgumentVerifier;

use crate::config::AgentConfig;

/// Operation id the startup health-check resumption holds the exclusive
/// lock under.
const RESUME_OPERATION: &str = "self_update";

/// The side-effecting seams. Production uses [`Seams::system`]; tests
/// substitute their own.
#[derive(Clone)]
pub struct Seams {
    pub host: Arc<dyn HostActions>,
    pub service: Arc<dyn ServiceControl>,
    pub probe: Arc<dyn HealthProbe>,
}

impl Seams {
    pub fn system(config: &AgentConfig) -> Result<Self> {
        let host = config.host_config();
        let probe = CommandProbe::new(
            config.health.command.clone(),
            config.updater_config().health.probe_timeout,
        )
        .context("invalid health probe")?;
        Ok(Self {
            host: Arc::new(SystemHost::new(host.clone())),
            service: Arc::new(SystemctlService::new(host)),
            probe: Arc::new(probe),
        })
    }
}

/// Load the ledger and build the updater over the configured release root.
pub fn open_updater(
    config: &AgentConfig,
    service: Arc<dyn ServiceControl>,
    probe: Arc<dyn HealthProbe>,
) -> Result<SelfUpdater> {
    std::fs::create_dir_all(&config.release.root).with_context(|| {
        format!("failed to create release root {}", config.release.root.display())
    })?;
    let ledger = VersionLedger::load(&config.release.ledger_path).with_context(|| {
        format!("failed to load version ledger {}", config.release.ledger_path.display())
    })?;
    let manager = ReleaseManager::new(&config.release.root, config.release.keep_releases);
    Ok(SelfUpdater::new(manager, ledger, service, probe, config.updater_config()))
}

pub fn load_catalogue(path: &Path) -> Result<TomlCatalogue> {
    TomlCatalogue::from_file(path)
        .with_context(|| format!("failed to load operation catalogue {}", path.display()))
}

/// Everything `serve` runs, assembled and bound.
pub struct Agent {
    dispatcher: Arc<Dispatcher>,
    updater: Arc<SelfUpdater>,
    audit: Arc<JsonlAuditWriter>,
    server: IpcServer,
}

impl Agent {
    /// Build every component and bind the socket. Configuration problems
    /// surface here, before any client can connect. Must run inside a
    /// tokio runtime.
    pub fn assemble(config: &AgentConfig, seams: Seams) -> Result<Self> {
        let catalogue = load_catalogue(&config.catalogue)?;
        let audit = Arc::new(JsonlAuditWriter::open(&config.audit.path).with_context(|| {
            format!("failed to open audit log {}", config.audit.path.display())
        })?);

        let updater = Arc::new(open_updater(config, seams.service, seams.probe)?);
        updater.reconcile().context("release reconciliation failed")?;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(catalogue),
            Arc::new(SchemaArgumentVerifier::new()),
            audit.clone(),
            Handlers { host: seams.host, updates: updater.clone() },
            config.dispatcher_config(),
        ));

        let server = IpcServer::bind(config.ipc_config()).with_context(|| {
            format!("failed to bind IPC socket {}", config.ipc.socket_path.display())
        })?;

        Ok(Self { dispatcher, updater, audit, server })
    }

    pub fn socket_path(&self) -> &Path {
        self.server.socket_path()
    }

    /// Serve until `shutdown` fires, then wind down: abort windows and
    /// health checks are cancelled, in-flight connections get the grace
    /// period, the socket file is removed.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Agent { dispatcher, updater, audit, server } = self;

        let resume = tokio::spawn(resume_pending_update(
            updater,
            dispatcher.gate().clone(),
            audit,
            shutdown.child_token(),
        ));

        let winding_down = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                dispatcher.shutdown().await;
            })
        };

        info!(socket = %server.socket_path().display(), "agent serving");
        let handler: Arc<dyn RequestHandler> = dispatcher;
        let served = server.serve(handler, shutdown.clone()).await;

        // A failed accept loop still has to wind the dispatcher down.
        shutdown.cancel();
        if let Err(e) = winding_down.await {
            warn!(error = %e, "dispatcher shutdown task failed");
        }
        if let Err(e) = resume.await {
            warn!(error = %e, "health check resumption task failed");
        }

        served.context("IPC server failed")?;
        info!("agent stopped");
        Ok(())
    }
}

/// Complete a health check the previous run of the agent left pending.
/// Holds the exclusive lock so no update can start meanwhile. When the lock
/// is already taken, the next `self_update` settles the check before it
/// promotes anything.
async fn resume_pending_update(
    updater: Arc<SelfUpdater>,
    gate: ExclusiveGate,
    audit: Arc<JsonlAuditWriter>,
    cancel: CancellationToken,
) {
    let Some(version) = updater.pending_health_check() else {
        return;
    };
    info!(version = %version, "resuming interrupted health check");

    let _guard = match gate.try_acquire(RESUME_OPERATION) {
        Ok(guard) => guard,
        Err(e) => {
            warn!(
                version = %version,
                error = %e,
                "exclusive lock busy, health check left for the next self_update"
            );
            return;
        }
    };

    match updater.resume_pending(cancel).await {
        Ok(None) => {}
        Ok(Some(outcome)) => info!(outcome = %outcome, "pending health check resolved"),
        Err(e @ AgentError::Rollback { .. }) => {
            error!(
                target: OPERATOR_TARGET,
                error = %e,
                "rollback failed after restart, operator intervention required"
            );
            let entry = AuditEntry {
                timestamp: Utc::now(),
                kind: AuditEntryKind::OperatorAlert,
                operation_id: RESUME_OPERATION.to_string(),
                caller: agent_identity(),
                idempotency_key: None,
                arguments: Value::Null,
                result: OperationResult::from_error(&e),
                guardrail: vec![],
            };
            if let Err(e) = audit.write(&entry) {
                error!(target: OPERATOR_TARGET, error = %e, "operator alert could not be audited");
            }
        }
        Err(e) => warn!(error = %e, "pending health check did not complete"),
    }
}

/// The agent itself, as recorded for actions nobody requested.
fn agent_identity() -> CallerIdentity {
    CallerIdentity::new(
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
        i32::try_from(std::process::id()).ok(),
    )
}
