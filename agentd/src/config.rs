//! The agent configuration file.
//!
//! One TOML document, every field optional. Relative paths are resolved
//! against the directory holding the file, so a config and its catalogue
//! can travel together.
//!
//! ```toml
//! catalogue = "catalogue.toml"
//!
//! [ipc]
//! socket_path = "/run/hostguard/agent.sock"
//! allowed_gids = [1001]
//!
//! [health]
//! command = ["systemctl", "is-active", "--quiet", "frontend.service"]
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

use hostguard_core::{DispatcherConfig, GuardrailConfig};
use hostguard_host::{system::validate_unit, HostConfig};
use hostguard_ipc::{IpcServerConfig, MAX_FRAME_SIZE};
use hostguard_release::{HealthCheckConfig, UpdaterConfig, LEDGER_FILE_NAME};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostguard/agent.toml";

/// Frames above this are refused even if configured.
const FRAME_LIMIT_CEILING: usize = 16 * MAX_FRAME_SIZE;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub catalogue: PathBuf,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub ipc: IpcSection,
    pub guardrail: GuardrailSection,
    pub release: ReleaseSection,
    pub health: HealthSection,
    pub audit: AuditSection,
    pub host: HostSection,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            catalogue: PathBuf::from("/etc/hostguard/catalogue.toml"),
            log_filter: "info".to_string(),
            ipc: IpcSection::default(),
            guardrail: GuardrailSection::default(),
            release: ReleaseSection::default(),
            health: HealthSection::default(),
            audit: AuditSection::default(),
            host: HostSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcSection {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub allowed_uids: Vec<u32>,
    pub allowed_gids: Vec<u32>,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    pub request_read_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for IpcSection {
    fn default() -> Self {
        let server = IpcServerConfig::default();
        Self {
            socket_path: server.socket_path,
            socket_mode: server.socket_mode,
            allowed_uids: Vec::new(),
            allowed_gids: Vec::new(),
            max_connections: server.max_connections,
            max_frame_bytes: server.max_frame_bytes,
            request_read_timeout_ms: millis(server.request_read_timeout),
            idle_timeout_ms: millis(server.idle_timeout),
            shutdown_grace_ms: millis(server.shutdown_grace),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailSection {
    pub token_ttl_ms: u64,
    pub abort_window_ms: u64,
    pub idempotency_retention_secs: u64,
}

impl Default for GuardrailSection {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            token_ttl_ms: millis(dispatcher.guardrail.token_ttl),
            abort_window_ms: millis(dispatcher.guardrail.abort_window),
            idempotency_retention_secs: dispatcher.idempotency_retention.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReleaseSection {
    pub root: PathBuf,
    pub ledger_path: PathBuf,
    pub service_unit: String,
    /// Failed or retired releases kept on disk.
    pub keep_releases: usize,
}

impl Default for ReleaseSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/hostguard/releases"),
            ledger_path: Path::new("/var/lib/hostguard").join(LEDGER_FILE_NAME),
            service_unit: "hostguard-frontend.service".to_string(),
            keep_releases: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSection {
    pub interval_ms: u64,
    pub budget_ms: u64,
    pub max_consecutive_failures: u32,
    pub required_successes: u32,
    pub probe_timeout_ms: u64,
    /// argv of the probe; exit status 0 is healthy.
    pub command: Vec<String>,
}

impl Default for HealthSection {
    fn default() -> Self {
        let health = HealthCheckConfig::default();
        Self {
            interval_ms: millis(health.interval),
            budget_ms: millis(health.budget),
            max_consecutive_failures: health.max_consecutive_failures,
            required_successes: health.required_successes,
            probe_timeout_ms: millis(health.probe_timeout),
            command: ["systemctl", "is-active", "--quiet", "hostguard-frontend.service"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSection {
    pub path: PathBuf,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self { path: PathBuf::from("/var/log/hostguard/audit.jsonl") }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostSection {
    pub device_root: PathBuf,
    pub systemctl: PathBuf,
    pub command_timeout_ms: u64,
}

impl Default for HostSection {
    fn default() -> Self {
        let host = HostConfig::default();
        Self {
            device_root: host.device_root,
            systemctl: host.systemctl,
            command_timeout_ms: millis(host.command_timeout),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl AgentConfig {
    /// Read, parse, resolve relative paths and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn resolve_relative_to(&mut self, base: &Path) {
        for path in [
            &mut self.catalogue,
            &mut self.ipc.socket_path,
            &mut self.release.root,
            &mut self.release.ledger_path,
            &mut self.audit.path,
            &mut self.host.device_root,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.ipc.socket_mode <= 0o777, "ipc.socket_mode {:o} is not a permission mode", self.ipc.socket_mode);
        ensure!(self.ipc.max_connections > 0, "ipc.max_connections must be at least 1");
        ensure!(
            self.ipc.max_frame_bytes > 0 && self.ipc.max_frame_bytes <= FRAME_LIMIT_CEILING,
            "ipc.max_frame_bytes must be between 1 and {FRAME_LIMIT_CEILING}"
        );
        ensure!(self.ipc.request_read_timeout_ms > 0, "ipc.request_read_timeout_ms must be positive");
        ensure!(self.ipc.idle_timeout_ms > 0, "ipc.idle_timeout_ms must be positive");

        ensure!(self.guardrail.token_ttl_ms > 0, "guardrail.token_ttl_ms must be positive");

        if let Err(e) = validate_unit(&self.release.service_unit) {
            bail!("release.service_unit: {e}");
        }

        let health = &self.health;
        ensure!(health.interval_ms > 0, "health.interval_ms must be positive");
        ensure!(
            health.budget_ms >= health.interval_ms,
            "health.budget_ms must be at least health.interval_ms"
        );
        ensure!(health.max_consecutive_failures > 0, "health.max_consecutive_failures must be at least 1");
        ensure!(health.required_successes > 0, "health.required_successes must be at least 1");
        ensure!(health.probe_timeout_ms > 0, "health.probe_timeout_ms must be positive");
        ensure!(!health.command.is_empty(), "health.command must not be empty");
        Ok(())
    }

    pub fn ipc_config(&self) -> IpcServerConfig {
        IpcServerConfig {
            socket_path: self.ipc.socket_path.clone(),
            socket_mode: self.ipc.socket_mode,
            allowed_uids: self.ipc.allowed_uids.clone(),
            allowed_gids: self.ipc.allowed_gids.clone(),
            max_connections: self.ipc.max_connections,
            max_frame_bytes: self.ipc.max_frame_bytes,
            request_read_timeout: Duration::from_millis(self.ipc.request_read_timeout_ms),
            idle_timeout: Duration::from_millis(self.ipc.idle_timeout_ms),
            shutdown_grace: Duration::from_millis(self.ipc.shutdown_grace_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            guardrail: GuardrailConfig {
                token_ttl: Duration::from_millis(self.guardrail.token_ttl_ms),
                abort_window: Duration::from_millis(self.guardrail.abort_window_ms),
            },
            idempotency_retention: Duration::from_secs(self.guardrail.idempotency_retention_secs),
        }
    }

    pub fn updater_config(&self) -> UpdaterConfig {
        UpdaterConfig {
            service_unit: self.release.service_unit.clone(),
            health: HealthCheckConfig {
                interval: Duration::from_millis(self.health.interval_ms),
                budget: Duration::from_millis(self.health.budget_ms),
                max_consecutive_failures: self.health.max_consecutive_failures,
                required_successes: self.health.required_successes,
                probe_timeout: Duration::from_millis(self.health.probe_timeout_ms),
            },
        }
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            device_root: self.host.device_root.clone(),
            systemctl: self.host.systemctl.clone(),
            command_timeout: Duration::from_millis(self.host.command_timeout_ms),
        }
    }
}
