//! The production seams: systemd via `systemctl`, device attributes via
//! the filesystem, health via a configured command.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use hostguard_contracts::{
    error::{AgentError, AgentResult, ValidationCode},
    policy::HandlerKind,
};
use hostguard_core::traits::{HealthProbe, HostActions, ServiceControl};

use crate::{
    command::run_command,
    device::{read_device, write_device},
};

fn bad_arguments(detail: impl Into<String>) -> AgentError {
    AgentError::validation(ValidationCode::BadArguments, detail)
}

fn parse<T: DeserializeOwned>(handler: HandlerKind, arguments: &Value) -> AgentResult<T> {
    serde_json::from_value(arguments.clone())
        .map_err(|e| bad_arguments(format!("{} arguments: {e}", handler.as_str())))
}

/// systemd unit names: letters, digits and `@._:-`, not starting with `-`.
pub fn validate_unit(unit: &str) -> AgentResult<()> {
    let valid = !unit.is_empty()
        && !unit.starts_with('-')
        && unit
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'@' | b'.' | b'_' | b':' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(bad_arguments(format!("'{unit}' is not a valid unit name")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitArgs {
    unit: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceReadArgs {
    device: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceWriteArgs {
    device: String,
    value: String,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root all device names resolve under.
    pub device_root: PathBuf,
    /// The `systemctl` binary.
    pub systemctl: PathBuf,
    pub command_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            device_root: PathBuf::from("/sys/class/gpio"),
            systemctl: PathBuf::from("systemctl"),
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl HostConfig {
    async fn systemctl(&self, args: &[&str]) -> AgentResult<String> {
        let mut argv = vec![self.systemctl.to_string_lossy().into_owned()];
        argv.extend(args.iter().map(|a| a.to_string()));
        run_command(&argv, &[], self.command_timeout).await
    }
}

/// `HostActions` backed by the real system.
#[derive(Debug, Clone, Default)]
pub struct SystemHost {
    config: HostConfig,
}

impl SystemHost {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HostActions for SystemHost {
    async fn perform(&self, handler: HandlerKind, arguments: &Value) -> AgentResult<Value> {
        match handler {
            HandlerKind::ServiceRestart => {
                let args: UnitArgs = parse(handler, arguments)?;
                validate_unit(&args.unit)?;
                self.config.systemctl(&["restart", "--", args.unit.as_str()]).await?;
                info!(unit = %args.unit, "service restarted");
                Ok(json!({ "unit": args.unit, "restarted": true }))
            }
            HandlerKind::Reboot => {
                warn!("rebooting host");
                self.config.systemctl(&["reboot"]).await?;
                Ok(json!({ "action": "reboot" }))
            }
            HandlerKind::Shutdown => {
                warn!("powering off host");
                self.config.systemctl(&["poweroff"]).await?;
                Ok(json!({ "action": "poweroff" }))
            }
            HandlerKind::DeviceRead => {
                let args: DeviceReadArgs = parse(handler, arguments)?;
                let value = read_device(&self.config.device_root, &args.device).await?;
                Ok(json!({ "device": args.device, "value": value }))
            }
            HandlerKind::DeviceWrite => {
                let args: DeviceWriteArgs = parse(handler, arguments)?;
                write_device(&self.config.device_root, &args.device, &args.value).await?;
                Ok(json!({ "device": args.device, "written": true }))
            }
            other => Err(AgentError::Config {
                reason: format!("handler '{}' is not a host action", other.as_str()),
            }),
        }
    }
}

/// `ServiceControl` via `systemctl restart`.
#[derive(Debug, Clone, Default)]
pub struct SystemctlService {
    config: HostConfig,
}

impl SystemctlService {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ServiceControl for SystemctlService {
    async fn restart(&self, unit: &str) -> AgentResult<()> {
        validate_unit(unit)?;
        self.config.systemctl(&["restart", "--", unit]).await?;
        info!(unit = %unit, "service restarted");
        Ok(())
    }
}

/// Runs a configured command; exit status 0 means healthy. The version
/// under test is exported as `HOSTGUARD_VERSION`.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(argv: Vec<String>, timeout: Duration) -> AgentResult<Self> {
        if argv.is_empty() {
            return Err(AgentError::Config { reason: "health probe command is empty".to_string() });
        }
        Ok(Self { argv, timeout })
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn probe(&self, version: &str) -> AgentResult<()> {
        run_command(&self.argv, &[("HOSTGUARD_VERSION", version)], self.timeout)
            .await
            .map(|_| ())
    }
}
