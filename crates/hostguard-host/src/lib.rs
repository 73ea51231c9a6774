//! # hostguard-host
//!
//! The OS-facing implementations of the dispatcher's seams:
//!
//! - [`SystemHost`] (`HostActions`): `systemctl restart|reboot|poweroff`
//!   and device attribute reads/writes confined to a root directory
//! - [`SystemctlService`] (`ServiceControl`): restarts the release's unit
//! - [`CommandProbe`] (`HealthProbe`): a configured health command

pub mod command;
pub mod device;
pub mod system;

pub use command::run_command;
pub use device::{read_device, resolve_device, write_device};
pub use system::{validate_unit, CommandProbe, HostConfig, SystemHost, SystemctlService};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use serde_json::json;

    use hostguard_contracts::{error::AgentError, policy::HandlerKind};
    use hostguard_core::traits::{HealthProbe, HostActions, ServiceControl};

    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn host_with(systemctl: &str, device_root: PathBuf) -> SystemHost {
        SystemHost::new(HostConfig {
            device_root,
            systemctl: PathBuf::from(systemctl),
            command_timeout: Duration::from_secs(5),
        })
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn command_output_is_captured() {
        let echo = argv(&["echo", "restart", "--", "app.service"]);
        let out = run_command(&echo, &[], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, "restart -- app.service");
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let failing = argv(&["sh", "-c", "echo boom >&2; exit 3"]);
        let err = run_command(&failing, &[], Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, AgentError::Execution { .. }));
        assert!(err.detail().contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn slow_command_is_killed() {
        let err = run_command(&argv(&["sleep", "5"]), &[], Duration::from_millis(50)).await.unwrap_err();
        assert!(err.detail().contains("timed out"), "{err}");
    }

    // ── Units ─────────────────────────────────────────────────────────────────

    #[test]
    fn unit_names_are_validated() {
        for ok in ["app.service", "getty@tty1.service", "dev-sda1.device"] {
            assert!(validate_unit(ok).is_ok(), "{ok}");
        }
        for bad in ["", "--force", "app service", "app;reboot", "../x"] {
            assert!(validate_unit(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn service_restart_runs_systemctl() {
        let dir = tempfile::tempdir().unwrap();
        let ok = host_with("true", dir.path().to_path_buf());
        let result = ok
            .perform(HandlerKind::ServiceRestart, &json!({ "unit": "app.service" }))
            .await
            .unwrap();
        assert_eq!(result["restarted"], true);

        let failing = host_with("false", dir.path().to_path_buf());
        let err = failing
            .perform(HandlerKind::ServiceRestart, &json!({ "unit": "app.service" }))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Execution { .. }));

        let err = ok
            .perform(HandlerKind::ServiceRestart, &json!({ "unit": "-x" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("bad_arguments"));
    }

    #[tokio::test]
    async fn systemctl_service_restarts_units() {
        let service = SystemctlService::new(HostConfig {
            systemctl: PathBuf::from("true"),
            ..HostConfig::default()
        });
        service.restart("hostguard-frontend.service").await.unwrap();
        assert!(service.restart("bad unit").await.is_err());
    }

    #[tokio::test]
    async fn agent_handlers_are_not_host_actions() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_with("true", dir.path().to_path_buf());
        assert!(host.perform(HandlerKind::SelfUpdate, &json!({})).await.is_err());
    }

    // ── Devices ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn device_attributes_read_and_write() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("gpio17")).unwrap();
        std::fs::write(dir.path().join("gpio17/value"), "0\n").unwrap();
        let host = host_with("true", dir.path().to_path_buf());

        let read = host
            .perform(HandlerKind::DeviceRead, &json!({ "device": "gpio17/value" }))
            .await
            .unwrap();
        assert_eq!(read["value"], "0");

        host.perform(HandlerKind::DeviceWrite, &json!({ "device": "gpio17/value", "value": "1" }))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("gpio17/value")).unwrap(), "1");
    }

    #[tokio::test]
    async fn device_writes_never_create_files() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_with("true", dir.path().to_path_buf());
        let err = host
            .perform(HandlerKind::DeviceWrite, &json!({ "device": "new_attr", "value": "1" }))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Execution { .. }));
        assert!(!dir.path().join("new_attr").exists());
    }

    #[test]
    fn device_names_cannot_escape_the_root() {
        let root = std::path::Path::new("/sys/class/gpio");
        assert_eq!(resolve_device(root, "gpio17/value").unwrap(), root.join("gpio17/value"));
        for bad in ["", "/etc/shadow", "../../etc/shadow", "gpio17/../../x", "./gpio17"] {
            assert!(resolve_device(root, bad).is_err(), "{bad}");
        }
    }

    // ── Health probe ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn probe_sees_the_version_under_test() {
        let probe = CommandProbe::new(
            argv(&["sh", "-c", "test \"$HOSTGUARD_VERSION\" = 0.2.0"]),
            Duration::from_secs(5),
        )
        .unwrap();
        probe.probe("0.2.0").await.unwrap();
        assert!(probe.probe("0.3.0").await.is_err());
    }

    #[test]
    fn empty_probe_command_is_a_config_error() {
        assert!(matches!(
            CommandProbe::new(vec![], Duration::from_secs(1)),
            Err(AgentError::Config { .. })
        ));
    }
}
