//! # hostguard-policy
//!
//! The operation catalogue for the HOSTGUARD agent.
//!
//! ## Overview
//!
//! This crate provides [`TomlCatalogue`], which implements the
//! [`PolicyEngine`](hostguard_core::traits::PolicyEngine) trait. Operations
//! are declared in a TOML file; an operation that is not declared does not
//! exist. The whole file is validated at load time so that inconsistent
//! guardrail settings stop the agent from starting rather than surfacing
//! on the first request.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::path::Path;
//! use hostguard_policy::TomlCatalogue;
//!
//! let catalogue = TomlCatalogue::from_file(Path::new("/etc/hostguard/catalogue.toml"))?;
//! // Pass `Arc::new(catalogue)` to `hostguard_core::Dispatcher::new(...)`.
//! ```

pub mod engine;
pub mod entry;

pub use engine::TomlCatalogue;
pub use entry::{CatalogueConfig, CatalogueEntry};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use hostguard_contracts::{
        error::AgentError,
        policy::{ConfirmationClass, HandlerKind},
        verify::ArgumentRuleType,
    };
    use hostguard_core::traits::PolicyEngine;

    use crate::TomlCatalogue;

    const CATALOGUE: &str = r#"
        [[operations]]
        id = "status"
        description = "Agent status"
        handler = "status"

        [[operations]]
        id = "reboot"
        description = "Reboot the device"
        handler = "reboot"
        confirmation = "two-phase"
        exclusive = true
        guardrail_class = "power"
        cooldown_secs = 300
        allowed_gids = [1100]
        arguments = { type = "object", additionalProperties = false }

        [[operations]]
        id = "shutdown"
        handler = "shutdown"
        confirmation = "two-phase"
        exclusive = true
        guardrail_class = "power"
        cooldown_secs = 300

        [[operations]]
        id = "device_write"
        handler = "device_write"
        exclusive = true
        redact = ["value"]

        [operations.arguments]
        type = "object"
        required = ["device", "value"]

        [operations.arguments.properties.device]
        type = "string"

        [operations.arguments.properties.value]
        type = "string"

        [[operations.rules]]
        rule_id = "no-traversal"
        type = "forbidden-pattern"
        field_path = "device"
        pattern = ".."

        [[operations]]
        id = "service_restart"
        handler = "service_restart"
        confirmation = "immediate"
        exclusive = true
        cooldown_secs = 30

        [operations.rate_limit]
        max_executions = 5
        window_secs = 3600
    "#;

    fn config_reason(result: Result<TomlCatalogue, AgentError>) -> String {
        match result {
            Err(AgentError::Config { reason }) => reason,
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    // ── 1. loading ────────────────────────────────────────────────────────────

    #[test]
    fn test_catalogue_loads_every_operation() {
        let catalogue = TomlCatalogue::from_toml_str(CATALOGUE).unwrap();
        assert_eq!(catalogue.len(), 5);

        let ids: Vec<&str> = catalogue.operations().iter().map(|p| p.operation_id.as_str()).collect();
        assert_eq!(ids, ["status", "reboot", "shutdown", "device_write", "service_restart"]);
    }

    #[test]
    fn test_entry_fields_carry_into_policy() {
        let catalogue = TomlCatalogue::from_toml_str(CATALOGUE).unwrap();

        let reboot = catalogue.resolve("reboot").unwrap();
        assert_eq!(reboot.handler, HandlerKind::Reboot);
        assert_eq!(reboot.confirmation, ConfirmationClass::TwoPhase);
        assert_eq!(reboot.guardrail_class, "power");
        assert_eq!(reboot.cooldown_secs, 300);
        assert_eq!(reboot.allowed_gids, vec![1100]);

        let write = catalogue.resolve("device_write").unwrap();
        assert_eq!(write.guardrail_class, "device_write", "class defaults to the id");
        assert_eq!(write.redact, vec!["value".to_string()]);
        assert_eq!(write.arguments.json_schema["required"][0], "device");
        assert!(matches!(
            write.arguments.rules[0].rule_type,
            ArgumentRuleType::ForbiddenPattern { .. }
        ));

        let restart = catalogue.resolve("service_restart").unwrap();
        assert_eq!(restart.rate_limit.unwrap().max_executions, 5);

        let status = catalogue.resolve("status").unwrap();
        assert_eq!(status.confirmation, ConfirmationClass::None);
        assert!(!status.exclusive);
    }

    // ── 2. unknown operations ─────────────────────────────────────────────────

    #[test]
    fn test_unknown_operation_is_a_validation_error() {
        let catalogue = TomlCatalogue::from_toml_str(CATALOGUE).unwrap();
        let err = catalogue.resolve("format_disk").unwrap_err();
        assert_eq!(err.code(), Some("unknown_operation"));
    }

    #[test]
    fn test_empty_catalogue_knows_nothing() {
        let catalogue = TomlCatalogue::from_toml_str("").unwrap();
        assert!(catalogue.is_empty());
        assert!(catalogue.resolve("status").is_err());
    }

    // ── 3. startup validation ─────────────────────────────────────────────────

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let toml = r#"
            [[operations]]
            id = "status"
            handler = "status"

            [[operations]]
            id = "status"
            handler = "status"
        "#;
        assert!(config_reason(TomlCatalogue::from_toml_str(toml)).contains("duplicate"));
    }

    #[test]
    fn test_confirmed_operation_must_be_exclusive() {
        let toml = r#"
            [[operations]]
            id = "reboot"
            handler = "reboot"
            confirmation = "two-phase"
        "#;
        assert!(config_reason(TomlCatalogue::from_toml_str(toml)).contains("must be exclusive"));
    }

    #[test]
    fn test_cancel_must_not_be_exclusive() {
        let toml = r#"
            [[operations]]
            id = "cancel"
            handler = "cancel"
            exclusive = true
        "#;
        assert!(config_reason(TomlCatalogue::from_toml_str(toml)).contains("cancel"));
    }

    #[test]
    fn test_bad_argument_schema_is_rejected() {
        let toml = r#"
            [[operations]]
            id = "device_read"
            handler = "device_read"
            arguments = { type = "not-a-type" }
        "#;
        assert!(config_reason(TomlCatalogue::from_toml_str(toml)).contains("does not compile"));
    }

    #[test]
    fn test_class_members_must_agree() {
        let toml = r#"
            [[operations]]
            id = "reboot"
            handler = "reboot"
            confirmation = "two-phase"
            exclusive = true
            guardrail_class = "power"
            cooldown_secs = 300

            [[operations]]
            id = "shutdown"
            handler = "shutdown"
            confirmation = "two-phase"
            exclusive = true
            guardrail_class = "power"
            cooldown_secs = 10
        "#;
        let reason = config_reason(TomlCatalogue::from_toml_str(toml));
        assert!(reason.contains("power"), "unexpected reason: {reason}");
    }

    #[test]
    fn test_zero_rate_limit_is_rejected() {
        let toml = r#"
            [[operations]]
            id = "device_read"
            handler = "device_read"
            rate_limit = { max_executions = 0, window_secs = 60 }
        "#;
        assert!(config_reason(TomlCatalogue::from_toml_str(toml)).contains("rate limit"));
    }

    // ── 4. TOML errors ────────────────────────────────────────────────────────

    #[test]
    fn test_unknown_handler_is_a_parse_error() {
        let toml = r#"
            [[operations]]
            id = "wipe"
            handler = "format_disk"
        "#;
        assert!(config_reason(TomlCatalogue::from_toml_str(toml)).contains("failed to parse catalogue TOML"));
    }

    #[test]
    fn test_toml_parse_error() {
        let bad_toml = r#"
            this is not valid toml ][[[
        "#;
        assert!(config_reason(TomlCatalogue::from_toml_str(bad_toml)).contains("failed to parse catalogue TOML"));
    }
}
