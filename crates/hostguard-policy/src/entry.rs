//! Catalogue entry types and configuration schema.
//!
//! A `CatalogueConfig` is deserialized from TOML and holds the list of
//! operations the agent will perform. Anything not listed does not exist.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hostguard_contracts::{
    policy::{ConfirmationClass, HandlerKind, OperationPolicy, RateLimit},
    verify::{ArgumentRule, ArgumentSchema},
};

/// One `[[operations]]` entry.
///
/// Example:
/// ```toml
/// [[operations]]
/// id = "reboot"
/// description = "Reboot the device"
/// handler = "reboot"
/// confirmation = "two-phase"
/// exclusive = true
/// guardrail_class = "power"
/// cooldown_secs = 300
/// arguments = { type = "object", additionalProperties = false }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogueEntry {
    /// The `operation_id` clients use.
    pub id: String,

    #[serde(default)]
    pub description: String,

    pub handler: HandlerKind,

    #[serde(default = "default_confirmation")]
    pub confirmation: ConfirmationClass,

    #[serde(default)]
    pub exclusive: bool,

    /// Defaults to the operation id.
    pub guardrail_class: Option<String>,

    #[serde(default)]
    pub cooldown_secs: u64,

    pub rate_limit: Option<RateLimit>,

    /// Inline JSON Schema for the request arguments. Absent means any
    /// arguments are structurally acceptable.
    #[serde(default)]
    pub arguments: Value,

    #[serde(default)]
    pub rules: Vec<ArgumentRule>,

    /// Argument fields (dot paths) replaced by `"[REDACTED]"` when audited.
    #[serde(default)]
    pub redact: Vec<String>,

    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    #[serde(default)]
    pub allowed_gids: Vec<u32>,
}

fn default_confirmation() -> ConfirmationClass {
    ConfirmationClass::None
}

impl CatalogueEntry {
    /// The effective guardrail class.
    pub fn class(&self) -> &str {
        self.guardrail_class.as_deref().unwrap_or(&self.id)
    }

    /// Convert into the policy the dispatcher works with.
    pub fn into_policy(self) -> OperationPolicy {
        let guardrail_class = self.class().to_string();
        OperationPolicy {
            arguments: ArgumentSchema {
                schema_id: self.id.clone(),
                json_schema: self.arguments,
                rules: self.rules,
            },
            operation_id: self.id,
            description: self.description,
            handler: self.handler,
            confirmation: self.confirmation,
            exclusive: self.exclusive,
            guardrail_class,
            cooldown_secs: self.cooldown_secs,
            rate_limit: self.rate_limit,
            redact: self.redact,
            allowed_uids: self.allowed_uids,
            allowed_gids: self.allowed_gids,
        }
    }
}

/// The top-level structure deserialized from a catalogue file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogueConfig {
    #[serde(default)]
    pub operations: Vec<CatalogueEntry>,
}
