//! Argument schema and validation report types.
//!
//! Before the dispatcher looks at idempotency or guardrails, the request's
//! `arguments` are validated against the operation's `ArgumentSchema`.
//! Only a passing `ValidationReport` lets the request proceed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The specification an operation's arguments are checked against.
///
/// Combines a JSON Schema document with additional rules that JSON Schema
/// cannot express conveniently (e.g. forbidding path traversal fragments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentSchema {
    /// Identifier used in log lines, normally the operation id.
    pub schema_id: String,
    /// A JSON Schema document used for structural validation. `null` means
    /// no structural constraint.
    pub json_schema: Value,
    /// Additional rules evaluated after structural validation.
    pub rules: Vec<ArgumentRule>,
}

/// A single semantic rule applied to request arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentRule {
    /// Unique identifier for this rule, referenced in failure reports.
    pub rule_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub rule_type: ArgumentRuleType,
}

/// The rule kinds the verifier supports.
///
/// Example in TOML:
/// ```toml
/// [[operations.rules]]
/// rule_id = "no-traversal"
/// type = "forbidden-pattern"
/// field_path = "path"
/// pattern = ".."
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ArgumentRuleType {
    /// The field at `field_path` must be present and non-null.
    RequiredField { field_path: String },

    /// The field at `field_path` must equal one of `allowed`.
    AllowedValues { field_path: String, allowed: Vec<Value> },

    /// The string field at `field_path` must not contain `pattern`.
    ForbiddenPattern { field_path: String, pattern: String },
}

/// The result of running an `ArgumentSchema` against request arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True only if every check passed.
    pub passed: bool,
    /// All failures collected during this run. Empty on pass.
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    /// One-line summary suitable for an error detail.
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("[{}] {}", f.rule_id, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub rule_id: String,
    pub message: String,
}
