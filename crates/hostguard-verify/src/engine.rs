//! Schema-based argument verifier.
//!
//! `SchemaArgumentVerifier` implements the `ArgumentVerifier` trait from
//! `hostguard-core`. Verification runs in two phases:
//!
//! 1. **Structural**: the request arguments are validated against the
//!    operation's JSON Schema using the `jsonschema` crate.
//! 2. **Semantic**: each `ArgumentRule` is evaluated in order. All failures
//!    are collected before returning so the caller sees every problem at
//!    once.
//!
//! Compiled schemas are cached per `schema_id`; catalogues are immutable
//! after startup, so an id always maps to the same document.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use jsonschema::Validator;
use serde_json::Value;
use tracing::{debug, warn};

use hostguard_contracts::{
    error::{AgentError, AgentResult},
    verify::{ArgumentRuleType, ArgumentSchema, ValidationFailure, ValidationReport},
};
use hostguard_core::traits::ArgumentVerifier;

/// Rule id reported for structural failures.
pub const JSON_SCHEMA_RULE: &str = "json-schema";

/// The HOSTGUARD argument verifier.
#[derive(Default)]
pub struct SchemaArgumentVerifier {
    compiled: RwLock<HashMap<String, Arc<Validator>>>,
}

impl SchemaArgumentVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `schema` once and reuse it for every later request.
    fn validator(&self, schema: &ArgumentSchema) -> AgentResult<Arc<Validator>> {
        if let Some(v) = self
            .compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&schema.schema_id)
        {
            return Ok(Arc::clone(v));
        }

        let validator = jsonschema::validator_for(&schema.json_schema).map_err(|e| {
            AgentError::Config {
                reason: format!("argument schema '{}' does not compile: {e}", schema.schema_id),
            }
        })?;
        let validator = Arc::new(validator);
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(schema.schema_id.clone(), Arc::clone(&validator));
        Ok(validator)
    }
}

/// Resolve a dot-notation field path (e.g. `"target.unit"`) against a JSON
/// value. Returns `None` when any segment is missing or the value is JSON
/// `null`.
pub fn resolve_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) if !v.is_null() => current = v,
            _ => return None,
        }
    }
    Some(current)
}

impl ArgumentVerifier for SchemaArgumentVerifier {
    /// Verify `arguments` against `schema`.
    ///
    /// A schema that fails to compile is a verifier malfunction and returns
    /// `Err`; the catalogue loader rejects such schemas at startup, so this
    /// only happens with hand-built schemas.
    fn verify(&self, arguments: &Value, schema: &ArgumentSchema) -> AgentResult<ValidationReport> {
        let mut failures: Vec<ValidationFailure> = Vec::new();

        // ── Phase 1: JSON Schema structural validation ────────────────────────
        if !schema.json_schema.is_null() {
            let validator = self.validator(schema)?;
            for error in validator.iter_errors(arguments) {
                let message = format!("JSON Schema violation at '{}': {}", error.instance_path, error);
                warn!(schema_id = %schema.schema_id, %message, "structural validation failure");
                failures.push(ValidationFailure {
                    rule_id: JSON_SCHEMA_RULE.to_string(),
                    message,
                });
            }
        }

        // ── Phase 2: Semantic rule evaluation ────────────────────────────────
        for rule in &schema.rules {
            debug!(rule_id = %rule.rule_id, description = %rule.description, "evaluating argument rule");

            let failure_msg: Option<String> = match &rule.rule_type {
                ArgumentRuleType::RequiredField { field_path } => resolve_path(arguments, field_path)
                    .is_none()
                    .then(|| format!("required field '{field_path}' is missing or null")),

                ArgumentRuleType::AllowedValues { field_path, allowed } => {
                    match resolve_path(arguments, field_path) {
                        // Absent optional field: nothing to check.
                        None => None,
                        Some(actual) if allowed.contains(actual) => None,
                        Some(actual) => Some(format!(
                            "field '{field_path}' has value {actual} which is not in the allowed set"
                        )),
                    }
                }

                // Only string values are checked.
                ArgumentRuleType::ForbiddenPattern { field_path, pattern } => {
                    resolve_path(arguments, field_path)
                        .and_then(Value::as_str)
                        .filter(|s| s.contains(pattern.as_str()))
                        .map(|_| format!("field '{field_path}' contains forbidden pattern '{pattern}'"))
                }
            };

            if let Some(message) = failure_msg {
                warn!(rule_id = %rule.rule_id, %message, "argument rule failed");
                failures.push(ValidationFailure {
                    rule_id: rule.rule_id.clone(),
                    message,
                });
            }
        }

        let passed = failures.is_empty();
        debug!(
            schema_id = %schema.schema_id,
            passed,
            failure_count = failures.len(),
            "argument validation complete"
        );

        Ok(ValidationReport { passed, failures })
    }
}
