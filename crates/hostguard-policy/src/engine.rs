//! TOML-driven operation catalogue.
//!
//! `TomlCatalogue` loads a `CatalogueConfig` from a TOML string or file,
//! validates it as a whole, and implements the `PolicyEngine` trait from
//! hostguard-core.
//!
//! Startup validation rejects a catalogue when:
//!
//! 1. an operation id is empty or duplicated,
//! 2. an `immediate` or `two-phase` operation is not `exclusive`,
//! 3. an agent-internal handler (`status`, `update_status`, `cancel`) is
//!    guarded or exclusive,
//! 4. an argument schema does not compile,
//! 5. operations sharing a guardrail class disagree on confirmation class
//!    or cooldown,
//! 6. a rate limit allows zero executions.
//!
//! After construction the catalogue is immutable; lookups are pure.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use tracing::{debug, info};

use hostguard_contracts::{
    error::{AgentError, AgentResult, ValidationCode},
    policy::{ConfirmationClass, HandlerKind, OperationPolicy},
};
use hostguard_core::traits::PolicyEngine;

use crate::entry::{CatalogueConfig, CatalogueEntry};

/// A `PolicyEngine` implementation backed by a TOML catalogue.
///
/// ```rust,ignore
/// use hostguard_policy::TomlCatalogue;
///
/// let catalogue = TomlCatalogue::from_file(Path::new("/etc/hostguard/catalogue.toml"))?;
/// ```
#[derive(Debug)]
pub struct TomlCatalogue {
    operations: Vec<OperationPolicy>,
    index: HashMap<String, usize>,
}

impl TomlCatalogue {
    /// Parse `s` as TOML and build a validated catalogue.
    ///
    /// Returns `AgentError::Config` if the TOML is malformed, does not match
    /// the expected schema, or fails startup validation.
    pub fn from_toml_str(s: &str) -> AgentResult<Self> {
        let config: CatalogueConfig = toml::from_str(s).map_err(|e| AgentError::Config {
            reason: format!("failed to parse catalogue TOML: {e}"),
        })?;
        Self::from_config(config)
    }

    /// Read the file at `path` and parse it as a catalogue.
    pub fn from_file(path: &Path) -> AgentResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("failed to read catalogue file '{}': {e}", path.display()),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_config(config: CatalogueConfig) -> AgentResult<Self> {
        validate(&config.operations)?;

        let operations: Vec<OperationPolicy> =
            config.operations.into_iter().map(CatalogueEntry::into_policy).collect();
        let index = operations
            .iter()
            .enumerate()
            .map(|(i, op)| (op.operation_id.clone(), i))
            .collect();

        info!(operations = operations.len(), "operation catalogue loaded");
        Ok(Self { operations, index })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl PolicyEngine for TomlCatalogue {
    fn resolve(&self, operation_id: &str) -> AgentResult<&OperationPolicy> {
        match self.index.get(operation_id) {
            Some(&i) => {
                debug!(operation_id = %operation_id, "operation resolved");
                Ok(&self.operations[i])
            }
            None => Err(AgentError::validation(
                ValidationCode::UnknownOperation,
                format!("operation '{operation_id}' is not in the catalogue"),
            )),
        }
    }

    fn operations(&self) -> Vec<&OperationPolicy> {
        self.operations.iter().collect()
    }
}

fn config_error(reason: String) -> AgentError {
    AgentError::Config { reason }
}

fn validate(entries: &[CatalogueEntry]) -> AgentResult<()> {
    let mut seen = HashSet::new();
    // class → (first operation id, confirmation, cooldown)
    let mut classes: HashMap<&str, (&str, ConfirmationClass, u64)> = HashMap::new();

    for entry in entries {
        let id = entry.id.as_str();
        if id.trim().is_empty() {
            return Err(config_error("operation id must not be empty".to_string()));
        }
        if !seen.insert(id) {
            return Err(config_error(format!("duplicate operation id '{id}'")));
        }

        if entry.confirmation != ConfirmationClass::None && !entry.exclusive {
            return Err(config_error(format!(
                "operation '{id}' requires confirmation and must be exclusive"
            )));
        }

        if matches!(
            entry.handler,
            HandlerKind::Status | HandlerKind::UpdateStatus | HandlerKind::Cancel
        ) && (entry.exclusive || entry.confirmation != ConfirmationClass::None)
        {
            return Err(config_error(format!(
                "operation '{id}' uses handler '{}', which must be neither exclusive nor confirmed",
                entry.handler.as_str()
            )));
        }

        if !entry.arguments.is_null() {
            jsonschema::validator_for(&entry.arguments).map_err(|e| {
                config_error(format!("argument schema of '{id}' does not compile: {e}"))
            })?;
        }

        if let Some(limit) = &entry.rate_limit {
            if limit.max_executions == 0 {
                return Err(config_error(format!(
                    "rate limit of '{id}' must allow at least one execution"
                )));
            }
        }

        let class = entry.class();
        match classes.get(class) {
            Some(&(first, confirmation, cooldown))
                if confirmation != entry.confirmation || cooldown != entry.cooldown_secs =>
            {
                return Err(config_error(format!(
                    "operations '{first}' and '{id}' share guardrail class '{class}' but disagree on confirmation or cooldown"
                )));
            }
            Some(_) => {}
            None => {
                classes.insert(class, (id, entry.confirmation, entry.cooldown_secs));
            }
        }
    }
    Ok(())
}
