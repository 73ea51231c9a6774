//! # hostguard-verify
//!
//! Argument validation for the HOSTGUARD agent.
//!
//! [`SchemaArgumentVerifier`] implements
//! [`ArgumentVerifier`](hostguard_core::traits::ArgumentVerifier): JSON
//! Schema structural validation followed by the catalogue's semantic rules
//! (`required-field`, `allowed-values`, `forbidden-pattern`).

pub mod engine;

pub use engine::{resolve_path, SchemaArgumentVerifier, JSON_SCHEMA_RULE};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use hostguard_contracts::verify::{ArgumentRule, ArgumentRuleType, ArgumentSchema};
    use hostguard_core::traits::ArgumentVerifier;

    use super::*;

    fn make_schema(json_schema: Value, rules: Vec<ArgumentRule>) -> ArgumentSchema {
        ArgumentSchema {
            schema_id: "device_write".to_string(),
            json_schema,
            rules,
        }
    }

    fn rule(rule_id: &str, rule_type: ArgumentRuleType) -> ArgumentRule {
        ArgumentRule {
            rule_id: rule_id.to_string(),
            description: String::new(),
            rule_type,
        }
    }

    fn device_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "device": { "type": "string" },
                "value": { "type": "string", "maxLength": 64 }
            },
            "required": ["device", "value"],
            "additionalProperties": false
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let verifier = SchemaArgumentVerifier::new();
        let report = verifier
            .verify(&json!({ "device": "leds/status", "value": "1" }), &make_schema(device_schema(), vec![]))
            .unwrap();
        assert!(report.passed, "{}", report.summary());
    }

    #[test]
    fn structural_violations_are_all_reported() {
        let verifier = SchemaArgumentVerifier::new();
        let report = verifier
            .verify(&json!({ "value": 7, "extra": true }), &make_schema(device_schema(), vec![]))
            .unwrap();

        assert!(!report.passed);
        assert!(report.failures.len() >= 2);
        assert!(report.failures.iter().all(|f| f.rule_id == JSON_SCHEMA_RULE));
    }

    #[test]
    fn null_schema_imposes_no_structure() {
        let verifier = SchemaArgumentVerifier::new();
        let report = verifier.verify(&json!({ "anything": [1, 2] }), &make_schema(Value::Null, vec![])).unwrap();
        assert!(report.passed);
    }

    #[test]
    fn forbidden_pattern_blocks_path_traversal() {
        let verifier = SchemaArgumentVerifier::new();
        let schema = make_schema(
            device_schema(),
            vec![rule(
                "no-traversal",
                ArgumentRuleType::ForbiddenPattern {
                    field_path: "device".to_string(),
                    pattern: "..".to_string(),
                },
            )],
        );

        let report = verifier.verify(&json!({ "device": "../../etc/shadow", "value": "x" }), &schema).unwrap();
        assert!(!report.passed);
        assert_eq!(report.failures[0].rule_id, "no-traversal");
        assert!(report.summary().contains("forbidden pattern"));
    }

    #[test]
    fn allowed_values_restrict_the_field() {
        let verifier = SchemaArgumentVerifier::new();
        let schema = make_schema(
            Value::Null,
            vec![rule(
                "known-units",
                ArgumentRuleType::AllowedValues {
                    field_path: "unit".to_string(),
                    allowed: vec![json!("app.service"), json!("telemetry.service")],
                },
            )],
        );

        assert!(verifier.verify(&json!({ "unit": "app.service" }), &schema).unwrap().passed);
        assert!(!verifier.verify(&json!({ "unit": "sshd.service" }), &schema).unwrap().passed);
        assert!(verifier.verify(&json!({}), &schema).unwrap().passed, "absent field is not checked");
    }

    #[test]
    fn required_field_resolves_dotted_paths() {
        let verifier = SchemaArgumentVerifier::new();
        let schema = make_schema(
            Value::Null,
            vec![rule(
                "source-path",
                ArgumentRuleType::RequiredField { field_path: "source.path".to_string() },
            )],
        );

        assert!(verifier.verify(&json!({ "source": { "path": "/tmp/r" } }), &schema).unwrap().passed);
        let report = verifier.verify(&json!({ "source": { "path": null } }), &schema).unwrap();
        assert!(!report.passed);
    }

    #[test]
    fn uncompilable_schema_is_a_verifier_error() {
        let verifier = SchemaArgumentVerifier::new();
        let schema = make_schema(json!({ "type": "no-such-type" }), vec![]);
        assert!(verifier.verify(&json!({}), &schema).is_err());
    }

    #[test]
    fn resolve_path_treats_null_as_missing() {
        let value = json!({ "a": { "b": null, "c": 1 } });
        assert!(resolve_path(&value, "a.b").is_none());
        assert_eq!(resolve_path(&value, "a.c"), Some(&json!(1)));
        assert!(resolve_path(&value, "x").is_none());
    }
}
