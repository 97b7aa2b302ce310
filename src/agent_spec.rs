//! Declarative agent definitions shared by the agent session driver and
//! the sub-agent controller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Permissive JSON-schema subset: top-level `type`, `properties.type`,
/// and `required` presence — enough for structural pre/post-flight
/// checks without pulling in a full schema validator.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PermissiveSchema {
    #[serde(rename = "type", default)]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyType>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyType {
    #[serde(rename = "type")]
    pub schema_type: String,
}

#[derive(Debug, Clone)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl PermissiveSchema {
    /// Structural check: object-ness, declared property types, and
    /// required-key presence. Returns every violation found.
    pub fn validate(&self, value: &serde_json::Value) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();

        if let Some(t) = &self.schema_type {
            if t == "object" && !value.is_object() {
                violations.push(SchemaViolation { path: "$".into(), message: "expected an object".into() });
                return violations;
            }
        }

        let Some(obj) = value.as_object() else { return violations };

        for key in &self.required {
            if !obj.contains_key(key) {
                violations.push(SchemaViolation { path: key.clone(), message: "required field missing".into() });
            }
        }

        for (key, prop) in &self.properties {
            if let Some(v) = obj.get(key) {
                if !json_type_matches(&prop.schema_type, v) {
                    violations.push(SchemaViolation { path: key.clone(), message: format!("expected type '{}'", prop.schema_type) });
                }
            }
        }

        violations
    }
}

fn json_type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub policy: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub input_schema: Option<PermissiveSchema>,
    #[serde(default)]
    pub output_schema: Option<PermissiveSchema>,
}

impl AgentSpec {
    /// §9 open question (d): absent `system` defaults to a deterministic
    /// prompt asserting strict JSON output.
    pub fn system_prompt(&self) -> String {
        self.system.clone().unwrap_or_else(|| {
            "Respond with a single strict JSON object only. No prose, no markdown code fences.".to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_field_is_a_violation() {
        let schema = PermissiveSchema {
            schema_type: Some("object".into()),
            properties: BTreeMap::from([("ids".to_string(), PropertyType { schema_type: "array".into() })]),
            required: vec!["ids".to_string()],
        };
        let violations = schema.validate(&json!({}));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "ids");
    }

    #[test]
    fn wrong_property_type_is_a_violation() {
        let schema = PermissiveSchema {
            schema_type: Some("object".into()),
            properties: BTreeMap::from([("ids".to_string(), PropertyType { schema_type: "array".into() })]),
            required: vec![],
        };
        let violations = schema.validate(&json!({"ids": "not-an-array"}));
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn absent_system_defaults_to_strict_json_prompt() {
        let spec = AgentSpec { name: "Writer".into(), policy: "default".into(), system: None, tools: vec![], input_schema: None, output_schema: None };
        assert!(spec.system_prompt().contains("strict JSON"));
    }
}
