//! Validated policy configuration.
//!
//! Reading the YAML file itself is an external collaborator's job; this
//! module only defines the typed, validated shape and the closed-schema
//! check, the way the teacher's `AgentConfig` fills defaults from a
//! profile rather than trusting caller-supplied structs blindly.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PolicyIssue;

fn default_p95_window_n() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Objectives {
    pub p95_latency_ms: u64,
    pub max_cost_usd: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GenParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_mode: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GenDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(flatten)]
    pub params: GenParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Routing {
    pub primary: Vec<String>,
    #[serde(default)]
    pub backups: Vec<String>,
    #[serde(default = "default_p95_window_n")]
    pub p95_window_n: usize,
    #[serde(default)]
    pub params: std::collections::BTreeMap<String, GenParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Strategy {
    pub fallback_on_latency_ms: u64,
    pub max_attempts: usize,
    pub backoff_ms: Vec<u64>,
    #[serde(default)]
    pub first_chunk_gate_ms: u64,
    pub escalate_after_fallbacks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Tenancy {
    pub per_user_daily_tokens: u64,
    pub per_user_rpm: u32,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub name: String,
    pub objectives: Objectives,
    pub routing: Routing,
    pub strategy: Strategy,
    pub tenancy: Tenancy,
    #[serde(default)]
    pub gen: GenDefaults,
}

impl Policy {
    /// Validate against the closed schema: structural requirements from
    /// §3 plus IANA timezone parseability. Collects every issue instead of
    /// stopping at the first.
    pub fn validate(&self) -> Vec<PolicyIssue> {
        let mut issues = Vec::new();

        if self.routing.primary.is_empty() {
            issues.push(PolicyIssue {
                path: "routing.primary".into(),
                message: "must contain at least one model".into(),
            });
        }
        if self.strategy.max_attempts == 0 {
            issues.push(PolicyIssue {
                path: "strategy.max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.strategy.backoff_ms.is_empty() {
            issues.push(PolicyIssue {
                path: "strategy.backoff_ms".into(),
                message: "must contain at least one entry".into(),
            });
        }
        if self.tenancy.per_user_rpm == 0 {
            issues.push(PolicyIssue {
                path: "tenancy.per_user_rpm".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.tenancy.timezone.parse::<chrono_tz::Tz>().is_err() {
            issues.push(PolicyIssue {
                path: "tenancy.timezone".into(),
                message: format!("'{}' is not a recognized IANA timezone", self.tenancy.timezone),
            });
        }
        if self.routing.p95_window_n == 0 {
            issues.push(PolicyIssue {
                path: "routing.p95_window_n".into(),
                message: "must be greater than 0".into(),
            });
        }

        issues
    }

    /// Canonical JSON form used for both the policy hash and the receipt
    /// payload field — object keys are emitted in a stable order by virtue
    /// of serde's struct field order, so this is deterministic across runs.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("Policy serializes")
    }

    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Merge `gen` defaults with a per-model override, per-model winning.
    pub fn effective_params(&self, model: &str) -> GenParams {
        let mut merged = self.gen.params.clone();
        if let Some(over) = self.routing.params.get(model) {
            if over.temperature.is_some() {
                merged.temperature = over.temperature;
            }
            if over.top_p.is_some() {
                merged.top_p = over.top_p;
            }
            if over.stop.is_some() {
                merged.stop = over.stop.clone();
            }
            if over.json_mode.is_some() {
                merged.json_mode = over.json_mode;
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Policy {
        Policy {
            name: "default".into(),
            objectives: Objectives { p95_latency_ms: 500, max_cost_usd: 1.0, max_tokens: 4096 },
            routing: Routing {
                primary: vec!["gpt-4o-mini".into()],
                backups: vec!["gpt-4o".into()],
                p95_window_n: 50,
                params: Default::default(),
            },
            strategy: Strategy {
                fallback_on_latency_ms: 1500,
                max_attempts: 3,
                backoff_ms: vec![100, 250, 500],
                first_chunk_gate_ms: 0,
                escalate_after_fallbacks: 2,
            },
            tenancy: Tenancy { per_user_daily_tokens: 100_000, per_user_rpm: 30, timezone: "America/New_York".into() },
            gen: GenDefaults::default(),
        }
    }

    #[test]
    fn valid_policy_has_no_issues() {
        assert!(sample().validate().is_empty());
    }

    #[test]
    fn empty_primary_is_rejected() {
        let mut p = sample();
        p.routing.primary.clear();
        let issues = p.validate();
        assert!(issues.iter().any(|i| i.path == "routing.primary"));
    }

    #[test]
    fn bad_timezone_is_rejected() {
        let mut p = sample();
        p.tenancy.timezone = "Not/AZone".into();
        let issues = p.validate();
        assert!(issues.iter().any(|i| i.path == "tenancy.timezone"));
    }

    #[test]
    fn hash_is_stable_for_equal_policies() {
        assert_eq!(sample().hash(), sample().hash());
    }

    #[test]
    fn per_model_override_wins_over_gen_default() {
        let mut p = sample();
        p.gen.params.temperature = Some(0.7);
        p.routing.params.insert("gpt-4o-mini".into(), GenParams { temperature: Some(0.2), top_p: None, stop: None, json_mode: None });
        let eff = p.effective_params("gpt-4o-mini");
        assert_eq!(eff.temperature, Some(0.2));
    }

    #[test]
    fn round_trip_through_yaml_preserves_defaults() {
        let p = sample();
        let yaml = serde_yaml::to_string(&p).unwrap();
        let back: Policy = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let yaml = serde_yaml::to_string(&sample()).unwrap() + "unknown_field: true\n";
        assert!(serde_yaml::from_str::<Policy>(&yaml).is_err());
    }

    #[test]
    fn unknown_nested_tenancy_key_is_rejected() {
        let mut value: serde_yaml::Value = serde_yaml::from_str(&serde_yaml::to_string(&sample()).unwrap()).unwrap();
        value["tenancy"]["bogus"] = serde_yaml::Value::Bool(true);
        let yaml = serde_yaml::to_string(&value).unwrap();
        assert!(serde_yaml::from_str::<Policy>(&yaml).is_err());
    }
}
