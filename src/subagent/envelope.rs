use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub tokens: u32,
    #[serde(rename = "costUsd")]
    pub cost_usd: f64,
    #[serde(rename = "timeMs")]
    pub time_ms: u64,
}

/// Typed call record passed into one sub-agent hop. Not persisted — only
/// the receipts it produces are durable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "envelopeVersion")]
    pub envelope_version: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<String>,
    pub agent: String,
    pub policy: String,
    pub budget: Budget,
    pub input: Value,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub constraints: Option<Value>,
}

impl TaskEnvelope {
    pub fn new(task_id: impl Into<String>, parent_id: Option<String>, agent: impl Into<String>, policy: impl AsRef<str>, budget: Budget, input: Value) -> Self {
        Self {
            envelope_version: "1".to_string(),
            task_id: task_id.into(),
            parent_id,
            agent: agent.into(),
            policy: policy.as_ref().to_string(),
            budget,
            input,
            context: None,
            constraints: None,
        }
    }

    pub fn child(&self, parent_receipt_id: impl AsRef<str>, agent: impl Into<String>, input: Value) -> Self {
        Self {
            envelope_version: "1".to_string(),
            task_id: self.task_id.clone(),
            parent_id: Some(parent_receipt_id.as_ref().to_string()),
            agent: agent.into(),
            policy: self.policy.clone(),
            budget: Budget { tokens: self.budget.tokens, cost_usd: self.budget.cost_usd, time_ms: self.budget.time_ms },
            input,
            context: self.context.clone(),
            constraints: self.constraints.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_is_always_1() {
        let env = TaskEnvelope::new("t1", None, "Triage", "default", Budget { tokens: 100, cost_usd: 0.1, time_ms: 2000 }, json!({}));
        assert_eq!(env.envelope_version, "1");
    }

    #[test]
    fn child_inherits_task_id_and_policy() {
        let env = TaskEnvelope::new("t1", None, "Triage", "default", Budget { tokens: 100, cost_usd: 0.1, time_ms: 2000 }, json!({}));
        let child = env.child("r1", "Writer", json!({"draft": ""}));
        assert_eq!(child.task_id, "t1");
        assert_eq!(child.parent_id, Some("r1".to_string()));
        assert_eq!(child.policy, "default");
    }
}
