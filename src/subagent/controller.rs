//! Sub-agent controller (CH): envelope-driven execution of typed agents.
//! Drives the pre-flight/call/collect/post-flight lifecycle per hop and
//! composes hops into the sequential "helpdesk" and parallel
//! "helpdesk-par" chains.

use chrono::Utc;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::agent_spec::AgentSpec;
use crate::config::{HttpFetchConfig, RuntimeConfig};
use crate::error::RoutePilotError;
use crate::gateway::ChatMessage;
use crate::ledger::{Ledger, Receipt, Trace};
use crate::policy::Policy;
use crate::rate::RateEstimator;
use crate::recorder::{Recorder, RecorderInput};
use crate::router::{CaptureSink, Supervisor};

use super::aggregator;
use super::envelope::TaskEnvelope;
use super::http_fetch;
use super::registry::AgentRegistry;

#[derive(Debug, Error)]
pub enum HopError {
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("input failed schema validation: {0:?}")]
    InputSchemaInvalid(Vec<String>),
    #[error("no balanced JSON object found in model output")]
    NoBalancedJson,
    #[error(transparent)]
    Router(RoutePilotError),
    #[error(transparent)]
    Ledger(anyhow::Error),
}

impl From<RoutePilotError> for HopError {
    fn from(e: RoutePilotError) -> Self {
        HopError::Router(e)
    }
}

pub struct HopOutput {
    pub receipt: Receipt,
    pub output: Value,
    pub over_budget: bool,
}

pub struct SubagentController {
    ledger: Ledger,
    recorder: Recorder,
    rate: RateEstimator,
    supervisor: Supervisor,
    registry: AgentRegistry,
    http_fetch_cfg: HttpFetchConfig,
    dry_run: bool,
}

impl SubagentController {
    pub fn new(ledger: Ledger, recorder: Recorder, rate: RateEstimator, supervisor: Supervisor, registry: AgentRegistry, cfg: &RuntimeConfig) -> Self {
        Self { ledger, recorder, rate, supervisor, registry, http_fetch_cfg: cfg.http_fetch.clone(), dry_run: cfg.dry_run }
    }

    /// Dry-run stub keyed by agent-name family; used when the ambient
    /// dry-run flag is set so chains can be exercised without a gateway.
    fn dry_run_stub(agent_name: &str) -> Value {
        if agent_name.starts_with("Triage") {
            json!({"intent": "dry-run", "fields": []})
        } else if agent_name.starts_with("Retriever") {
            json!({"records": []})
        } else if agent_name.starts_with("Writer") {
            json!({"draft": ""})
        } else if agent_name.starts_with("Aggregator") {
            json!({"records": []})
        } else {
            json!({})
        }
    }

    #[tracing::instrument(skip(self, policy, envelope), fields(agent = %envelope.agent, task = %envelope.task_id))]
    pub async fn execute(&self, policy: &Policy, envelope: &TaskEnvelope) -> Result<HopOutput, HopError> {
        self.execute_with_meta(policy, envelope, None).await
    }

    /// Same as `execute`, but folds `cancelled_agents` into the receipt's
    /// `meta` before `write_hop_receipt` signs it — cancellation info is
    /// known to the caller only after this hop's `TaskEnvelope` exists, so
    /// it cannot travel through the envelope itself.
    async fn execute_with_meta(&self, policy: &Policy, envelope: &TaskEnvelope, cancelled_agents: Option<&[String]>) -> Result<HopOutput, HopError> {
        let spec = self.registry.resolve(&envelope.agent).ok_or_else(|| HopError::UnknownAgent(envelope.agent.clone()))?;

        if let Some(schema) = &spec.input_schema {
            let violations = schema.validate(&envelope.input);
            if !violations.is_empty() {
                return Err(HopError::InputSchemaInvalid(violations.into_iter().map(|v| format!("{}: {}", v.path, v.message)).collect()));
            }
        }

        let attempt_start = std::time::Instant::now();

        if self.dry_run {
            let output = Self::dry_run_stub(&spec.name);
            return self.write_hop_receipt(policy, envelope, spec, &policy.routing.primary[0], &output, 0, vec![], 0, None, 0, 0, cancelled_agents).await;
        }

        let mut tool_results = Map::new();
        if spec.tools.iter().any(|t| t == "http_fetch") {
            if let Some(ids) = envelope.input.get("ids").and_then(|v| v.as_array()) {
                let ids: Vec<String> = ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
                if !ids.is_empty() && self.http_fetch_cfg.url_template.is_some() {
                    let fetched = http_fetch::fetch_ids(&ids, &self.http_fetch_cfg).await;
                    let entries: Vec<Value> = fetched.into_iter().map(|e| json!({"id": e.id, "status": e.status, "body": e.body})).collect();
                    tool_results.insert("http_fetch".to_string(), Value::Array(entries));
                }
            }
        }

        let mut user_payload = Map::new();
        user_payload.insert("input".to_string(), envelope.input.clone());
        if let Some(ctx) = &envelope.context {
            user_payload.insert("context".to_string(), ctx.clone());
        }
        if let Some(constraints) = &envelope.constraints {
            user_payload.insert("constraints".to_string(), constraints.clone());
        }
        if !tool_results.is_empty() {
            user_payload.insert("tool_results".to_string(), Value::Object(tool_results));
        }
        let user_content = serde_json::to_string(&Value::Object(user_payload)).map_err(|e| HopError::Ledger(e.into()))?;

        let messages = vec![
            ChatMessage { role: "system".to_string(), content: spec.system_prompt() },
            ChatMessage { role: "user".to_string(), content: user_content.clone() },
        ];

        let mut json_policy = policy.clone();
        json_policy.gen.params.json_mode = Some(true);
        json_policy.strategy.fallback_on_latency_ms = envelope.budget.time_ms;

        let mut sink = CaptureSink::default();
        let route = self
            .supervisor
            .run(&json_policy, messages, policy.objectives.max_tokens, &mut sink)
            .await
            .map_err(RoutePilotError::from)?;
        let captured = sink.0;

        let output = extract_last_balanced_json(&captured).ok_or(HopError::NoBalancedJson)?;

        if let Some(schema) = &spec.output_schema {
            let violations = schema.validate(&output);
            for v in &violations {
                tracing::warn!(path = %v.path, message = %v.message, "sub-agent output schema violation");
            }
        }

        let (prompt_tokens, completion_tokens) = match (route.usage_prompt, route.usage_completion) {
            (Some(p), Some(c)) => (p, c),
            _ => (crate::inference::DEFAULT_PROMPT_ESTIMATE, crate::inference::DEFAULT_COMPLETION_ESTIMATE),
        };
        let elapsed_ms = attempt_start.elapsed().as_millis() as u64;

        self.write_hop_receipt(
            policy,
            envelope,
            spec,
            &route.route_final,
            &output,
            route.fallback_count,
            route.reasons.clone(),
            route.latency_ms.max(elapsed_ms),
            route.first_token_ms,
            prompt_tokens,
            completion_tokens,
            cancelled_agents,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_hop_receipt(
        &self,
        policy: &Policy,
        envelope: &TaskEnvelope,
        spec: &AgentSpec,
        route_final: &str,
        output: &Value,
        fallback_count: u32,
        reasons: Vec<String>,
        latency_ms: u64,
        first_token_ms: Option<u64>,
        prompt_tokens: u32,
        completion_tokens: u32,
        cancelled_agents: Option<&[String]>,
    ) -> Result<HopOutput, HopError> {
        let cost_usd = self.rate.estimate_cost(route_final, prompt_tokens, completion_tokens);
        let over_budget = cost_usd > envelope.budget.cost_usd || latency_ms > envelope.budget.time_ms || fallback_count >= 2;

        let user_message = serde_json::to_string(&envelope.input).unwrap_or_default();
        let prompt_hash = {
            let mut hasher = Sha256::new();
            hasher.update(user_message.as_bytes());
            hex::encode(hasher.finalize())
        };
        let policy_hash = policy.hash();

        let mut meta = Map::new();
        if over_budget {
            meta.insert("over_budget".to_string(), Value::Bool(true));
        }
        if let Some(cancelled) = cancelled_agents {
            if !cancelled.is_empty() {
                meta.insert("cancelled_agents".to_string(), json!(cancelled));
            }
        }

        let receipt = self
            .recorder
            .record(RecorderInput {
                ts: Utc::now(),
                policy: policy.name.clone(),
                route_primary: policy.routing.primary[0].clone(),
                route_final: route_final.to_string(),
                fallback_count,
                reasons,
                latency_ms,
                first_token_ms,
                task_id: Some(envelope.task_id.clone()),
                parent_id: envelope.parent_id.clone(),
                prompt_tokens,
                completion_tokens,
                cost_usd,
                prompt_hash,
                policy_hash,
                agent: Some(spec.name.clone()),
                meta: Value::Object(meta),
            })
            .await
            .map_err(HopError::Ledger)?;

        self.ledger
            .insert_trace(Trace {
                id: Uuid::new_v4().to_string(),
                ts: Utc::now(),
                user_ref: None,
                policy: policy.name.clone(),
                route_primary: policy.routing.primary[0].clone(),
                route_final: route_final.to_string(),
                latency_ms,
                tokens: prompt_tokens + completion_tokens,
                cost_usd,
            })
            .await
            .map_err(HopError::Ledger)?;

        Ok(HopOutput { receipt, output: output.clone(), over_budget })
    }

    /// Sequential "helpdesk" chain: Triage, then Writer directly or
    /// Retriever→Writer depending on Triage's declared `fields`. If Triage
    /// is over budget, the conditional Retriever hop is skipped.
    pub async fn run_helpdesk_chain(&self, policy: &Policy, task_id: &str, input: Value) -> Result<Vec<HopOutput>, HopError> {
        let budget = super::envelope::Budget { tokens: policy.objectives.max_tokens, cost_usd: policy.objectives.max_cost_usd, time_ms: policy.strategy.fallback_on_latency_ms };
        let triage_env = TaskEnvelope::new(task_id, None, "Triage", &policy.name, budget.clone(), input);
        let triage = self.execute(policy, &triage_env).await?;

        let wants_retrieval = !triage.over_budget
            && triage.output.get("fields").and_then(|f| f.as_array()).map(|a| !a.is_empty()).unwrap_or(false);

        let mut hops = vec![triage];
        let triage_receipt_id = hops[0].receipt.id.clone();

        let records_input = if wants_retrieval {
            let retriever_env = triage_env.child(&triage_receipt_id, "Retriever", json!({"fields": hops[0].output.get("fields").cloned().unwrap_or(json!([]))}));
            let retriever = self.execute(policy, &retriever_env).await?;
            let records = retriever.output.clone();
            hops.push(retriever);
            records
        } else {
            json!({"records": []})
        };

        let writer_parent = hops.last().unwrap().receipt.id.clone();
        let writer_env = triage_env.child(&writer_parent, "Writer", json!({"records": records_input.get("records").cloned().unwrap_or(json!([]))}));
        let writer = self.execute(policy, &writer_env).await?;
        hops.push(writer);

        Ok(hops)
    }

    /// Parallel "helpdesk-par" chain: Triage fans out to
    /// `{RetrieverFast, RetrieverAccurate}`, an Aggregator reduces both
    /// outputs, then Writer runs last. `early_stop` cancels the losing
    /// branch instead of awaiting it.
    pub async fn run_helpdesk_par_chain(&self, policy: &Policy, task_id: &str, input: Value, early_stop: bool) -> Result<Vec<HopOutput>, HopError> {
        let budget = super::envelope::Budget { tokens: policy.objectives.max_tokens, cost_usd: policy.objectives.max_cost_usd, time_ms: policy.strategy.fallback_on_latency_ms };
        let triage_env = TaskEnvelope::new(task_id, None, "Triage", &policy.name, budget, input);
        let triage = self.execute(policy, &triage_env).await?;
        let triage_receipt_id = triage.receipt.id.clone();

        let fast_env = triage_env.child(&triage_receipt_id, "RetrieverFast", triage.output.clone());
        let accurate_env = triage_env.child(&triage_receipt_id, "RetrieverAccurate", triage.output.clone());

        let (branch_outputs, cancelled) = if early_stop {
            self.race_branches(policy, ("RetrieverFast".to_string(), fast_env), ("RetrieverAccurate".to_string(), accurate_env)).await
        } else {
            let results = futures::future::join_all(vec![self.execute(policy, &fast_env), self.execute(policy, &accurate_env)]).await;
            let outputs = results.into_iter().collect::<Result<Vec<_>, _>>()?;
            (outputs, Vec::new())
        };

        let branch_records: Vec<Vec<Value>> = branch_outputs
            .iter()
            .map(|h| h.output.get("records").and_then(|r| r.as_array()).cloned().unwrap_or_default())
            .collect();
        let aggregated = aggregator::to_strict_json(aggregator::reduce(branch_records));

        let mut hops = vec![triage];
        hops.extend(branch_outputs);

        let aggregator_env = triage_env.child(&triage_receipt_id, "Aggregator", aggregated.clone());
        let cancelled_agents = if cancelled.is_empty() { None } else { Some(cancelled.as_slice()) };
        let aggregator_hop = self.execute_with_meta(policy, &aggregator_env, cancelled_agents).await?;
        let aggregator_receipt_id = aggregator_hop.receipt.id.clone();
        hops.push(aggregator_hop);

        let writer_env = triage_env.child(&aggregator_receipt_id, "Writer", aggregated);
        let writer = self.execute(policy, &writer_env).await?;
        hops.push(writer);

        Ok(hops)
    }

    /// Runs both branches concurrently via `tokio::select!`; the first to
    /// resolve wins and the other's in-flight future is dropped
    /// (cancelling its gateway read) without being awaited. Returns the
    /// winner plus the name of the branch that was cancelled.
    async fn race_branches(&self, policy: &Policy, branch_a: (String, TaskEnvelope), branch_b: (String, TaskEnvelope)) -> (Vec<HopOutput>, Vec<String>) {
        let (name_a, env_a) = branch_a;
        let (name_b, env_b) = branch_b;

        tokio::select! {
            result = self.execute(policy, &env_a) => {
                match result {
                    Ok(hop) => (vec![hop], vec![name_b]),
                    Err(_) => match self.execute(policy, &env_b).await {
                        Ok(hop) => (vec![hop], vec![name_a]),
                        Err(_) => (Vec::new(), vec![name_a, name_b]),
                    },
                }
            }
            result = self.execute(policy, &env_b) => {
                match result {
                    Ok(hop) => (vec![hop], vec![name_a]),
                    Err(_) => match self.execute(policy, &env_a).await {
                        Ok(hop) => (vec![hop], vec![name_b]),
                        Err(_) => (Vec::new(), vec![name_a, name_b]),
                    },
                }
            }
        }
    }
}

/// Scans for the last top-level `{...}` that parses as JSON: walk forward
/// tracking brace depth, and at every point depth returns to zero, try
/// parsing the substring since the last top-level open; keep the last
/// successful parse.
pub fn extract_last_balanced_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut depth: i32 = 0;
    let mut start: Option<usize> = None;
    let mut last_valid: Option<Value> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        let c = b as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        if let Ok(value) = serde_json::from_str::<Value>(&text[s..=i]) {
                            last_valid = Some(value);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    last_valid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_last_of_multiple_json_objects() {
        let text = r#"preamble {"a":1} middle {"b":2} trailing"#;
        let v = extract_last_balanced_json(text).unwrap();
        assert_eq!(v, json!({"b": 2}));
    }

    #[test]
    fn skips_unbalanced_trailing_fragment() {
        let text = r#"{"a":1} {"b": "unterminated"#;
        let v = extract_last_balanced_json(text).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_depth_tracking() {
        let text = r#"{"note": "a { b } c"}"#;
        let v = extract_last_balanced_json(text).unwrap();
        assert_eq!(v["note"], "a { b } c");
    }

    #[test]
    fn no_json_object_returns_none() {
        assert!(extract_last_balanced_json("just text, no braces").is_none());
    }

    #[test]
    fn dry_run_stub_matches_agent_family() {
        assert_eq!(SubagentController::dry_run_stub("Triage"), json!({"intent": "dry-run", "fields": []}));
        assert_eq!(SubagentController::dry_run_stub("RetrieverFast"), json!({"records": []}));
        assert_eq!(SubagentController::dry_run_stub("Writer"), json!({"draft": ""}));
        assert_eq!(SubagentController::dry_run_stub("Aggregator"), json!({"records": []}));
    }
}
