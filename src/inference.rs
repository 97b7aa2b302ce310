//! Inference driver (I): single-request orchestration — quota check,
//! router, usage reconciliation, receipt, trace — plus an optional
//! silent shadow run.

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::RoutePilotError;
use crate::gateway::{ChatMessage, GatewayClient};
use crate::ledger::{Ledger, Trace};
use crate::policy::Policy;
use crate::quota::QuotaEnforcer;
use crate::rate::RateEstimator;
use crate::recorder::{Recorder, RecorderInput};
use crate::router::{Sink, SilentSink, Supervisor};

/// Default estimate used when the gateway never reports usage and the
/// probe is disabled — intentionally coarse (§9 token accounting gap).
pub(crate) const DEFAULT_PROMPT_ESTIMATE: u32 = 300;
pub(crate) const DEFAULT_COMPLETION_ESTIMATE: u32 = 200;

pub struct InferenceDriver {
    gateway: GatewayClient,
    ledger: Ledger,
    quota: QuotaEnforcer,
    recorder: Recorder,
    rate: RateEstimator,
    supervisor: Supervisor,
    usage_probe: bool,
}

pub struct InferInput {
    pub user: String,
    pub content: String,
    pub attachment_block: Option<String>,
    pub shadow_model: Option<String>,
}

pub struct InferOutput {
    pub receipt_id: String,
    pub route_final: String,
    pub fallback_count: u32,
}

impl InferenceDriver {
    pub fn new(
        gateway: GatewayClient,
        ledger: Ledger,
        quota: QuotaEnforcer,
        recorder: Recorder,
        rate: RateEstimator,
        supervisor: Supervisor,
        usage_probe: bool,
    ) -> Self {
        Self { gateway, ledger, quota, recorder, rate, supervisor, usage_probe }
    }

    #[tracing::instrument(skip(self, policy, input, sink), fields(user = %input.user))]
    pub async fn infer(&self, policy: &Policy, input: InferInput, mut sink: impl Sink) -> Result<InferOutput, RoutePilotError> {
        let policy_hash = policy.hash();

        self.quota
            .assert_within_rpm(&input.user, policy.tenancy.per_user_rpm)
            .await
            .map_err(RoutePilotError::Unknown)?
            .map_err(RoutePilotError::from)?;

        let mut messages = Vec::new();
        if let Some(system) = &policy.gen.system {
            messages.push(ChatMessage { role: "system".to_string(), content: system.clone() });
        }
        let mut user_content = input.content.clone();
        if let Some(block) = &input.attachment_block {
            user_content.push_str("\n\n");
            user_content.push_str(block);
        }
        messages.push(ChatMessage { role: "user".to_string(), content: user_content });

        let prompt_hash = {
            let mut hasher = Sha256::new();
            hasher.update(input.content.as_bytes());
            if let Some(block) = &input.attachment_block {
                hasher.update(b"\n\n");
                hasher.update(block.as_bytes());
            }
            hex::encode(hasher.finalize())
        };

        let route = self
            .supervisor
            .run(policy, messages.clone(), policy.objectives.max_tokens, &mut sink)
            .await
            .map_err(RoutePilotError::from)?;

        let (prompt_tokens, completion_tokens) = self.reconcile_usage(policy, &route, &messages).await;
        let cost_usd = self.rate.estimate_cost(&route.route_final, prompt_tokens, completion_tokens);

        let ts = Utc::now();
        let task_id = Uuid::new_v4().to_string();
        let receipt = self
            .recorder
            .record(RecorderInput {
                ts,
                policy: policy.name.clone(),
                route_primary: policy.routing.primary[0].clone(),
                route_final: route.route_final.clone(),
                fallback_count: route.fallback_count,
                reasons: route.reasons.clone(),
                latency_ms: route.latency_ms,
                first_token_ms: route.first_token_ms,
                task_id: Some(task_id.clone()),
                parent_id: None,
                prompt_tokens,
                completion_tokens,
                cost_usd,
                prompt_hash,
                policy_hash: policy_hash.clone(),
                agent: None,
                meta: json!({}),
            })
            .await
            .map_err(RoutePilotError::Unknown)?;

        // Quota errors here are raised after the gateway call already
        // streamed bytes to the caller — intentional (§7). The receipt
        // above already exists; no trace row or shadow run follows a
        // quota failure (§4.5: "on failure at any step, no mutation below
        // it occurs").
        self.quota
            .add_daily_tokens(&input.user, (prompt_tokens + completion_tokens) as u64, policy.tenancy.per_user_daily_tokens, &policy.tenancy.timezone)
            .await
            .map_err(RoutePilotError::Unknown)?
            .map_err(RoutePilotError::from)?;

        self.ledger
            .insert_trace(Trace {
                id: Uuid::new_v4().to_string(),
                ts,
                user_ref: Some(input.user.clone()),
                policy: policy.name.clone(),
                route_primary: policy.routing.primary[0].clone(),
                route_final: route.route_final.clone(),
                latency_ms: route.latency_ms,
                tokens: prompt_tokens + completion_tokens,
                cost_usd,
            })
            .await
            .map_err(RoutePilotError::Unknown)?;

        if let Some(shadow_model) = input.shadow_model {
            self.run_shadow(policy, &shadow_model, &messages, &task_id, &policy_hash).await;
        }

        Ok(InferOutput { receipt_id: receipt.id, route_final: route.route_final, fallback_count: route.fallback_count })
    }

    async fn reconcile_usage(&self, policy: &Policy, route: &crate::router::RouteResult, messages: &[ChatMessage]) -> (u32, u32) {
        if let (Some(p), Some(c)) = (route.usage_prompt, route.usage_completion) {
            return (p, c);
        }
        if self.usage_probe {
            if let Ok(Some((p, c))) = self.probe_usage(policy, &route.route_final, messages).await {
                return (p, c);
            }
        }
        (DEFAULT_PROMPT_ESTIMATE, DEFAULT_COMPLETION_ESTIMATE)
    }

    async fn probe_usage(&self, policy: &Policy, model: &str, messages: &[ChatMessage]) -> anyhow::Result<Option<(u32, u32)>> {
        let params = policy.effective_params(model);
        let req = crate::gateway::ChatRequest::new(model, messages.to_vec(), 1, false, &params);
        let response = self.gateway.call(&req).await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = response.json().await?;
        let prompt = body["usage"]["prompt_tokens"].as_u64().map(|n| n as u32);
        let completion = body["usage"]["completion_tokens"].as_u64().map(|n| n as u32);
        Ok(prompt.zip(completion))
    }

    /// Silent secondary invocation for comparison; failures are swallowed
    /// per §9 open question (c).
    async fn run_shadow(&self, policy: &Policy, shadow_model: &str, messages: &[ChatMessage], task_id: &str, policy_hash: &str) {
        let mut shadow_policy = policy.clone();
        shadow_policy.routing.primary = vec![shadow_model.to_string()];
        shadow_policy.routing.backups.clear();
        shadow_policy.strategy.max_attempts = 1;

        let result = self.supervisor.run(&shadow_policy, messages.to_vec(), policy.objectives.max_tokens, SilentSink).await;

        if result.is_ok() {
            let prompt_hash = {
                let mut hasher = Sha256::new();
                for m in messages {
                    hasher.update(m.content.as_bytes());
                }
                hex::encode(hasher.finalize())
            };
            let _ = self
                .recorder
                .record(RecorderInput {
                    ts: Utc::now(),
                    policy: policy.name.clone(),
                    route_primary: shadow_model.to_string(),
                    route_final: shadow_model.to_string(),
                    fallback_count: 0,
                    reasons: vec!["shadow".to_string()],
                    latency_ms: 0,
                    first_token_ms: None,
                    task_id: Some(task_id.to_string()),
                    parent_id: None,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    cost_usd: 0.0,
                    prompt_hash,
                    policy_hash: policy_hash.to_string(),
                    agent: None,
                    meta: json!({"shadow": true}),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_fallback_matches_documented_defaults() {
        assert_eq!(DEFAULT_PROMPT_ESTIMATE, 300);
        assert_eq!(DEFAULT_COMPLETION_ESTIMATE, 200);
    }
}
