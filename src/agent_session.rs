//! Agent session driver (A): multi-turn chat backed by persisted history,
//! per §4.7 — one RPM gate and one receipt per turn, the assistant's reply
//! appended to the same session's message history for the next turn.

use chrono::Utc;
use sha2::{Digest, Sha256};
use serde_json::json;
use uuid::Uuid;

use crate::agent_spec::AgentSpec;
use crate::error::RoutePilotError;
use crate::gateway::ChatMessage;
use crate::ledger::{Ledger, Message, Role, Session};
use crate::policy::Policy;
use crate::quota::QuotaEnforcer;
use crate::rate::RateEstimator;
use crate::recorder::{Recorder, RecorderInput};
use crate::router::{CaptureSink, Supervisor};

/// Messages older than this fall out of the prompt window, though they
/// remain in the ledger for the transcript.
const HISTORY_WINDOW: usize = 50;

pub struct AgentSessionDriver {
    ledger: Ledger,
    quota: QuotaEnforcer,
    recorder: Recorder,
    rate: RateEstimator,
    supervisor: Supervisor,
}

pub struct TurnInput {
    pub session_id: String,
    pub user: String,
    pub content: String,
    pub attachment_block: Option<String>,
}

pub struct TurnOutput {
    pub receipt_id: String,
    pub reply: String,
    pub route_final: String,
}

impl AgentSessionDriver {
    pub fn new(ledger: Ledger, quota: QuotaEnforcer, recorder: Recorder, rate: RateEstimator, supervisor: Supervisor) -> Self {
        Self { ledger, quota, recorder, rate, supervisor }
    }

    /// Creates a new session row. Callers hold on to the returned id across
    /// turns.
    pub async fn start_session(&self, user: &str, agent: &AgentSpec, policy_name: &str) -> Result<String, RoutePilotError> {
        let id = Uuid::new_v4().to_string();
        self.ledger
            .create_session(Session {
                id: id.clone(),
                created_at: Utc::now(),
                user_ref: user.to_string(),
                agent_name: agent.name.clone(),
                policy_name: policy_name.to_string(),
            })
            .await
            .map_err(RoutePilotError::Unknown)?;
        Ok(id)
    }

    #[tracing::instrument(skip(self, policy, agent, input), fields(session = %input.session_id))]
    pub async fn turn(&self, policy: &Policy, agent: &AgentSpec, input: TurnInput) -> Result<TurnOutput, RoutePilotError> {
        self.quota
            .assert_within_rpm(&input.user, policy.tenancy.per_user_rpm)
            .await
            .map_err(RoutePilotError::Unknown)?
            .map_err(RoutePilotError::from)?;

        let history = self
            .ledger
            .recent_messages(&input.session_id, HISTORY_WINDOW)
            .await
            .map_err(RoutePilotError::Unknown)?;

        let mut messages = vec![ChatMessage { role: "system".to_string(), content: agent.system_prompt() }];
        messages.extend(history.iter().map(|m| ChatMessage { role: role_str(m.role).to_string(), content: m.content.clone() }));

        let mut user_content = input.content.clone();
        if let Some(block) = &input.attachment_block {
            user_content.push_str("\n\n");
            user_content.push_str(block);
        }
        messages.push(ChatMessage { role: "user".to_string(), content: user_content.clone() });

        let user_message_id = Uuid::new_v4().to_string();
        self.ledger
            .insert_message(Message {
                id: user_message_id,
                session_id: input.session_id.clone(),
                role: Role::User,
                content: user_content,
                ts: Utc::now(),
            })
            .await
            .map_err(RoutePilotError::Unknown)?;

        let mut sink = CaptureSink::default();
        let route = self
            .supervisor
            .run(policy, messages, policy.objectives.max_tokens, &mut sink)
            .await
            .map_err(RoutePilotError::from)?;
        let reply = sink.0;

        let assistant_message_id = Uuid::new_v4().to_string();
        self.ledger
            .insert_message(Message {
                id: assistant_message_id,
                session_id: input.session_id.clone(),
                role: Role::Assistant,
                content: reply.clone(),
                ts: Utc::now(),
            })
            .await
            .map_err(RoutePilotError::Unknown)?;

        let (prompt_tokens, completion_tokens) = match (route.usage_prompt, route.usage_completion) {
            (Some(p), Some(c)) => (p, c),
            _ => (crate::inference::DEFAULT_PROMPT_ESTIMATE, crate::inference::DEFAULT_COMPLETION_ESTIMATE),
        };
        let cost_usd = self.rate.estimate_cost(&route.route_final, prompt_tokens, completion_tokens);

        self.quota
            .add_daily_tokens(&input.user, (prompt_tokens + completion_tokens) as u64, policy.tenancy.per_user_daily_tokens, &policy.tenancy.timezone)
            .await
            .map_err(RoutePilotError::Unknown)?
            .map_err(RoutePilotError::from)?;

        let parent_id = self
            .ledger
            .last_receipt_for_task(&input.session_id)
            .await
            .map_err(RoutePilotError::Unknown)?
            .map(|r| r.id);

        let prompt_hash = {
            let mut hasher = Sha256::new();
            hasher.update(input.content.as_bytes());
            hex::encode(hasher.finalize())
        };

        let receipt = self
            .recorder
            .record(RecorderInput {
                ts: Utc::now(),
                policy: policy.name.clone(),
                route_primary: policy.routing.primary[0].clone(),
                route_final: route.route_final.clone(),
                fallback_count: route.fallback_count,
                reasons: route.reasons.clone(),
                latency_ms: route.latency_ms,
                first_token_ms: route.first_token_ms,
                task_id: Some(input.session_id.clone()),
                parent_id,
                prompt_tokens,
                completion_tokens,
                cost_usd,
                prompt_hash,
                policy_hash: policy.hash(),
                agent: Some(agent.name.clone()),
                meta: json!({}),
            })
            .await
            .map_err(RoutePilotError::Unknown)?;

        self.ledger
            .insert_trace(crate::ledger::Trace {
                id: Uuid::new_v4().to_string(),
                ts: Utc::now(),
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

        Ok(TurnOutput { receipt_id: receipt.id, reply, route_final: route.route_final })
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_window_matches_documented_cap() {
        assert_eq!(HISTORY_WINDOW, 50);
    }

    #[test]
    fn role_str_round_trips_through_from_str() {
        for role in [Role::System, Role::User, Role::Assistant] {
            let s = role_str(role);
            let parsed: Role = s.parse().unwrap();
            assert_eq!(parsed, role);
        }
    }
}
