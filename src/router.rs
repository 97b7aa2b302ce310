//! Router / Supervisor (RT): builds the route ladder, invokes the
//! gateway, supervises the stream, classifies failures, retries with
//! backoff, and returns a result record.
//!
//! Grounded on the source's `Supervisor`: a struct holding the shared
//! clients, driving attempts in a loop, and using `tokio::select!` for
//! cancellation instead of a hand-rolled poll loop.

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_stream::StreamExt;

use crate::config::ChaosConfig;
use crate::error::{AttemptError, RouterError};
use crate::gateway::{ChatMessage, ChatRequest, GatewayClient};
use crate::ledger::Ledger;
use crate::policy::Policy;
use crate::stream::{decode_stream, usage_from_headers, SseEvent};

#[derive(Debug, Clone)]
pub struct RouteResult {
    pub route_final: String,
    pub fallback_count: u32,
    pub latency_ms: u64,
    pub first_token_ms: Option<u64>,
    pub reasons: Vec<String>,
    pub usage_prompt: Option<u32>,
    pub usage_completion: Option<u32>,
}

pub struct Supervisor {
    gateway: GatewayClient,
    ledger: Ledger,
    chaos: ChaosConfig,
}

/// Content sink; the sub-agent controller passes a `String`-capturing
/// variant (buffered), the inference driver a stdout-forwarding one, and
/// shadow runs a no-op (silent) variant.
pub trait Sink: Send {
    fn push(&mut self, delta: &str);
}

impl<F: FnMut(&str) + Send> Sink for F {
    fn push(&mut self, delta: &str) {
        self(delta)
    }
}

pub struct SilentSink;
impl Sink for SilentSink {
    fn push(&mut self, _delta: &str) {}
}

#[derive(Default)]
pub struct CaptureSink(pub String);
impl Sink for CaptureSink {
    fn push(&mut self, delta: &str) {
        self.0.push_str(delta);
    }
}

impl Supervisor {
    pub fn new(gateway: GatewayClient, ledger: Ledger, chaos: ChaosConfig) -> Self {
        Self { gateway, ledger, chaos }
    }

    /// Builds `[primary..., backups...]`, pre-picking a backup ahead of
    /// the primary when its observed p95 beats target and the sample is
    /// large enough to trust (§4.1 step 2).
    async fn build_ladder(&self, policy: &Policy) -> anyhow::Result<Vec<String>> {
        let primary = &policy.routing.primary;
        let backups = &policy.routing.backups;

        let primary_sample = self.ledger.p95_latency_for(&primary[0], policy.routing.p95_window_n).await?;

        let should_prepick = primary_sample
            .map(|s| s.sample_count >= 10 && s.p95_ms > policy.objectives.p95_latency_ms)
            .unwrap_or(false);

        if !should_prepick {
            let mut ladder = primary.clone();
            ladder.extend(backups.clone());
            return Ok(ladder);
        }

        let mut best: Option<(usize, &String, u64)> = None;
        for (idx, backup) in backups.iter().enumerate() {
            if let Some(sample) = self.ledger.p95_latency_for(backup, policy.routing.p95_window_n).await? {
                let better = match &best {
                    None => true,
                    Some((_, _, best_p95)) => sample.p95_ms < *best_p95,
                };
                if better {
                    best = Some((idx, backup, sample.p95_ms));
                }
            }
        }

        match best {
            Some((idx, winner, _)) => {
                let mut ladder = vec![winner.clone()];
                ladder.extend(primary.clone());
                ladder.extend(backups.iter().enumerate().filter(|(i, _)| *i != idx).map(|(_, m)| m.clone()));
                Ok(ladder)
            }
            None => {
                let mut ladder = primary.clone();
                ladder.extend(backups.clone());
                Ok(ladder)
            }
        }
    }

    /// Runs the ladder, streaming content to `sink`.
    pub async fn run(
        &self,
        policy: &Policy,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        mut sink: impl Sink,
    ) -> Result<RouteResult, RouterError> {
        let ladder = self.build_ladder(policy).await.unwrap_or_else(|_| {
            let mut l = policy.routing.primary.clone();
            l.extend(policy.routing.backups.clone());
            l
        });

        let strategy = &policy.strategy;
        let start = Instant::now();
        let mut fallback_count: u32 = 0;
        let mut reasons = Vec::new();
        let mut attempts = Vec::new();

        for model in ladder.into_iter().take(strategy.max_attempts) {
            let params = policy.effective_params(&model);
            let is_primary = model == policy.routing.primary[0];

            let attempt_start = Instant::now();
            let outcome = self
                .run_one_attempt(&model, &messages, max_tokens, &params, strategy.fallback_on_latency_ms, strategy.first_chunk_gate_ms, is_primary, &mut sink)
                .await;

            match outcome {
                Ok((first_token_ms, usage_prompt, usage_completion)) => {
                    return Ok(RouteResult {
                        route_final: model,
                        fallback_count,
                        latency_ms: start.elapsed().as_millis() as u64,
                        first_token_ms,
                        reasons,
                        usage_prompt,
                        usage_completion,
                    });
                }
                Err((reason, message, status)) => {
                    attempts.push(AttemptError { model: model.clone(), message, status });
                    reasons.push(reason);
                    fallback_count += 1;
                    let _ = attempt_start;

                    if fallback_count >= strategy.escalate_after_fallbacks {
                        tracing::warn!(fallback_count, "route escalation threshold reached");
                    }

                    let idx = (fallback_count as usize).saturating_sub(1).min(strategy.backoff_ms.len().saturating_sub(1));
                    if let Some(backoff) = strategy.backoff_ms.get(idx) {
                        sleep(Duration::from_millis(*backoff)).await;
                    }
                }
            }
        }

        Err(RouterError { attempts })
    }

    /// Returns `Ok((first_token_ms, usage_prompt, usage_completion))` on
    /// success or `Err((reason, message, status))` for classification.
    #[allow(clippy::too_many_arguments)]
    async fn run_one_attempt(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        params: &crate::policy::GenParams,
        stall_ms: u64,
        gate_ms: u64,
        is_primary: bool,
        sink: &mut impl Sink,
    ) -> Result<(Option<u64>, Option<u32>, Option<u32>), (String, String, Option<u16>)> {
        if is_primary && self.chaos.primary_stall {
            sleep(Duration::from_millis(stall_ms + 50)).await;
            return Err(("stall".to_string(), "chaos: synthetic stall".to_string(), None));
        }
        if is_primary && self.chaos.http_5xx {
            return Err(("5xx".to_string(), "chaos: synthetic 503".to_string(), Some(503)));
        }

        let req = ChatRequest::new(model, messages.to_vec(), max_tokens, true, params);
        let response = match self.gateway.call(&req).await {
            Ok(r) => r,
            Err(e) => return Err(("error".to_string(), e.to_string(), None)),
        };

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let short_body: String = body.chars().take(300).collect();
            let reason = classify_http_status(code);
            return Err((reason, short_body, Some(code)));
        }

        let (usage_prompt, usage_completion) = usage_from_headers(response.headers());
        let attempt_start = Instant::now();
        let mut events = decode_stream(response);

        let mut first_token_ms: Option<u64> = None;
        let mut gate_opened_at: Option<Instant> = None;
        let mut buffered = String::new();

        loop {
            let stall_deadline = sleep(Duration::from_millis(stall_ms));
            tokio::select! {
                _ = stall_deadline, if first_token_ms.is_none() => {
                    return Err(("stall".to_string(), "no content delta before stall cutoff".to_string(), None));
                }
                next = events.next() => {
                    match next {
                        Some(Ok(SseEvent::Delta(text))) => {
                            if first_token_ms.is_none() {
                                first_token_ms = Some(attempt_start.elapsed().as_millis() as u64);
                                gate_opened_at = Some(Instant::now());
                            }
                            buffered.push_str(&text);
                            if gate_opened_at.map(|t| t.elapsed().as_millis() as u64 >= gate_ms).unwrap_or(false) {
                                sink.push(&buffered);
                                buffered.clear();
                            }
                        }
                        Some(Ok(SseEvent::Done)) => {
                            if !buffered.is_empty() {
                                sink.push(&buffered);
                            }
                            return Ok((first_token_ms, usage_prompt, usage_completion));
                        }
                        Some(Err(e)) => {
                            return Err(("error".to_string(), e.to_string(), None));
                        }
                        None => {
                            if !buffered.is_empty() {
                                sink.push(&buffered);
                            }
                            return Ok((first_token_ms, usage_prompt, usage_completion));
                        }
                    }
                }
            }
        }
    }
}

fn classify_http_status(code: u16) -> String {
    match code {
        429 => "rate_limit".to_string(),
        500..=599 => "5xx".to_string(),
        other => format!("http_{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_known_statuses() {
        assert_eq!(classify_http_status(429), "rate_limit");
        assert_eq!(classify_http_status(503), "5xx");
        assert_eq!(classify_http_status(404), "http_404");
    }

    #[test]
    fn capture_sink_accumulates_deltas() {
        let mut sink = CaptureSink::default();
        sink.push("Hi ");
        sink.push("there");
        assert_eq!(sink.0, "Hi there");
    }

    fn sample_policy() -> crate::policy::Policy {
        crate::policy::Policy {
            name: "default".into(),
            objectives: crate::policy::Objectives { p95_latency_ms: 500, max_cost_usd: 1.0, max_tokens: 4096 },
            routing: crate::policy::Routing {
                primary: vec!["gpt-4o-mini".into()],
                backups: vec!["gpt-4o".into()],
                p95_window_n: 50,
                params: Default::default(),
            },
            strategy: crate::policy::Strategy {
                fallback_on_latency_ms: 1500,
                max_attempts: 3,
                backoff_ms: vec![100, 250, 500],
                first_chunk_gate_ms: 0,
                escalate_after_fallbacks: 2,
            },
            tenancy: crate::policy::Tenancy { per_user_daily_tokens: 100_000, per_user_rpm: 30, timezone: "UTC".into() },
            gen: Default::default(),
        }
    }

    fn slow_trace(model: &str, ms: u64, offset_secs: i64) -> crate::ledger::Trace {
        crate::ledger::Trace {
            id: uuid::Uuid::new_v4().to_string(),
            ts: chrono::Utc::now() - chrono::Duration::seconds(offset_secs),
            user_ref: None,
            policy: "default".into(),
            route_primary: model.into(),
            route_final: model.into(),
            latency_ms: ms,
            tokens: 10,
            cost_usd: 0.0,
        }
    }

    async fn supervisor_over(ledger: Ledger) -> Supervisor {
        let cfg = crate::config::RuntimeConfig {
            gateway_base_url: "https://gw.example.com".into(),
            gateway_api_key: "k".into(),
            jwt_secret: "dev-secret".into(),
            mirror_json: false,
            snapshot_input: false,
            redact: false,
            redact_fields: vec![],
            usage_probe: false,
            early_stop: false,
            dry_run: false,
            http_fetch: crate::config::HttpFetchConfig { allowlist: vec![], url_template: None, max: 3 },
            chaos: ChaosConfig { primary_stall: false, http_5xx: false },
        };
        Supervisor::new(crate::gateway::GatewayClient::new(&cfg), ledger, cfg.chaos.clone())
    }

    #[tokio::test]
    async fn nine_samples_is_below_the_prepick_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        for i in 0..9 {
            ledger.insert_trace(slow_trace("gpt-4o-mini", 900, i)).await.unwrap();
            ledger.insert_trace(slow_trace("gpt-4o", 50, i)).await.unwrap();
        }
        let supervisor = supervisor_over(ledger).await;
        let ladder = supervisor.build_ladder(&sample_policy()).await.unwrap();
        assert_eq!(ladder, vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()]);
    }

    #[tokio::test]
    async fn ten_samples_crosses_the_prepick_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        for i in 0..10 {
            ledger.insert_trace(slow_trace("gpt-4o-mini", 900, i)).await.unwrap();
            ledger.insert_trace(slow_trace("gpt-4o", 50, i)).await.unwrap();
        }
        let supervisor = supervisor_over(ledger).await;
        let ladder = supervisor.build_ladder(&sample_policy()).await.unwrap();
        assert_eq!(ladder[0], "gpt-4o");
    }
}
