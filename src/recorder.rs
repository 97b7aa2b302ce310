//! Receipts recorder (M): builds the canonical payload, HMAC-signs it,
//! optionally redacts first, persists to the Ledger, and optionally
//! mirrors pretty JSON to a file tree.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::{Map, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::ledger::{Ledger, Receipt};

type HmacSha256 = Hmac<Sha256>;

/// Everything needed to build one receipt except its identity and
/// signature, which `Recorder::record` fills in.
pub struct RecorderInput {
    pub ts: DateTime<Utc>,
    pub policy: String,
    pub route_primary: String,
    pub route_final: String,
    pub fallback_count: u32,
    pub reasons: Vec<String>,
    pub latency_ms: u64,
    pub first_token_ms: Option<u64>,
    pub task_id: Option<String>,
    pub parent_id: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub prompt_hash: String,
    pub policy_hash: String,
    pub agent: Option<String>,
    pub meta: Value,
}

pub struct Recorder {
    ledger: Ledger,
    secret: String,
    redact: bool,
    redact_fields: Vec<String>,
    mirror_json: bool,
    mirror_dir: PathBuf,
}

impl Recorder {
    pub fn new(ledger: Ledger, cfg: &RuntimeConfig) -> Self {
        Self {
            ledger,
            secret: cfg.jwt_secret.clone(),
            redact: cfg.redact,
            redact_fields: cfg.redact_fields.clone(),
            mirror_json: cfg.mirror_json,
            mirror_dir: PathBuf::from("receipts"),
        }
    }

    pub async fn record(&self, input: RecorderInput) -> Result<Receipt> {
        let id = Uuid::new_v4().to_string();

        let mut payload = Map::new();
        payload.insert("id".into(), Value::String(id.clone()));
        payload.insert("ts".into(), Value::String(input.ts.to_rfc3339()));
        payload.insert("policy".into(), Value::String(input.policy.clone()));
        payload.insert("route_primary".into(), Value::String(input.route_primary.clone()));
        payload.insert("route_final".into(), Value::String(input.route_final.clone()));
        payload.insert("fallback_count".into(), Value::from(input.fallback_count));
        payload.insert("reasons".into(), Value::from(input.reasons.clone()));
        payload.insert("latency_ms".into(), Value::from(input.latency_ms));
        payload.insert(
            "first_token_ms".into(),
            input.first_token_ms.map(Value::from).unwrap_or(Value::Null),
        );
        payload.insert("task_id".into(), input.task_id.clone().map(Value::String).unwrap_or(Value::Null));
        payload.insert("parent_id".into(), input.parent_id.clone().map(Value::String).unwrap_or(Value::Null));
        payload.insert("prompt_tokens".into(), Value::from(input.prompt_tokens));
        payload.insert("completion_tokens".into(), Value::from(input.completion_tokens));
        payload.insert("cost_usd".into(), Value::from(input.cost_usd));
        payload.insert("prompt_hash".into(), Value::String(input.prompt_hash.clone()));
        payload.insert("policy_hash".into(), Value::String(input.policy_hash.clone()));
        if let Some(agent) = &input.agent {
            payload.insert("agent".into(), Value::String(agent.clone()));
        }
        payload.insert("meta".into(), input.meta.clone());

        let mut payload = Value::Object(payload);
        if self.redact {
            redact_payload(&mut payload, &self.redact_fields);
        }

        let payload_json = serde_json::to_string(&payload)?;
        let signature = sign(&self.secret, &payload_json);

        let receipt = Receipt {
            id,
            ts: input.ts,
            policy: input.policy,
            route_primary: input.route_primary,
            route_final: input.route_final,
            fallback_count: input.fallback_count,
            reasons: input.reasons,
            latency_ms: input.latency_ms,
            first_token_ms: input.first_token_ms,
            task_id: input.task_id,
            parent_id: input.parent_id,
            prompt_tokens: input.prompt_tokens,
            completion_tokens: input.completion_tokens,
            cost_usd: input.cost_usd,
            prompt_hash: input.prompt_hash,
            policy_hash: input.policy_hash,
            agent: input.agent,
            meta: payload.get("meta").cloned().unwrap_or(Value::Null),
            signature,
            payload_json,
        };

        self.ledger.insert_receipt(receipt.clone()).await?;

        if self.mirror_json {
            self.mirror(&receipt).await?;
        }

        Ok(receipt)
    }

    async fn mirror(&self, receipt: &Receipt) -> Result<()> {
        tokio::fs::create_dir_all(&self.mirror_dir).await?;
        let path = self.mirror_dir.join(format!("{}.json", receipt.id));
        let pretty = serde_json::to_string_pretty(&receipt)?;
        tokio::fs::write(&path, pretty).await?;
        Ok(())
    }
}

pub fn sign(secret: &str, payload_json: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload_json.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(secret: &str, payload_json: &str, signature: &str) -> bool {
    sign(secret, payload_json) == signature
}

fn email_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\d[\d\-.\s]{6,}\d").unwrap())
}

fn scrub_string(s: &str) -> String {
    let s = email_re().replace_all(s, "[redacted-email]");
    phone_re().replace_all(&s, "[redacted-phone]").into_owned()
}

/// Recursively scrubs emails/phone numbers from every string leaf, then
/// redacts configured `meta` keys. Idempotent: redacted markers contain
/// neither pattern, so a second pass is a no-op.
fn redact_payload(value: &mut Value, meta_fields: &[String]) {
    scrub_strings(value);
    if let Some(meta) = value.get_mut("meta").and_then(|m| m.as_object_mut()) {
        for field in meta_fields {
            if let Some(v) = meta.get_mut(field) {
                *v = Value::String("[redacted]".to_string());
            }
        }
    }
}

fn scrub_strings(value: &mut Value) {
    match value {
        Value::String(s) => *s = scrub_string(s),
        Value::Array(items) => items.iter_mut().for_each(scrub_strings),
        Value::Object(map) => map.values_mut().for_each(scrub_strings),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_input() -> RecorderInput {
        RecorderInput {
            ts: Utc::now(),
            policy: "default".into(),
            route_primary: "gpt-4o-mini".into(),
            route_final: "gpt-4o-mini".into(),
            fallback_count: 0,
            reasons: vec![],
            latency_ms: 120,
            first_token_ms: Some(40),
            task_id: Some("t1".into()),
            parent_id: None,
            prompt_tokens: 10,
            completion_tokens: 20,
            cost_usd: 0.001,
            prompt_hash: "abc".into(),
            policy_hash: "def".into(),
            agent: None,
            meta: json!({}),
        }
    }

    fn test_cfg() -> RuntimeConfig {
        RuntimeConfig {
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
            chaos: crate::config::ChaosConfig { primary_stall: false, http_5xx: false },
        }
    }

    #[tokio::test]
    async fn signature_matches_persisted_payload() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        let recorder = Recorder::new(ledger.clone(), &test_cfg());
        let receipt = recorder.record(sample_input()).await.unwrap();
        assert!(verify("dev-secret", &receipt.payload_json, &receipt.signature));

        let from_db = ledger.get_receipt(&receipt.id).await.unwrap().unwrap();
        assert_eq!(from_db.signature, receipt.signature);
        assert_eq!(from_db.payload_json, receipt.payload_json);
    }

    #[test]
    fn redaction_scrubs_email_and_phone_and_is_idempotent() {
        let mut payload = json!({
            "meta": {"note": "contact alice@example.com or 415-555-0100", "secret_field": "keep-this"}
        });
        redact_payload(&mut payload, &["secret_field".to_string()]);
        let note = payload["meta"]["note"].as_str().unwrap();
        assert!(note.contains("[redacted-email]"));
        assert!(note.contains("[redacted-phone]"));
        assert_eq!(payload["meta"]["secret_field"], "[redacted]");

        let mut second_pass = payload.clone();
        redact_payload(&mut second_pass, &["secret_field".to_string()]);
        assert_eq!(second_pass, payload);
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let sig = sign("dev-secret", "{\"a\":1}");
        assert!(!verify("dev-secret", "{\"a\":2}", &sig));
    }
}
