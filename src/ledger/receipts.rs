use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task;

use super::Ledger;

/// Immutable record of one invocation. `payload_json` is the exact
/// canonical (post-redaction) JSON string the signature was computed
/// over; it is stored alongside the typed fields so a caller can re-verify
/// `HMAC(payload_json) == signature` without re-deriving the payload from
/// the row, which could drift from field-order assumptions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub id: String,
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
    pub meta: serde_json::Value,
    pub signature: String,
    pub payload_json: String,
}

impl Ledger {
    pub async fn insert_receipt(&self, receipt: Receipt) -> Result<()> {
        let path = self.path();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute(
                "INSERT INTO receipts (id, ts, policy, route_primary, route_final, fallback_count,
                    reasons, latency_ms, first_token_ms, task_id, parent_id, prompt_tokens,
                    completion_tokens, cost_usd, prompt_hash, policy_hash, agent, meta, signature, payload_json)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
                params![
                    receipt.id,
                    receipt.ts.to_rfc3339(),
                    receipt.policy,
                    receipt.route_primary,
                    receipt.route_final,
                    receipt.fallback_count,
                    serde_json::to_string(&receipt.reasons)?,
                    receipt.latency_ms,
                    receipt.first_token_ms,
                    receipt.task_id,
                    receipt.parent_id,
                    receipt.prompt_tokens,
                    receipt.completion_tokens,
                    receipt.cost_usd,
                    receipt.prompt_hash,
                    receipt.policy_hash,
                    receipt.agent,
                    serde_json::to_string(&receipt.meta)?,
                    receipt.signature,
                    receipt.payload_json,
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn get_receipt(&self, id: &str) -> Result<Option<Receipt>> {
        let path = self.path();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            let row = conn
                .query_row(
                    "SELECT id, ts, policy, route_primary, route_final, fallback_count, reasons,
                        latency_ms, first_token_ms, task_id, parent_id, prompt_tokens,
                        completion_tokens, cost_usd, prompt_hash, policy_hash, agent, meta,
                        signature, payload_json
                     FROM receipts WHERE id = ?1",
                    params![id],
                    row_to_receipt,
                )
                .optional()?;
            Ok::<_, anyhow::Error>(row)
        })
        .await?
    }

    /// Rows for a task in ascending `ts`, per the recorder contract.
    pub async fn timeline_for_task(&self, task_id: &str) -> Result<Vec<Receipt>> {
        let path = self.path();
        let task_id = task_id.to_string();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, ts, policy, route_primary, route_final, fallback_count, reasons,
                    latency_ms, first_token_ms, task_id, parent_id, prompt_tokens,
                    completion_tokens, cost_usd, prompt_hash, policy_hash, agent, meta,
                    signature, payload_json
                 FROM receipts WHERE task_id = ?1 ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(params![task_id], row_to_receipt)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, anyhow::Error>(rows)
        })
        .await?
    }

    /// Most recent receipt for a task, used by the agent session driver to
    /// chain `parent_id` across turns of the same session.
    pub async fn last_receipt_for_task(&self, task_id: &str) -> Result<Option<Receipt>> {
        let path = self.path();
        let task_id = task_id.to_string();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            let row = conn
                .query_row(
                    "SELECT id, ts, policy, route_primary, route_final, fallback_count, reasons,
                        latency_ms, first_token_ms, task_id, parent_id, prompt_tokens,
                        completion_tokens, cost_usd, prompt_hash, policy_hash, agent, meta,
                        signature, payload_json
                     FROM receipts WHERE task_id = ?1 ORDER BY ts DESC LIMIT 1",
                    params![task_id],
                    row_to_receipt,
                )
                .optional()?;
            Ok::<_, anyhow::Error>(row)
        })
        .await?
    }

    /// Same rows as `timeline_for_task`, named separately because callers
    /// use it specifically to reconstruct the parent/child tree: receipts
    /// with `parent_id == None` belong to the synthetic `ROOT:<task_id>`
    /// group.
    pub async fn timeline_rows_raw(&self, task_id: &str) -> Result<Vec<Receipt>> {
        self.timeline_for_task(task_id).await
    }
}

fn row_to_receipt(row: &rusqlite::Row) -> rusqlite::Result<Receipt> {
    let ts: String = row.get(1)?;
    let reasons: String = row.get(6)?;
    let meta: String = row.get(17)?;
    Ok(Receipt {
        id: row.get(0)?,
        ts: DateTime::parse_from_rfc3339(&ts)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?,
        policy: row.get(2)?,
        route_primary: row.get(3)?,
        route_final: row.get(4)?,
        fallback_count: row.get(5)?,
        reasons: serde_json::from_str(&reasons)
            .context("decode reasons")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?,
        latency_ms: row.get(7)?,
        first_token_ms: row.get(8)?,
        task_id: row.get(9)?,
        parent_id: row.get(10)?,
        prompt_tokens: row.get(11)?,
        completion_tokens: row.get(12)?,
        cost_usd: row.get(13)?,
        prompt_hash: row.get(14)?,
        policy_hash: row.get(15)?,
        agent: row.get(16)?,
        meta: serde_json::from_str(&meta)
            .context("decode meta")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(17, rusqlite::types::Type::Text, Box::new(e)))?,
        signature: row.get(18)?,
        payload_json: row.get(19)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_receipt(id: &str, task_id: Option<&str>, parent_id: Option<&str>) -> Receipt {
        Receipt {
            id: id.to_string(),
            ts: Utc::now(),
            policy: "default".into(),
            route_primary: "gpt-4o-mini".into(),
            route_final: "gpt-4o-mini".into(),
            fallback_count: 0,
            reasons: vec![],
            latency_ms: 120,
            first_token_ms: Some(40),
            task_id: task_id.map(String::from),
            parent_id: parent_id.map(String::from),
            prompt_tokens: 10,
            completion_tokens: 20,
            cost_usd: 0.001,
            prompt_hash: "abc".into(),
            policy_hash: "def".into(),
            agent: None,
            meta: json!({}),
            signature: "sig".into(),
            payload_json: "{}".into(),
        }
    }

    #[tokio::test]
    async fn insert_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        let r = sample_receipt("r1", Some("t1"), None);
        ledger.insert_receipt(r.clone()).await.unwrap();
        let back = ledger.get_receipt("r1").await.unwrap().unwrap();
        assert_eq!(back, r);
    }

    #[tokio::test]
    async fn timeline_is_ascending_by_ts() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        let mut r1 = sample_receipt("r1", Some("t1"), None);
        r1.ts = Utc::now() - chrono::Duration::seconds(5);
        let r2 = sample_receipt("r2", Some("t1"), Some("r1"));
        ledger.insert_receipt(r1).await.unwrap();
        ledger.insert_receipt(r2).await.unwrap();
        let timeline = ledger.timeline_for_task("t1").await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert!(timeline[0].ts <= timeline[1].ts);
    }
}
