use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::task;

use super::Ledger;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub user_ref: Option<String>,
    pub policy: String,
    pub route_primary: String,
    pub route_final: String,
    pub latency_ms: u64,
    pub tokens: u32,
    pub cost_usd: f64,
}

/// Result of a p95 query: the latency plus how many samples backed it, so
/// callers can apply the "sample count >= 10" pre-pick gate themselves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct P95Sample {
    pub p95_ms: u64,
    pub sample_count: usize,
}

impl Ledger {
    pub async fn insert_trace(&self, trace: Trace) -> Result<()> {
        let path = self.path();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute(
                "INSERT INTO traces (id, ts, user_ref, policy, route_primary, route_final, latency_ms, tokens, cost_usd)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    trace.id,
                    trace.ts.to_rfc3339(),
                    trace.user_ref,
                    trace.policy,
                    trace.route_primary,
                    trace.route_final,
                    trace.latency_ms,
                    trace.tokens,
                    trace.cost_usd,
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    /// `null` iff no trace for `model` exists; otherwise the 95th
    /// percentile over the most recent `min(n, available)` samples:
    /// `sorted_asc[floor(0.95 * (k - 1))]`.
    pub async fn p95_latency_for(&self, model: &str, n: usize) -> Result<Option<P95Sample>> {
        let path = self.path();
        let model = model.to_string();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT latency_ms FROM traces WHERE route_final = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            let mut latencies: Vec<i64> = stmt
                .query_map(params![model, n as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if latencies.is_empty() {
                return Ok::<_, anyhow::Error>(None);
            }
            latencies.sort_unstable();
            let k = latencies.len();
            let idx = ((0.95 * (k - 1) as f64).floor()) as usize;
            Ok(Some(P95Sample { p95_ms: latencies[idx] as u64, sample_count: k }))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(model: &str, ms: u64, ts_offset_secs: i64) -> Trace {
        Trace {
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now() - chrono::Duration::seconds(ts_offset_secs),
            user_ref: None,
            policy: "default".into(),
            route_primary: model.into(),
            route_final: model.into(),
            latency_ms: ms,
            tokens: 10,
            cost_usd: 0.0,
        }
    }

    #[tokio::test]
    async fn no_samples_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        assert!(ledger.p95_latency_for("ghost", 50).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn p95_matches_formula_on_small_sample() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        // 4 samples: 100,200,300,400 -> sorted_asc idx floor(0.95*3)=2 -> 300
        for (i, ms) in [100u64, 200, 300, 400].into_iter().enumerate() {
            ledger.insert_trace(trace("m", ms, i as i64)).await.unwrap();
        }
        let sample = ledger.p95_latency_for("m", 50).await.unwrap().unwrap();
        assert_eq!(sample.p95_ms, 300);
        assert_eq!(sample.sample_count, 4);
    }

    #[tokio::test]
    async fn sample_cap_limits_window() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        for i in 0..20 {
            ledger.insert_trace(trace("m", 100 + i, i as i64)).await.unwrap();
        }
        let sample = ledger.p95_latency_for("m", 10).await.unwrap().unwrap();
        assert_eq!(sample.sample_count, 10);
    }
}
