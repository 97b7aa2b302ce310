//! Quota enforcer: sliding-window RPM gate and per-day token accounting
//! in a named IANA timezone.
//!
//! The ledger's own transaction already serializes the prune+count+insert
//! and read+check+upsert sequences at the SQLite layer; this module adds
//! an in-process per-user mutex in front of it — the same "wrap the
//! critical section in a mutex" shape the source uses for its hardware
//! lock — as defense in depth against two tasks racing the same user
//! inside one process.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;

use crate::error::QuotaError;
use crate::ledger::Ledger;

#[derive(Debug, Clone, PartialEq)]
pub struct UsageSummary {
    pub day: String,
    pub tokens_today: u64,
    pub tokens_month: u64,
    pub resets_at: chrono::DateTime<Utc>,
}

pub struct QuotaEnforcer {
    ledger: Ledger,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl QuotaEnforcer {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger, user_locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, user: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks.entry(user.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn assert_within_rpm(&self, user: &str, limit: u32) -> Result<std::result::Result<(), QuotaError>> {
        let lock = self.lock_for(user).await;
        let _guard = lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        self.ledger.assert_within_rpm(user, limit, now_ms).await
    }

    pub async fn add_daily_tokens(&self, user: &str, tokens: u64, cap: u64, tz: &str) -> Result<std::result::Result<(), QuotaError>> {
        let lock = self.lock_for(user).await;
        let _guard = lock.lock().await;
        let day = today_in_tz(tz)?;
        self.ledger.add_daily_tokens(user, tokens, cap, &day).await
    }

    pub async fn usage_summary(&self, user: &str, tz: &str) -> Result<UsageSummary> {
        let day = today_in_tz(tz)?;
        let tokens_today = self.ledger.daily_tokens(user, &day).await?;
        let year_month = &day[..7];
        let tokens_month = self.ledger.month_tokens(user, year_month).await?;
        let resets_at = next_midnight_in_tz(tz)?;
        Ok(UsageSummary { day, tokens_today, tokens_month, resets_at })
    }
}

fn parse_tz(tz: &str) -> Result<Tz> {
    tz.parse::<Tz>().map_err(|_| anyhow::anyhow!("invalid IANA timezone '{tz}'"))
}

/// `day` as `YYYY-MM-DD` in `tz`, recomputed on every call so resets occur
/// at local midnight.
fn today_in_tz(tz: &str) -> Result<String> {
    let zone = parse_tz(tz)?;
    let now = Utc::now().with_timezone(&zone);
    Ok(now.format("%Y-%m-%d").to_string())
}

fn next_midnight_in_tz(tz: &str) -> Result<chrono::DateTime<Utc>> {
    let zone = parse_tz(tz)?;
    let now = Utc::now().with_timezone(&zone);
    let tomorrow = now.date_naive().succ_opt().ok_or_else(|| anyhow::anyhow!("date overflow"))?;
    let midnight = tomorrow.and_hms_opt(0, 0, 0).ok_or_else(|| anyhow::anyhow!("invalid time"))?;
    let local_midnight = zone
        .from_local_datetime(&midnight)
        .single()
        .ok_or_else(|| anyhow::anyhow!("ambiguous local midnight in '{tz}'"))?;
    Ok(local_midnight.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rpm_gate_blocks_after_limit() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        let q = QuotaEnforcer::new(ledger);
        for _ in 0..2 {
            assert!(q.assert_within_rpm("u1", 2).await.unwrap().is_ok());
        }
        assert!(q.assert_within_rpm("u1", 2).await.unwrap().is_err());
    }

    #[tokio::test]
    async fn daily_tokens_respect_cap() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        let q = QuotaEnforcer::new(ledger);
        assert!(q.add_daily_tokens("u1", 400, 500, "UTC").await.unwrap().is_ok());
        assert!(q.add_daily_tokens("u1", 200, 500, "UTC").await.unwrap().is_err());
    }

    #[tokio::test]
    async fn usage_summary_reports_today_and_month() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        let q = QuotaEnforcer::new(ledger);
        q.add_daily_tokens("u1", 150, 10_000, "UTC").await.unwrap().unwrap();
        let summary = q.usage_summary("u1", "UTC").await.unwrap();
        assert_eq!(summary.tokens_today, 150);
        assert_eq!(summary.tokens_month, 150);
        assert!(summary.resets_at > Utc::now());
    }

    #[tokio::test]
    async fn concurrent_callers_cannot_both_pass_at_limit_minus_one() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("l.db")).await.unwrap();
        let q = Arc::new(QuotaEnforcer::new(ledger));
        let limit = 5;
        // Pre-fill to limit-1 so the next two racing callers contend for
        // the single remaining slot.
        for _ in 0..limit - 1 {
            q.assert_within_rpm("u1", limit).await.unwrap().unwrap();
        }
        let q1 = q.clone();
        let q2 = q.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { q1.assert_within_rpm("u1", limit).await.unwrap() }),
            tokio::spawn(async move { q2.assert_within_rpm("u1", limit).await.unwrap() }),
        );
        let passed = [r1.unwrap(), r2.unwrap()].into_iter().filter(|r| r.is_ok()).count();
        assert_eq!(passed, 1);
    }
}
