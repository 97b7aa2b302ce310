//! Durable store of receipts, traces, per-user quotas, sessions, and
//! messages. Every operation opens a short-lived `rusqlite::Connection`
//! inside `tokio::task::spawn_blocking`, following the same shape as the
//! source's `SqliteTaskQueue`: a connection is never held across an
//! `.await`, and schema creation is idempotent `CREATE TABLE IF NOT EXISTS`.

mod quota_rows;
mod receipts;
mod sessions;
mod traces;

pub use quota_rows::*;
pub use receipts::*;
pub use sessions::*;
pub use traces::*;

use anyhow::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tokio::task;

#[derive(Clone)]
pub struct Ledger {
    db_path: PathBuf,
}

impl Ledger {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)?;
            create_schema(&conn)?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path).map_err(Into::into)
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.db_path.clone()
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS receipts (
            id TEXT PRIMARY KEY,
            ts TEXT NOT NULL,
            policy TEXT NOT NULL,
            route_primary TEXT NOT NULL,
            route_final TEXT NOT NULL,
            fallback_count INTEGER NOT NULL,
            reasons TEXT NOT NULL,
            latency_ms INTEGER NOT NULL,
            first_token_ms INTEGER,
            task_id TEXT,
            parent_id TEXT,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            cost_usd REAL NOT NULL,
            prompt_hash TEXT NOT NULL,
            policy_hash TEXT NOT NULL,
            agent TEXT,
            meta TEXT NOT NULL,
            signature TEXT NOT NULL,
            payload_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_receipts_task ON receipts(task_id, ts);

        CREATE TABLE IF NOT EXISTS traces (
            id TEXT PRIMARY KEY,
            ts TEXT NOT NULL,
            user_ref TEXT,
            policy TEXT NOT NULL,
            route_primary TEXT NOT NULL,
            route_final TEXT NOT NULL,
            latency_ms INTEGER NOT NULL,
            tokens INTEGER NOT NULL,
            cost_usd REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_traces_route_ts ON traces(route_final, ts DESC);

        CREATE TABLE IF NOT EXISTS quotas_daily (
            user_ref TEXT NOT NULL,
            day TEXT NOT NULL,
            tokens INTEGER NOT NULL,
            PRIMARY KEY (user_ref, day)
        );
        CREATE INDEX IF NOT EXISTS idx_quotas_user_day ON quotas_daily(user_ref, day);

        CREATE TABLE IF NOT EXISTS rpm_events (
            user_ref TEXT NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rpm_user_ts ON rpm_events(user_ref, ts_ms);

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            user_ref TEXT NOT NULL,
            agent_name TEXT NOT NULL,
            policy_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            ts TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, ts);
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        Ledger::open(&path).await.unwrap();
        // Re-opening must not fail against existing tables/indices.
        Ledger::open(&path).await.unwrap();
    }
}
