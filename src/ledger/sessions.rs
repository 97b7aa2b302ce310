use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::task;

use super::Ledger;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub user_ref: String,
    pub agent_name: String,
    pub policy_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(anyhow::anyhow!("unknown message role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub ts: DateTime<Utc>,
}

impl Ledger {
    pub async fn create_session(&self, session: Session) -> Result<()> {
        let path = self.path();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute(
                "INSERT INTO sessions (id, created_at, user_ref, agent_name, policy_name) VALUES (?1,?2,?3,?4,?5)",
                params![session.id, session.created_at.to_rfc3339(), session.user_ref, session.agent_name, session.policy_name],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn insert_message(&self, message: Message) -> Result<()> {
        let path = self.path();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute(
                "INSERT INTO messages (id, session_id, role, content, ts) VALUES (?1,?2,?3,?4,?5)",
                params![message.id, message.session_id, message.role.as_str(), message.content, message.ts.to_rfc3339()],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    /// Last `limit` messages for a session, in ascending (chronological)
    /// order — the shape the agent session driver builds its message list
    /// from.
    pub async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let path = self.path();
        let session_id = session_id.to_string();
        task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, ts FROM messages
                 WHERE session_id = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            let mut rows = stmt
                .query_map(params![session_id, limit as i64], |row| {
                    let ts: String = row.get(4)?;
                    let role: String = row.get(2)?;
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, role, row.get::<_, String>(3)?, ts))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.reverse();
            let messages = rows
                .into_iter()
                .map(|(id, session_id, role, content, ts)| {
                    Ok(Message {
                        id,
                        session_id,
                        role: role.parse()?,
                        content,
                        ts: DateTime::parse_from_rfc3339(&ts)?.with_timezone(&Utc),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok::<_, anyhow::Error>(messages)
        })
        .await?
    }
}
