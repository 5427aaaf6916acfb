//! Durable connection attachments.
//!
//! The role-tagged metadata of each connection is written to a side store
//! keyed by connection id at handshake and refreshed when the socket drops.
//! It outlives the socket until the sweeper purges it. A peer that
//! reconnects with `resume.connectionId` gets its previous id back when the
//! stored role and logical id match, and a node that resumes without
//! announcing tools gets its stored tool list back.

use std::{collections::HashMap, sync::Mutex};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    sqlx::SqlitePool,
};

use switchyard_protocol::{Mode, ToolDefinition};

use crate::connections::ConnectionRole;

/// Snapshot of a connection's role metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAttachment {
    pub conn_id: String,
    pub mode: Mode,
    pub logical_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Epoch millis of the handshake, or of the disconnect once the socket
    /// is gone.
    pub seen_at: i64,
}

impl ConnectionAttachment {
    pub fn new(conn_id: &str, role: &ConnectionRole, seen_at: i64) -> Self {
        let (channel, account_id, tools) = match role {
            ConnectionRole::Client { .. } => (None, None, Vec::new()),
            ConnectionRole::Node { tools, .. } => (None, None, tools.clone()),
            ConnectionRole::Channel {
                channel,
                account_id,
                ..
            } => (Some(channel.clone()), Some(account_id.clone()), Vec::new()),
        };
        Self {
            conn_id: conn_id.to_string(),
            mode: role.mode(),
            logical_id: role.logical_id().to_string(),
            channel,
            account_id,
            tools,
            seen_at,
        }
    }

    /// Rebuild the role this attachment was taken from.
    pub fn role(&self) -> ConnectionRole {
        match self.mode {
            Mode::Client => ConnectionRole::Client {
                id: self.logical_id.clone(),
            },
            Mode::Node => ConnectionRole::Node {
                id: self.logical_id.clone(),
                tools: self.tools.clone(),
            },
            Mode::Channel => ConnectionRole::Channel {
                key: self.logical_id.clone(),
                channel: self.channel.clone().unwrap_or_default(),
                account_id: self.account_id.clone().unwrap_or_default(),
            },
        }
    }

    /// Carry stored metadata into a resumed connection's role. A node that
    /// announced no tools in its handshake gets the stored list.
    pub fn restore(&self, role: ConnectionRole, announced_tools: bool) -> ConnectionRole {
        match (role, self.role()) {
            (ConnectionRole::Node { id, .. }, ConnectionRole::Node { tools, .. })
                if !announced_tools =>
            {
                ConnectionRole::Node { id, tools }
            },
            (role, _) => role,
        }
    }

    /// Whether a new handshake may take over this attachment's connection id.
    pub fn matches(&self, role: &ConnectionRole) -> bool {
        self.mode == role.mode() && self.logical_id == role.logical_id()
    }
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn save(&self, attachment: &ConnectionAttachment) -> Result<()>;
    async fn load(&self, conn_id: &str) -> Result<Option<ConnectionAttachment>>;
    async fn delete(&self, conn_id: &str) -> Result<()>;
    /// Remove attachments last seen before `cutoff_ms`; returns how many.
    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64>;
}

// ── SQLite ───────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    payload: String,
}

/// SQLite-backed attachment store.
pub struct SqliteAttachmentStore {
    pool: SqlitePool,
}

impl SqliteAttachmentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the attachments table.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS connection_attachments (
                conn_id    TEXT    PRIMARY KEY,
                mode       TEXT    NOT NULL,
                logical_id TEXT    NOT NULL,
                payload    TEXT    NOT NULL,
                seen_at    INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for SqliteAttachmentStore {
    async fn save(&self, attachment: &ConnectionAttachment) -> Result<()> {
        let payload = serde_json::to_string(attachment)?;
        sqlx::query(
            r#"INSERT INTO connection_attachments (conn_id, mode, logical_id, payload, seen_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(conn_id) DO UPDATE SET
                 mode = excluded.mode,
                 logical_id = excluded.logical_id,
                 payload = excluded.payload,
                 seen_at = excluded.seen_at"#,
        )
        .bind(&attachment.conn_id)
        .bind(attachment.mode.as_str())
        .bind(&attachment.logical_id)
        .bind(&payload)
        .bind(attachment.seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, conn_id: &str) -> Result<Option<ConnectionAttachment>> {
        let row = sqlx::query_as::<_, AttachmentRow>(
            "SELECT payload FROM connection_attachments WHERE conn_id = ?",
        )
        .bind(conn_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| serde_json::from_str(&r.payload).map_err(Into::into))
            .transpose()
    }

    async fn delete(&self, conn_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM connection_attachments WHERE conn_id = ?")
            .bind(conn_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM connection_attachments WHERE seen_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAttachmentStore {
    entries: Mutex<HashMap<String, ConnectionAttachment>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn save(&self, attachment: &ConnectionAttachment) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(attachment.conn_id.clone(), attachment.clone());
        Ok(())
    }

    async fn load(&self, conn_id: &str) -> Result<Option<ConnectionAttachment>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conn_id)
            .cloned())
    }

    async fn delete(&self, conn_id: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn_id);
        Ok(())
    }

    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, a| a.seen_at >= cutoff_ms);
        Ok((before - entries.len()) as u64)
    }
}
