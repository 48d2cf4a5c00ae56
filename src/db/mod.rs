//! Registered chats and resumable agent sessions.
//!
//! Chat metadata and the folder→session map survive host restarts; both
//! live in the same SQLite file as the task store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// A chat the host will route and spawn agents for.
#[derive(Debug, Clone)]
pub struct RegisteredChat {
    pub jid: String,
    pub display_name: String,
    /// Filesystem directory name; the agent's working directory and the
    /// scoping key for tasks and sessions.
    pub folder: String,
    pub trigger_pattern: Option<String>,
    pub requires_trigger: bool,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChatStore {
    db_path: PathBuf,
}

impl ChatStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        // Fail early on an unopenable or corrupt store.
        store.with_connection(|_| Ok(()))?;
        Ok(store)
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir: {}", parent.display()))?;
        }
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chats (
                jid             TEXT PRIMARY KEY,
                display_name    TEXT NOT NULL,
                folder          TEXT NOT NULL UNIQUE,
                trigger_pattern TEXT,
                requires_trigger INTEGER NOT NULL DEFAULT 0,
                added_at        TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                folder     TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .context("Failed to initialize chat schema")?;
        f(&conn)
    }

    /// Insert or update a chat. The folder of an existing chat is never
    /// changed by an upsert; it anchors sessions and tasks.
    pub fn upsert_chat(&self, chat: &RegisteredChat) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO chats (jid, display_name, folder, trigger_pattern, requires_trigger, added_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(jid) DO UPDATE SET
                     display_name = excluded.display_name,
                     trigger_pattern = excluded.trigger_pattern,
                     requires_trigger = excluded.requires_trigger",
                params![
                    chat.jid,
                    chat.display_name,
                    chat.folder,
                    chat.trigger_pattern,
                    chat.requires_trigger,
                    chat.added_at.to_rfc3339(),
                ],
            )
            .context("Failed to upsert chat")?;
            Ok(())
        })
    }

    pub fn get_by_jid(&self, jid: &str) -> Result<Option<RegisteredChat>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT jid, display_name, folder, trigger_pattern, requires_trigger, added_at
                 FROM chats WHERE jid = ?1",
                params![jid],
                row_to_chat,
            )
            .optional()
            .context("Failed to query chat by jid")
        })
    }

    pub fn get_by_folder(&self, folder: &str) -> Result<Option<RegisteredChat>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT jid, display_name, folder, trigger_pattern, requires_trigger, added_at
                 FROM chats WHERE folder = ?1",
                params![folder],
                row_to_chat,
            )
            .optional()
            .context("Failed to query chat by folder")
        })
    }

    pub fn list_chats(&self) -> Result<Vec<RegisteredChat>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT jid, display_name, folder, trigger_pattern, requires_trigger, added_at
                 FROM chats ORDER BY added_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_chat)?;
            let mut chats = Vec::new();
            for row in rows {
                chats.push(row?);
            }
            Ok(chats)
        })
    }

    /// Record the folder's resumable session id.
    pub fn set_session(&self, folder: &str, session_id: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (folder, session_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(folder) DO UPDATE SET
                     session_id = excluded.session_id,
                     updated_at = excluded.updated_at",
                params![folder, session_id, Utc::now().to_rfc3339()],
            )
            .context("Failed to persist session")?;
            Ok(())
        })
    }

    pub fn get_session(&self, folder: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT session_id FROM sessions WHERE folder = ?1",
                params![folder],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query session")
        })
    }

    /// Drop a folder's session, forcing the next run to start fresh.
    pub fn clear_session(&self, folder: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM sessions WHERE folder = ?1", params![folder])
                .context("Failed to clear session")?;
            Ok(())
        })
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredChat> {
    let added_raw: String = row.get(5)?;
    let added_at = DateTime::parse_from_rfc3339(&added_raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(RegisteredChat {
        jid: row.get(0)?,
        display_name: row.get(1)?,
        folder: row.get(2)?,
        trigger_pattern: row.get(3)?,
        requires_trigger: row.get(4)?,
        added_at,
    })
}
