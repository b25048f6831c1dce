pub mod files;
pub mod models;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use models::{Conversation, Message};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("invalid role: {0}")]
    InvalidRole(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    conn: Mutex<Connection>,
}

/// Current time in the stored timestamp format (RFC 3339, millisecond precision, UTC).
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir).ok();
        }
        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        debug!(path = %db_path.display(), "database opened");
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                user_id TEXT,
                entity_memory TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                media_type TEXT NOT NULL,
                size INTEGER,
                content BLOB,
                created_at TEXT NOT NULL
            );

            -- file_id carries no foreign key: orphans and null references are
            -- repaired by the consistency manager.
            CREATE TABLE IF NOT EXISTS document_chunks (
                id TEXT PRIMARY KEY,
                file_id TEXT,
                text_chunk TEXT NOT NULL,
                metadata_column TEXT NOT NULL,
                page INTEGER,
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_file ON document_chunks (file_id);
            ",
        )?;
        Ok(())
    }

    // ── Conversations ──

    pub fn create_conversation(
        &self,
        id: Option<&str>,
        title: &str,
        user_id: Option<&str>,
    ) -> Result<Conversation> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(self.ensure_conversation(&id, title, user_id)?.0)
    }

    /// Inserts the conversation unless a row with `id` exists, then returns the
    /// stored row and whether this call created it.
    pub fn ensure_conversation(
        &self,
        id: &str,
        title: &str,
        user_id: Option<&str>,
    ) -> Result<(Conversation, bool)> {
        let conn = self.lock()?;
        let now = now_timestamp();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO conversations (id, title, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, title, user_id, now],
        )?;
        let conv = conn.query_row(
            "SELECT id, title, user_id, entity_memory, created_at, updated_at FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )?;
        Ok((conv, inserted == 1))
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock()?;
        let conv = conn
            .query_row(
                "SELECT id, title, user_id, entity_memory, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                row_to_conversation,
            )
            .optional()?;
        Ok(conv)
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, user_id, entity_memory, created_at, updated_at FROM conversations ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_conversation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Removes every conversation and message. Returns the number of conversations deleted.
    pub fn delete_all_conversations(&self) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages", [])?;
        let deleted = tx.execute("DELETE FROM conversations", [])?;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn update_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now_timestamp(), id],
        )?;
        Ok(())
    }

    pub fn set_entity_memory(&self, id: &str, memory: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations SET entity_memory = ?1 WHERE id = ?2",
            params![memory, id],
        )?;
        Ok(())
    }

    // ── Messages ──

    /// Appends a message. A timestamp not later than the conversation's last
    /// message is moved to one millisecond after it, so stored order is never
    /// rewritten. Re-adding an existing id returns the stored message unchanged.
    pub fn add_message(
        &self,
        conversation_id: &str,
        id: Option<&str>,
        role: &str,
        content: &str,
        at: Option<&str>,
    ) -> Result<Message> {
        if role != "user" && role != "assistant" {
            return Err(DbError::InvalidRole(role.to_string()));
        }
        let conn = self.lock()?;
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let last: Option<String> = conn
            .query_row(
                "SELECT created_at FROM messages WHERE conversation_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        let mut created = at.and_then(parse_timestamp).unwrap_or_else(Utc::now);
        if let Some(last) = last.as_deref().and_then(parse_timestamp) {
            if created <= last {
                created = last + Duration::milliseconds(1);
            }
        }
        let created_at = format_timestamp(created);

        let inserted = conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO NOTHING",
            params![id, conversation_id, role, content, created_at],
        )?;
        if inserted == 0 {
            debug!(message_id = %id, "message already stored");
            return Ok(conn.query_row(
                "SELECT id, conversation_id, role, content, created_at FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )?);
        }
        // Touch conversation updated_at
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![created_at, conversation_id],
        )?;
        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at,
        })
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        user_id: row.get(2)?,
        entity_memory: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
