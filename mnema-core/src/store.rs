//! SQLite persistence for messages and memories.
//!
//! Two tables, typed columns:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS messages (
//!     id         INTEGER PRIMARY KEY AUTOINCREMENT,
//!     story_id   TEXT NOT NULL,
//!     user_id    TEXT NOT NULL,
//!     role       TEXT NOT NULL,
//!     content    TEXT NOT NULL,
//!     extracted  INTEGER NOT NULL DEFAULT 0,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS memories (
//!     id           TEXT PRIMARY KEY,
//!     user_id      TEXT NOT NULL,
//!     content      TEXT NOT NULL,
//!     prev_content TEXT,
//!     category     TEXT NOT NULL,
//!     importance   REAL NOT NULL,
//!     confidence   REAL NOT NULL,
//!     embedding    BLOB NOT NULL,
//!     action       TEXT NOT NULL,
//!     created_at   TEXT NOT NULL,
//!     updated_at   TEXT NOT NULL
//! );
//! ```
//!
//! Embeddings are stored as little-endian `f32` BLOBs. Message ids are
//! monotonic rowids, so creation order equals id order. WAL mode keeps
//! reads cheap while a consolidation run writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, ToSql, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{MnemaError, Result};
use crate::types::{
    Embedding, Memory, MemoryAction, MemoryCategory, MemoryId, Message, MessageId, Role, StoryId,
    UserId,
};

// ---------------------------------------------------------------------------
// Embedding BLOB codec
// ---------------------------------------------------------------------------

/// Encode an embedding as a little-endian f32 byte blob.
fn embedding_to_blob(embedding: &Embedding) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.0.len() * 4);
    for value in &embedding.0 {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 byte blob back into an embedding.
fn blob_to_embedding(blob: &[u8]) -> Embedding {
    let mut values = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Embedding(values)
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let story: String = row.get(1)?;
    let user: String = row.get(2)?;
    let role: String = row.get(3)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        story_id: StoryId(parse_uuid(1, &story)?),
        user_id: UserId(parse_uuid(2, &user)?),
        role: Role::from_str_lossy(&role),
        content: row.get(4)?,
        extracted: row.get::<_, i64>(5)? != 0,
        created_at: parse_ts(6, &created)?,
        updated_at: parse_ts(7, &updated)?,
    })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let id: String = row.get(0)?;
    let user: String = row.get(1)?;
    let category: String = row.get(4)?;
    let blob: Vec<u8> = row.get(7)?;
    let action: String = row.get(8)?;
    let created: String = row.get(9)?;
    let updated: String = row.get(10)?;
    Ok(Memory {
        id: MemoryId(parse_uuid(0, &id)?),
        user_id: UserId(parse_uuid(1, &user)?),
        content: row.get(2)?,
        prev_content: row.get(3)?,
        category: MemoryCategory::from_wire(&category),
        importance: row.get(5)?,
        confidence: row.get(6)?,
        embedding: blob_to_embedding(&blob),
        action: MemoryAction::from_wire(&action).unwrap_or(MemoryAction::Add),
        created_at: parse_ts(9, &created)?,
        updated_at: parse_ts(10, &updated)?,
    })
}

const MEMORY_COLUMNS: &str = "id, user_id, content, prev_content, category, importance, \
                              confidence, embedding, action, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, story_id, user_id, role, content, extracted, \
                               created_at, updated_at";

// ---------------------------------------------------------------------------
// Write payloads
// ---------------------------------------------------------------------------

/// Payload for inserting a new memory row.
#[derive(Debug, Clone)]
pub struct NewMemory {
    /// Owning user.
    pub user_id: UserId,
    /// Memory text.
    pub content: String,
    /// Category bucket.
    pub category: MemoryCategory,
    /// Importance (0–1).
    pub importance: f32,
    /// Confidence (0–1).
    pub confidence: f32,
    /// Embedding of `content`.
    pub embedding: Embedding,
    /// Provenance of this write.
    pub action: MemoryAction,
}

/// Full-content patch applied by an UPDATE decision (or direct CRUD).
///
/// The patch carries a fresh embedding of the new content — a memory's
/// embedding is always regenerated when its content changes, so there is
/// deliberately no way to patch content without one.
#[derive(Debug, Clone)]
pub struct MemoryPatch {
    /// New memory text.
    pub content: String,
    /// Category bucket.
    pub category: MemoryCategory,
    /// Importance (0–1).
    pub importance: f32,
    /// Confidence (0–1).
    pub confidence: f32,
    /// Embedding of the new content.
    pub embedding: Embedding,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the SQLite database holding the message log and memory store.
///
/// The connection sits behind a mutex; clones of the surrounding `Arc`
/// can be handed to blocking tasks for concurrent similarity searches.
pub struct Store {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Arc<Self>> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))?;

        Self::init_schema(&conn)?;

        info!(
            path = %db_path.display(),
            wal = config.wal_mode,
            "mnema store opened"
        );

        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            db_path,
        }))
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }))
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                story_id   TEXT NOT NULL,
                user_id    TEXT NOT NULL,
                role       TEXT NOT NULL,
                content    TEXT NOT NULL,
                extracted  INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_unextracted
                ON messages(user_id, extracted);
            CREATE TABLE IF NOT EXISTS memories (
                id           TEXT PRIMARY KEY,
                user_id      TEXT NOT NULL,
                content      TEXT NOT NULL,
                prev_content TEXT,
                category     TEXT NOT NULL,
                importance   REAL NOT NULL,
                confidence   REAL NOT NULL,
                embedding    BLOB NOT NULL,
                action       TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_user
                ON memories(user_id);",
        )?;
        Ok(())
    }

    /// Path to the database file (or `:memory:`).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run an integrity check on the database.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] if the check query itself fails.
    pub fn integrity_check(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    // ------------------------------------------------------------------
    // Message log
    // ------------------------------------------------------------------

    /// Append a conversational turn to the log.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn append_message(
        &self,
        story_id: StoryId,
        user_id: UserId,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Message> {
        let content = content.into();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (story_id, user_id, role, content, extracted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![
                story_id.0.to_string(),
                user_id.0.to_string(),
                role.as_str(),
                content,
                now_str
            ],
        )?;
        let id = conn.last_insert_rowid();

        debug!(message = id, user = %user_id, role = %role, "Appended message");

        Ok(Message {
            id,
            story_id,
            user_id,
            role,
            content,
            extracted: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// All messages for a user with `extracted = false`, in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn unextracted_for_user(&self, user_id: UserId) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE user_id = ?1 AND extracted = 0
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.0.to_string()], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(MnemaError::from)
    }

    /// All messages for a user in creation order, extracted or not.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn messages_for_user(&self, user_id: UserId) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE user_id = ?1
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.0.to_string()], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(MnemaError::from)
    }

    /// Flip `extracted = true` on the given messages in a single batched
    /// UPDATE. Returns the number of rows actually flipped (already
    /// extracted rows are left alone, so the false→true transition happens
    /// at most once per message).
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn mark_extracted(&self, ids: &[MessageId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE messages SET extracted = 1, updated_at = ?
             WHERE extracted = 0 AND id IN ({placeholders})"
        );

        let mut bind: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 1);
        bind.push(&now);
        for id in ids {
            bind.push(id);
        }

        let conn = self.conn.lock();
        let changed = conn.execute(&sql, bind.as_slice())?;

        debug!(requested = ids.len(), flipped = changed, "Marked messages extracted");
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Memory store
    // ------------------------------------------------------------------

    /// Insert one memory row.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn insert_memory(&self, new: NewMemory) -> Result<Memory> {
        let conn = self.conn.lock();
        Self::insert_memory_locked(&conn, new)
    }

    /// Insert several memory rows in one transaction, returning them in
    /// input order.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures; nothing is
    /// written if any row fails.
    pub fn insert_memories(&self, rows: Vec<NewMemory>) -> Result<Vec<Memory>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = Vec::with_capacity(rows.len());
        for new in rows {
            inserted.push(Self::insert_memory_locked(&tx, new)?);
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn insert_memory_locked(conn: &Connection, new: NewMemory) -> Result<Memory> {
        let id = MemoryId::new();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        conn.execute(
            "INSERT INTO memories
                (id, user_id, content, prev_content, category, importance,
                 confidence, embedding, action, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id.0.to_string(),
                new.user_id.0.to_string(),
                new.content,
                new.category.as_str(),
                new.importance,
                new.confidence,
                embedding_to_blob(&new.embedding),
                new.action.as_str(),
                now_str
            ],
        )?;

        debug!(memory = %id, user = %new.user_id, category = %new.category, "Inserted memory");

        Ok(Memory {
            id,
            user_id: new.user_id,
            content: new.content,
            prev_content: None,
            category: new.category,
            importance: new.importance,
            confidence: new.confidence,
            embedding: new.embedding,
            action: new.action,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a full-content patch to a memory, snapshotting the current
    /// content into `prev_content` and stamping `action = UPDATE`.
    ///
    /// Returns `None` if no memory with that id exists for the user.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn update_memory(
        &self,
        user_id: UserId,
        memory_id: MemoryId,
        patch: MemoryPatch,
    ) -> Result<Option<Memory>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();

        let changed = conn.execute(
            "UPDATE memories SET
                prev_content = content,
                content = ?1,
                category = ?2,
                importance = ?3,
                confidence = ?4,
                embedding = ?5,
                action = ?6,
                updated_at = ?7
             WHERE id = ?8 AND user_id = ?9",
            params![
                patch.content,
                patch.category.as_str(),
                patch.importance,
                patch.confidence,
                embedding_to_blob(&patch.embedding),
                MemoryAction::Update.as_str(),
                now,
                memory_id.0.to_string(),
                user_id.0.to_string()
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }

        debug!(memory = %memory_id, user = %user_id, "Updated memory");
        Self::get_memory_locked(&conn, user_id, memory_id)
    }

    /// Fetch one memory by id, scoped to a user.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn get_memory(&self, user_id: UserId, memory_id: MemoryId) -> Result<Option<Memory>> {
        let conn = self.conn.lock();
        Self::get_memory_locked(&conn, user_id, memory_id)
    }

    fn get_memory_locked(
        conn: &Connection,
        user_id: UserId,
        memory_id: MemoryId,
    ) -> Result<Option<Memory>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1 AND user_id = ?2"
        ))?;
        match stmt.query_row(
            params![memory_id.0.to_string(), user_id.0.to_string()],
            row_to_memory,
        ) {
            Ok(memory) => Ok(Some(memory)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All memories for a user in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn list_memories(&self, user_id: UserId) -> Result<Vec<Memory>> {
        self.memories_matching(Some(user_id), None)
    }

    /// Memories filtered by optional user and category, in creation order.
    /// This is the scan feeding similarity search.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn memories_matching(
        &self,
        user_id: Option<UserId>,
        category: Option<MemoryCategory>,
    ) -> Result<Vec<Memory>> {
        let conn = self.conn.lock();
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE 1 = 1");
        let mut bind: Vec<String> = Vec::new();
        if let Some(user) = user_id {
            bind.push(user.0.to_string());
            sql.push_str(&format!(" AND user_id = ?{}", bind.len()));
        }
        if let Some(cat) = category {
            bind.push(cat.as_str().to_string());
            sql.push_str(&format!(" AND category = ?{}", bind.len()));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bind.iter()), row_to_memory)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(MnemaError::from)
    }

    /// Delete a memory. Returns `true` if a row was actually deleted.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn delete_memory(&self, user_id: UserId, memory_id: MemoryId) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM memories WHERE id = ?1 AND user_id = ?2",
            params![memory_id.0.to_string(), user_id.0.to_string()],
        )?;
        Ok(deleted > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
