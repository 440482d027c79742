//! Durable conversation-state snapshots.
//!
//! Conversations live primarily in memory (`ConversationStore`); this module
//! persists a periodic snapshot of each so a restart can rehydrate rather
//! than silently drop everything mid-WAL. Storage failures here are logged
//! and swallowed (spec §7: persistence is best-effort, never fatal to a
//! request in flight).

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

/// One row of durable state for a tracked conversation.
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub key: String,
    pub conv_id: String,
    pub model: String,
    pub phase: String,
    pub total_input_tokens: u32,
    pub context_window: u32,
    pub wal_start_index: Option<i64>,
    pub checkpoint_content: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Open (creating if absent) the SQLite database at `db_path` and return a
/// pooled handle, applying WAL-mode pragmas and running migrations.
pub fn open_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "#,
        )
    });
    let pool = Pool::builder().max_size(4).build(manager)?;

    init_schema(&pool.get()?)?;
    Ok(pool)
}

fn init_schema(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(
                (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                0
            )",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_schema_v1(conn)?;
    }

    Ok(())
}

fn apply_schema_v1(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS conversations (
            key TEXT PRIMARY KEY,
            conv_id TEXT NOT NULL,
            model TEXT NOT NULL,
            phase TEXT NOT NULL,
            total_input_tokens INTEGER NOT NULL,
            context_window INTEGER NOT NULL,
            wal_start_index INTEGER,
            checkpoint_content TEXT,
            updated_at TEXT NOT NULL
        );

        INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', '1');
        "#,
    )?;
    Ok(())
}

/// Upsert one conversation's durable snapshot. Logs and returns on failure
/// rather than propagating — a dropped persistence write never fails the
/// request that triggered it.
pub fn save_conversation(pool: &DbPool, row: &ConversationRow) {
    let result = (|| -> anyhow::Result<()> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO conversations
                (key, conv_id, model, phase, total_input_tokens, context_window, wal_start_index, checkpoint_content, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET
                conv_id = excluded.conv_id,
                model = excluded.model,
                phase = excluded.phase,
                total_input_tokens = excluded.total_input_tokens,
                context_window = excluded.context_window,
                wal_start_index = excluded.wal_start_index,
                checkpoint_content = excluded.checkpoint_content,
                updated_at = excluded.updated_at",
            params![
                row.key,
                row.conv_id,
                row.model,
                row.phase,
                row.total_input_tokens,
                row.context_window,
                row.wal_start_index,
                row.checkpoint_content,
                row.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })();

    if let Err(e) = result {
        tracing::warn!(key = %row.key, error = %e, "failed to persist conversation snapshot");
    }
}

/// Remove a conversation's durable row (mirrors an in-memory reset/eviction).
pub fn delete_conversation(pool: &DbPool, key: &str) {
    let result = (|| -> anyhow::Result<()> {
        let conn = pool.get()?;
        conn.execute("DELETE FROM conversations WHERE key = ?1", params![key])?;
        Ok(())
    })();

    if let Err(e) = result {
        tracing::warn!(key = %key, error = %e, "failed to delete persisted conversation row");
    }
}

/// Load every persisted conversation row, e.g. for startup diagnostics.
/// Rehydration into live `ConversationState` is intentionally not attempted:
/// in-flight checkpoints and backoff timers don't survive a restart
/// meaningfully, so a fresh `ConversationStore` simply rebuilds state from
/// subsequent traffic.
pub fn load_all(pool: &DbPool) -> anyhow::Result<Vec<ConversationRow>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT key, conv_id, model, phase, total_input_tokens, context_window, wal_start_index, checkpoint_content, updated_at
         FROM conversations",
    )?;
    let rows = stmt.query_map([], |row| {
        let updated_at: String = row.get(8)?;
        Ok(ConversationRow {
            key: row.get(0)?,
            conv_id: row.get(1)?,
            model: row.get(2)?,
            phase: row.get(3)?,
            total_input_tokens: row.get(4)?,
            context_window: row.get(5)?,
            wal_start_index: row.get(6)?,
            checkpoint_content: row.get(7)?,
            updated_at: updated_at
                .parse::<chrono::DateTime<chrono::Utc>>()
                .unwrap_or_else(|_| chrono::Utc::now()),
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_row(key: &str) -> ConversationRow {
        ConversationRow {
            key: key.to_string(),
            conv_id: "conv-1".to_string(),
            model: "tiny".to_string(),
            phase: "IDLE".to_string(),
            total_input_tokens: 10,
            context_window: 100,
            wal_start_index: None,
            checkpoint_content: None,
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir.path().join("test.db")).unwrap();
        save_conversation(&pool, &sample_row("k1"));
        let rows = load_all(&pool).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "k1");
    }

    #[test]
    fn save_is_idempotent_upsert() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir.path().join("test.db")).unwrap();
        save_conversation(&pool, &sample_row("k1"));
        let mut updated = sample_row("k1");
        updated.total_input_tokens = 99;
        save_conversation(&pool, &updated);
        let rows = load_all(&pool).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_input_tokens, 99);
    }

    #[test]
    fn delete_removes_row() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir.path().join("test.db")).unwrap();
        save_conversation(&pool, &sample_row("k1"));
        delete_conversation(&pool, "k1");
        assert!(load_all(&pool).unwrap().is_empty());
    }

    #[test]
    fn schema_init_is_idempotent_across_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool1 = open_pool(&path).unwrap();
        save_conversation(&pool1, &sample_row("k1"));
        drop(pool1);
        let pool2 = open_pool(&path).unwrap();
        assert_eq!(load_all(&pool2).unwrap().len(), 1);
    }
}
