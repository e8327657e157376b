//! Connection pool setup and schema migrations for the Learning Store.
//!
//! Grounded in the teacher's `db/mod.rs`: same `SqlitePragmaCustomizer`
//! shape, same WAL-then-pool-then-migrate ordering, same `init_test_db`
//! helper for tests.

use std::path::Path;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::BrokerError;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }
}

/// Open (creating if absent) the learning-store database at `path`, run
/// migrations, and return a ready connection pool.
pub fn init_db(path: impl AsRef<Path>) -> Result<DbPool, BrokerError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    tracing::info!(path = %path.display(), "initializing learning store database");

    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(8)
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        run_migrations(&conn)?;
    }

    tracing::info!("learning store database ready");
    Ok(pool)
}

/// Open a pool backed by a uniquely named temp file, used by tests. A real
/// file is still used under the hood because r2d2 pools more than one
/// connection against the same path, and `:memory:` databases are each
/// connection-private. `into_temp_path().keep()` hands us a unique path
/// without deleting it out from under the pool when the `NamedTempFile`
/// guard drops at the end of this function.
#[cfg(test)]
pub fn init_test_db() -> Result<DbPool, BrokerError> {
    let path = tempfile::Builder::new()
        .prefix("persona_broker_test_")
        .suffix(".db")
        .tempfile()?
        .into_temp_path()
        .keep()
        .map_err(|e| e.error)?;
    init_db(path)
}

fn run_migrations(conn: &rusqlite::Connection) -> Result<(), BrokerError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS lessons (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_type TEXT NOT NULL,
            category TEXT NOT NULL,
            tags TEXT,
            task_description TEXT NOT NULL,
            success INTEGER NOT NULL,
            error_message TEXT,
            error_pattern TEXT,
            root_cause TEXT,
            solution TEXT,
            lesson_summary TEXT NOT NULL,
            attempts_before_success INTEGER NOT NULL DEFAULT 1,
            time_to_resolution_ms INTEGER NOT NULL DEFAULT 0,
            relevance_score REAL NOT NULL DEFAULT 1.0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_lessons_task_type ON lessons(task_type);
        CREATE INDEX IF NOT EXISTS idx_lessons_category ON lessons(category);
        CREATE INDEX IF NOT EXISTS idx_lessons_success ON lessons(success);
        CREATE INDEX IF NOT EXISTS idx_lessons_error_pattern ON lessons(error_pattern);
        CREATE INDEX IF NOT EXISTS idx_lessons_created_at ON lessons(created_at);

        CREATE TABLE IF NOT EXISTS task_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            persona_id TEXT,
            category TEXT,
            task_type TEXT NOT NULL,
            task_shape TEXT NOT NULL,
            success INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            output TEXT,
            lesson_ids TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_task_history_task_type ON task_history(task_type);
        CREATE INDEX IF NOT EXISTS idx_task_history_success ON task_history(success);
        CREATE INDEX IF NOT EXISTS idx_task_history_created_at ON task_history(created_at);
        ",
    )?;
    ensure_columns(conn)?;
    Ok(())
}

/// Forward-only, idempotent column additions for installs upgrading from an
/// earlier schema version, mirroring the teacher's incremental-migration
/// idiom (`db/migrations.rs`'s `run_incremental`).
fn ensure_columns(conn: &rusqlite::Connection) -> Result<(), BrokerError> {
    let has_column = |table: &str, column: &str| -> Result<bool, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let found = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .any(|name| name == column);
        Ok(found)
    };

    if !has_column("lessons", "relevance_score")? {
        conn.execute_batch(
            "ALTER TABLE lessons ADD COLUMN relevance_score REAL NOT NULL DEFAULT 1.0;",
        )?;
    }
    Ok(())
}
