//! Shared SQLite handle.
//!
//! The catalog, relay, secret store and capability storage all live in one
//! database file (`<data_dir>/toolsmith.db`) so that secrets and storage can
//! cascade with their capability row.  Each component holds an
//! `Arc<Database>` and borrows the connection through [`Database::with_conn`].

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS capabilities (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL UNIQUE,
    description   TEXT NOT NULL,
    version       INTEGER NOT NULL DEFAULT 1,
    status        TEXT NOT NULL CHECK(status IN ('building', 'active', 'failed', 'disabled')),
    input_schema  TEXT NOT NULL DEFAULT '{}',
    output_schema TEXT NOT NULL DEFAULT '{}',
    tags          TEXT NOT NULL DEFAULT '[]',
    path          TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_capabilities_status ON capabilities(status);

CREATE TABLE IF NOT EXISTS relay_messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,
    build_id   TEXT NOT NULL,
    direction  TEXT NOT NULL CHECK(direction IN ('to_user', 'to_builder')),
    kind       TEXT NOT NULL CHECK(kind IN ('question', 'answer', 'progress', 'complete',
                                            'error', 'secret_request', 'secret_response')),
    payload    TEXT NOT NULL DEFAULT '{}',
    consumed   INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_relay_unconsumed ON relay_messages(build_id, direction, consumed);

CREATE TABLE IF NOT EXISTS capability_secrets (
    capability_id   TEXT NOT NULL REFERENCES capabilities(id) ON DELETE CASCADE,
    key             TEXT NOT NULL,
    encrypted_value TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    UNIQUE(capability_id, key)
);

CREATE TABLE IF NOT EXISTS capability_storage (
    capability_id TEXT NOT NULL REFERENCES capabilities(id) ON DELETE CASCADE,
    key           TEXT NOT NULL,
    value         TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    UNIQUE(capability_id, key)
);
";

/// Mutex-guarded SQLite connection with the runtime schema applied.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `<data_dir>/toolsmith.db`.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        Self::open_path(&data_dir.join("toolsmith.db"))
    }

    /// Open a database at an explicit path (useful for tests).
    pub fn open_path(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// In-memory database; nothing touches disk.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        f(&mut conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_twice() {
        let dir = tempfile::tempdir().unwrap();
        Database::open(dir.path()).unwrap();
        // Re-opening must not fail on existing tables.
        let db = Database::open(dir.path()).unwrap();
        let count: i64 = db
            .with_conn(|c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                     AND name IN ('capabilities', 'relay_messages', 'capability_secrets', 'capability_storage')",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 4);
    }
}
