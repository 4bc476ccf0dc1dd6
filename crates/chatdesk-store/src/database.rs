use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the chat database.
///
/// One connection behind a `parking_lot::Mutex` (rusqlite connections are
/// not Sync). Clones share the connection, so an in-memory database is
/// visible to every clone.
///
/// Writes for all sessions queue on this one mutex. Per-session lock
/// timeouts do not cover that wait; a slow write delays every session.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        let db = Self::initialize(conn, path.to_owned())?;
        info!(path = %path.display(), "chat database opened");
        Ok(db)
    }

    /// Fresh in-memory database, used by tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn initialize(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        let stored: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [schema::SCHEMA_VERSION],
                )?;
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(StoreError::Database(format!(
                    "database schema v{v} is newer than supported v{}",
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction. Commits on `Ok`; any error rolls
    /// everything back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(db: &Database) -> Vec<String> {
        db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .unwrap()
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn in_memory_has_chat_tables() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
        let tables = table_names(&db);
        for expected in ["accounts", "chat_messages", "chat_sessions", "schema_version"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn clones_share_the_connection() {
        let db = Database::in_memory().unwrap();
        let other = db.clone();
        other
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO accounts (id, name, email, role, created_at)
                     VALUES ('acct_1', 'Sam', 'sam@shop.test', 'agent', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&db, "accounts"), 1);
    }

    #[test]
    fn reopening_a_file_keeps_data_and_version() {
        let dir = std::env::temp_dir().join(format!("chatdesk-db-{}", uuid::Uuid::now_v7()));
        let path = dir.join("nested").join("chat.db");

        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts (id, name, email, role, created_at)
                 VALUES ('acct_1', 'Sam', 'sam@shop.test', 'agent', '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        assert_eq!(count(&reopened, "accounts"), 1);
        assert_eq!(count(&reopened, "schema_version"), 1);

        drop(reopened);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = std::env::temp_dir().join(format!("chatdesk-db-{}", uuid::Uuid::now_v7()));
        let path = dir.join("chat.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE schema_version SET version = 99", [])?;
            Ok(())
        })
        .unwrap();
        drop(db);

        assert!(matches!(Database::open(&path), Err(StoreError::Database(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        let result: Result<(), StoreError> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO accounts (id, name, email, role, created_at)
                 VALUES ('a1', 'n', 'e', 'agent', 'now')",
                [],
            )?;
            Err(StoreError::Conflict("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(count(&db, "accounts"), 0);
    }

    #[test]
    fn messages_require_an_existing_session() {
        let db = Database::in_memory().unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, session_id, sequence, kind, author, content, timestamp)
                 VALUES ('msg_1', 'chat_missing', 0, 'visitor', 'Guest', 'hi', 'now')",
                [],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }
}
