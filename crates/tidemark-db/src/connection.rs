use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use tidemark_common::{Error, Result};
use tracing::info;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the SQLite database the migrations run against.
pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    info!("opening database at {}", db_path.display());
    let conn = Connection::open(db_path)
        .map_err(|e| Error::Connection(format!("failed to open database: {e}")))?;
    configure(&conn, busy_timeout)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .map_err(|e| Error::Connection(format!("failed to open in-memory database: {e}")))?;
    configure(&conn, DEFAULT_BUSY_TIMEOUT)?;
    Ok(conn)
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .map_err(|e| sqlite_error("failed to set pragmas", e))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| sqlite_error("failed to set busy timeout", e))?;
    Ok(())
}

/// Map a rusqlite error onto the engine's taxonomy. Contention and open
/// failures are transport problems; everything else is a storage error.
pub(crate) fn sqlite_error(context: &str, e: rusqlite::Error) -> Error {
    let transient = matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen)
    );
    if transient {
        Error::Connection(format!("{context}: {e}"))
    } else {
        Error::Database(format!("{context}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_enables_foreign_keys() {
        let conn = open_in_memory().unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn busy_errors_are_connection_errors() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(sqlite_error("begin", busy), Error::Connection(_)));

        let conn = open_in_memory().unwrap();
        let syntax = conn.execute_batch("CREAT TABLE x (id INTEGER)").unwrap_err();
        assert!(matches!(sqlite_error("ddl", syntax), Error::Database(_)));
    }

    #[test]
    fn open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let _conn = open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert!(path.exists());
    }
}
