use std::fmt;

use rusqlite::Transaction;
use tidemark_common::{Result, Version};

use crate::connection::sqlite_error;

/// A versioned pair of forward and backward schema actions.
///
/// Both actions receive the transaction the manager opened for this step and
/// must do all of their work through it; the ledger row is written in the same
/// transaction, so the schema change and the bookkeeping commit together.
pub trait Migration: Send + Sync {
    fn version(&self) -> Version;

    fn description(&self) -> &str;

    fn up(&self, tx: &Transaction<'_>) -> Result<()>;

    fn down(&self, tx: &Transaction<'_>) -> Result<()>;
}

/// A migration made of two static SQL batches.
#[derive(Debug, Clone, Copy)]
pub struct SqlMigration {
    pub version: Version,
    pub description: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

impl SqlMigration {
    pub const fn new(
        version: Version,
        description: &'static str,
        up_sql: &'static str,
        down_sql: &'static str,
    ) -> Self {
        Self {
            version,
            description,
            up_sql,
            down_sql,
        }
    }
}

impl Migration for SqlMigration {
    fn version(&self) -> Version {
        self.version
    }

    fn description(&self) -> &str {
        self.description
    }

    fn up(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(self.up_sql)
            .map_err(|e| sqlite_error("up script failed", e))
    }

    fn down(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(self.down_sql)
            .map_err(|e| sqlite_error("down script failed", e))
    }
}

type Action = Box<dyn Fn(&Transaction<'_>) -> Result<()> + Send + Sync>;

/// A migration backed by closures, for actions that need more than a script.
pub struct FnMigration {
    version: Version,
    description: String,
    up: Action,
    down: Action,
}

impl FnMigration {
    pub fn new<U, D>(version: Version, description: impl Into<String>, up: U, down: D) -> Self
    where
        U: Fn(&Transaction<'_>) -> Result<()> + Send + Sync + 'static,
        D: Fn(&Transaction<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            version,
            description: description.into(),
            up: Box::new(up),
            down: Box::new(down),
        }
    }
}

impl fmt::Debug for FnMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMigration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl Migration for FnMigration {
    fn version(&self) -> Version {
        self.version
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn up(&self, tx: &Transaction<'_>) -> Result<()> {
        (self.up)(tx)
    }

    fn down(&self, tx: &Transaction<'_>) -> Result<()> {
        (self.down)(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;
    use tidemark_common::Error;

    fn table_exists(conn: &rusqlite::Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn sql_migration_runs_inside_transaction() {
        let mut conn = open_in_memory().unwrap();
        let m = SqlMigration::new(
            1,
            "create widgets",
            "CREATE TABLE widgets (id INTEGER PRIMARY KEY);",
            "DROP TABLE widgets;",
        );

        let tx = conn.transaction().unwrap();
        m.up(&tx).unwrap();
        tx.rollback().unwrap();
        assert!(!table_exists(&conn, "widgets"));

        let tx = conn.transaction().unwrap();
        m.up(&tx).unwrap();
        tx.commit().unwrap();
        assert!(table_exists(&conn, "widgets"));
    }

    #[test]
    fn sql_migration_reports_script_errors() {
        let mut conn = open_in_memory().unwrap();
        let m = SqlMigration::new(1, "broken", "CREATE TABLE (;", "");
        let tx = conn.transaction().unwrap();
        let err = m.up(&tx).unwrap_err();
        assert!(matches!(err, Error::Database(ref msg) if msg.contains("up script failed")));
    }

    #[test]
    fn fn_migration_invokes_closures() {
        let mut conn = open_in_memory().unwrap();
        let m = FnMigration::new(
            5,
            "seed",
            |tx| {
                tx.execute_batch("CREATE TABLE seeds (n INTEGER);")
                    .map_err(|e| Error::Database(e.to_string()))
            },
            |_| Err(Error::Database("irreversible".into())),
        );
        assert_eq!(m.version(), 5);
        assert_eq!(m.description(), "seed");

        let tx = conn.transaction().unwrap();
        m.up(&tx).unwrap();
        assert!(m.down(&tx).is_err());
        tx.commit().unwrap();
        assert!(table_exists(&conn, "seeds"));
    }
}
