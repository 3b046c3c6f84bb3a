use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use tidemark_common::{Error, Result, Version, is_valid_identifier};
use tracing::{debug, warn};

use crate::connection::sqlite_error;

pub const DEFAULT_LEDGER_TABLE: &str = "_tidemark_migrations";

/// A row of the ledger: one applied migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub version: Version,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// The persisted record of which migrations have been applied.
///
/// Reads go through whatever connection or transaction the caller holds.
/// Writes take a `Transaction` and never open one of their own.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    table: String,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self {
            table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl LedgerStore {
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(Error::Config(format!(
                "ledger table '{table}' is not a valid SQL identifier"
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if it does not exist yet.
    pub fn ensure_ledger(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
            self.table
        ))
        .map_err(|e| sqlite_error("failed to create ledger table", e))?;
        debug!("ledger table {} ready", self.table);
        Ok(())
    }

    pub fn applied_versions(&self, conn: &Connection) -> Result<BTreeSet<Version>> {
        let mut stmt = conn
            .prepare(&format!("SELECT version FROM {} ORDER BY version", self.table))
            .map_err(|e| sqlite_error("failed to prepare ledger query", e))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, Version>(0))
            .map_err(|e| sqlite_error("failed to query applied migrations", e))?;

        rows.collect::<std::result::Result<BTreeSet<_>, _>>()
            .map_err(|e| sqlite_error("failed to read ledger row", e))
    }

    pub fn applied_records(&self, conn: &Connection) -> Result<Vec<AppliedRecord>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT version, description, applied_at FROM {} ORDER BY version",
                self.table
            ))
            .map_err(|e| sqlite_error("failed to prepare ledger query", e))?;

        let rows = stmt
            .query_map([], |row| {
                let version: Version = row.get(0)?;
                Ok(AppliedRecord {
                    version,
                    description: row.get(1)?,
                    applied_at: parse_datetime(version, &row.get::<_, String>(2)?),
                })
            })
            .map_err(|e| sqlite_error("failed to query applied migrations", e))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| sqlite_error("failed to read ledger row", e))?);
        }
        Ok(records)
    }

    pub fn is_applied(&self, conn: &Connection, version: Version) -> Result<bool> {
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE version = ?1", self.table),
                params![version],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| sqlite_error("failed to check migration status", e))?;
        Ok(found.is_some())
    }

    pub fn record_applied(
        &self,
        tx: &Transaction<'_>,
        version: Version,
        description: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<()> {
        tx.execute(
            &format!(
                "INSERT INTO {} (version, description, applied_at) VALUES (?1, ?2, ?3)",
                self.table
            ),
            params![version, description, format_datetime(applied_at)],
        )
        .map_err(|e| sqlite_error("failed to record migration", e))?;
        Ok(())
    }

    /// Delete the ledger row for `version`. A missing row means the caller's
    /// snapshot no longer matches the ledger, which is reported as an error.
    pub fn remove_applied(&self, tx: &Transaction<'_>, version: Version) -> Result<()> {
        let removed = tx
            .execute(
                &format!("DELETE FROM {} WHERE version = ?1", self.table),
                params![version],
            )
            .map_err(|e| sqlite_error("failed to remove migration record", e))?;
        if removed == 0 {
            return Err(Error::Database(format!(
                "no ledger row for migration {version}"
            )));
        }
        Ok(())
    }
}

pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Unreadable timestamps fall back to the epoch so one bad row cannot break
/// `status`; the raw text is logged.
pub(crate) fn parse_datetime(version: Version, s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Rows written by hand with datetime('now') use "YYYY-MM-DD HH:MM:SS"
    match chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        Ok(naive) => naive.and_utc(),
        Err(e) => {
            warn!("migration {version}: unreadable applied_at '{s}' ({e}), showing epoch");
            DateTime::<Utc>::UNIX_EPOCH
        }
    }
}
