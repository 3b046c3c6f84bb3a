use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tidemark_common::{Error, Result, is_valid_identifier};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::sqlite_error;
use crate::ledger::format_datetime;

pub const DEFAULT_LOCK_TABLE: &str = "_tidemark_lock";
pub const DEFAULT_LOCK_RESOURCE: &str = "migrations";

/// Serializes migration runs across processes sharing one database.
///
/// SQLite has no advisory locks, so the lock is a row in a dedicated table,
/// keyed by resource name and stamped with an owner and a lease expiry. An
/// expired row is reclaimed by the next acquirer, which covers processes that
/// died while holding the lock.
///
/// Every `acquire` mints a fresh owner id that lives only in the returned
/// guard, so two acquisitions never share a row, even through a clone.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    table: String,
    resource: String,
    timeout: Duration,
    retry_interval: Duration,
    lease: Duration,
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self {
            table: DEFAULT_LOCK_TABLE.to_string(),
            resource: DEFAULT_LOCK_RESOURCE.to_string(),
            timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(250),
            lease: Duration::from_secs(600),
        }
    }
}

impl LockCoordinator {
    pub fn new(table: impl Into<String>, resource: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let resource = resource.into();
        if !is_valid_identifier(&table) {
            return Err(Error::Config(format!(
                "lock table '{table}' is not a valid SQL identifier"
            )));
        }
        if resource.is_empty() {
            return Err(Error::Config("lock resource cannot be empty".into()));
        }
        Ok(Self {
            table,
            resource,
            ..Self::default()
        })
    }

    /// How long `acquire` keeps retrying before giving up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn ensure_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                resource TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );",
            self.table
        ))
        .map_err(|e| sqlite_error("failed to create lock table", e))?;
        Ok(())
    }

    /// Take the lock, retrying until the configured timeout elapses.
    /// Fails with `LockContention` naming the current holder.
    pub fn acquire<'c>(&self, conn: &'c Connection) -> Result<LockGuard<'c>> {
        let started = Instant::now();
        let owner = new_owner_id();
        loop {
            let holder = match self.try_acquire(conn, &owner) {
                Ok(None) => {
                    debug!("acquired lock '{}' as {owner}", self.resource);
                    return Ok(LockGuard {
                        conn,
                        table: self.table.clone(),
                        resource: self.resource.clone(),
                        owner,
                        lease: self.lease,
                        released: false,
                    });
                }
                Ok(Some(holder)) => holder,
                // Another writer is mid-transaction; treat it like a held lock.
                Err(Error::Connection(reason)) => format!("unknown ({reason})"),
                Err(e) => return Err(e),
            };

            if started.elapsed() + self.retry_interval > self.timeout {
                info!("lock '{}' is held by {holder}, giving up", self.resource);
                return Err(Error::LockContention {
                    resource: self.resource.clone(),
                    holder,
                });
            }
            debug!("lock '{}' is held by {holder}, retrying", self.resource);
            std::thread::sleep(self.retry_interval);
        }
    }

    /// One attempt. `Ok(None)` means we hold the lock, `Ok(Some(owner))`
    /// names whoever does.
    fn try_acquire(&self, conn: &Connection, owner: &str) -> Result<Option<String>> {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|e| sqlite_error("failed to begin lock transaction", e))?;

        let now = Utc::now();
        let expires = lease_expiry(now, self.lease);

        let reclaimed = tx
            .execute(
                &format!(
                    "DELETE FROM {} WHERE resource = ?1 AND expires_at <= ?2",
                    self.table
                ),
                params![self.resource, format_datetime(now)],
            )
            .map_err(|e| sqlite_error("failed to clear expired lock", e))?;
        if reclaimed > 0 {
            warn!("reclaimed expired lock '{}'", self.resource);
        }

        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (resource, owner, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                self.table
            ),
            params![
                self.resource,
                owner,
                format_datetime(now),
                format_datetime(expires)
            ],
        )
        .map_err(|e| sqlite_error("failed to insert lock row", e))?;

        let holder: String = tx
            .query_row(
                &format!("SELECT owner FROM {} WHERE resource = ?1", self.table),
                params![self.resource],
                |row| row.get(0),
            )
            .map_err(|e| sqlite_error("failed to read lock owner", e))?;

        tx.commit()
            .map_err(|e| sqlite_error("failed to commit lock transaction", e))?;

        if holder == owner {
            Ok(None)
        } else {
            Ok(Some(holder))
        }
    }

    /// Current holder of the lock, ignoring expiry.
    pub fn holder(&self, conn: &Connection) -> Result<Option<String>> {
        conn.query_row(
            &format!("SELECT owner FROM {} WHERE resource = ?1", self.table),
            params![self.resource],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| sqlite_error("failed to read lock owner", e))
    }
}

/// Held lock. Released by `release()`, or on drop as a fallback so that every
/// exit path gives the lock back.
#[derive(Debug)]
pub struct LockGuard<'c> {
    conn: &'c Connection,
    table: String,
    resource: String,
    owner: String,
    lease: Duration,
    released: bool,
}

impl LockGuard<'_> {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Push the lease expiry forward. Fails with `LockContention` if the row
    /// no longer belongs to us, e.g. because the lease lapsed and someone
    /// else took it.
    pub fn renew(&self) -> Result<()> {
        let expires = lease_expiry(Utc::now(), self.lease);
        let updated = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET expires_at = ?1 WHERE resource = ?2 AND owner = ?3",
                    self.table
                ),
                params![format_datetime(expires), self.resource, self.owner],
            )
            .map_err(|e| sqlite_error("failed to renew lock", e))?;
        if updated == 0 {
            return Err(Error::LockContention {
                resource: self.resource.clone(),
                holder: "another process (lease lost)".into(),
            });
        }
        Ok(())
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.delete_row()
    }

    fn delete_row(&self) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE resource = ?1 AND owner = ?2",
                    self.table
                ),
                params![self.resource, self.owner],
            )
            .map_err(|e| sqlite_error("failed to release lock", e))?;
        debug!("released lock '{}'", self.resource);
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.delete_row() {
            warn!("failed to release lock '{}' on drop: {e}", self.resource);
        }
    }
}

// Leases are capped so expiry stays a four-digit-year timestamp and keeps
// sorting correctly as text.
const MAX_LEASE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease.min(MAX_LEASE)).unwrap_or_default();
    now + lease
}

fn new_owner_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "local".to_string());
    format!("{host}:{}:{}", std::process::id(), Uuid::new_v4())
}
