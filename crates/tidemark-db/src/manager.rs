use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tidemark_common::{Direction, Error, Result, Version};
use tracing::{debug, info, warn};

use crate::catalog::{SchemaExpectation, object_exists, table_columns};
use crate::connection::sqlite_error;
use crate::ledger::LedgerStore;
use crate::lock::{LockCoordinator, LockGuard};
use crate::migration::Migration;
use crate::registry::MigrationRegistry;

/// Cooperative cancellation for `up`/`down`. Checked only between migration
/// steps; a step that has begun its transaction always commits or rolls back.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-migration line of `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub version: Version,
    pub description: String,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
}

/// What a call to `up()` committed, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpReport {
    pub applied: Vec<Version>,
}

impl UpReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// A table, index or column an applied migration should have created but
/// which is not in the schema. Columns are named `table.column`; a primary
/// key on the wrong column is reported with kind `"primary key"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingObject {
    pub version: Version,
    pub kind: &'static str,
    pub name: String,
}

/// Applies and reverts registered migrations against one database, keeping
/// the ledger in step with the schema.
pub struct MigrationManager {
    conn: Mutex<Connection>,
    registry: MigrationRegistry,
    ledger: LedgerStore,
    lock: LockCoordinator,
    cancel: CancelFlag,
}

impl MigrationManager {
    /// Wrap `conn`, creating the ledger and lock tables if they are absent.
    pub fn new(conn: Connection, ledger: LedgerStore, lock: LockCoordinator) -> Result<Self> {
        ledger.ensure_ledger(&conn)?;
        lock.ensure_table(&conn)?;
        info!("migration ledger initialized ({})", ledger.table());
        Ok(Self {
            conn: Mutex::new(conn),
            registry: MigrationRegistry::new(),
            ledger,
            lock,
            cancel: CancelFlag::default(),
        })
    }

    pub fn with_defaults(conn: Connection) -> Result<Self> {
        Self::new(conn, LedgerStore::default(), LockCoordinator::default())
    }

    pub fn add_migration<M: Migration + 'static>(&mut self, migration: M) -> Result<()> {
        self.registry.add(migration)
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn lock(&self) -> &LockCoordinator {
        &self.lock
    }

    /// A handle that stops `up`/`down` at the next step boundary.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Idempotently create the ledger table.
    pub fn ensure_ledger(&self) -> Result<()> {
        let conn = self.connection()?;
        self.ledger.ensure_ledger(&conn)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("migration connection lock poisoned".into()))
    }

    /// Apply every pending migration in ascending version order, stopping at
    /// the first failure.
    pub fn up(&self) -> Result<UpReport> {
        let conn = self.connection()?;
        let guard = self.lock.acquire(&conn)?;
        let outcome = self.apply_pending(&conn, &guard);
        let released = guard.release();
        let report = outcome?;
        released?;
        Ok(report)
    }

    fn apply_pending(&self, conn: &Connection, guard: &LockGuard<'_>) -> Result<UpReport> {
        let applied = self.ledger.applied_versions(conn)?;
        for version in applied.iter().filter(|v| !self.registry.contains(**v)) {
            warn!("ledger records migration {version} which is not registered");
        }

        let mut report = UpReport::default();
        for migration in self.registry.all() {
            let version = migration.version();
            if applied.contains(&version) {
                debug!(
                    "migration {version} ({}) already applied, skipping",
                    migration.description()
                );
                continue;
            }
            if self.cancel.is_cancelled() {
                info!("cancelled before migration {version}");
                return Err(Error::Cancelled { next: version });
            }
            guard.renew()?;

            info!("applying migration {version}: {}", migration.description());
            self.run_step(conn, migration, Direction::Up)?;
            info!("applied migration {version}: {}", migration.description());
            report.applied.push(version);
        }

        if report.is_noop() {
            info!("no pending migrations");
        }
        Ok(report)
    }

    /// Revert the most recently applied migration. Returns the version
    /// reverted, or `None` when nothing is applied.
    pub fn down(&self) -> Result<Option<Version>> {
        let conn = self.connection()?;
        let guard = self.lock.acquire(&conn)?;
        let outcome = self.revert_latest(&conn, &guard);
        let released = guard.release();
        let reverted = outcome?;
        released?;
        Ok(reverted)
    }

    fn revert_latest(&self, conn: &Connection, guard: &LockGuard<'_>) -> Result<Option<Version>> {
        let applied = self.ledger.applied_versions(conn)?;
        let Some(&version) = applied.last() else {
            info!("no migrations to roll back");
            return Ok(None);
        };

        let migration = self.registry.get(version).ok_or(Error::Drift(version))?;
        self.check_drift(&applied)?;

        if self.cancel.is_cancelled() {
            info!("cancelled before rolling back migration {version}");
            return Err(Error::Cancelled { next: version });
        }
        guard.renew()?;

        info!("rolling back migration {version}: {}", migration.description());
        self.run_step(conn, migration, Direction::Down)?;
        info!("rolled back migration {version}: {}", migration.description());
        Ok(Some(version))
    }

    /// One migration step in its own transaction: the action and the ledger
    /// write commit together or not at all.
    fn run_step(
        &self,
        conn: &Connection,
        migration: &dyn Migration,
        direction: Direction,
    ) -> Result<()> {
        let version = migration.version();
        let failed = |reason: String| Error::SchemaApply {
            version,
            direction,
            reason,
        };

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|e| sqlite_error("failed to begin migration transaction", e))?;

        let result = match direction {
            Direction::Up => migration.up(&tx).and_then(|()| {
                self.ledger
                    .record_applied(&tx, version, migration.description(), Utc::now())
            }),
            Direction::Down => migration
                .down(&tx)
                .and_then(|()| self.ledger.remove_applied(&tx, version)),
        };

        if let Err(e) = result {
            warn!("migration {version} failed to {direction}, rolling back: {e}");
            if let Err(rollback) = tx.rollback() {
                warn!("rollback of migration {version} failed: {rollback}");
            }
            return Err(failed(e.to_string()));
        }

        tx.commit()
            .map_err(|e| failed(format!("commit failed: {e}")))
    }

    /// Every registered migration, ascending, with whether it is applied.
    /// Read-only; takes no coordination lock.
    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let conn = self.connection()?;
        let records = {
            // One read transaction so the ledger is seen as a single snapshot.
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| sqlite_error("failed to begin read transaction", e))?;
            let records = self.ledger.applied_records(&tx)?;
            tx.commit()
                .map_err(|e| sqlite_error("failed to end read transaction", e))?;
            records
        };

        let applied: BTreeMap<Version, DateTime<Utc>> = records
            .into_iter()
            .map(|r| (r.version, r.applied_at))
            .collect();
        let versions: BTreeSet<Version> = applied.keys().copied().collect();
        self.check_drift(&versions)?;

        Ok(self
            .registry
            .all()
            .map(|m| {
                let applied_at = applied.get(&m.version()).copied();
                MigrationStatus {
                    version: m.version(),
                    description: m.description().to_string(),
                    applied: applied_at.is_some(),
                    applied_at,
                }
            })
            .collect())
    }

    /// Registered migrations not yet applied, ascending.
    pub fn pending(&self) -> Result<Vec<MigrationStatus>> {
        Ok(self.status()?.into_iter().filter(|s| !s.applied).collect())
    }

    /// Check that each applied migration left its expected tables, indexes and
    /// columns behind. Expectations for unapplied versions are skipped.
    pub fn verify(&self, expectations: &[SchemaExpectation]) -> Result<Vec<MissingObject>> {
        let conn = self.connection()?;
        let applied = self.ledger.applied_versions(&conn)?;

        let mut missing = Vec::new();
        for expectation in expectations.iter().filter(|e| applied.contains(&e.version)) {
            let objects = expectation
                .tables
                .iter()
                .map(|name| ("table", *name))
                .chain(expectation.indexes.iter().map(|name| ("index", *name)));
            for (kind, name) in objects {
                if !object_exists(&conn, kind, name)? {
                    missing.push(MissingObject {
                        version: expectation.version,
                        kind,
                        name: name.to_string(),
                    });
                }
            }

            for shape in expectation.columns {
                let actual = table_columns(&conn, shape.table)?;
                // A missing table is already reported above.
                if actual.is_empty() {
                    continue;
                }
                for column in shape.columns {
                    if !actual.iter().any(|(name, _)| name == column) {
                        missing.push(MissingObject {
                            version: expectation.version,
                            kind: "column",
                            name: format!("{}.{column}", shape.table),
                        });
                    }
                }
                let pk_ok = actual
                    .iter()
                    .any(|(name, pk)| *pk && name == shape.primary_key);
                if !pk_ok {
                    missing.push(MissingObject {
                        version: expectation.version,
                        kind: "primary key",
                        name: format!("{}.{}", shape.table, shape.primary_key),
                    });
                }
            }
        }
        Ok(missing)
    }

    fn check_drift(&self, applied: &BTreeSet<Version>) -> Result<()> {
        match applied.iter().find(|v| !self.registry.contains(**v)) {
            Some(&version) => Err(Error::Drift(version)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::catalog::{BUILTIN_EXPECTATIONS, builtin};
    use crate::connection::open_in_memory;
    use crate::migration::{FnMigration, SqlMigration};

    fn manager() -> MigrationManager {
        MigrationManager::with_defaults(open_in_memory().unwrap()).unwrap()
    }

    fn create_table(version: Version, table: &'static str) -> FnMigration {
        FnMigration::new(
            version,
            format!("create {table}"),
            move |tx| {
                tx.execute_batch(&format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY);"))
                    .map_err(|e| Error::Database(e.to_string()))
            },
            move |tx| {
                tx.execute_batch(&format!("DROP TABLE {table};"))
                    .map_err(|e| Error::Database(e.to_string()))
            },
        )
    }

    fn table_exists(manager: &MigrationManager, name: &str) -> bool {
        let conn = manager.connection().unwrap();
        object_exists(&conn, "table", name).unwrap()
    }

    fn applied(manager: &MigrationManager) -> Vec<Version> {
        let conn = manager.connection().unwrap();
        manager
            .ledger
            .applied_versions(&conn)
            .unwrap()
            .into_iter()
            .collect()
    }

    fn insert_ledger_row(manager: &MigrationManager, version: Version) {
        let conn = manager.connection().unwrap();
        conn.execute(
            "INSERT INTO _tidemark_migrations (version, description, applied_at)
             VALUES (?1, 'ghost', '2024-01-01T00:00:00.000Z')",
            [version],
        )
        .unwrap();
    }

    #[test]
    fn up_down_scenario() {
        let mut manager = manager();
        manager.add_migration(create_table(1, "alpha")).unwrap();
        manager.add_migration(create_table(2, "beta")).unwrap();

        let report = manager.up().unwrap();
        assert_eq!(report.applied, vec![1, 2]);
        assert_eq!(applied(&manager), vec![1, 2]);
        let status = manager.status().unwrap();
        assert!(status.iter().all(|s| s.applied && s.applied_at.is_some()));

        assert_eq!(manager.down().unwrap(), Some(2));
        assert_eq!(applied(&manager), vec![1]);
        assert!(!table_exists(&manager, "beta"));
        assert!(table_exists(&manager, "alpha"));

        assert_eq!(manager.down().unwrap(), Some(1));
        assert!(applied(&manager).is_empty());
        assert!(!table_exists(&manager, "alpha"));

        assert_eq!(manager.down().unwrap(), None);
    }

    #[test]
    fn second_up_is_a_noop() {
        let mut manager = manager();
        manager.add_migration(create_table(1, "alpha")).unwrap();

        assert_eq!(manager.up().unwrap().applied, vec![1]);
        let again = manager.up().unwrap();
        assert!(again.is_noop());
        assert_eq!(applied(&manager), vec![1]);
    }

    #[test]
    fn applies_in_version_order_regardless_of_registration() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = manager();
        for version in [3, 1, 2] {
            let order = Arc::clone(&order);
            manager
                .add_migration(FnMigration::new(
                    version,
                    format!("step {version}"),
                    move |_| {
                        order.lock().unwrap().push(version);
                        Ok(())
                    },
                    |_| Ok(()),
                ))
                .unwrap();
        }

        manager.up().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn failed_up_rolls_back_and_stops() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let mut manager = manager();
        manager.add_migration(create_table(1, "alpha")).unwrap();
        manager
            .add_migration(SqlMigration::new(
                2,
                "half done",
                "CREATE TABLE partial (id INTEGER); INSERT INTO nowhere VALUES (1);",
                "DROP TABLE partial;",
            ))
            .unwrap();
        let calls = Arc::clone(&later_calls);
        manager
            .add_migration(FnMigration::new(
                3,
                "never reached",
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                |_| Ok(()),
            ))
            .unwrap();

        let err = manager.up().unwrap_err();
        assert!(matches!(
            err,
            Error::SchemaApply {
                version: 2,
                direction: Direction::Up,
                ..
            }
        ));
        assert_eq!(applied(&manager), vec![1]);
        assert!(!table_exists(&manager, "partial"));
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);

        // The lock was released despite the failure.
        let conn = manager.connection().unwrap();
        assert!(manager.lock.holder(&conn).unwrap().is_none());
    }

    #[test]
    fn failed_down_keeps_migration_applied() {
        let mut manager = manager();
        manager
            .add_migration(FnMigration::new(
                1,
                "irreversible",
                |tx| {
                    tx.execute_batch("CREATE TABLE keep (id INTEGER);")
                        .map_err(|e| Error::Database(e.to_string()))
                },
                |tx| {
                    tx.execute_batch("DROP TABLE keep;")
                        .map_err(|e| Error::Database(e.to_string()))?;
                    Err(Error::Database("refusing to drop data".into()))
                },
            ))
            .unwrap();
        manager.up().unwrap();

        let err = manager.down().unwrap_err();
        assert!(matches!(
            err,
            Error::SchemaApply {
                version: 1,
                direction: Direction::Down,
                ..
            }
        ));
        assert_eq!(applied(&manager), vec![1]);
        assert!(table_exists(&manager, "keep"));
    }

    #[test]
    fn drift_is_reported_by_down_and_status() {
        let mut manager = manager();
        manager.add_migration(create_table(1, "alpha")).unwrap();
        manager.up().unwrap();
        insert_ledger_row(&manager, 7);

        assert!(matches!(manager.down(), Err(Error::Drift(7))));
        assert!(matches!(manager.status(), Err(Error::Drift(7))));
        // Nothing was reverted.
        assert_eq!(applied(&manager), vec![1, 7]);
    }

    #[test]
    fn drift_below_latest_still_blocks_down() {
        let mut manager = manager();
        manager.add_migration(create_table(5, "alpha")).unwrap();
        insert_ledger_row(&manager, 2);
        manager.up().unwrap();

        assert!(matches!(manager.down(), Err(Error::Drift(2))));
        assert!(table_exists(&manager, "alpha"));
    }

    #[test]
    fn up_tolerates_unknown_applied_versions() {
        let mut manager = manager();
        manager.add_migration(create_table(1, "alpha")).unwrap();
        insert_ledger_row(&manager, 9);

        assert_eq!(manager.up().unwrap().applied, vec![1]);
    }

    #[test]
    fn fills_gaps_below_the_latest_applied_version() {
        let mut manager = manager();
        manager.add_migration(create_table(1, "alpha")).unwrap();
        manager.add_migration(create_table(3, "gamma")).unwrap();
        manager.up().unwrap();

        manager.add_migration(create_table(2, "beta")).unwrap();
        assert_eq!(manager.pending().unwrap().len(), 1);
        assert_eq!(manager.up().unwrap().applied, vec![2]);
    }

    #[test]
    fn status_lists_every_registered_version() {
        let mut manager = manager();
        manager.add_migration(create_table(2, "beta")).unwrap();
        manager.add_migration(create_table(1, "alpha")).unwrap();

        let status = manager.status().unwrap();
        assert_eq!(
            status
                .iter()
                .map(|s| (s.version, s.applied))
                .collect::<Vec<_>>(),
            vec![(1, false), (2, false)]
        );
        assert_eq!(status[0].description, "create alpha");

        let json = serde_json::to_value(&status[0]).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["applied"], false);
    }

    #[test]
    fn cancel_stops_before_next_step() {
        let mut manager = manager();
        manager.add_migration(create_table(1, "alpha")).unwrap();
        manager.cancel_flag().cancel();

        assert!(matches!(manager.up(), Err(Error::Cancelled { next: 1 })));
        assert!(applied(&manager).is_empty());
        let conn = manager.connection().unwrap();
        assert!(manager.lock.holder(&conn).unwrap().is_none());
    }

    #[test]
    fn cancel_between_steps_keeps_committed_work() {
        let mut manager = manager();
        let cancel = manager.cancel_flag();
        manager
            .add_migration(FnMigration::new(
                1,
                "create alpha, then interrupt",
                move |tx| {
                    tx.execute_batch("CREATE TABLE alpha (id INTEGER PRIMARY KEY);")
                        .map_err(|e| Error::Database(e.to_string()))?;
                    cancel.cancel();
                    Ok(())
                },
                |tx| {
                    tx.execute_batch("DROP TABLE alpha;")
                        .map_err(|e| Error::Database(e.to_string()))
                },
            ))
            .unwrap();
        manager.add_migration(create_table(2, "beta")).unwrap();

        assert!(matches!(manager.up(), Err(Error::Cancelled { next: 2 })));
        assert_eq!(applied(&manager), vec![1]);
        assert!(table_exists(&manager, "alpha"));
        assert!(!table_exists(&manager, "beta"));
        let conn = manager.connection().unwrap();
        assert!(manager.lock.holder(&conn).unwrap().is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut manager = manager();
        manager.add_migration(create_table(1, "alpha")).unwrap();
        assert!(matches!(
            manager.add_migration(create_table(1, "beta")),
            Err(Error::DuplicateVersion(1))
        ));
    }

    #[test]
    fn verify_reports_missing_objects() {
        let mut manager = manager();
        for m in builtin() {
            manager.add_migration(m).unwrap();
        }
        assert!(manager.verify(BUILTIN_EXPECTATIONS).unwrap().is_empty());

        manager.up().unwrap();
        assert!(manager.verify(BUILTIN_EXPECTATIONS).unwrap().is_empty());

        {
            let conn = manager.connection().unwrap();
            conn.execute_batch("DROP INDEX idx_posts_created_at;").unwrap();
        }
        let missing = manager.verify(BUILTIN_EXPECTATIONS).unwrap();
        assert_eq!(
            missing,
            vec![MissingObject {
                version: 2,
                kind: "index",
                name: "idx_posts_created_at".into(),
            }]
        );
    }

    #[test]
    fn verify_checks_columns_and_primary_key() {
        let mut manager = manager();
        for m in builtin() {
            manager.add_migration(m).unwrap();
        }
        manager.up().unwrap();

        {
            let conn = manager.connection().unwrap();
            conn.execute_batch(
                "DROP TABLE users;
                 CREATE TABLE users (
                     id INTEGER,
                     username TEXT PRIMARY KEY,
                     password_hash TEXT,
                     created_at TEXT,
                     updated_at TEXT
                 );
                 CREATE INDEX idx_users_email ON users(username);
                 CREATE INDEX idx_users_username ON users(username);",
            )
            .unwrap();
        }

        let missing = manager.verify(BUILTIN_EXPECTATIONS).unwrap();
        assert_eq!(
            missing,
            vec![
                MissingObject {
                    version: 1,
                    kind: "column",
                    name: "users.email".into(),
                },
                MissingObject {
                    version: 1,
                    kind: "primary key",
                    name: "users.id".into(),
                },
            ]
        );
    }
}
