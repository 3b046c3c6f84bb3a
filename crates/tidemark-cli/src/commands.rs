use std::io::Write;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tidemark_config::AppConfig;
use tidemark_db::catalog::{self, BUILTIN_EXPECTATIONS};
use tidemark_db::{LedgerStore, LockCoordinator, MigrationManager, MigrationStatus, connection};
use tracing::info;

use crate::Command;

/// Open the configured database and register the built-in migrations.
pub fn build_manager(config: &AppConfig) -> Result<MigrationManager> {
    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let conn = connection::open(&db_path, config.database.busy_timeout())?;
    let ledger = LedgerStore::new(&config.ledger.table)?;
    let lock = LockCoordinator::new(&config.lock.table, &config.lock.resource)?
        .with_timeout(config.lock.timeout())
        .with_retry_interval(config.lock.retry_interval())
        .with_lease(config.lock.lease());

    let mut manager = MigrationManager::new(conn, ledger, lock)?;
    for migration in catalog::builtin() {
        manager.add_migration(migration)?;
    }
    Ok(manager)
}

pub fn execute(
    manager: &MigrationManager,
    command: Command,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Command::Up => {
            let report = manager.up().context("failed to run migrations")?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
            } else if report.is_noop() {
                writeln!(out, "Schema is up to date.")?;
            } else {
                for version in &report.applied {
                    writeln!(out, "Applied migration {version}")?;
                }
            }
            info!("migrations completed successfully");
        }
        Command::Down { steps } => {
            let mut reverted = Vec::new();
            for _ in 0..steps {
                match manager.down().context("failed to roll back migration")? {
                    Some(version) => reverted.push(version),
                    None => break,
                }
            }
            if json {
                writeln!(out, "{}", json!({ "reverted": reverted }))?;
            } else if reverted.is_empty() {
                writeln!(out, "No migrations to roll back.")?;
            } else {
                for version in &reverted {
                    writeln!(out, "Rolled back migration {version}")?;
                }
            }
        }
        Command::Status => {
            let status = manager.status().context("failed to read migration status")?;
            write_status(out, &status, json)?;
        }
        Command::Pending => {
            let pending = manager.pending().context("failed to read pending migrations")?;
            write_status(out, &pending, json)?;
        }
        Command::Verify => {
            let missing = manager
                .verify(BUILTIN_EXPECTATIONS)
                .context("failed to inspect schema")?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&missing)?)?;
            } else {
                for m in &missing {
                    writeln!(out, "Migration {}: {} '{}' is missing", m.version, m.kind, m.name)?;
                }
            }
            if !missing.is_empty() {
                bail!("schema verification failed: {} object(s) missing", missing.len());
            }
            if !json {
                writeln!(out, "Schema matches the applied migrations.")?;
            }
        }
    }
    Ok(())
}

fn write_status(out: &mut impl Write, status: &[MigrationStatus], json: bool) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(status)?)?;
        return Ok(());
    }
    if status.is_empty() {
        writeln!(out, "No migrations.")?;
        return Ok(());
    }
    writeln!(out, "Migration Status:")?;
    for s in status {
        let state = match s.applied_at {
            Some(at) => format!("Applied {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            None => "Not Applied".to_string(),
        };
        writeln!(out, "  Version {}: {} - {}", s.version, s.description, state)?;
    }
    Ok(())
}

/// 2 for errors worth retrying (lock contention, busy database), 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let retryable = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<tidemark_common::Error>())
        .any(|e| e.is_retryable());
    if retryable { 2 } else { 1 }
}
