use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidemark_common::{Error, Result, is_valid_identifier};

/// Top-level configuration, as read from `config.yml` / `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file. `None` resolves to `~/.tidemark/data/tidemark.db`.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub table: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            table: "_tidemark_migrations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub table: String,
    pub resource: String,
    pub timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub lease_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            table: "_tidemark_lock".to_string(),
            resource: "migrations".to_string(),
            timeout_ms: 30_000,
            retry_interval_ms: 250,
            lease_secs: 600,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".tidemark")
                .join("data")
                .join("tidemark.db")
        })
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl AppConfig {
    /// Reject values that would make table names unsafe to interpolate or
    /// make the lock loop spin.
    pub fn validate(&self) -> Result<()> {
        for (field, name) in [
            ("ledger.table", &self.ledger.table),
            ("lock.table", &self.lock.table),
        ] {
            if !is_valid_identifier(name) {
                return Err(Error::Config(format!(
                    "{field} '{name}' is not a valid SQL identifier"
                )));
            }
        }
        if self.ledger.table == self.lock.table {
            return Err(Error::Config(
                "ledger.table and lock.table must differ".into(),
            ));
        }
        if self.lock.resource.is_empty() {
            return Err(Error::Config("lock.resource cannot be empty".into()));
        }
        if self.lock.retry_interval_ms == 0 {
            return Err(Error::Config(
                "lock.retry_interval_ms must be positive".into(),
            ));
        }
        if self.lock.lease_secs == 0 {
            return Err(Error::Config("lock.lease_secs must be positive".into()));
        }
        Ok(())
    }
}
