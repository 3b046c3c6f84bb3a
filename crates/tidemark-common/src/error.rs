use thiserror::Error;

use crate::types::{Direction, Version};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("duplicate migration version {0}")]
    DuplicateVersion(Version),

    #[error("migration {version} failed to {direction}: {reason}")]
    SchemaApply {
        version: Version,
        direction: Direction,
        reason: String,
    },

    #[error("ledger records migration {0} as applied but it is not registered")]
    Drift(Version),

    #[error("migration lock '{resource}' is held by {holder}")]
    LockContention { resource: String, holder: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled before migration {next}")]
    Cancelled { next: Version },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether a caller may reasonably retry the whole operation later.
    /// Drift and failed migrations need an operator, not a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockContention { .. } | Error::Connection(_))
    }

    /// The migration version the error is about, if any.
    pub fn version(&self) -> Option<Version> {
        match self {
            Error::DuplicateVersion(v) | Error::Drift(v) => Some(*v),
            Error::SchemaApply { version, .. } => Some(*version),
            Error::Cancelled { next } => Some(*next),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let e = Error::DuplicateVersion(3);
        assert_eq!(e.to_string(), "duplicate migration version 3");

        let e = Error::SchemaApply {
            version: 7,
            direction: Direction::Down,
            reason: "no such table: users".into(),
        };
        assert_eq!(
            e.to_string(),
            "migration 7 failed to revert: no such table: users"
        );

        let e = Error::LockContention {
            resource: "migrations".into(),
            holder: "host:42:abc".into(),
        };
        assert_eq!(
            e.to_string(),
            "migration lock 'migrations' is held by host:42:abc"
        );

        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(
            Error::LockContention {
                resource: "m".into(),
                holder: "other".into()
            }
            .is_retryable()
        );
        assert!(Error::Connection("busy".into()).is_retryable());

        assert!(!Error::Drift(4).is_retryable());
        assert!(
            !Error::SchemaApply {
                version: 1,
                direction: Direction::Up,
                reason: "syntax error".into()
            }
            .is_retryable()
        );
        assert!(!Error::DuplicateVersion(1).is_retryable());
    }

    #[test]
    fn version_is_attached_where_known() {
        assert_eq!(Error::Drift(9).version(), Some(9));
        assert_eq!(Error::Cancelled { next: 2 }.version(), Some(2));
        assert_eq!(Error::Database("x".into()).version(), None);
    }
}
