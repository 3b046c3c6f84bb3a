pub mod catalog;
pub mod connection;
pub mod ledger;
pub mod lock;
pub mod manager;
pub mod migration;
pub mod registry;

pub use catalog::SchemaExpectation;
pub use ledger::{AppliedRecord, LedgerStore};
pub use lock::{LockCoordinator, LockGuard};
pub use manager::{CancelFlag, MigrationManager, MigrationStatus, MissingObject, UpReport};
pub use migration::{FnMigration, Migration, SqlMigration};
pub use registry::MigrationRegistry;
