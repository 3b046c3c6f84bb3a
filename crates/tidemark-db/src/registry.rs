use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

use tidemark_common::{Error, Result, Version};

use crate::migration::Migration;

/// Registered migrations keyed by version. Iteration is always ascending by
/// version, whatever order they were added in.
#[derive(Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<Version, Box<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Migration + 'static>(&mut self, migration: M) -> Result<()> {
        self.add_boxed(Box::new(migration))
    }

    pub fn add_boxed(&mut self, migration: Box<dyn Migration>) -> Result<()> {
        let version = migration.version();
        if version <= 0 {
            return Err(Error::Config(format!(
                "migration version must be positive, got {version}"
            )));
        }
        match self.migrations.entry(version) {
            Entry::Occupied(_) => Err(Error::DuplicateVersion(version)),
            Entry::Vacant(slot) => {
                slot.insert(migration);
                Ok(())
            }
        }
    }

    /// All migrations, ascending by version.
    pub fn all(&self) -> impl Iterator<Item = &dyn Migration> + '_ {
        self.migrations.values().map(|m| m.as_ref())
    }

    pub fn get(&self, version: Version) -> Option<&dyn Migration> {
        self.migrations.get(&version).map(|m| m.as_ref())
    }

    pub fn contains(&self, version: Version) -> bool {
        self.migrations.contains_key(&version)
    }

    pub fn versions(&self) -> impl Iterator<Item = Version> + '_ {
        self.migrations.keys().copied()
    }

    pub fn latest_version(&self) -> Option<Version> {
        self.migrations.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.migrations.iter().map(|(v, m)| (v, m.description())))
            .finish()
    }
}
