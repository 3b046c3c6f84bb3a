use std::fmt;

use serde::{Deserialize, Serialize};

/// Migration version. Assigned by the migration author, unique and totally
/// ordered; the engine only accepts positive values.
pub type Version = i64;

/// Which way a migration step moves the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "apply",
            Direction::Down => "revert",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`. Table names are
/// interpolated into statements, so anything else is refused.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
