//! Built-in migrations shipped with the `tidemark` binary: the user and post
//! tables of the bundled board application.

use rusqlite::{Connection, params};
use tidemark_common::{Result, Version};

use crate::connection::sqlite_error;
use crate::migration::SqlMigration;

pub const CREATE_USERS_TABLE_SQL: &str = "
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE CHECK (length(username) <= 50),
    email TEXT NOT NULL UNIQUE CHECK (length(email) <= 100),
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_users_email ON users(email);
CREATE INDEX idx_users_username ON users(username);
";

pub const DROP_USERS_TABLE_SQL: &str = "
DROP INDEX IF EXISTS idx_users_username;
DROP INDEX IF EXISTS idx_users_email;
DROP TABLE IF EXISTS users;
";

pub const CREATE_USERS_TABLE: SqlMigration = SqlMigration::new(
    1,
    "Create users table",
    CREATE_USERS_TABLE_SQL,
    DROP_USERS_TABLE_SQL,
);

pub const CREATE_POSTS_TABLE_SQL: &str = "
CREATE TABLE posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_posts_created_at ON posts(created_at);
";

pub const DROP_POSTS_TABLE_SQL: &str = "
DROP INDEX IF EXISTS idx_posts_created_at;
DROP TABLE IF EXISTS posts;
";

pub const CREATE_POSTS_TABLE: SqlMigration = SqlMigration::new(
    2,
    "Create posts table",
    CREATE_POSTS_TABLE_SQL,
    DROP_POSTS_TABLE_SQL,
);

pub fn builtin() -> Vec<SqlMigration> {
    vec![CREATE_USERS_TABLE, CREATE_POSTS_TABLE]
}

/// Schema objects a migration is expected to leave behind once applied.
#[derive(Debug, Clone, Copy)]
pub struct SchemaExpectation {
    pub version: Version,
    pub tables: &'static [&'static str],
    pub indexes: &'static [&'static str],
    pub columns: &'static [TableColumns],
}

/// Columns a table must carry, and which one is its primary key.
#[derive(Debug, Clone, Copy)]
pub struct TableColumns {
    pub table: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [&'static str],
}

pub const BUILTIN_EXPECTATIONS: &[SchemaExpectation] = &[
    SchemaExpectation {
        version: 1,
        tables: &["users"],
        indexes: &["idx_users_email", "idx_users_username"],
        columns: &[TableColumns {
            table: "users",
            primary_key: "id",
            columns: &[
                "id",
                "username",
                "email",
                "password_hash",
                "created_at",
                "updated_at",
            ],
        }],
    },
    SchemaExpectation {
        version: 2,
        tables: &["posts"],
        indexes: &["idx_posts_created_at"],
        columns: &[TableColumns {
            table: "posts",
            primary_key: "id",
            columns: &["id", "user_id", "content", "created_at", "updated_at"],
        }],
    },
];

/// Whether `sqlite_master` has an object of `kind` ("table", "index") named `name`.
pub fn object_exists(conn: &Connection, kind: &str, name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
            params![kind, name],
            |row| row.get(0),
        )
        .map_err(|e| sqlite_error("failed to inspect schema", e))?;
    Ok(count > 0)
}

/// `(name, is_primary_key)` for every column of `table`, in declaration
/// order. Empty when the table does not exist.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, bool)>> {
    let mut stmt = conn
        .prepare("SELECT name, pk FROM pragma_table_info(?1)")
        .map_err(|e| sqlite_error("failed to inspect columns", e))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? > 0))
        })
        .map_err(|e| sqlite_error("failed to inspect columns", e))?;
    let columns = rows
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| sqlite_error("failed to inspect columns", e))?;
    Ok(columns)
}
