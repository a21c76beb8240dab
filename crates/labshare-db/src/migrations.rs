//! Versioned schema migrations.
//!
//! Each migration is an embedded SQL file with a numeric version. The
//! highest applied version is the schema version; `run_migrations` applies
//! every migration above it in order, each in its own transaction together
//! with its row in `_labshare_migrations`.

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

macro_rules! migration {
    ($version:literal, $name:literal) => {
        Migration {
            version: $version,
            name: $name,
            sql: include_str!(concat!("migrations/", $name, ".sql")),
        }
    };
}

const MIGRATIONS: &[Migration] = &[
    migration!(1, "001_identity_expiry"),
    migration!(2, "002_node_availability"),
    migration!(3, "003_pending_announcements"),
    migration!(4, "004_public_quota"),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration {version} ({name}) failed: {source}")]
    ExecutionFailed {
        version: u32,
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to read schema version: {0}")]
    StateQuery(rusqlite::Error),

    /// The database was written by a newer build.
    #[error("database schema version {found} is newer than the latest known version {latest}")]
    SchemaTooNew { found: u32, latest: u32 },
}

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _labshare_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// The highest applied migration version, or `None` on a fresh database.
pub fn schema_version(conn: &Connection) -> Result<Option<u32>, MigrationError> {
    conn.execute_batch(TRACKING_TABLE)
        .map_err(MigrationError::StateQuery)?;
    conn.query_row("SELECT MAX(version) FROM _labshare_migrations", [], |row| {
        row.get::<_, Option<u32>>(0)
    })
    .optional()
    .map(Option::flatten)
    .map_err(MigrationError::StateQuery)
}

/// Applies every migration newer than the current schema version.
///
/// Returns the number applied by this call.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    let current = schema_version(conn)?;
    let latest = migrations.last().map(|m| m.version);
    if let (Some(found), Some(latest)) = (current, latest) {
        if found > latest {
            return Err(MigrationError::SchemaTooNew { found, latest });
        }
    }

    let mut applied = 0;
    for migration in migrations
        .iter()
        .filter(|m| current.map_or(true, |v| m.version > v))
    {
        tracing::info!(
            version = migration.version,
            migration = migration.name,
            "applying migration"
        );

        let failed = |source| MigrationError::ExecutionFailed {
            version: migration.version,
            name: migration.name.to_string(),
            source,
        };

        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO _labshare_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;

        applied += 1;
    }

    Ok(applied)
}
