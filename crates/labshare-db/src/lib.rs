//! Database layer for labshare nodes.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. The database holds node-local bookkeeping:
//! the identity expiry registry, the last health-probe snapshot, queued key
//! rotation announcements, and the public query quota. Key material itself
//! stays on disk as PEM files.

mod migrations;
mod pool;

pub use migrations::{run_migrations, schema_version, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
