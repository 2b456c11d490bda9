//! C3: the durable store. A single SQLite database; schema evolves by a
//! numbered, forward-only migration list embedded at compile time.
//! `Store::open` runs migrations idempotently — safe to call concurrently
//! from a single process boot, since `sqlx::migrate!` serializes via its
//! own schema-version table under a database-level lock.
pub mod api_keys;
pub mod machines;
pub mod model;

pub use model::{ApiKey, Machine, MachineStatus, RuntimeType};

use crate::error::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the SQLite database at `path` and runs
    /// all pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let is_memory = path.as_os_str() == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| Error::Runtime(format!("invalid database path: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);

        // A file-backed pool can safely hand out several connections; an
        // in-memory database only exists within the connection that created
        // it, so the pool must be pinned to exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 8 })
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
