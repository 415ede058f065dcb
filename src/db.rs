//! SQLite connection management and schema migrations.
//!
//! All SQL in this crate is runtime-checked (`sqlx::query`, not `sqlx::query!`), so building
//! never needs a live database. The schema itself is embedded from `migrations/`.

use sqlx::SqlitePool;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const MAX_CONNECTIONS: u32 = 5;

/// Errors raised while opening or migrating the database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection string was rejected or the database could not be opened.
    #[error("Failed to open database: {0}")]
    Connect(#[from] sqlx::Error),
    /// Schema migrations failed to apply.
    #[error("Failed to migrate database: {0}")]
    Migrate(#[from] MigrateError),
}

/// Open (creating if necessary) the database at `database_url` and apply migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool, DatabaseError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    tracing::debug!(database_url, "Database ready");
    Ok(pool)
}

/// Open a private in-memory database with the full schema.
///
/// The pool holds exactly one connection that never expires, since an in-memory SQLite database
/// lives only as long as its connection.
pub async fn connect_in_memory() -> Result<SqlitePool, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
