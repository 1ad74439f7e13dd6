//! Schema migrations and repository functions for the control plane store.
//!
//! Every component reaches the store through the free functions in this module. Functions that
//! take part in a transaction are generic over the sqlx executor so they accept both a pool and
//! a `&mut` transaction connection.

mod region;
mod registry;
mod runner;
mod sandbox;
mod snapshot;

use std::path::Path;

use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tokio::fs;

use crate::MonoplaneResult;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use region::*;
pub use registry::*;
pub use runner::*;
pub use sandbox::*;
pub use snapshot::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the control plane database
pub static CONTROL_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/db/migrations");

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Initializes a new SQLite database if it doesn't already exist at the specified path.
///
/// ## Arguments
///
/// * `db_path` - Path where the SQLite database file should be created
/// * `migrator` - SQLx migrator containing database schema migrations to run
pub async fn init_db(
    db_path: impl AsRef<Path>,
    migrator: &Migrator,
) -> MonoplaneResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let pool = get_db_pool(db_path).await?;

    // Run migrations
    migrator.run(&pool).await?;

    tracing::debug!("control database ready at {}", db_path.display());
    Ok(pool)
}

/// Creates and returns a connection pool for SQLite database operations.
///
/// The file is created if missing. The pool is configured with a maximum of 5 concurrent
/// connections.
pub async fn get_db_pool(db_path: impl AsRef<Path>) -> MonoplaneResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await?;

    Ok(pool)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Reads a TEXT column into one of the persisted enums.
pub(crate) fn parse_column<T>(row: &sqlx::sqlite::SqliteRow, column: &str) -> MonoplaneResult<T>
where
    T: std::str::FromStr<Err = crate::MonoplaneError>,
{
    use sqlx::Row;

    row.try_get::<String, _>(column)?.parse()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
