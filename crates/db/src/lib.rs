//! Persistence for the tabular import engine.
//!
//! [`BulkStore`] is the boundary the executor writes through.
//! [`PgBulkStore`] backs it with PostgreSQL; [`MemoryStore`] backs tests
//! and dry runs.

pub mod error;
pub mod memory;
pub mod pg_store;
pub mod store;

use sqlx::postgres::PgPoolOptions;

pub use error::StoreError;
pub use memory::{MemoryStore, StoreCall};
pub use pg_store::PgBulkStore;
pub use store::{BulkStore, KeyTuple, WriteMode};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the schema for the built-in importable entities.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
