//! # Schema Migrations
//!
//! Migrations live in `migrations/` at the crate root as
//! `YYYYMMDDHHMMSS_description.sql` and are embedded at compile time.

use crate::error::{TaskerError, TaskerResult};
use sqlx::PgPool;
use tracing::info;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn run_migrations(pool: &PgPool) -> TaskerResult<()> {
    info!("Running queue schema migrations...");
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| TaskerError::DatabaseError(format!("Migration failed: {e}")))?;
    info!("Queue schema migrations complete");
    Ok(())
}
