//! # Database
//!
//! PostgreSQL pool setup and the bundled schema migrations used by
//! [`PgRepository`](crate::repository::PgRepository).

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::{run_migrations, MIGRATOR};
