//! PostgreSQL task store for the taskhub server.
//!
//! Provides [`PostgresTaskStore`], an implementation of
//! [`taskhub_storage::TaskStore`] on top of a sqlx connection pool, plus the
//! pool factory and the embedded schema migration.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pool;
mod store;

pub use config::PostgresConfig;
pub use error::{PostgresError, Result};
pub use store::PostgresTaskStore;
