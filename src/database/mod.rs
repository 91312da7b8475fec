//! # Database Operations
//!
//! Durable store for builds and build requests.
//!
//! ## Key Components
//!
//! - [`connection`] - SQLite pool management
//! - [`migrations`] - idempotent schema setup
//! - [`builds`] - build records, merge propagation and history queries
//! - [`build_requests`] - build request bookkeeping
//! - [`resolver`] - builder display name / project lookup used by history rows
//!
//! Every multi-row write runs in one transaction; a failure rolls the whole
//! operation back and surfaces the original error.

pub mod build_requests;
pub mod builds;
pub mod connection;
pub mod migrations;
pub mod resolver;

pub use build_requests::BuildRequestsConnector;
pub use builds::{BuildCompletion, BuildsConnector};
pub use connection::DatabaseConnection;
pub use migrations::DatabaseMigrations;
pub use resolver::{BuilderResolver, StaticBuilderResolver};

use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("There is no build for brid: {request_id} and build number {number}")]
    NotFound { request_id: i64, number: i64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistenceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Start a transaction that holds the write lock from its first statement,
/// so a read followed by a write never has to upgrade a shared lock
pub(crate) async fn begin_write(
    pool: &SqlitePool,
) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}

/// Push `(?, ?, ...)` binding every value in `values`
pub(crate) fn push_in_list(
    builder: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>,
    values: impl IntoIterator<Item = i64>,
) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}
