//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// The scheduling tables are not installed.
    #[error("schema not installed: {0} is missing; run the migrations")]
    SchemaMissing(&'static str),

    /// A stored row does not describe a valid work item or node.
    #[error("invalid row in {table}: {message}")]
    InvalidRow { table: &'static str, message: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub(crate) fn invalid_row(table: &'static str, message: impl std::fmt::Display) -> Self {
        Self::InvalidRow {
            table,
            message: message.to_string(),
        }
    }
}
