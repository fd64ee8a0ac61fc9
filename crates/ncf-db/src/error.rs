//! Database error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, DbError>;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    /// SQL error from sqlx
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Row did not round-trip into its domain type
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Not found
    #[error("not found: {0}")]
    NotFound(String),
}
