//! Error types for fieldsync-core

use thiserror::Error;

use crate::models::{ConditionError, TransitionError};
use crate::sync::RemoteError;

/// Result type alias using fieldsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity not found locally
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sync status transition outside the lifecycle table
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    /// Schema skew encountered while evaluating a task condition
    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// Remote store error
    #[error(transparent)]
    Remote(#[from] RemoteError),
}
