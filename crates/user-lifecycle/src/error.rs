//! Application error types.

use common::StreamId;
use projections::ProjectionError;
use store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// No user with this id is in the expected lifecycle stage.
    #[error("User {0} not found")]
    UserNotFound(StreamId),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tracing or metrics could not be installed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Projection(err) => err.is_retryable(),
            AppError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}
