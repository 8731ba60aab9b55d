//! Error types shared across jobchain crates.

use thiserror::Error;

/// Every fallible operation in the engine returns this error.
///
/// Task execution failures are deliberately absent: a container that exits
/// non-zero is an ordinary outcome, carried as a value by the runner.
#[derive(Debug, Error)]
pub enum JobchainError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Notify error: {0}")]
    Notify(String),

    #[error("Invalid invocation timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JobchainError>;
