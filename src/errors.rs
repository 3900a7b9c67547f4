use thiserror::Error;

use crate::storage::StorageError;
use crate::template::TemplateError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{tool} failed with {status}: {stderr}")]
    Command {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Restore conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    pub fn config(msg: impl Into<String>) -> Self {
        AppError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
