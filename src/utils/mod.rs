// pgvault/src/utils/mod.rs
pub mod process;

use std::path::PathBuf;
use tokio::process::Command;
use which::which;

use crate::config::ConnectionConfig;
use crate::errors::{AppError, Result};

/// Finds a PostgreSQL client executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|e| {
        AppError::config(format!(
            "{} executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed and in your PATH.",
            name, e
        ))
    })
}

/// Quotes a SQL identifier: wrap in `"` and double any embedded `"`.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Passes the connection secrets to libpq-based tools out of band.
pub fn apply_connection_env(command: &mut Command, connection: &ConnectionConfig) {
    command
        .env("PGPASSWORD", &connection.password)
        .env("PGSSLMODE", &connection.ssl_mode)
        .env("PGCONNECT_TIMEOUT", "30");
}
