// pgvault/src/backup/db_dump.rs
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::info;

use crate::config::ConnectionConfig;
use crate::errors::Result;
use crate::utils::{apply_connection_env, find_executable, process};

/// Produces a plain SQL dump of one database.
#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(&self, connection: &ConnectionConfig) -> Result<Vec<u8>>;
}

/// `pg_dump` based dumper.
pub struct PgDump {
    executable: PathBuf,
}

impl PgDump {
    pub fn locate() -> Result<Self> {
        let executable = find_executable("pg_dump")?;
        info!(path = %executable.display(), "found pg_dump executable");
        Ok(Self { executable })
    }
}

/// Plain format, no ownership or privilege statements. The password never
/// appears on the command line.
pub fn dump_args(connection: &ConnectionConfig) -> Vec<String> {
    vec![
        "--host".to_string(),
        connection.host.clone(),
        "--port".to_string(),
        connection.port.to_string(),
        "--username".to_string(),
        connection.user.clone(),
        "--dbname".to_string(),
        connection.database.clone(),
        "--format=plain".to_string(),
        "--no-owner".to_string(),
        "--no-acl".to_string(),
        "--no-password".to_string(),
    ]
}

#[async_trait]
impl Dumper for PgDump {
    async fn dump(&self, connection: &ConnectionConfig) -> Result<Vec<u8>> {
        info!(
            host = %connection.host,
            port = connection.port,
            database = %connection.database,
            "running pg_dump"
        );
        let mut command = Command::new(&self.executable);
        command.args(dump_args(connection));
        apply_connection_env(&mut command, connection);

        let output = process::run_capture(command, "pg_dump").await?;
        info!(database = %connection.database, bytes = output.len(), "pg_dump finished");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            host: "pg.internal".into(),
            port: 6543,
            database: "orders".into(),
            user: "backup".into(),
            password: "hunter2".into(),
            ssl_mode: "require".into(),
        }
    }

    #[test]
    fn test_dump_args_request_plain_ownerless_dump() {
        let args = dump_args(&connection());
        assert_eq!(
            args,
            vec![
                "--host", "pg.internal", "--port", "6543", "--username", "backup", "--dbname",
                "orders", "--format=plain", "--no-owner", "--no-acl", "--no-password",
            ]
        );
    }

    #[test]
    fn test_password_is_not_passed_as_argument() {
        assert!(!dump_args(&connection()).iter().any(|arg| arg.contains("hunter2")));
    }
}
