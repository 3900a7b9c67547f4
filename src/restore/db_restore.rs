// pgvault/src/restore/db_restore.rs
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Executor, Pool, Postgres};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use crate::config::ConnectionConfig;
use crate::errors::Result;
use crate::storage::ObjectReader;
use crate::utils::{apply_connection_env, find_executable, process, quote_identifier};

/// Maintenance database used for administrative statements.
pub const ADMIN_DATABASE: &str = "postgres";

/// Administrative operations the conflict policies need on the target server.
#[async_trait]
pub trait TargetDatabase: Send + Sync {
    /// Base tables in schema `public` of `database`.
    async fn table_count(&self, database: &str) -> Result<i64>;
    async fn terminate_connections(&self, database: &str) -> Result<u64>;
    async fn drop_database(&self, database: &str) -> Result<()>;
    async fn create_database(&self, database: &str) -> Result<()>;
}

pub struct PgAdmin {
    connection: ConnectionConfig,
}

impl PgAdmin {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self { connection }
    }

    fn options(&self, database: &str) -> Result<PgConnectOptions> {
        Ok(PgConnectOptions::new()
            .host(&self.connection.host)
            .port(self.connection.port)
            .username(&self.connection.user)
            .password(&self.connection.password)
            .database(database)
            .ssl_mode(PgSslMode::from_str(&self.connection.ssl_mode)?))
    }

    async fn pool(&self, database: &str) -> Result<Pool<Postgres>> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(self.options(database)?)
            .await?;
        Ok(pool)
    }
}

#[async_trait]
impl TargetDatabase for PgAdmin {
    async fn table_count(&self, database: &str) -> Result<i64> {
        let pool = self.pool(database).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
        )
        .fetch_one(&pool)
        .await?;
        pool.close().await;
        Ok(count)
    }

    async fn terminate_connections(&self, database: &str) -> Result<u64> {
        let pool = self.pool(ADMIN_DATABASE).await?;
        let terminated = sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(database)
        .fetch_all(&pool)
        .await?
        .len() as u64;
        pool.close().await;
        Ok(terminated)
    }

    async fn drop_database(&self, database: &str) -> Result<()> {
        let pool = self.pool(ADMIN_DATABASE).await?;
        // Simple query protocol: DROP/CREATE DATABASE refuse to run inside
        // the implicit transaction of a prepared statement batch.
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_identifier(database));
        pool.execute(sql.as_str()).await?;
        pool.close().await;
        info!(database, "✓ database dropped");
        Ok(())
    }

    async fn create_database(&self, database: &str) -> Result<()> {
        let pool = self.pool(ADMIN_DATABASE).await?;
        let sql = format!("CREATE DATABASE {}", quote_identifier(database));
        pool.execute(sql.as_str()).await?;
        pool.close().await;
        info!(database, "✓ database created");
        Ok(())
    }
}

/// Replays a SQL stream into the target database.
#[async_trait]
pub trait Restorer: Send + Sync {
    async fn restore(
        &self,
        connection: &ConnectionConfig,
        input: ObjectReader,
        gunzip: bool,
        stop_on_error: bool,
    ) -> Result<u64>;
}

/// `psql` based restorer; the SQL arrives on stdin.
pub struct PsqlRestore {
    executable: PathBuf,
}

impl PsqlRestore {
    pub fn locate() -> Result<Self> {
        let executable = find_executable("psql")?;
        info!(path = %executable.display(), "found psql executable");
        Ok(Self { executable })
    }
}

pub fn psql_args(connection: &ConnectionConfig, stop_on_error: bool) -> Vec<String> {
    let mut args = vec![
        "-X".to_string(), // Do not read psqlrc
        "-q".to_string(),
        "--host".to_string(),
        connection.host.clone(),
        "--port".to_string(),
        connection.port.to_string(),
        "--username".to_string(),
        connection.user.clone(),
        "--dbname".to_string(),
        connection.database.clone(),
    ];
    if stop_on_error {
        args.push("-v".to_string());
        args.push("ON_ERROR_STOP=1".to_string());
    }
    args
}

#[async_trait]
impl Restorer for PsqlRestore {
    async fn restore(
        &self,
        connection: &ConnectionConfig,
        input: ObjectReader,
        gunzip: bool,
        stop_on_error: bool,
    ) -> Result<u64> {
        info!(
            host = %connection.host,
            database = %connection.database,
            gunzip,
            stop_on_error,
            "streaming dump into psql"
        );
        let mut command = Command::new(&self.executable);
        command.args(psql_args(connection, stop_on_error));
        apply_connection_env(&mut command, connection);
        process::pipe_into(command, "psql", input, gunzip).await
    }
}
