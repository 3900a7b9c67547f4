//! PostgreSQL backup / restore / retention job
//!
//! Runs exactly one mode per invocation and exits.

// pgvault/src/main.rs
mod backup;
mod config;
mod errors;
mod restore;
mod retention;
mod storage;
mod template;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::RawConfig;
use errors::AppError;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pgvault", version, about = "PostgreSQL backup, restore and retention job")]
struct Cli {
    /// Optional JSON config file; environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Mode {
    /// Dump, compress, tag and upload one database
    Backup,
    /// Download a dump and replay it into the target database
    Restore,
    /// Prune stored dumps according to the retention policy
    Retention,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    // stdout carries the JSON result, logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let raw = match &cli.config {
        Some(path) => RawConfig::load_from_json(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?
            .overlay(|name| env::var(name).ok()),
        None => RawConfig::from_env(),
    };
    let timeout = raw.job_timeout()?;
    cancellable(run_mode(cli.mode, &raw), timeout).await
}

/// Runs `job` until it finishes or the process is interrupted. Dropping the
/// job future kills any in-flight pg_dump/psql child.
async fn cancellable<T, F>(job: F, timeout: Option<Duration>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        result = job => result,
        reason = interrupted(timeout) => Err(AppError::Cancelled(reason).into()),
    }
}

async fn run_mode(mode: Mode, raw: &RawConfig) -> Result<()> {
    match mode {
        Mode::Backup => {
            let backup_config = config::load_backup_config(raw).context("Invalid backup configuration")?;
            info!(config = ?backup_config, "🚀 starting backup job");
            let stats = backup::run_backup(&backup_config).await.context("Backup failed")?;
            println!("{}", serde_json::to_string(&stats)?);
        }
        Mode::Restore => {
            let restore_config = config::load_restore_config(raw).context("Invalid restore configuration")?;
            info!(config = ?restore_config, "🔄 starting restore job");
            restore::run_restore(&restore_config).await.context("Restore failed")?;
        }
        Mode::Retention => {
            let retention_config =
                config::load_retention_config(raw).context("Invalid retention configuration")?;
            info!(config = ?retention_config, "starting retention job");
            let summary = retention::run_retention(&retention_config)
                .await
                .context("Retention failed")?;
            println!("{}", serde_json::to_string(&summary)?);
        }
    }
    Ok(())
}

/// Resolves on SIGINT, SIGTERM or when the job deadline passes.
async fn interrupted(timeout: Option<Duration>) -> String {
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "received interrupt signal".to_string(),
        _ = terminate() => "received SIGTERM".to_string(),
        _ = deadline => format!(
            "job exceeded JOB_TIMEOUT_SECONDS ({}s)",
            timeout.map(|t| t.as_secs()).unwrap_or_default()
        ),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}
