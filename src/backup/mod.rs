// pgvault/src/backup/mod.rs
pub(crate) mod db_dump;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Serialize, Serializer};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::BackupConfig;
use crate::errors::Result;
use crate::storage::{self, CREATED_BY, ObjectTags, StorageClient};
use crate::template::{self, TemplateFields};
use db_dump::{Dumper, PgDump};

/// Result reported back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct BackupStats {
    pub path: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    #[serde(rename = "duration_seconds", serialize_with = "as_secs")]
    pub duration: Duration,
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Everything derived from the configuration and the start instant, before
/// any external call is made.
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub key: String,
    pub tags: ObjectTags,
}

impl BackupPlan {
    pub fn prepare(config: &BackupConfig, now: DateTime<Utc>) -> Result<Self> {
        let fields = TemplateFields::new(
            &config.cluster,
            &config.connection.database,
            &config.run_id,
            now,
        );
        let path = template::render(&config.path_template, &fields)?;
        let filename = template::render(&config.filename_template, &fields)?;

        let tags = ObjectTags {
            database: config.connection.database.clone(),
            cluster: config.cluster.clone(),
            backup_name: config.backup_name.clone().unwrap_or_default(),
            namespace: config.namespace.clone().unwrap_or_default(),
            timestamp: fields.timestamp.clone(),
            created_by: CREATED_BY.to_string(),
        };

        Ok(Self {
            key: template::object_key(&path, &filename),
            tags,
        })
    }
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub struct BackupRunner {
    storage: Arc<dyn StorageClient>,
    dumper: Box<dyn Dumper>,
}

impl BackupRunner {
    pub fn new(storage: Arc<dyn StorageClient>, dumper: Box<dyn Dumper>) -> Self {
        Self { storage, dumper }
    }

    /// dump -> gzip -> tagged upload. A failed upload fails the run; there is
    /// no partial or resumable upload.
    pub async fn execute(&self, config: &BackupConfig, plan: BackupPlan) -> Result<BackupStats> {
        let started = Instant::now();
        info!(key = %plan.key, database = %config.connection.database, "starting backup");

        let dump = self.dumper.dump(&config.connection).await?;
        let uncompressed_size = dump.len() as u64;

        let compressed = tokio::task::spawn_blocking(move || gzip(&dump))
            .await
            .map_err(std::io::Error::other)??;
        let compressed_size = compressed.len() as u64;
        info!(uncompressed_size, compressed_size, "dump compressed");

        self.storage
            .upload_with_tags(&plan.key, Bytes::from(compressed), &plan.tags)
            .await?;

        let stats = BackupStats {
            path: plan.key,
            compressed_size,
            uncompressed_size,
            duration: started.elapsed(),
        };
        info!(
            path = %stats.path,
            compressed_size,
            uncompressed_size,
            duration_ms = stats.duration.as_millis() as u64,
            "✅ backup uploaded"
        );
        Ok(stats)
    }
}

/// Entry point for the backup job.
pub async fn run_backup(config: &BackupConfig) -> Result<BackupStats> {
    let plan = BackupPlan::prepare(config, Utc::now())?;
    let dumper = PgDump::locate()?;
    let storage = storage::connect(&config.storage).await?;
    BackupRunner::new(storage, Box::new(dumper)).execute(config, plan).await
}
