// pgvault/src/retention/mod.rs
pub mod policy;

pub use policy::{BackupArtifact, RetentionPolicy};

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::errors::Result;
use crate::storage::{self, StorageClient, StorageObject};
use crate::template::COMPACT_TIMESTAMP_FORMAT;

static TIMESTAMP_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{8}-\d{6}").expect("timestamp token pattern is valid"));

/// Parses the first valid `YYYYMMDD-HHMMSS` token found anywhere in `key`.
pub fn parse_key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    TIMESTAMP_TOKEN.find_iter(key).find_map(|token| {
        NaiveDateTime::parse_from_str(token.as_str(), COMPACT_TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

/// Attaches a timestamp to every object: the one embedded in the key, else the
/// provider's last-modified time. Objects with neither are left out entirely.
pub fn derive_artifacts(objects: Vec<StorageObject>) -> Vec<BackupArtifact> {
    objects
        .into_iter()
        .filter_map(|object| {
            let timestamp = parse_key_timestamp(&object.key).or(object.last_modified);
            match timestamp {
                Some(timestamp) => Some(BackupArtifact {
                    key: object.key,
                    timestamp,
                    size: object.size,
                }),
                None => {
                    debug!(key = %object.key, "no timestamp for object, excluded from retention");
                    None
                }
            }
        })
        .collect()
}

/// Outcome of a deletion sweep.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

pub struct RetentionManager {
    storage: Arc<dyn StorageClient>,
}

impl RetentionManager {
    pub fn new(storage: Arc<dyn StorageClient>) -> Self {
        Self { storage }
    }

    /// Returns the keys under `prefix` that the policy does not keep.
    /// Nothing is deleted here; see [`RetentionManager::delete_files`].
    pub async fn apply_retention(
        &self,
        prefix: &str,
        policy: Option<&RetentionPolicy>,
    ) -> Result<Vec<String>> {
        self.apply_retention_at(prefix, policy, Utc::now()).await
    }

    pub async fn apply_retention_at(
        &self,
        prefix: &str,
        policy: Option<&RetentionPolicy>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let Some(policy) = policy else {
            debug!(prefix, "no retention policy, nothing to do");
            return Ok(Vec::new());
        };
        if !policy.has_active_rule() {
            info!(prefix, ?policy, "retention policy has no active rule, skipping");
            return Ok(Vec::new());
        }

        let objects = self.storage.list(prefix).await?;
        if objects.is_empty() {
            info!(prefix, "no backups found under prefix");
            return Ok(Vec::new());
        }
        let listed = objects.len();

        let mut artifacts = derive_artifacts(objects);
        // Stable: equal timestamps keep listing order.
        artifacts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let keep = policy::compute_keep_set(&artifacts, policy, now);
        let to_delete: Vec<String> = artifacts
            .into_iter()
            .filter(|a| !keep.contains(&a.key))
            .map(|a| a.key)
            .collect();

        info!(
            prefix,
            listed,
            kept = keep.len(),
            to_delete = to_delete.len(),
            "retention evaluated"
        );
        Ok(to_delete)
    }

    /// Deletes each key independently. Failures are logged and the sweep
    /// continues; this never fails the job.
    pub async fn delete_files(&self, keys: &[String]) -> DeleteSummary {
        let mut summary = DeleteSummary::default();
        for key in keys {
            match self.storage.delete(key).await {
                Ok(()) => {
                    info!(key = %key, "deleted expired backup");
                    summary.deleted.push(key.clone());
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to delete expired backup, continuing");
                    summary.failed.push(key.clone());
                }
            }
        }
        summary
    }
}

/// Printed by the retention job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionSummary {
    pub candidates: Vec<String>,
    #[serde(flatten)]
    pub outcome: DeleteSummary,
}

impl RetentionManager {
    pub async fn sweep(&self, prefix: &str, policy: Option<&RetentionPolicy>) -> Result<RetentionSummary> {
        let candidates = self.apply_retention(prefix, policy).await?;
        let outcome = self.delete_files(&candidates).await;
        if !outcome.failed.is_empty() {
            warn!(prefix, failed = outcome.failed.len(), "some expired backups could not be deleted");
        }
        Ok(RetentionSummary { candidates, outcome })
    }
}

/// Entry point for the retention job.
pub async fn run_retention(config: &RetentionConfig) -> Result<RetentionSummary> {
    let storage = storage::connect(&config.storage).await?;
    RetentionManager::new(storage)
        .sweep(&config.prefix, config.policy.as_ref())
        .await
}
