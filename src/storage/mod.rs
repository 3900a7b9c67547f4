// pgvault/src/storage/mod.rs
//! Object storage abstraction shared by backup, restore and retention.
//!
//! Every provider adapter implements [`StorageClient`]. Runners only ever see
//! `Arc<dyn StorageClient>`, so a new backend is one more adapter plus one arm
//! in [`connect`].

pub(crate) mod cloud;
#[cfg(test)]
pub(crate) mod memory;
pub(crate) mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::warn;

use crate::config::StorageConfig;

/// Writer marker stored in the `created-by` tag.
pub const CREATED_BY: &str = "pgvault";

/// Provider error fragments that identify an authorization failure.
/// Matched case-sensitively against the provider's own error text. A bare
/// status code is only trusted in the forms the adapters render it:
/// `(status 403)` from the S3 adapter, `403 Forbidden` from HTTP clients.
const ACCESS_DENIED_SIGNATURES: &[&str] = &[
    "AccessDenied",
    "Access Denied",
    "AuthorizationPermissionMismatch",
    "AuthorizationFailure",
    "(status 403)",
    "403 Forbidden",
];

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("{operation} failed for `{key}`: {message}")]
    Transport {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("invalid object key `{key}`: {message}")]
    InvalidKey { key: String, message: String },

    #[error("storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn transport(operation: &'static str, key: &str, message: impl Into<String>) -> Self {
        StorageError::Transport {
            operation,
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// True when the provider rejected the request for lack of permission.
    pub fn is_access_denied(&self) -> bool {
        match self {
            StorageError::Transport { message, .. } => ACCESS_DENIED_SIGNATURES
                .iter()
                .any(|signature| message.contains(signature)),
            _ => false,
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Byte stream returned by [`StorageClient::download`].
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// A listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Identifying metadata attached to an uploaded backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTags {
    pub database: String,
    pub cluster: String,
    pub backup_name: String,
    pub namespace: String,
    pub timestamp: String,
    pub created_by: String,
}

impl ObjectTags {
    /// Tag key/value pairs in a stable order. Keys are identical on every backend.
    pub fn pairs(&self) -> [(&'static str, &str); 6] {
        [
            ("database", self.database.as_str()),
            ("cluster", self.cluster.as_str()),
            ("backup-name", self.backup_name.as_str()),
            ("namespace", self.namespace.as_str()),
            ("timestamp", self.timestamp.as_str()),
            ("created-by", self.created_by.as_str()),
        ]
    }
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Short provider label used in log records.
    fn provider(&self) -> &'static str;

    /// Stores `data` under `key`, attaching `tags` when given.
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        tags: Option<&ObjectTags>,
    ) -> StorageResult<()>;

    async fn download(&self, key: &str) -> StorageResult<ObjectReader>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<StorageObject>>;

    async fn upload(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.put_object(key, data, None).await
    }

    /// Uploads with tags. An authorization failure on the tagged request is
    /// retried once without tags; any other failure is returned as is.
    async fn upload_with_tags(
        &self,
        key: &str,
        data: Bytes,
        tags: &ObjectTags,
    ) -> StorageResult<()> {
        match self.put_object(key, data.clone(), Some(tags)).await {
            Err(err) if err.is_access_denied() => {
                warn!(
                    provider = self.provider(),
                    key,
                    error = %err,
                    "object tagging rejected; tagging is disabled, retrying upload without tags"
                );
                self.put_object(key, data, None).await
            }
            other => other,
        }
    }
}

/// Builds the adapter selected by `config`.
pub async fn connect(config: &StorageConfig) -> StorageResult<Arc<dyn StorageClient>> {
    match config {
        StorageConfig::S3(s3_config) => {
            let client = s3::S3Storage::connect(s3_config).await?;
            Ok(Arc::new(client))
        }
        StorageConfig::Gcs(gcs_config) => Ok(Arc::new(cloud::ObjectStoreStorage::gcs(gcs_config)?)),
        StorageConfig::Azure(azure_config) => {
            Ok(Arc::new(cloud::ObjectStoreStorage::azure(azure_config)?))
        }
    }
}
