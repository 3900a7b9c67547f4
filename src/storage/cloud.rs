// pgvault/src/storage/cloud.rs
//! Google Cloud Storage and Azure Blob adapters built on `object_store`.
//!
//! Both providers share one implementation; only construction differs. Tags
//! are written as user metadata (`x-goog-meta-*` / `x-ms-meta-*`).

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::{ObjectReader, ObjectTags, StorageClient, StorageError, StorageObject, StorageResult};
use crate::config::{AzureConfig, GcsConfig};

pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    provider: &'static str,
    bucket: String,
}

impl ObjectStoreStorage {
    pub fn new(store: Arc<dyn ObjectStore>, provider: &'static str, bucket: &str) -> Self {
        Self {
            store,
            provider,
            bucket: bucket.to_string(),
        }
    }

    /// Without an explicit key the builder falls back to application default
    /// credentials (`GOOGLE_APPLICATION_CREDENTIALS`, metadata server).
    pub fn gcs(config: &GcsConfig) -> StorageResult<Self> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&config.bucket);
        if let Some(key) = &config.service_account_key {
            builder = builder.with_service_account_key(key);
        }
        if let Some(path) = &config.service_account_path {
            builder = builder.with_service_account_path(path);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("GCS: {}", e)))?;

        info!(bucket = %config.bucket, "GCS storage client configured");
        Ok(Self::new(Arc::new(store), "gcs", &config.bucket))
    }

    /// Without an access key, `AZURE_*` environment credentials are used,
    /// including federated workload identity.
    pub fn azure(config: &AzureConfig) -> StorageResult<Self> {
        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_account(&config.account)
            .with_container_name(&config.container);
        if let Some(key) = &config.access_key {
            builder = builder.with_access_key(key);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("Azure: {}", e)))?;

        info!(account = %config.account, container = %config.container, "Azure storage client configured");
        Ok(Self::new(Arc::new(store), "azure", &config.container))
    }
}

fn parse_key(key: &str) -> StorageResult<ObjectPath> {
    ObjectPath::parse(key).map_err(|e| StorageError::InvalidKey {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn tag_attributes(tags: &ObjectTags) -> Attributes {
    let mut attributes = Attributes::new();
    for (name, value) in tags.pairs() {
        attributes.insert(Attribute::Metadata(name.into()), value.to_string().into());
    }
    attributes
}

// Directory part of a string prefix: `a/b/c` -> `a/b`, `abc` -> ``.
fn list_root(prefix: &str) -> &str {
    prefix.rfind('/').map(|i| &prefix[..i]).unwrap_or("")
}

#[async_trait]
impl StorageClient for ObjectStoreStorage {
    fn provider(&self) -> &'static str {
        self.provider
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        tags: Option<&ObjectTags>,
    ) -> StorageResult<()> {
        let path = parse_key(key)?;
        let size = data.len();
        let mut options = PutOptions::default();
        if let Some(tags) = tags {
            options.attributes = tag_attributes(tags);
        }

        self.store
            .put_opts(&path, PutPayload::from(data), options)
            .await
            .map_err(|e| StorageError::transport("put_object", key, e.to_string()))?;

        info!(
            provider = self.provider,
            bucket = %self.bucket,
            key,
            size,
            tagged = tags.is_some(),
            "uploaded object"
        );
        Ok(())
    }

    async fn download(&self, key: &str) -> StorageResult<ObjectReader> {
        let path = parse_key(key)?;
        let result = self.store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound { key: key.to_string() },
            other => StorageError::transport("get_object", key, other.to_string()),
        })?;

        let stream = result.into_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = parse_key(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::transport("head_object", key, e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = parse_key(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                debug!(provider = self.provider, key, "deleted object");
                Ok(())
            }
            Err(e) => Err(StorageError::transport("delete_object", key, e.to_string())),
        }
    }

    // object_store lists by path segment, so list the enclosing directory and
    // filter on the raw string prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<StorageObject>> {
        let root = list_root(prefix);
        let root_path = if root.is_empty() { None } else { Some(parse_key(root)?) };

        let mut stream = self.store.list(root_path.as_ref());
        let mut objects = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| StorageError::transport("list_objects", prefix, e.to_string()))?;
            let key = meta.location.to_string();
            if key.starts_with(prefix) {
                objects.push(StorageObject {
                    key,
                    size: meta.size as u64,
                    last_modified: Some(meta.last_modified),
                });
            }
        }

        debug!(provider = self.provider, prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CREATED_BY;
    use object_store::memory::InMemory;
    use tokio::io::AsyncReadExt;

    fn storage() -> ObjectStoreStorage {
        ObjectStoreStorage::new(Arc::new(InMemory::new()), "memory", "test-bucket")
    }

    fn tags() -> ObjectTags {
        ObjectTags {
            database: "orders".into(),
            cluster: "prod".into(),
            backup_name: "nightly".into(),
            namespace: "databases".into(),
            timestamp: "20260120-143022".into(),
            created_by: CREATED_BY.into(),
        }
    }

    #[test]
    fn test_list_root() {
        assert_eq!(list_root("prod/orders/2026"), "prod/orders");
        assert_eq!(list_root("prod/orders/"), "prod/orders");
        assert_eq!(list_root("prod"), "");
        assert_eq!(list_root(""), "");
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() -> anyhow::Result<()> {
        let store = Arc::new(InMemory::new());
        let storage = ObjectStoreStorage::new(store.clone(), "memory", "test-bucket");
        storage
            .upload_with_tags("prod/orders/20260120-143022.sql.gz", Bytes::from_static(b"payload"), &tags())
            .await?;
        assert!(storage.exists("prod/orders/20260120-143022.sql.gz").await?);

        let mut body = Vec::new();
        storage
            .download("prod/orders/20260120-143022.sql.gz")
            .await?
            .read_to_end(&mut body)
            .await?;
        assert_eq!(body, b"payload");

        let stored = store
            .get(&ObjectPath::from("prod/orders/20260120-143022.sql.gz"))
            .await?;
        let metadata = |name: &'static str| {
            stored
                .attributes
                .get(&Attribute::Metadata(name.into()))
                .map(|value| AsRef::<str>::as_ref(value).to_string())
        };
        assert_eq!(metadata("created-by").as_deref(), Some(CREATED_BY));
        assert_eq!(metadata("database").as_deref(), Some("orders"));
        assert_eq!(metadata("backup-name").as_deref(), Some("nightly"));
        assert_eq!(metadata("timestamp").as_deref(), Some("20260120-143022"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() -> anyhow::Result<()> {
        let storage = storage();
        assert!(!storage.exists("nope.sql.gz").await?);
        match storage.download("nope.sql.gz").await {
            Err(StorageError::NotFound { key }) => assert_eq!(key, "nope.sql.gz"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("download of a missing key succeeded"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_list_filters_on_string_prefix() -> anyhow::Result<()> {
        let storage = storage();
        for key in [
            "prod/orders/20260101-000000.sql.gz",
            "prod/orders/20260102-000000.sql.gz",
            "prod/orders-archive/20260101-000000.sql.gz",
            "staging/orders/20260101-000000.sql.gz",
        ] {
            storage.upload(key, Bytes::from_static(b"x")).await?;
        }

        let mut keys: Vec<String> = storage.list("prod/orders/").await?.into_iter().map(|o| o.key).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["prod/orders/20260101-000000.sql.gz", "prod/orders/20260102-000000.sql.gz"]
        );

        let partial = storage.list("prod/ord").await?;
        assert_eq!(partial.len(), 3);
        assert!(partial.iter().all(|o| o.size == 1 && o.last_modified.is_some()));

        assert_eq!(storage.list("").await?.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> anyhow::Result<()> {
        let storage = storage();
        storage.upload("a/b.sql.gz", Bytes::from_static(b"x")).await?;
        storage.delete("a/b.sql.gz").await?;
        assert!(!storage.exists("a/b.sql.gz").await?);
        storage.delete("a/b.sql.gz").await?;
        Ok(())
    }
}
