// pgvault/src/storage/memory.rs
//! In-process storage used by unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::sync::Mutex;

use super::{ObjectReader, ObjectTags, StorageClient, StorageError, StorageObject, StorageResult};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    tags: Option<ObjectTags>,
    last_modified: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    deny_tagging: bool,
    put_failure: Option<String>,
    list_failure: Option<String>,
    failing_deletes: HashSet<String>,
    put_attempts: Mutex<usize>,
    list_calls: Mutex<usize>,
    downloads: Mutex<usize>,
    delete_attempts: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects tagged uploads with an S3-style access-denied error.
    pub fn deny_tagging(mut self) -> Self {
        self.deny_tagging = true;
        self
    }

    pub fn fail_puts(mut self, message: &str) -> Self {
        self.put_failure = Some(message.to_string());
        self
    }

    pub fn fail_list(mut self, message: &str) -> Self {
        self.list_failure = Some(message.to_string());
        self
    }

    pub fn fail_delete_of(mut self, key: &str) -> Self {
        self.failing_deletes.insert(key.to_string());
        self
    }

    pub fn insert(&self, key: &str, data: &[u8], last_modified: Option<DateTime<Utc>>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                tags: None,
                last_modified,
            },
        );
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn bytes_of(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.clone())
    }

    pub fn tags_of(&self, key: &str) -> Option<ObjectTags> {
        self.objects.lock().unwrap().get(key).and_then(|o| o.tags.clone())
    }

    pub fn put_attempts(&self) -> usize {
        *self.put_attempts.lock().unwrap()
    }

    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }

    pub fn downloads(&self) -> usize {
        *self.downloads.lock().unwrap()
    }

    pub fn delete_attempts(&self) -> Vec<String> {
        self.delete_attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    fn provider(&self) -> &'static str {
        "memory"
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        tags: Option<&ObjectTags>,
    ) -> StorageResult<()> {
        *self.put_attempts.lock().unwrap() += 1;
        if let Some(message) = &self.put_failure {
            return Err(StorageError::transport("put_object", key, message.clone()));
        }
        if tags.is_some() && self.deny_tagging {
            return Err(StorageError::transport(
                "put_object",
                key,
                "service error: AccessDenied: Access Denied (status 403)",
            ));
        }
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                tags: tags.cloned(),
                last_modified: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn download(&self, key: &str) -> StorageResult<ObjectReader> {
        *self.downloads.lock().unwrap() += 1;
        let data = self
            .bytes_of(key)
            .ok_or_else(|| StorageError::NotFound { key: key.to_string() })?;
        Ok(Box::pin(Cursor::new(data.to_vec())))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.delete_attempts.lock().unwrap().push(key.to_string());
        if self.failing_deletes.contains(key) {
            return Err(StorageError::transport("delete_object", key, "simulated delete failure"));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<StorageObject>> {
        *self.list_calls.lock().unwrap() += 1;
        if let Some(message) = &self.list_failure {
            return Err(StorageError::transport("list_objects", prefix, message.clone()));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| StorageObject {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }
}
