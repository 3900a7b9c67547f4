// pgvault/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3::config::http::HttpResponse;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::{DisplayErrorContext, SdkError};
use s3::primitives::ByteStream;
use tracing::{debug, info};

use super::{ObjectReader, ObjectTags, StorageClient, StorageError, StorageObject, StorageResult};
use crate::config::S3Config;

/// Adapter for AWS S3 and S3-compatible stores (MinIO, DigitalOcean Spaces, ...).
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
}

impl S3Storage {
    /// Static keys when configured, otherwise the default AWS credential chain
    /// (environment, profile, web identity, instance metadata).
    pub async fn connect(config: &S3Config) -> StorageResult<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => {
                loader = loader.credentials_provider(Credentials::new(
                    access_key_id,
                    secret_access_key,
                    None,
                    None,
                    "Static",
                ));
            }
            _ => debug!("no static S3 keys configured, using the ambient credential chain"),
        }

        let sdk_config = loader.load().await;
        // Custom endpoints are almost always S3-compatible stores that need path-style URLs.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "S3 storage client configured"
        );

        Ok(Self {
            client: s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }
}

/// Encodes tags as the URL query string expected by `x-amz-tagging`.
pub(crate) fn tagging_query(tags: &ObjectTags) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(tags.pairs())
        .finish()
}

fn describe<E>(err: &SdkError<E, HttpResponse>) -> String
where
    E: std::error::Error + Send + Sync + 'static,
{
    match err.raw_response() {
        Some(response) => format!(
            "{} (status {})",
            DisplayErrorContext(err),
            response.status().as_u16()
        ),
        None => DisplayErrorContext(err).to_string(),
    }
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

pub(crate) fn to_utc(value: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(value.secs(), value.subsec_nanos())
}

#[async_trait]
impl StorageClient for S3Storage {
    fn provider(&self) -> &'static str {
        "s3"
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        tags: Option<&ObjectTags>,
    ) -> StorageResult<()> {
        let size = data.len();
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));
        if let Some(tags) = tags {
            request = request.tagging(tagging_query(tags));
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::transport("put_object", key, describe(&e)))?;

        info!(bucket = %self.bucket, key, size, tagged = tags.is_some(), "uploaded object to S3");
        Ok(())
    }

    async fn download(&self, key: &str) -> StorageResult<ObjectReader> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e.as_service_error().is_some_and(|se| se.is_no_such_key())
                    || status_of(&e) == Some(404);
                if missing {
                    StorageError::NotFound { key: key.to_string() }
                } else {
                    StorageError::transport("get_object", key, describe(&e))
                }
            })?;

        debug!(bucket = %self.bucket, key, size = ?output.content_length(), "downloading object from S3");
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error().is_some_and(|se| se.is_not_found())
                    || status_of(&e) == Some(404) =>
            {
                Ok(false)
            }
            Err(e) => Err(StorageError::transport("head_object", key, describe(&e))),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::transport("delete_object", key, describe(&e)))?;
        debug!(bucket = %self.bucket, key, "deleted object from S3");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<StorageObject>> {
        let mut request = self.client.list_objects_v2().bucket(&self.bucket);
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }

        let mut pages = request.into_paginator().send();
        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page =
                page.map_err(|e| StorageError::transport("list_objects_v2", prefix, describe(&e)))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(StorageObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified: object.last_modified().and_then(to_utc),
                });
            }
        }

        debug!(bucket = %self.bucket, prefix, count = objects.len(), "listed S3 objects");
        Ok(objects)
    }
}
