// pgvault/src/config/mod.rs
use serde::{Deserialize, Deserializer};
use sqlx::postgres::PgSslMode;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{AppError, Result};
use crate::retention::RetentionPolicy;

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_SSL_MODE: &str = "prefer";
pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_PATH_TEMPLATE: &str = "{cluster}/{database}";
pub const DEFAULT_FILENAME_TEMPLATE: &str = "{timestamp}.sql.gz";

// Raw, all-optional record. Filled from an optional JSON file and then from
// the environment; the environment wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub db_host: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub db_port: Option<String>,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_sslmode: Option<String>,

    pub storage_backend: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub gcs_bucket: Option<String>,
    pub gcs_service_account_key: Option<String>,
    pub gcs_service_account_path: Option<String>,
    pub azure_container: Option<String>,
    pub azure_storage_account: Option<String>,
    pub azure_storage_key: Option<String>,

    pub path_template: Option<String>,
    pub filename_template: Option<String>,
    pub cluster_name: Option<String>,
    pub backup_name: Option<String>,
    pub namespace: Option<String>,
    pub run_id: Option<String>,

    pub source_key: Option<String>,
    pub on_conflict: Option<String>,

    pub retention_prefix: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub keep_last: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub keep_daily: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub keep_weekly: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub keep_monthly: Option<String>,

    #[serde(deserialize_with = "lenient_string")]
    pub job_timeout_seconds: Option<String>,
}

// Accepts `"5432"` as well as `5432` in the JSON file.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

macro_rules! overlay_fields {
    ($target:ident, $lookup:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $lookup(stringify!($field).to_ascii_uppercase().as_str()) {
                $target.$field = Some(value);
            }
        )+
    };
}

impl RawConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path).map_err(|e| {
            AppError::config(format!("failed to read config file {}: {}", config_path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            AppError::config(format!("failed to parse config file {}: {}", config_path.display(), e))
        })
    }

    /// Overlays every field found through `lookup`, keyed by the upper-case
    /// field name (`db_host` -> `DB_HOST`).
    pub fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let cfg = &mut self;
        overlay_fields!(
            cfg,
            lookup,
            db_host,
            db_port,
            db_name,
            db_user,
            db_password,
            db_sslmode,
            storage_backend,
            s3_bucket,
            s3_region,
            s3_endpoint,
            s3_access_key_id,
            s3_secret_access_key,
            gcs_bucket,
            gcs_service_account_key,
            gcs_service_account_path,
            azure_container,
            azure_storage_account,
            azure_storage_key,
            path_template,
            filename_template,
            cluster_name,
            backup_name,
            namespace,
            run_id,
            source_key,
            on_conflict,
            retention_prefix,
            keep_last,
            keep_daily,
            keep_weekly,
            keep_monthly,
            job_timeout_seconds,
        );
        self
    }

    pub fn from_env() -> Self {
        RawConfig::default().overlay(|name| std::env::var(name).ok())
    }

    pub fn job_timeout(&self) -> Result<Option<Duration>> {
        Ok(optional_parse::<u64>(&self.job_timeout_seconds, "JOB_TIMEOUT_SECONDS")?
            .map(Duration::from_secs))
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone)]
pub struct GcsConfig {
    pub bucket: String,
    pub service_account_key: Option<String>,
    pub service_account_path: Option<String>,
}

impl fmt::Debug for GcsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsConfig")
            .field("bucket", &self.bucket)
            .field("service_account_key", &self.service_account_key.as_ref().map(|_| "<redacted>"))
            .field("service_account_path", &self.service_account_path)
            .finish()
    }
}

#[derive(Clone)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    pub access_key: Option<String>,
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Fail,
    Drop,
    Overwrite,
}

impl FromStr for ConflictPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "fail" => Ok(ConflictPolicy::Fail),
            "drop" => Ok(ConflictPolicy::Drop),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            other => Err(AppError::config(format!(
                "unsupported ON_CONFLICT value `{}` (expected fail, drop or overwrite)",
                other
            ))),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictPolicy::Fail => "fail",
            ConflictPolicy::Drop => "drop",
            ConflictPolicy::Overwrite => "overwrite",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub connection: ConnectionConfig,
    pub storage: StorageConfig,
    pub path_template: String,
    pub filename_template: String,
    pub cluster: String,
    pub backup_name: Option<String>,
    pub namespace: Option<String>,
    pub run_id: String,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub connection: ConnectionConfig,
    pub storage: StorageConfig,
    pub source_key: String,
    pub on_conflict: ConflictPolicy,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub storage: StorageConfig,
    pub prefix: String,
    pub policy: Option<RetentionPolicy>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    non_empty(value).ok_or_else(|| AppError::config(format!("{} must be set", name)))
}

fn optional_parse<T: FromStr>(value: &Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match non_empty(value) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| AppError::config(format!("invalid {} value `{}`: {}", name, raw, e))),
    }
}

// Validated here so a typo fails the job before pg_dump, psql or the
// storage client are touched. libpq gets the original spelling.
fn parse_ssl_mode(value: &Option<String>) -> Result<String> {
    let mode = non_empty(value).unwrap_or_else(|| DEFAULT_SSL_MODE.to_string());
    PgSslMode::from_str(&mode).map_err(|_| {
        AppError::config(format!(
            "unsupported DB_SSLMODE value `{}` (expected disable, allow, prefer, require, verify-ca or verify-full)",
            mode
        ))
    })?;
    Ok(mode)
}

pub fn load_connection_config(raw: &RawConfig) -> Result<ConnectionConfig> {
    Ok(ConnectionConfig {
        host: required(&raw.db_host, "DB_HOST")?,
        port: optional_parse::<u16>(&raw.db_port, "DB_PORT")?.unwrap_or(DEFAULT_PORT),
        database: required(&raw.db_name, "DB_NAME")?,
        user: required(&raw.db_user, "DB_USER")?,
        // An empty password is legitimate (trust auth), an absent one is not.
        password: raw
            .db_password
            .clone()
            .ok_or_else(|| AppError::config("DB_PASSWORD must be set"))?,
        ssl_mode: parse_ssl_mode(&raw.db_sslmode)?,
    })
}

pub fn load_storage_config(raw: &RawConfig) -> Result<StorageConfig> {
    let backend = required(&raw.storage_backend, "STORAGE_BACKEND")?;
    match backend.to_ascii_lowercase().as_str() {
        "s3" => {
            let access_key_id = non_empty(&raw.s3_access_key_id);
            let secret_access_key = non_empty(&raw.s3_secret_access_key);
            if access_key_id.is_some() != secret_access_key.is_some() {
                return Err(AppError::config(
                    "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together",
                ));
            }
            if let Some(endpoint) = non_empty(&raw.s3_endpoint) {
                url::Url::parse(&endpoint).map_err(|e| {
                    AppError::config(format!("invalid S3_ENDPOINT `{}`: {}", endpoint, e))
                })?;
            }
            Ok(StorageConfig::S3(S3Config {
                bucket: required(&raw.s3_bucket, "S3_BUCKET")?,
                region: non_empty(&raw.s3_region).unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                endpoint: non_empty(&raw.s3_endpoint),
                access_key_id,
                secret_access_key,
            }))
        }
        "gcs" => Ok(StorageConfig::Gcs(GcsConfig {
            bucket: required(&raw.gcs_bucket, "GCS_BUCKET")?,
            service_account_key: non_empty(&raw.gcs_service_account_key),
            service_account_path: non_empty(&raw.gcs_service_account_path),
        })),
        "azure" => Ok(StorageConfig::Azure(AzureConfig {
            account: required(&raw.azure_storage_account, "AZURE_STORAGE_ACCOUNT")?,
            container: required(&raw.azure_container, "AZURE_CONTAINER")?,
            access_key: non_empty(&raw.azure_storage_key),
        })),
        other => Err(AppError::config(format!(
            "unsupported STORAGE_BACKEND `{}` (expected s3, gcs or azure)",
            other
        ))),
    }
}

pub fn load_backup_config(raw: &RawConfig) -> Result<BackupConfig> {
    let connection = load_connection_config(raw)?;
    let storage = load_storage_config(raw)?;
    Ok(BackupConfig {
        connection,
        storage,
        path_template: non_empty(&raw.path_template)
            .unwrap_or_else(|| DEFAULT_PATH_TEMPLATE.to_string()),
        filename_template: non_empty(&raw.filename_template)
            .unwrap_or_else(|| DEFAULT_FILENAME_TEMPLATE.to_string()),
        cluster: required(&raw.cluster_name, "CLUSTER_NAME")?,
        backup_name: non_empty(&raw.backup_name),
        namespace: non_empty(&raw.namespace),
        run_id: non_empty(&raw.run_id).unwrap_or_else(generate_run_id),
    })
}

pub fn load_restore_config(raw: &RawConfig) -> Result<RestoreConfig> {
    let connection = load_connection_config(raw)?;
    let storage = load_storage_config(raw)?;
    let on_conflict = match non_empty(&raw.on_conflict) {
        Some(value) => value.parse()?,
        None => ConflictPolicy::Fail,
    };
    Ok(RestoreConfig {
        connection,
        storage,
        source_key: required(&raw.source_key, "SOURCE_KEY")?,
        on_conflict,
    })
}

pub fn load_retention_config(raw: &RawConfig) -> Result<RetentionConfig> {
    let storage = load_storage_config(raw)?;
    let keep_last = optional_parse::<i64>(&raw.keep_last, "KEEP_LAST")?;
    let keep_daily = optional_parse::<i64>(&raw.keep_daily, "KEEP_DAILY")?;
    let keep_weekly = optional_parse::<i64>(&raw.keep_weekly, "KEEP_WEEKLY")?;
    let keep_monthly = optional_parse::<i64>(&raw.keep_monthly, "KEEP_MONTHLY")?;

    let policy = if keep_last.is_none()
        && keep_daily.is_none()
        && keep_weekly.is_none()
        && keep_monthly.is_none()
    {
        None
    } else {
        Some(RetentionPolicy {
            keep_last,
            keep_daily,
            keep_weekly,
            keep_monthly,
        })
    };

    Ok(RetentionConfig {
        storage,
        prefix: raw.retention_prefix.clone().unwrap_or_default(),
        policy,
    })
}

fn generate_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
