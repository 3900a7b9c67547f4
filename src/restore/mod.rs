// pgvault/src/restore/mod.rs
pub(crate) mod db_restore;

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{ConflictPolicy, RestoreConfig};
use crate::errors::{AppError, Result};
use crate::storage::{self, StorageClient};
use db_restore::{PgAdmin, PsqlRestore, Restorer, TargetDatabase};

/// Databases the `drop` policy refuses to touch.
pub const SYSTEM_DATABASES: [&str; 3] = ["postgres", "template0", "template1"];

/// Decompression is decided by name only.
pub fn is_gzip_key(key: &str) -> bool {
    key.ends_with(".gz")
}

pub struct RestoreRunner {
    storage: Arc<dyn StorageClient>,
    database: Arc<dyn TargetDatabase>,
    restorer: Arc<dyn Restorer>,
}

impl RestoreRunner {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        database: Arc<dyn TargetDatabase>,
        restorer: Arc<dyn Restorer>,
    ) -> Self {
        Self {
            storage,
            database,
            restorer,
        }
    }

    /// Runs the conflict step for `policy` against `database`. Must complete
    /// before anything is downloaded or replayed.
    pub async fn resolve_conflict(&self, database: &str, policy: ConflictPolicy) -> Result<()> {
        match policy {
            ConflictPolicy::Fail => {
                let tables = self.database.table_count(database).await?;
                if tables > 0 {
                    return Err(AppError::Conflict(format!(
                        "target database '{}' already contains {} table(s) and on_conflict is '{}'",
                        database, tables, policy
                    )));
                }
                info!(database, "target database is empty");
            }
            ConflictPolicy::Drop => {
                if SYSTEM_DATABASES.iter().any(|s| database.eq_ignore_ascii_case(s)) {
                    return Err(AppError::Conflict(format!(
                        "refusing to drop '{}': it is a critical system database",
                        database
                    )));
                }
                match self.database.terminate_connections(database).await {
                    Ok(terminated) => info!(database, terminated, "terminated active connections"),
                    Err(err) => warn!(
                        database,
                        error = %err,
                        "failed to terminate connections, continuing with drop"
                    ),
                }
                self.database.drop_database(database).await?;
                self.database.create_database(database).await?;
            }
            ConflictPolicy::Overwrite => {
                info!(database, "on_conflict is overwrite, restoring over existing objects");
            }
        }
        Ok(())
    }

    pub async fn execute(&self, config: &RestoreConfig) -> Result<u64> {
        let started = Instant::now();
        let database = &config.connection.database;
        info!(
            source = %config.source_key,
            database = %database,
            on_conflict = %config.on_conflict,
            provider = self.storage.provider(),
            "starting restore"
        );

        self.resolve_conflict(database, config.on_conflict).await?;

        let reader = self.storage.download(&config.source_key).await?;
        let gunzip = is_gzip_key(&config.source_key);
        let stop_on_error = config.on_conflict != ConflictPolicy::Overwrite;

        let written = self
            .restorer
            .restore(&config.connection, reader, gunzip, stop_on_error)
            .await?;

        info!(
            source = %config.source_key,
            database = %database,
            bytes = written,
            duration_ms = started.elapsed().as_millis() as u64,
            "✅ restore completed"
        );
        Ok(written)
    }
}

/// Entry point for the restore job.
pub async fn run_restore(config: &RestoreConfig) -> Result<u64> {
    let restorer = PsqlRestore::locate()?;
    let storage = storage::connect(&config.storage).await?;
    let database = PgAdmin::new(config.connection.clone());
    RestoreRunner::new(storage, Arc::new(database), Arc::new(restorer))
        .execute(config)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, S3Config, StorageConfig};
    use crate::storage::ObjectReader;
    use crate::storage::memory::MemoryStorage;
    use async_trait::async_trait;
    use flate2::Compression;
    use flate2::read::MultiGzDecoder;
    use flate2::write::GzEncoder;
    use std::io::{Read, Write};
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct RecordingDatabase {
        tables: i64,
        terminate_fails: bool,
        drop_fails: bool,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingDatabase {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TargetDatabase for RecordingDatabase {
        async fn table_count(&self, database: &str) -> Result<i64> {
            self.record(format!("count {}", database));
            Ok(self.tables)
        }

        async fn terminate_connections(&self, database: &str) -> Result<u64> {
            self.record(format!("terminate {}", database));
            if self.terminate_fails {
                return Err(AppError::Database(sqlx::Error::Protocol(
                    "permission denied to terminate process".into(),
                )));
            }
            Ok(2)
        }

        async fn drop_database(&self, database: &str) -> Result<()> {
            self.record(format!("drop {}", database));
            if self.drop_fails {
                return Err(AppError::Database(sqlx::Error::Protocol(
                    "database is being accessed by other users".into(),
                )));
            }
            Ok(())
        }

        async fn create_database(&self, database: &str) -> Result<()> {
            self.record(format!("create {}", database));
            Ok(())
        }
    }

    /// Captures what would have been piped into psql.
    #[derive(Default)]
    struct CapturingRestorer {
        received: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    #[async_trait]
    impl Restorer for CapturingRestorer {
        async fn restore(
            &self,
            _connection: &ConnectionConfig,
            mut input: ObjectReader,
            gunzip: bool,
            stop_on_error: bool,
        ) -> Result<u64> {
            let mut raw = Vec::new();
            input.read_to_end(&mut raw).await?;
            let sql = if gunzip {
                let mut out = Vec::new();
                MultiGzDecoder::new(&raw[..]).read_to_end(&mut out)?;
                out
            } else {
                raw
            };
            let len = sql.len() as u64;
            self.received.lock().unwrap().push((sql, stop_on_error));
            Ok(len)
        }
    }

    fn config(key: &str, on_conflict: ConflictPolicy) -> RestoreConfig {
        RestoreConfig {
            connection: ConnectionConfig {
                host: "pg".into(),
                port: 5432,
                database: "orders".into(),
                user: "postgres".into(),
                password: "secret".into(),
                ssl_mode: "prefer".into(),
            },
            storage: StorageConfig::S3(S3Config {
                bucket: "backups".into(),
                region: "us-east-1".into(),
                endpoint: None,
                access_key_id: None,
                secret_access_key: None,
            }),
            source_key: key.into(),
            on_conflict,
        }
    }

    fn gzipped(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        database: Arc<RecordingDatabase>,
        restorer: Arc<CapturingRestorer>,
    }

    impl Fixture {
        fn new(database: RecordingDatabase) -> Self {
            let storage = Arc::new(MemoryStorage::new());
            storage.insert("prod/orders/20260120-143022.sql.gz", &gzipped(b"CREATE TABLE t();"), None);
            storage.insert("prod/orders/20260120-143022.sql", b"CREATE TABLE plain();", None);
            Self {
                storage,
                database: Arc::new(database),
                restorer: Arc::new(CapturingRestorer::default()),
            }
        }

        fn runner(&self) -> RestoreRunner {
            RestoreRunner::new(self.storage.clone(), self.database.clone(), self.restorer.clone())
        }

        fn received(&self) -> Vec<(Vec<u8>, bool)> {
            self.restorer.received.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_fail_policy_aborts_on_non_empty_database() {
        let fixture = Fixture::new(RecordingDatabase {
            tables: 1,
            ..Default::default()
        });
        let err = fixture
            .runner()
            .execute(&config("prod/orders/20260120-143022.sql.gz", ConflictPolicy::Fail))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Conflict(ref msg) if msg.contains("fail")));
        assert_eq!(fixture.database.calls(), vec!["count orders"]);
        assert_eq!(fixture.storage.downloads(), 0);
        assert!(fixture.received().is_empty());
    }

    #[tokio::test]
    async fn test_fail_policy_restores_into_empty_database() -> anyhow::Result<()> {
        let fixture = Fixture::new(RecordingDatabase::default());
        let written = fixture
            .runner()
            .execute(&config("prod/orders/20260120-143022.sql.gz", ConflictPolicy::Fail))
            .await?;

        assert_eq!(written, 17);
        assert_eq!(fixture.received(), vec![(b"CREATE TABLE t();".to_vec(), true)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_policy_order_survives_terminate_failure() -> anyhow::Result<()> {
        let fixture = Fixture::new(RecordingDatabase {
            tables: 12,
            terminate_fails: true,
            ..Default::default()
        });
        fixture
            .runner()
            .execute(&config("prod/orders/20260120-143022.sql.gz", ConflictPolicy::Drop))
            .await?;

        assert_eq!(
            fixture.database.calls(),
            vec!["terminate orders", "drop orders", "create orders"]
        );
        assert_eq!(fixture.received().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_failure_is_fatal() {
        let fixture = Fixture::new(RecordingDatabase {
            drop_fails: true,
            ..Default::default()
        });
        let result = fixture
            .runner()
            .execute(&config("prod/orders/20260120-143022.sql.gz", ConflictPolicy::Drop))
            .await;

        assert!(matches!(result, Err(AppError::Database(_))));
        assert_eq!(fixture.database.calls(), vec!["terminate orders", "drop orders"]);
        assert_eq!(fixture.storage.downloads(), 0);
    }

    #[tokio::test]
    async fn test_drop_refuses_system_databases() {
        let fixture = Fixture::new(RecordingDatabase::default());
        for name in ["postgres", "template0", "TEMPLATE1"] {
            let mut cfg = config("prod/orders/20260120-143022.sql.gz", ConflictPolicy::Drop);
            cfg.connection.database = name.into();
            let result = fixture.runner().execute(&cfg).await;
            assert!(matches!(result, Err(AppError::Conflict(_))), "{} was not refused", name);
        }
        assert!(fixture.database.calls().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_skips_database_checks() -> anyhow::Result<()> {
        let fixture = Fixture::new(RecordingDatabase {
            tables: 40,
            ..Default::default()
        });
        fixture
            .runner()
            .execute(&config("prod/orders/20260120-143022.sql", ConflictPolicy::Overwrite))
            .await?;

        assert!(fixture.database.calls().is_empty());
        assert_eq!(fixture.received(), vec![(b"CREATE TABLE plain();".to_vec(), false)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_key_is_a_storage_error() {
        let fixture = Fixture::new(RecordingDatabase::default());
        let result = fixture
            .runner()
            .execute(&config("prod/orders/missing.sql.gz", ConflictPolicy::Overwrite))
            .await;

        assert!(matches!(result, Err(AppError::Storage(crate::storage::StorageError::NotFound { .. }))));
        assert!(fixture.received().is_empty());
    }

    #[test]
    fn test_gzip_detection_is_name_based() {
        assert!(is_gzip_key("prod/orders/20260120-143022.sql.gz"));
        assert!(!is_gzip_key("prod/orders/20260120-143022.sql"));
        assert!(!is_gzip_key("prod/orders/20260120-143022.gz.sql"));
    }
}
