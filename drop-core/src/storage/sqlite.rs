use crate::error::{ConfigError, StoreError};
use crate::storage::KeyValueStore;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub total_reads: AtomicU64,
    pub total_writes: AtomicU64,
    pub total_errors: AtomicU64,
}

/// SQLite-backed key-value store.
///
/// One `kv_store` table holds phase records, allow-lists and commitments.
/// The `action_log` table is written by [`super::SqliteRecordSink`] through
/// the same pool.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    metrics: StoreMetrics,
}

impl SqliteStore {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

    pub async fn new(db_path: &str) -> Result<Self> {
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path).map_err(|e| ConfigError::IoError {
                path: db_path.to_string(),
                msg: e.to_string(),
            })?;
            info!("Created new database file: {}", db_path);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_millis(Self::DEFAULT_TIMEOUT_MS))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{}", db_path))
            .await
            .map_err(|e| StoreError::Backend {
                key: db_path.to_string(),
                msg: e.to_string(),
            })?;

        let store = Self {
            pool,
            metrics: StoreMetrics::default(),
        };
        store.init_schema().await?;
        info!("Drop store opened at {} (WAL Mode)", db_path);
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY,
                actor TEXT,
                action TEXT,
                payload TEXT,
                timestamp INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_action_log_actor ON action_log(actor);
            CREATE INDEX IF NOT EXISTS idx_action_log_action ON action_log(action);",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend {
            key: "schema".to_string(),
            msg: e.to_string(),
        })?;

        debug!("Drop store schema initialized.");
        Ok(())
    }

    /// Shared pool, used to attach a record sink to the same database.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn backend_error(&self, key: &str, e: sqlx::Error) -> StoreError {
        self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
        StoreError::Backend {
            key: key.to_string(),
            msg: e.to_string(),
        }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.metrics.total_reads.fetch_add(1, Ordering::SeqCst);
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.backend_error(key, e))?;

        match row {
            Some(row) => {
                let value: Vec<u8> = row
                    .try_get("value")
                    .map_err(|e| self.backend_error(key, e))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.metrics.total_writes.fetch_add(1, Ordering::SeqCst);
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| self.backend_error(key, e))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.metrics.total_writes.fetch_add(1, Ordering::SeqCst);
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_error(key, e))?;
        Ok(())
    }
}
