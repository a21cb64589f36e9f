//! Durable persistence for the upload queue.
//!
//! The queue is always written whole under a single collection key, so a
//! crash leaves either the previous or the next snapshot behind.

use crate::config::StoreConfig;
use crate::record::MediaRecord;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Errors surfaced by a durable store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("stored queue could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Whole-queue persistence contract used by the queue engine
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Load the persisted queue; empty when nothing was ever saved
    async fn load(&self) -> Result<Vec<MediaRecord>, StoreError>;

    /// Replace the persisted queue with `queue`
    async fn save(&self, queue: &[MediaRecord]) -> Result<(), StoreError>;

    /// Round trip used by the readiness endpoint
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// SQLite-backed store keeping the queue as one JSON document
pub struct SqliteStore {
    pool: SqlitePool,
    collection: String,
}

impl SqliteStore {
    /// Open (creating if missing) the database described by `config`
    pub async fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            // in-memory databases live only as long as their connection
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        info!(
            database_url = %config.database_url,
            collection = %config.collection,
            "Connected to queue database"
        );

        let store = Self {
            pool,
            collection: config.collection.clone(),
        };

        if config.run_migrations {
            store.run_migrations().await?;
        }

        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running queue database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Collection key the queue is stored under
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    #[instrument(skip(self), fields(collection = %self.collection))]
    async fn load(&self) -> Result<Vec<MediaRecord>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?1")
            .bind(&self.collection)
            .fetch_optional(&self.pool)
            .await?;

        let queue = match row {
            Some((value,)) => serde_json::from_str(&value)?,
            None => Vec::new(),
        };

        debug!(records = queue.len(), "Loaded upload queue");
        Ok(queue)
    }

    #[instrument(skip(self, queue), fields(collection = %self.collection, records = queue.len()))]
    async fn save(&self, queue: &[MediaRecord]) -> Result<(), StoreError> {
        let value = serde_json::to_string(queue)?;

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.collection)
        .bind(&value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(size_bytes = value.len(), "Saved upload queue");
        metrics::counter!("uploader.store.saves").increment(1);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Process-local store, serialized the same way as the SQLite backend
#[derive(Default)]
pub struct MemoryStore {
    value: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already persisted queue
    pub fn with_queue(queue: &[MediaRecord]) -> Result<Self, StoreError> {
        Ok(Self {
            value: Mutex::new(Some(serde_json::to_string(queue)?)),
        })
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load(&self) -> Result<Vec<MediaRecord>, StoreError> {
        match self.value.lock().await.as_deref() {
            Some(value) => Ok(serde_json::from_str(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, queue: &[MediaRecord]) -> Result<(), StoreError> {
        let value = serde_json::to_string(queue)?;
        *self.value.lock().await = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordId;
    use chrono::TimeZone;

    fn record(id: i64) -> MediaRecord {
        MediaRecord::new(
            RecordId(id),
            format!("payload-{id}").as_bytes(),
            "image/png",
            None,
            Utc.timestamp_millis_opt(id).unwrap(),
        )
    }

    fn memory_config() -> StoreConfig {
        StoreConfig {
            database_url: "sqlite::memory:".to_string(),
            ..StoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sqlite_load_on_first_run_is_empty() {
        let store = SqliteStore::new(&memory_config()).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_save_replaces_whole_queue() {
        let store = SqliteStore::new(&memory_config()).await.unwrap();

        store.save(&[record(1), record(2), record(3)]).await.unwrap();
        store.save(&[record(2), record(3)]).await.unwrap();

        let ids: Vec<_> = store.load().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RecordId(2), RecordId(3)]);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            database_url: format!("sqlite://{}", dir.path().join("queue.db").display()),
            ..StoreConfig::default()
        };

        {
            let store = SqliteStore::new(&config).await.unwrap();
            store.save(&[record(10), record(11)]).await.unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteStore::new(&config).await.unwrap();
        let queue = reopened.load().await.unwrap();
        assert_eq!(queue, vec![record(10), record(11)]);
    }

    #[tokio::test]
    async fn test_sqlite_collections_are_isolated() {
        let store = SqliteStore::new(&memory_config()).await.unwrap();
        store.save(&[record(1)]).await.unwrap();

        let other = SqliteStore {
            pool: store.pool.clone(),
            collection: "otherQueue".to_string(),
        };
        assert!(other.load().await.unwrap().is_empty());
        assert_eq!(store.collection(), "uploadQueue");
    }

    #[tokio::test]
    async fn test_sqlite_corrupt_snapshot_is_an_error() {
        let store = SqliteStore::new(&memory_config()).await.unwrap();
        sqlx::query("INSERT INTO kv_store (key, value, updated_at) VALUES ('uploadQueue', 'not json', 0)")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(matches!(
            store.load().await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::with_queue(&[record(1)]).unwrap();
        assert_eq!(store.load().await.unwrap(), vec![record(1)]);

        store.save(&[]).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
