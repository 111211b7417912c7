//! Shared fixtures: in-memory store and cache, and a wired-up pipeline on the in-process broker.

#![allow(dead_code)]

use async_trait::async_trait;
use csvq_ingest::DecoderOptions;
use csvq_server::{
    broker::InMemoryBroker,
    cache::{CacheError, RecordCache},
    consumer::{ConsumerSettings, RecordConsumer},
    db::{DbError, DbResult, RecordStore},
    features::FeatureState,
    ingest::IngestPublisher,
    models::{PersistedRow, RowFilter},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const QUEUE: &str = "csv_records";

/// Store backed by a map keyed on id, so rows come back ordered by id.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, PersistedRow>>,
    /// Ids whose upsert fails
    failing_ids: Vec<String>,
    down: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(ids: &[&str]) -> Self {
        Self {
            failing_ids: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn down() -> Self {
        Self {
            down: true,
            ..Self::default()
        }
    }

    pub async fn rows(&self) -> Vec<PersistedRow> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn insert(&self, row: PersistedRow) {
        self.rows.lock().await.insert(row.id.clone(), row);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, row: &PersistedRow) -> DbResult<()> {
        if self.down || self.failing_ids.contains(&row.id) {
            return Err(DbError::unavailable(format!("cannot store {}", row.id)));
        }
        self.rows.lock().await.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn query(
        &self,
        filter: &RowFilter,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<PersistedRow>> {
        if self.down {
            return Err(DbError::unavailable("store is down"));
        }
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|row| filter.matches(row))
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> DbResult<()> {
        if self.down {
            return Err(DbError::unavailable("store is down"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, (String, Duration)>>,
    down: bool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn down() -> Self {
        Self {
            down: true,
            ..Self::default()
        }
    }

    pub async fn get(&self, key: &str) -> Option<(String, Duration)> {
        self.entries.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl RecordCache for MemoryCache {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        if self.down {
            return Err(CacheError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }
}

pub fn settings(workers: usize) -> ConsumerSettings {
    ConsumerSettings {
        queue: QUEUE.to_string(),
        workers,
        cache_ttl: Duration::from_secs(3600),
        resubscribe_delay: Duration::from_millis(10),
    }
}

/// Broker, store and cache wired the way the binary wires them.
pub struct Pipeline {
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
}

impl Pipeline {
    pub async fn new(broker: InMemoryBroker, store: MemoryStore, cache: MemoryCache) -> Self {
        use csvq_server::broker::BrokerChannel;

        broker.declare_queue(QUEUE).await.unwrap();
        Self {
            broker: Arc::new(broker),
            store: Arc::new(store),
            cache: Arc::new(cache),
        }
    }

    pub async fn standard() -> Self {
        Self::new(InMemoryBroker::recording(), MemoryStore::new(), MemoryCache::new()).await
    }

    pub fn publisher(&self, chunk_size: usize) -> IngestPublisher {
        IngestPublisher::new(
            self.broker.clone(),
            QUEUE,
            DecoderOptions {
                chunk_size,
                ..DecoderOptions::default()
            },
        )
    }

    pub fn consumer(&self, workers: usize) -> RecordConsumer {
        RecordConsumer::new(
            self.broker.clone(),
            self.store.clone(),
            self.cache.clone(),
            settings(workers),
        )
    }

    pub fn feature_state(&self) -> FeatureState {
        FeatureState {
            store: self.store.clone(),
            publisher: Arc::new(self.publisher(16)),
            max_upload_bytes: 1024 * 1024,
        }
    }
}

/// Poll until `check` holds, giving background tasks time to run.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
