//! Best-effort record cache
//!
//! The consumer mirrors every stored record's JSON into Redis under its id. The store stays
//! authoritative; cache failures are logged by the caller and never fail a delivery.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;

use crate::config::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait RecordCache: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}

/// Redis-backed cache. The connection manager reconnects on its own after failures.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        tracing::info!(url = %config.url, "Connected to Redis");

        Ok(Self { connection })
    }
}

#[async_trait]
impl RecordCache for RedisCache {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        connection
            .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }
}
