//! Record consumer
//!
//! Drains the record queue into the store. Each delivery ends settled one way or the other:
//!
//! 1. decode the payload, nack without requeue on failure
//! 2. coerce and upsert the row, nack without requeue on failure
//! 3. mirror the raw record into the cache, logging any failure
//! 4. ack
//!
//! Workers share a single subscription. When it ends the consumer subscribes again after a
//! delay, until the shutdown token is cancelled.

use csvq_ingest::{decode_payload, CodecError};
use futures::{future::join_all, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, BrokerResult, Delivery, DeliveryStream};
use crate::cache::RecordCache;
use crate::config::Config;
use crate::db::{DbError, RecordStore};
use crate::models::{CoercionError, PersistedRow};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub workers: usize,
    pub cache_ttl: Duration,
    pub resubscribe_delay: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.broker.queue.clone(),
            workers: config.consumer.workers.max(1),
            cache_ttl: config.cache.ttl(),
            resubscribe_delay: config.broker.reconnect_delay(),
        }
    }
}

/// Why a delivery was rejected
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Undecodable payload: {0}")]
    Payload(#[from] CodecError),

    #[error("Unusable record: {0}")]
    Coercion(#[from] CoercionError),

    #[error("Failed to store record: {0}")]
    Store(#[from] DbError),
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Rejected,
}

pub struct RecordConsumer {
    broker: Arc<dyn BrokerChannel>,
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn RecordCache>,
    settings: ConsumerSettings,
}

impl RecordConsumer {
    pub fn new(
        broker: Arc<dyn BrokerChannel>,
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn RecordCache>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            broker,
            store,
            cache,
            settings,
        }
    }

    /// Persist one delivery and settle it. An error means settling itself failed.
    #[tracing::instrument(skip(self, delivery), fields(tag = delivery.delivery_tag))]
    pub async fn process_delivery(&self, delivery: Delivery) -> BrokerResult<Outcome> {
        match self.persist(&delivery.payload).await {
            Ok(id) => {
                delivery.ack().await?;
                debug!(id = %id, "Record stored");
                Ok(Outcome::Acked)
            },
            Err(e) => {
                warn!(error = %e, "Rejecting delivery");
                delivery.nack(false).await?;
                Ok(Outcome::Rejected)
            },
        }
    }

    async fn persist(&self, payload: &[u8]) -> Result<String, ConsumerError> {
        let decoded = decode_payload(payload)?;
        let row = PersistedRow::from_record(&decoded.record)?;

        self.store.upsert(&row).await?;

        if let Err(e) = self
            .cache
            .put(&row.id, &decoded.raw, self.settings.cache_ttl)
            .await
        {
            warn!(id = %row.id, error = %e, "Failed to cache record");
        }

        Ok(row.id)
    }

    /// Consume until `shutdown` is cancelled. A delivery already being processed is settled
    /// before returning.
    pub async fn run(self, shutdown: CancellationToken) {
        let consumer = Arc::new(self);
        let queue = consumer.settings.queue.clone();

        info!(queue = %queue, workers = consumer.settings.workers, "Record consumer started");

        loop {
            let subscription = tokio::select! {
                _ = shutdown.cancelled() => break,
                subscription = consumer.broker.consume(&queue) => subscription,
            };

            match subscription {
                Ok(stream) => {
                    consumer.drain(stream, &shutdown).await;
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(queue = %queue, "Delivery stream ended");
                },
                Err(e) => error!(queue = %queue, error = %e, "Failed to subscribe"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(consumer.settings.resubscribe_delay) => {
                    info!(queue = %queue, "Resubscribing");
                },
            }
        }

        info!(queue = %queue, "Record consumer stopped");
    }

    async fn drain(self: &Arc<Self>, stream: DeliveryStream, shutdown: &CancellationToken) {
        let stream = Arc::new(Mutex::new(stream));

        let workers = (0..self.settings.workers).map(|worker| {
            let consumer = Arc::clone(self);
            let stream = Arc::clone(&stream);
            let shutdown = shutdown.clone();
            async move { consumer.work(worker, stream, shutdown).await }
        });

        join_all(workers).await;
    }

    async fn work(
        &self,
        worker: usize,
        stream: Arc<Mutex<DeliveryStream>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = async { stream.lock().await.next().await } => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Err(e) = self.process_delivery(delivery).await {
                        error!(worker, error = %e, "Failed to settle delivery");
                    }
                },
                Some(Err(e)) => {
                    error!(worker, error = %e, "Delivery stream failed");
                    return;
                },
                None => return,
            }
        }
    }
}
