use csvq_ingest::{encode_record, CodecError, DecodeError, DecoderOptions, StreamDecoder};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::broker::{BrokerChannel, BrokerError};

const PROGRESS_EVERY: u64 = 10_000;

/// Result of a fully published upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub columns: usize,
    pub published: u64,
}

/// An upload stopped early. `published` records had already been sent and stay published.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{source}")]
    Decode {
        published: u64,
        #[source]
        source: DecodeError,
    },

    #[error("{source}")]
    Encode {
        published: u64,
        #[source]
        source: CodecError,
    },

    #[error("Failed to publish record {}: {source}", .published + 1)]
    Publish {
        published: u64,
        #[source]
        source: BrokerError,
    },
}

impl IngestError {
    pub fn published(&self) -> u64 {
        match self {
            IngestError::Decode { published, .. }
            | IngestError::Encode { published, .. }
            | IngestError::Publish { published, .. } => *published,
        }
    }

    /// The upload itself was bad, as opposed to a read or broker failure.
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, IngestError::Decode { source, .. } if source.is_malformed_input())
    }
}

pub struct IngestPublisher {
    broker: Arc<dyn BrokerChannel>,
    queue: String,
    options: DecoderOptions,
}

impl IngestPublisher {
    pub fn new(
        broker: Arc<dyn BrokerChannel>,
        queue: impl Into<String>,
        options: DecoderOptions,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            options,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Decode `source` chunk by chunk and publish every record in file order. Stops at the
    /// first failure.
    #[tracing::instrument(skip(self, source), fields(queue = %self.queue))]
    pub async fn publish_upload<R>(&self, source: R) -> Result<IngestSummary, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut published = 0u64;

        let mut decoder = StreamDecoder::new(source, self.options)
            .await
            .map_err(|source| IngestError::Decode { published, source })?;
        let columns = decoder.header().len();

        loop {
            let record = match decoder.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(source) => return Err(IngestError::Decode { published, source }),
            };

            let payload =
                encode_record(&record).map_err(|source| IngestError::Encode { published, source })?;

            self.broker
                .publish(&self.queue, &payload)
                .await
                .map_err(|source| IngestError::Publish { published, source })?;

            published += 1;
            if published % PROGRESS_EVERY == 0 {
                debug!(published, "Upload progress");
            }
        }

        info!(columns, published, "Upload published");

        Ok(IngestSummary { columns, published })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    #[tokio::test]
    async fn test_malformed_classification() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = IngestPublisher::new(broker, "q", DecoderOptions::default());

        let err = publisher.publish_upload(&b""[..]).await.unwrap_err();
        assert!(err.is_malformed_input());
        assert_eq!(err.published(), 0);
    }

    #[test]
    fn test_publish_error_names_failing_record() {
        let err = IngestError::Publish {
            published: 1,
            source: BrokerError::Unavailable("down".to_string()),
        };
        assert_eq!(err.to_string(), "Failed to publish record 2: Broker unavailable: down");
        assert!(!err.is_malformed_input());
    }
}
