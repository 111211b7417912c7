//! csvq server library
//!
//! Accepts CSV uploads over HTTP, publishes one queue message per record, consumes the queue
//! into PostgreSQL (mirroring each record into Redis), and serves the stored rows back.
//!
//! # Architecture
//!
//! ```text
//! POST /api/v1/upload -> IngestPublisher -> BrokerChannel -> RecordConsumer -> RecordStore
//!                                                                           \-> RecordCache
//! GET  /api/v1/data   -> RecordStore
//! ```
//!
//! - [`ingest`]: chunked decoding of the upload and publishing, inline in the request
//! - [`broker`]: queue abstraction with AMQP and in-process implementations
//! - [`consumer`]: worker pool settling each delivery with ack or nack
//! - [`db`] / [`cache`]: the system of record and its best-effort mirror
//! - [`features`]: HTTP handlers
//!
//! # Example
//!
//! ```no_run
//! use csvq_server::{api, broker, config::Config, db, features::FeatureState};
//! use csvq_server::ingest::IngestPublisher;
//! use csvq_ingest::DecoderOptions;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     let broker = broker::connect(&config.broker).await?;
//!     broker.declare_queue(&config.broker.queue).await?;
//!
//!     let state = FeatureState {
//!         store: Arc::new(db::PgRecordStore::new(pool)),
//!         publisher: Arc::new(IngestPublisher::new(
//!             broker,
//!             config.broker.queue.clone(),
//!             DecoderOptions::default(),
//!         )),
//!         max_upload_bytes: config.ingest.max_upload_bytes,
//!     };
//!
//!     let app = api::create_router(state, &config.cors);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod api;
pub mod broker;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod features;
pub mod ingest;
pub mod middleware;
pub mod models;

// Re-export commonly used types
pub use error::{AppError, AppResult};
