//! csvq Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! The producer half of the record pipeline:
//!
//! - **decoder**: [`StreamDecoder`] turns a chunked byte source into header-keyed records
//! - **codec**: the JSON payload a record travels in through the broker, and its inverse
//!
//! # Example
//!
//! ```no_run
//! use csvq_ingest::{codec, DecoderOptions, StreamDecoder};
//!
//! # async fn run(file: tokio::fs::File) -> anyhow::Result<()> {
//! let mut decoder = StreamDecoder::new(file, DecoderOptions::default()).await?;
//! while let Some(record) = decoder.next_record().await? {
//!     let payload = codec::encode_record(&record)?;
//!     // hand `payload` to the broker
//! #   let _ = payload;
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod decoder;

pub use codec::{decode_payload, encode_record, CodecError, DecodedPayload};
pub use decoder::{DecodeError, DecoderOptions, StreamDecoder};
