//! Upload ingestion: decode an uploaded CSV stream and publish one message per record.

pub mod publisher;

pub use publisher::{IngestError, IngestPublisher, IngestSummary};
