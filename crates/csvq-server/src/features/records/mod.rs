//! CSV upload and stored-row listing

pub mod queries;
pub mod routes;

use std::sync::Arc;

use crate::db::RecordStore;
use crate::ingest::IngestPublisher;

pub use queries::{ListRowsError, ListRowsQuery};
pub use routes::records_routes;

#[derive(Clone)]
pub struct RecordsState {
    pub store: Arc<dyn RecordStore>,
    pub publisher: Arc<IngestPublisher>,
}
