//! Feature modules implementing the csvq API
//!
//! Each feature is a vertical slice with its own queries and routes:
//!
//! - **records**: CSV upload onto the record queue and listing of stored rows

pub mod records;

use axum::Router;
use std::sync::Arc;

use crate::db::RecordStore;
use crate::ingest::IngestPublisher;

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    /// System of record for consumed rows
    pub store: Arc<dyn RecordStore>,
    /// Publishes uploads onto the record queue
    pub publisher: Arc<IngestPublisher>,
    /// Request body limit for uploads
    pub max_upload_bytes: usize,
}

/// Creates the API router with all feature routes mounted. Served under `/api/v1`.
pub fn router(state: FeatureState) -> Router<()> {
    let records_state = records::RecordsState {
        store: state.store,
        publisher: state.publisher,
    };

    Router::new().merge(records::records_routes(state.max_upload_bytes).with_state(records_state))
}
