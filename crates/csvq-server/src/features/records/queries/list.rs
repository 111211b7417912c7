use serde::{de, Deserialize, Deserializer};
use std::collections::HashMap;

use crate::db::{DbError, RecordStore};
use crate::models::{FilterError, PersistedRow, RowFilter};

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;

/// Paging parameters of the data endpoint. Blank values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Paging {
    #[serde(default, deserialize_with = "blank_as_none")]
    pub limit: Option<i64>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRowsQuery {
    pub paging: Paging,
    pub filter: RowFilter,
}

#[derive(Debug, thiserror::Error)]
pub enum ListRowsError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl ListRowsQuery {
    /// Combine paging with the filter columns found in `params`; other keys are ignored.
    pub fn new(paging: Paging, params: &HashMap<String, String>) -> Result<Self, ListRowsError> {
        Ok(Self {
            paging,
            filter: RowFilter::from_params(params)?,
        })
    }

    pub fn limit(&self) -> i64 {
        self.paging.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.paging.offset.unwrap_or(0).max(0)
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| {
            de::Error::custom(format!("invalid value '{value}': expected an integer"))
        }),
    }
}

#[tracing::instrument(skip(store))]
pub async fn handle(
    store: &dyn RecordStore,
    query: &ListRowsQuery,
) -> Result<Vec<PersistedRow>, ListRowsError> {
    let rows = store
        .query(&query.filter, query.limit(), query.offset())
        .await?;

    tracing::debug!(count = rows.len(), "Rows listed");
    Ok(rows)
}
