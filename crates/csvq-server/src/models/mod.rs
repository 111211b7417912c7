//! Store-side row types
//!
//! Records leave the broker as string mappings. [`PersistedRow::from_record`] coerces them into
//! the typed `csv_data` row, and [`RowFilter`] describes the equality predicates accepted by the
//! data endpoint.

use chrono::{DateTime, NaiveDateTime};
use csvq_common::Record;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use thiserror::Error;

/// Text form of stored timestamps, in requests and responses
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Value meaning "absent" in numeric source columns.
pub const NULL_SENTINEL: &str = "-1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoercionError {
    #[error("Record has no id")]
    MissingId,
}

/// One row of `csv_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PersistedRow {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email_address: Option<String>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub deleted_at: Option<NaiveDateTime>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub merged_at: Option<NaiveDateTime>,
    pub parent_user_id: Option<String>,
}

impl PersistedRow {
    /// Coerce a decoded record. Missing columns become null; timestamps are epoch
    /// milliseconds, with `-1` or non-numeric input stored as null.
    pub fn from_record(record: &Record) -> Result<Self, CoercionError> {
        let id = record
            .get("id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(CoercionError::MissingId)?;

        let text = |key: &str| record.get(key).map(str::to_string);
        let timestamp = |key: &str| record.get(key).and_then(parse_epoch_millis);

        Ok(Self {
            id: id.to_string(),
            first_name: text("first_name"),
            last_name: text("last_name"),
            email_address: text("email_address"),
            created_at: timestamp("created_at"),
            deleted_at: timestamp("deleted_at"),
            merged_at: timestamp("merged_at"),
            parent_user_id: record
                .get("parent_user_id")
                .filter(|parent| parent.trim() != NULL_SENTINEL)
                .map(str::to_string),
        })
    }
}

/// Parse an epoch-millisecond value such as `1700000000000` or `1.7e12` into a UTC timestamp
/// with second precision.
pub fn parse_epoch_millis(value: &str) -> Option<NaiveDateTime> {
    let millis: f64 = value.trim().parse().ok()?;
    if !millis.is_finite() || millis == -1.0 {
        return None;
    }

    DateTime::from_timestamp(millis as i64 / 1000, 0).map(|dt| dt.naive_utc())
}

fn serialize_timestamp<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(ts) => serializer.collect_str(&ts.format(TIMESTAMP_FORMAT)),
        None => serializer.serialize_none(),
    }
}

/// Columns the data endpoint can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterColumn {
    Id,
    FirstName,
    LastName,
    EmailAddress,
    CreatedAt,
    DeletedAt,
    ParentUserId,
}

impl FilterColumn {
    pub const ALL: [FilterColumn; 7] = [
        FilterColumn::Id,
        FilterColumn::FirstName,
        FilterColumn::LastName,
        FilterColumn::EmailAddress,
        FilterColumn::CreatedAt,
        FilterColumn::DeletedAt,
        FilterColumn::ParentUserId,
    ];

    /// Column name, identical to the query parameter name
    pub fn as_str(self) -> &'static str {
        match self {
            FilterColumn::Id => "id",
            FilterColumn::FirstName => "first_name",
            FilterColumn::LastName => "last_name",
            FilterColumn::EmailAddress => "email_address",
            FilterColumn::CreatedAt => "created_at",
            FilterColumn::DeletedAt => "deleted_at",
            FilterColumn::ParentUserId => "parent_user_id",
        }
    }

    fn is_timestamp(self) -> bool {
        matches!(self, FilterColumn::CreatedAt | FilterColumn::DeletedAt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Timestamp(NaiveDateTime),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid value '{value}' for '{column}': expected 'YYYY-MM-DD HH:MM:SS' or epoch milliseconds")]
    InvalidTimestamp { column: &'static str, value: String },
}

/// ANDed equality predicates over `csv_data`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    predicates: Vec<(FilterColumn, FilterValue)>,
}

impl RowFilter {
    /// Build a filter from query parameters. Unrecognized keys and blank values are ignored.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, FilterError> {
        let mut filter = Self::default();

        for column in FilterColumn::ALL {
            let Some(raw) = params
                .get(column.as_str())
                .filter(|raw| !raw.trim().is_empty())
            else {
                continue;
            };

            let value = if column.is_timestamp() {
                FilterValue::Timestamp(parse_timestamp_filter(raw).ok_or_else(|| {
                    FilterError::InvalidTimestamp {
                        column: column.as_str(),
                        value: raw.clone(),
                    }
                })?)
            } else {
                FilterValue::Text(raw.clone())
            };

            filter.predicates.push((column, value));
        }

        Ok(filter)
    }

    pub fn with(mut self, column: FilterColumn, value: FilterValue) -> Self {
        self.predicates.push((column, value));
        self
    }

    pub fn predicates(&self) -> &[(FilterColumn, FilterValue)] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluate the filter against a row held in memory.
    pub fn matches(&self, row: &PersistedRow) -> bool {
        self.predicates.iter().all(|(column, value)| match (column, value) {
            (FilterColumn::Id, FilterValue::Text(v)) => &row.id == v,
            (FilterColumn::FirstName, FilterValue::Text(v)) => row.first_name.as_ref() == Some(v),
            (FilterColumn::LastName, FilterValue::Text(v)) => row.last_name.as_ref() == Some(v),
            (FilterColumn::EmailAddress, FilterValue::Text(v)) => {
                row.email_address.as_ref() == Some(v)
            },
            (FilterColumn::ParentUserId, FilterValue::Text(v)) => {
                row.parent_user_id.as_ref() == Some(v)
            },
            (FilterColumn::CreatedAt, FilterValue::Timestamp(ts)) => row.created_at == Some(*ts),
            (FilterColumn::DeletedAt, FilterValue::Timestamp(ts)) => row.deleted_at == Some(*ts),
            _ => false,
        })
    }
}

fn parse_timestamp_filter(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .or_else(|| raw.parse::<i64>().ok().and_then(|_| parse_epoch_millis(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_from_record_coerces_columns() {
        let record = Record::from([
            ("id", "7"),
            ("first_name", "Ann"),
            ("created_at", "-1"),
            ("deleted_at", "1700000000000"),
            ("merged_at", "soon"),
            ("parent_user_id", "-1"),
        ]);

        let row = PersistedRow::from_record(&record).unwrap();
        assert_eq!(row.id, "7");
        assert_eq!(row.first_name.as_deref(), Some("Ann"));
        assert_eq!(row.last_name, None);
        assert_eq!(row.created_at, None);
        assert_eq!(row.deleted_at, Some(ts(2023, 11, 14, 22, 13, 20)));
        assert_eq!(row.merged_at, None);
        assert_eq!(row.parent_user_id, None);
    }

    #[test]
    fn test_missing_or_blank_id_is_rejected() {
        assert_eq!(
            PersistedRow::from_record(&Record::from([("first_name", "Ann")])),
            Err(CoercionError::MissingId)
        );
        assert_eq!(
            PersistedRow::from_record(&Record::from([("id", "  ")])),
            Err(CoercionError::MissingId)
        );
    }

    #[test]
    fn test_parse_epoch_millis() {
        assert_eq!(parse_epoch_millis("0"), Some(ts(1970, 1, 1, 0, 0, 0)));
        assert_eq!(parse_epoch_millis("1.7e12"), Some(ts(2023, 11, 14, 22, 13, 20)));
        assert_eq!(parse_epoch_millis("1700000000999"), Some(ts(2023, 11, 14, 22, 13, 20)));
        assert_eq!(parse_epoch_millis(" -1 "), None);
        assert_eq!(parse_epoch_millis("-1.0"), None);
        assert_eq!(parse_epoch_millis("-1e0"), None);
        assert_eq!(parse_epoch_millis(""), None);
        assert_eq!(parse_epoch_millis("NaN"), None);
    }

    #[test]
    fn test_row_serializes_timestamps_as_text() {
        let row = PersistedRow::from_record(&Record::from([
            ("id", "1"),
            ("created_at", "1700000000000"),
        ]))
        .unwrap();

        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["created_at"], "2023-11-14 22:13:20");
        assert!(value["deleted_at"].is_null());
    }

    #[test]
    fn test_filter_from_params() {
        let params: HashMap<String, String> = [
            ("email_address", "a@x.io"),
            ("created_at", "2023-11-14 22:13:20"),
            ("deleted_at", "1700000000000"),
            ("merged_at", "ignored"),
            ("unknown", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let filter = RowFilter::from_params(&params).unwrap();
        assert_eq!(
            filter.predicates(),
            &[
                (FilterColumn::EmailAddress, FilterValue::Text("a@x.io".to_string())),
                (FilterColumn::CreatedAt, FilterValue::Timestamp(ts(2023, 11, 14, 22, 13, 20))),
                (FilterColumn::DeletedAt, FilterValue::Timestamp(ts(2023, 11, 14, 22, 13, 20))),
            ]
        );
    }

    #[test]
    fn test_filter_skips_blank_values() {
        let params: HashMap<String, String> = [("created_at", ""), ("first_name", "  "), ("id", "4")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let filter = RowFilter::from_params(&params).unwrap();
        assert_eq!(
            filter.predicates(),
            &[(FilterColumn::Id, FilterValue::Text("4".to_string()))]
        );
    }

    #[test]
    fn test_filter_rejects_bad_timestamp() {
        let params = HashMap::from([("created_at".to_string(), "yesterday".to_string())]);
        assert!(matches!(
            RowFilter::from_params(&params),
            Err(FilterError::InvalidTimestamp { column: "created_at", .. })
        ));
    }

    #[test]
    fn test_filter_matches_row() {
        let row = PersistedRow::from_record(&Record::from([
            ("id", "1"),
            ("last_name", "Bo"),
            ("created_at", "1700000000000"),
        ]))
        .unwrap();

        assert!(RowFilter::default().matches(&row));
        assert!(RowFilter::default()
            .with(FilterColumn::LastName, FilterValue::Text("Bo".to_string()))
            .with(FilterColumn::CreatedAt, FilterValue::Timestamp(ts(2023, 11, 14, 22, 13, 20)))
            .matches(&row));
        assert!(!RowFilter::default()
            .with(FilterColumn::FirstName, FilterValue::Text("Bo".to_string()))
            .matches(&row));
    }
}
