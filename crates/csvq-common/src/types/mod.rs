//! Record types shared by the ingest and server crates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Byte-order mark some spreadsheet exports put in front of the first column name.
const BOM: char = '\u{feff}';

/// Ordered column names taken from the first line of an upload.
///
/// Column `i` names field `i` of every data line that follows. A header is fixed for the
/// lifetime of one upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    columns: Vec<String>,
}

impl Header {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    /// Parse a raw header line: strip a leading BOM, trim surrounding whitespace and split on
    /// `,`. A blank line yields an empty header.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_start_matches(BOM).trim();
        if line.is_empty() {
            return Self::default();
        }

        Self {
            columns: line.split(',').map(str::to_string).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.columns.join(","))
    }
}

/// One decoded data line as a column name to raw value mapping.
///
/// Serializes as a flat JSON object of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, String>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair header columns with line values by position.
    ///
    /// Callers check that `values` covers every column; surplus values are ignored.
    pub fn zip<'a>(header: &Header, values: impl IntoIterator<Item = &'a str>) -> Self {
        header
            .columns()
            .iter()
            .zip(values)
            .map(|(column, value)| (column.clone(), value.to_string()))
            .collect()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Record {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_strips_bom_and_whitespace() {
        let header = Header::parse("\u{feff}id,first_name,last_name \r\n");
        assert_eq!(header.columns(), ["id", "first_name", "last_name"]);
    }

    #[test]
    fn test_blank_header_is_empty() {
        assert!(Header::parse("  \r\n").is_empty());
        assert!(Header::parse("\u{feff}").is_empty());
    }

    #[test]
    fn test_zip_ignores_surplus_values() {
        let header = Header::parse("id,name");
        let record = Record::zip(&header, ["1", "Ann", "extra"]);
        assert_eq!(record, Record::from([("id", "1"), ("name", "Ann")]));
    }

    #[test]
    fn test_record_serializes_as_flat_object() {
        let record = Record::from([("id", "7"), ("first_name", "Ann")]);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"first_name":"Ann","id":"7"}"#);
    }
}
