//! Broker payload codec
//!
//! A record travels as its JSON object text wrapped in one JSON string:
//!
//! ```text
//! "{\"first_name\":\"Ann\",\"id\":\"1\"}"
//! ```
//!
//! Consumers unwrap the envelope before parsing the mapping. A bare JSON object is accepted as
//! well, so messages published by tools that skip the envelope still decode.

use csvq_common::Record;
use serde_json::Value;

/// Content type set on published messages.
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to serialize record: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Payload is not a flat mapping of strings: {0}")]
    NotAMapping(#[source] serde_json::Error),
}

/// A payload after the envelope has been removed.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    /// JSON object text of the record, as mirrored into the cache
    pub raw: String,
    pub record: Record,
}

pub fn encode_record(record: &Record) -> Result<Vec<u8>, CodecError> {
    let object = serde_json::to_string(record).map_err(CodecError::Serialize)?;
    serde_json::to_vec(&object).map_err(CodecError::Serialize)
}

pub fn decode_payload(payload: &[u8]) -> Result<DecodedPayload, CodecError> {
    let value: Value = serde_json::from_slice(payload).map_err(CodecError::InvalidJson)?;

    match value {
        Value::String(raw) => {
            let record = serde_json::from_str(&raw).map_err(CodecError::NotAMapping)?;
            Ok(DecodedPayload { raw, record })
        },
        other => {
            let raw = String::from_utf8_lossy(payload).trim().to_string();
            let record = serde_json::from_value(other).map_err(CodecError::NotAMapping)?;
            Ok(DecodedPayload { raw, record })
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let record = Record::from([
            ("id", "1"),
            ("first_name", "Ann"),
            ("last_name", "O\"Neil, \\ Jr"),
        ]);

        let payload = encode_record(&record).unwrap();
        let decoded = decode_payload(&payload).unwrap();

        assert_eq!(decoded.record, record);
        assert_eq!(decoded.raw, serde_json::to_string(&record).unwrap());
    }

    #[test]
    fn test_payload_is_string_envelope() {
        let payload = encode_record(&Record::from([("id", "7")])).unwrap();
        assert_eq!(payload, br#""{\"id\":\"7\"}""#.to_vec());
    }

    #[test]
    fn test_bare_object_is_accepted() {
        let payload = br#"{"id":"7","created_at":"-1","deleted_at":"1700000000000"}"#;
        let decoded = decode_payload(payload).unwrap();

        assert_eq!(decoded.record.get("id"), Some("7"));
        assert_eq!(decoded.record.get("created_at"), Some("-1"));
        assert_eq!(decoded.raw, String::from_utf8(payload.to_vec()).unwrap());
    }

    #[test]
    fn test_garbage_is_invalid_json() {
        assert!(matches!(decode_payload(b"{not json"), Err(CodecError::InvalidJson(_))));
        assert!(matches!(decode_payload(b""), Err(CodecError::InvalidJson(_))));
    }

    #[test]
    fn test_non_string_values_are_rejected() {
        assert!(matches!(
            decode_payload(br#"{"id":7}"#),
            Err(CodecError::NotAMapping(_))
        ));
        assert!(matches!(
            decode_payload(br#""[1,2]""#),
            Err(CodecError::NotAMapping(_))
        ));
    }
}
