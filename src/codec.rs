//! Raw point wire format
//!
//! Layout of a `WriteRawSeries` payload:
//!
//! ```text
//! offset 0  : series id       u32  big-endian
//! offset 4  : timestamp nanos i64  big-endian
//! offset 12 : value stream
//! ```
//!
//! The value stream is a concatenation of `[field id:u8][type tag:u8][value]`
//! records and is decoded greedily until the end of the buffer. The type tag
//! byte is reserved so non-numeric field types can be added without changing
//! the layout.

use crate::meta::FieldValue;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Size of the fixed point header in bytes.
pub const POINT_HEADER_SIZE: usize = 12;

/// Type tag for an 8-byte IEEE 754 float.
pub const FIELD_TYPE_NUMBER: u8 = 0x00;

/// Encodes a series id and timestamp into the fixed point header.
pub fn marshal_point_header(series_id: u32, timestamp: i64) -> [u8; POINT_HEADER_SIZE] {
    let mut buf = [0u8; POINT_HEADER_SIZE];
    buf[0..4].copy_from_slice(&series_id.to_be_bytes());
    buf[4..12].copy_from_slice(&timestamp.to_be_bytes());
    buf
}

/// Decodes the fixed point header.
pub fn unmarshal_point_header(data: &[u8]) -> Result<(u32, i64)> {
    if data.len() < POINT_HEADER_SIZE {
        return Err(Error::Serialization(format!(
            "point header too short: {} bytes",
            data.len()
        )));
    }
    let series_id = u32::from_be_bytes(data[0..4].try_into().unwrap());
    let timestamp = i64::from_be_bytes(data[4..12].try_into().unwrap());
    Ok((series_id, timestamp))
}

/// Encodes field-id-keyed values into the compact value stream.
///
/// The map is ordered by field id so the encoding is deterministic across
/// replicas.
pub fn marshal_values(values: &BTreeMap<u8, FieldValue>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 10);
    for (field_id, value) in values {
        buf.push(*field_id);
        match value {
            FieldValue::Number(v) => {
                buf.push(FIELD_TYPE_NUMBER);
                buf.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
    buf
}

/// Decodes a value stream back to field-id-keyed values.
///
/// Decoding stops at a truncated record or an unrecognized type tag; records
/// decoded up to that point are kept.
pub fn unmarshal_values(data: &[u8]) -> BTreeMap<u8, FieldValue> {
    let mut values = BTreeMap::new();
    let mut rest = data;
    while rest.len() >= 2 {
        let field_id = rest[0];
        let type_tag = rest[1];
        match type_tag {
            FIELD_TYPE_NUMBER => {
                if rest.len() < 10 {
                    break;
                }
                let v = f64::from_be_bytes(rest[2..10].try_into().unwrap());
                values.insert(field_id, FieldValue::Number(v));
                rest = &rest[10..];
            }
            _ => break,
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_header_round_trip() {
        let data = marshal_point_header(42, 1_672_617_600_000_000_000);
        let (series_id, timestamp) = unmarshal_point_header(&data).unwrap();
        assert_eq!(series_id, 42);
        assert_eq!(timestamp, 1_672_617_600_000_000_000);
    }

    #[test]
    fn test_point_header_rejects_short_buffer() {
        assert!(unmarshal_point_header(&[0u8; 11]).is_err());
    }

    #[test]
    fn test_values_round_trip() {
        let values = BTreeMap::from([
            (1u8, FieldValue::Number(1.5)),
            (7u8, FieldValue::Number(-3.25)),
        ]);
        let decoded = unmarshal_values(&marshal_values(&values));
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_truncated_stream_keeps_complete_records() {
        let values = BTreeMap::from([(1u8, FieldValue::Number(2.0)), (2u8, FieldValue::Number(4.0))]);
        let mut data = marshal_values(&values);
        data.truncate(data.len() - 3);
        let decoded = unmarshal_values(&data);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get(&1), Some(&FieldValue::Number(2.0)));
    }
}
