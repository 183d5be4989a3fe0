//! Tuple codec: rows to bytes and back, against a schema.
//!
//! Layout:
//! ```text
//!   tuple_len u16 | null_bitmap u16 | flags u16 | column data...
//! ```
//! The null bitmap has one bit per column, LSB = column 0; a set bit means
//! NULL and the column contributes no data bytes. Column data follows
//! schema order. The fixed 16-bit bitmap caps tables at 16 columns,
//! enforced at CREATE TABLE.

use crate::errors::{DbError, DbResult};
use crate::schema::Schema;
use crate::types::{deserialize_value, serialize_value, Value};

/// `tuple_len | null_bitmap | flags`.
pub const TUPLE_HEADER_LEN: usize = 6;

/// Encode a row. The row must already satisfy `Schema::validate_row`.
pub fn encode(schema: &Schema, row: &[Value]) -> DbResult<Vec<u8>> {
    debug_assert_eq!(row.len(), schema.column_count());

    let mut bitmap: u16 = 0;
    let mut data = Vec::new();
    for (i, (col, value)) in schema.columns.iter().zip(row).enumerate() {
        if value.is_null() {
            bitmap |= 1 << i;
        } else {
            serialize_value(value, col.data_type, &mut data).map_err(|e| match e {
                DbError::TypeMismatch { expected, found, .. } => DbError::TypeMismatch {
                    column: col.name.clone(),
                    expected,
                    found,
                },
                other => other,
            })?;
        }
    }

    let total = TUPLE_HEADER_LEN + data.len();
    if total > u16::MAX as usize {
        return Err(DbError::StringTooLong(total));
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&bitmap.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // flags, reserved
    out.extend_from_slice(&data);
    Ok(out)
}

/// Decode a tuple previously produced by [`encode`] for the same schema.
pub fn decode(schema: &Schema, bytes: &[u8]) -> DbResult<Vec<Value>> {
    if bytes.len() < TUPLE_HEADER_LEN {
        return Err(DbError::CorruptTuple(format!(
            "tuple of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let tuple_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if tuple_len != bytes.len() {
        return Err(DbError::CorruptTuple(format!(
            "header says {tuple_len} bytes, buffer has {}",
            bytes.len()
        )));
    }
    let bitmap = u16::from_be_bytes([bytes[2], bytes[3]]);

    let mut offset = TUPLE_HEADER_LEN;
    let mut row = Vec::with_capacity(schema.column_count());
    for (i, col) in schema.columns.iter().enumerate() {
        if bitmap & (1 << i) != 0 {
            row.push(Value::Null);
            continue;
        }
        let (value, next) = deserialize_value(bytes, offset, col.data_type)?;
        row.push(value);
        offset = next;
    }
    if offset != bytes.len() {
        return Err(DbError::CorruptTuple(format!(
            "{} trailing bytes after last column",
            bytes.len() - offset
        )));
    }
    Ok(row)
}
