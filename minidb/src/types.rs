//! The data type system: five column types plus the NULL sentinel, with
//! big-endian binary serialization and a total ordering dispatcher.

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DbResult};

/// Supported column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Int,
    Float,
    String,
    Boolean,
    Date,
}

impl DataType {
    /// Byte tag persisted in index file headers.
    pub fn tag(self) -> u8 {
        match self {
            DataType::Int => 1,
            DataType::Float => 2,
            DataType::String => 3,
            DataType::Boolean => 4,
            DataType::Date => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<DataType> {
        match tag {
            1 => Some(DataType::Int),
            2 => Some(DataType::Float),
            3 => Some(DataType::String),
            4 => Some(DataType::Boolean),
            5 => Some(DataType::Date),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int => "INT",
            DataType::Float => "FLOAT",
            DataType::String => "STRING",
            DataType::Boolean => "BOOLEAN",
            DataType::Date => "DATE",
        };
        f.write_str(name)
    }
}

/// A dynamically typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Str(String),
    Null,
}

pub fn date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch")
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The type of this value; `None` for NULL, which belongs to every
    /// type.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Int(_) => Some(DataType::Int),
            Value::Float(_) => Some(DataType::Float),
            Value::Bool(_) => Some(DataType::Boolean),
            Value::Date(_) => Some(DataType::Date),
            Value::Str(_) => Some(DataType::String),
            Value::Null => None,
        }
    }

    pub fn matches(&self, dtype: DataType) -> bool {
        match self.data_type() {
            None => true,
            Some(t) => t == dtype,
        }
    }

    /// Short type name for error messages ("NULL" included).
    pub fn type_name(&self) -> String {
        match self.data_type() {
            Some(t) => t.to_string(),
            None => "NULL".to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
            Value::Null => f.write_str("NULL"),
        }
    }
}

/// Serialize a non-null value in its on-disk form (big-endian; strings are
/// length-prefixed UTF-8).
pub fn serialize_value(value: &Value, dtype: DataType, out: &mut Vec<u8>) -> DbResult<()> {
    debug_assert!(!value.is_null(), "NULLs are encoded in the bitmap");
    match (dtype, value) {
        (DataType::Int, Value::Int(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (DataType::Float, Value::Float(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (DataType::Boolean, Value::Bool(v)) => out.push(u8::from(*v)),
        (DataType::Date, Value::Date(v)) => {
            let days = v.signed_duration_since(date_epoch()).num_days() as i32;
            out.extend_from_slice(&days.to_be_bytes());
        }
        (DataType::String, Value::Str(v)) => {
            let bytes = v.as_bytes();
            if bytes.len() > u16::MAX as usize {
                return Err(DbError::StringTooLong(bytes.len()));
            }
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        (expected, value) => {
            return Err(DbError::TypeMismatch {
                column: String::new(),
                expected,
                found: value.type_name(),
            })
        }
    }
    Ok(())
}

/// Deserialize one value of `dtype` at `offset`. Returns the value and the
/// offset just past it.
pub fn deserialize_value(data: &[u8], offset: usize, dtype: DataType) -> DbResult<(Value, usize)> {
    let short = || DbError::CorruptTuple(format!("truncated {dtype} at offset {offset}"));
    match dtype {
        DataType::Int => {
            let raw: [u8; 4] = data
                .get(offset..offset + 4)
                .ok_or_else(short)?
                .try_into()
                .unwrap();
            Ok((Value::Int(i32::from_be_bytes(raw)), offset + 4))
        }
        DataType::Float => {
            let raw: [u8; 8] = data
                .get(offset..offset + 8)
                .ok_or_else(short)?
                .try_into()
                .unwrap();
            Ok((Value::Float(f64::from_be_bytes(raw)), offset + 8))
        }
        DataType::Boolean => {
            let byte = *data.get(offset).ok_or_else(short)?;
            Ok((Value::Bool(byte != 0), offset + 1))
        }
        DataType::Date => {
            let raw: [u8; 4] = data
                .get(offset..offset + 4)
                .ok_or_else(short)?
                .try_into()
                .unwrap();
            let days = i32::from_be_bytes(raw);
            let date = date_epoch()
                .checked_add_signed(chrono::Duration::days(days as i64))
                .ok_or_else(|| DbError::CorruptTuple(format!("date {days} out of range")))?;
            Ok((Value::Date(date), offset + 4))
        }
        DataType::String => {
            let raw: [u8; 2] = data
                .get(offset..offset + 2)
                .ok_or_else(short)?
                .try_into()
                .unwrap();
            let len = u16::from_be_bytes(raw) as usize;
            let start = offset + 2;
            let bytes = data.get(start..start + len).ok_or_else(|| {
                DbError::CorruptTuple(format!("string length {len} overflows buffer"))
            })?;
            let text = std::str::from_utf8(bytes)
                .map_err(|e| DbError::CorruptTuple(format!("invalid utf-8: {e}")))?;
            Ok((Value::Str(text.to_string()), start + len))
        }
    }
}

/// Total order for two values of the same declared type. NULL is neither
/// less nor greater than anything: comparisons involving it return `None`
/// (three-valued logic at the SQL layer; index keys reject NULL outright).
pub fn compare(dtype: DataType, a: &Value, b: &Value) -> Option<Ordering> {
    match (dtype, a, b) {
        (_, Value::Null, _) | (_, _, Value::Null) => None,
        (DataType::Int, Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (DataType::Float, Value::Float(x), Value::Float(y)) => Some(x.total_cmp(y)),
        (DataType::Boolean, Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (DataType::Date, Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (DataType::String, Value::Str(x), Value::Str(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value, dtype: DataType) -> Value {
        let mut buf = Vec::new();
        serialize_value(&value, dtype, &mut buf).unwrap();
        let (decoded, end) = deserialize_value(&buf, 0, dtype).unwrap();
        assert_eq!(end, buf.len());
        decoded
    }

    #[test]
    fn fixed_width_round_trips() {
        assert_eq!(round_trip(Value::Int(-42), DataType::Int), Value::Int(-42));
        assert_eq!(
            round_trip(Value::Float(2.5), DataType::Float),
            Value::Float(2.5)
        );
        assert_eq!(
            round_trip(Value::Bool(true), DataType::Boolean),
            Value::Bool(true)
        );
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            round_trip(Value::Date(date), DataType::Date),
            Value::Date(date)
        );
    }

    #[test]
    fn int_is_four_big_endian_bytes() {
        let mut buf = Vec::new();
        serialize_value(&Value::Int(1), DataType::Int, &mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 1]);
    }

    #[test]
    fn string_round_trips_with_length_prefix() {
        let value = Value::Str("héllo".to_string());
        let mut buf = Vec::new();
        serialize_value(&value, DataType::String, &mut buf).unwrap();
        assert_eq!(
            u16::from_be_bytes([buf[0], buf[1]]) as usize,
            "héllo".len()
        );
        assert_eq!(round_trip(value.clone(), DataType::String), value);
    }

    #[test]
    fn truncated_string_is_detected() {
        let mut buf = Vec::new();
        serialize_value(
            &Value::Str("long enough".into()),
            DataType::String,
            &mut buf,
        )
        .unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            deserialize_value(&buf, 0, DataType::String),
            Err(DbError::CorruptTuple(_))
        ));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            serialize_value(&Value::Int(1), DataType::String, &mut buf),
            Err(DbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn comparisons_follow_sql_ordering() {
        assert_eq!(
            compare(DataType::Int, &Value::Int(1), &Value::Int(2)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare(DataType::Boolean, &Value::Bool(false), &Value::Bool(true)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare(
                DataType::String,
                &Value::Str("a".into()),
                &Value::Str("ab".into())
            ),
            Some(Ordering::Less)
        );
        assert_eq!(compare(DataType::Int, &Value::Null, &Value::Int(1)), None);
        assert_eq!(
            compare(
                DataType::Float,
                &Value::Float(-0.5),
                &Value::Float(0.25)
            ),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn date_epoch_is_day_zero() {
        let mut buf = Vec::new();
        serialize_value(&Value::Date(date_epoch()), DataType::Date, &mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
    }
}
