//! Typed values and the byte formats built on them.
//!
//! - [`row`]: the binary row format shared by the producer, the segment
//!   buffers and the `GET_DATA` stream.
//! - [`delimited`]: the text format handed to the warehouse bulk loader.

pub mod delimited;
pub mod row;

use std::cmp::Ordering;
use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;

use byteorder::{BigEndian, ReadBytesExt};
use chrono::NaiveDate;

use crate::error::{Error, Result};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Column types supported by the row format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int,
    Long,
    Float,
    Double,
    String,
    Date,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Long => "long",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Date => "date",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(DataType::Int),
            "long" | "bigint" => Ok(DataType::Long),
            "float" | "real" => Ok(DataType::Float),
            "double" => Ok(DataType::Double),
            "string" | "varchar" | "text" => Ok(DataType::String),
            "date" => Ok(DataType::Date),
            other => Err(Error::decode("data type", format!("unknown type {other:?}"))),
        }
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value can be stored in a column of type `ty`.
    pub fn fits(&self, ty: DataType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Int(_), DataType::Int)
                | (Value::Long(_), DataType::Long)
                | (Value::Float(_), DataType::Float)
                | (Value::Double(_), DataType::Double)
                | (Value::Str(_), DataType::String)
                | (Value::Date(_), DataType::Date)
        )
    }

    /// Orders two values of the same type. Nulls and mixed types are
    /// incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Parses the textual form of a value of type `ty`.
    pub fn parse(ty: DataType, text: &str) -> Result<Value> {
        let bad = |e: &dyn fmt::Display| Error::decode("value", format!("{text:?} as {ty}: {e}"));
        Ok(match ty {
            DataType::Int => Value::Int(text.parse().map_err(|e| bad(&e))?),
            DataType::Long => Value::Long(text.parse().map_err(|e| bad(&e))?),
            DataType::Float => Value::Float(text.parse().map_err(|e| bad(&e))?),
            DataType::Double => Value::Double(text.parse().map_err(|e| bad(&e))?),
            DataType::String => Value::Str(text.to_string()),
            DataType::Date => {
                Value::Date(NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|e| bad(&e))?)
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
            Value::Date(v) => write!(f, "{}", v.format(DATE_FORMAT)),
        }
    }
}

/// Appends a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as i32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor
        .read_i32::<BigEndian>()
        .map_err(|e| Error::decode("string length", e.to_string()))?;
    if len < 0 {
        return Err(Error::decode("string", format!("negative length {len}")));
    }
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len as u64 > remaining {
        return Err(Error::decode(
            "string",
            format!("length {len} exceeds remaining {remaining} bytes"),
        ));
    }
    let mut bytes = vec![0u8; len as usize];
    cursor
        .read_exact(&mut bytes)
        .map_err(|e| Error::decode("string", e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::decode("string", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_names() {
        for ty in [
            DataType::Int,
            DataType::Long,
            DataType::Float,
            DataType::Double,
            DataType::String,
            DataType::Date,
        ] {
            assert_eq!(ty.name().parse::<DataType>().unwrap(), ty);
        }
        assert_eq!("VARCHAR".parse::<DataType>().unwrap(), DataType::String);
        assert!("blob".parse::<DataType>().is_err());
    }

    #[test]
    fn test_value_compare() {
        assert_eq!(
            Value::Int(1).compare(&Value::Int(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Int(1).compare(&Value::Long(1)), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn test_value_parse() {
        let date = Value::parse(DataType::Date, "2024-02-29").unwrap();
        assert_eq!(date.to_string(), "2024-02-29");
        assert!(Value::parse(DataType::Date, "2023-02-29").is_err());
        assert_eq!(Value::parse(DataType::Long, "-7").unwrap(), Value::Long(-7));
    }

    #[test]
    fn test_string_roundtrip_and_truncation() {
        let mut buf = Vec::new();
        write_string(&mut buf, "héllo");
        let mut cursor = Cursor::new(buf.as_slice());
        assert_eq!(read_string(&mut cursor).unwrap(), "héllo");

        let truncated = &buf[..buf.len() - 1];
        let mut cursor = Cursor::new(truncated);
        assert!(matches!(
            read_string(&mut cursor),
            Err(Error::Decode("string", _))
        ));
    }
}
