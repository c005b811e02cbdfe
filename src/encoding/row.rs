//! Binary row format.
//!
//! Every column, in catalog order, followed by the implicit row-ID column:
//!
//! ```text
//! +------+----------------------------------------------+
//! | null | value (absent when null = 1)                 |
//! | u8   | int/float: 4 bytes BE, long/double: 8 bytes  |
//! |      | date: 10 ASCII bytes "YYYY-MM-DD"            |
//! |      | string: i32 BE length + UTF-8 bytes          |
//! +------+----------------------------------------------+
//! ```
//!
//! The row ID is encoded as a non-null `int` column. Rows are
//! self-delimiting given the column types, so a buffer of rows needs no
//! framing beyond the types themselves.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::NaiveDate;

use super::{DataType, Value, DATE_FORMAT};
use crate::error::{Error, Result};
use crate::RowId;

pub const DATE_LEN: usize = 10;
const NOT_NULL: u8 = 0;
const NULL: u8 = 1;

/// Encodes and decodes rows for one table's column types.
#[derive(Debug, Clone, PartialEq)]
pub struct RowCodec {
    types: Vec<DataType>,
}

/// A row borrowed out of a buffer of encoded rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowRef<'a> {
    pub row_id: RowId,
    pub bytes: &'a [u8],
}

impl RowCodec {
    /// `types` are the user columns; the row-ID column is implicit.
    pub fn new(types: Vec<DataType>) -> Self {
        Self { types }
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn encode(&self, values: &[Value], row_id: RowId) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf, values, row_id)?;
        Ok(buf)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>, values: &[Value], row_id: RowId) -> Result<()> {
        if values.len() != self.types.len() {
            return Err(Error::Encode(
                "row",
                format!("expected {} columns, got {}", self.types.len(), values.len()),
            ));
        }
        for (value, ty) in values.iter().zip(&self.types) {
            encode_value(buf, *ty, value)?;
        }
        let row_id = i32::try_from(row_id)
            .map_err(|_| Error::Encode("row id", format!("{row_id} does not fit an int")))?;
        encode_value(buf, DataType::Int, &Value::Int(row_id))
    }

    /// Decodes one row from the front of `bytes`, returning the values, the
    /// row ID and the number of bytes consumed.
    pub fn decode(&self, bytes: &[u8]) -> Result<(Vec<Value>, RowId, usize)> {
        let mut cursor = Cursor::new(bytes);
        let mut values = Vec::with_capacity(self.types.len());
        for ty in &self.types {
            values.push(decode_value(&mut cursor, *ty)?);
        }
        let row_id = read_row_id(&mut cursor)?;
        Ok((values, row_id, cursor.position() as usize))
    }

    /// Walks one row without materializing its values.
    pub fn extent<'a>(&self, bytes: &'a [u8]) -> Result<RowRef<'a>> {
        let mut cursor = Cursor::new(bytes);
        for ty in &self.types {
            skip_value(&mut cursor, *ty)?;
        }
        let row_id = read_row_id(&mut cursor)?;
        let len = cursor.position() as usize;
        Ok(RowRef {
            row_id,
            bytes: &bytes[..len],
        })
    }

    /// Iterates over a buffer holding zero or more encoded rows.
    pub fn rows<'a>(&'a self, bytes: &'a [u8]) -> RowIter<'a> {
        RowIter {
            codec: self,
            bytes,
            pos: 0,
        }
    }
}

pub struct RowIter<'a> {
    codec: &'a RowCodec,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for RowIter<'a> {
    type Item = Result<RowRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let bytes: &'a [u8] = self.bytes;
        match self.codec.extent(&bytes[self.pos..]) {
            Ok(row) => {
                self.pos += row.bytes.len();
                Some(Ok(row))
            }
            Err(e) => {
                self.pos = self.bytes.len();
                Some(Err(e))
            }
        }
    }
}

fn read_row_id(cursor: &mut Cursor<&[u8]>) -> Result<RowId> {
    match decode_value(cursor, DataType::Int)? {
        Value::Int(id) => Ok(id as RowId),
        _ => Err(Error::decode("row id", "row id column is null")),
    }
}

pub fn encode_value(buf: &mut Vec<u8>, ty: DataType, value: &Value) -> Result<()> {
    if !value.fits(ty) {
        return Err(Error::Encode(
            "value",
            format!("{value:?} does not fit a {ty} column"),
        ));
    }
    if value.is_null() {
        buf.push(NULL);
        return Ok(());
    }
    buf.push(NOT_NULL);
    match value {
        Value::Int(v) => buf.write_i32::<BigEndian>(*v)?,
        Value::Long(v) => buf.write_i64::<BigEndian>(*v)?,
        Value::Float(v) => buf.write_f32::<BigEndian>(*v)?,
        Value::Double(v) => buf.write_f64::<BigEndian>(*v)?,
        Value::Str(s) => super::write_string(buf, s),
        Value::Date(d) => buf.extend_from_slice(d.format(DATE_FORMAT).to_string().as_bytes()),
        Value::Null => unreachable!("handled above"),
    }
    Ok(())
}

pub fn decode_value(cursor: &mut Cursor<&[u8]>, ty: DataType) -> Result<Value> {
    let eof = |e: std::io::Error| Error::decode("value", format!("{ty} column: {e}"));
    match cursor.read_u8().map_err(eof)? {
        NULL => return Ok(Value::Null),
        NOT_NULL => {}
        flag => return Err(Error::decode("value", format!("invalid null flag {flag}"))),
    }
    Ok(match ty {
        DataType::Int => Value::Int(cursor.read_i32::<BigEndian>().map_err(eof)?),
        DataType::Long => Value::Long(cursor.read_i64::<BigEndian>().map_err(eof)?),
        DataType::Float => Value::Float(cursor.read_f32::<BigEndian>().map_err(eof)?),
        DataType::Double => Value::Double(cursor.read_f64::<BigEndian>().map_err(eof)?),
        DataType::String => Value::Str(super::read_string(cursor)?),
        DataType::Date => {
            let mut raw = [0u8; DATE_LEN];
            cursor.read_exact(&mut raw).map_err(eof)?;
            let text = std::str::from_utf8(&raw)
                .map_err(|e| Error::decode("date", e.to_string()))?;
            let date = NaiveDate::parse_from_str(text, DATE_FORMAT)
                .map_err(|e| Error::decode("date", format!("{text:?}: {e}")))?;
            Value::Date(date)
        }
    })
}

fn skip_value(cursor: &mut Cursor<&[u8]>, ty: DataType) -> Result<()> {
    let eof = |e: std::io::Error| Error::decode("value", format!("{ty} column: {e}"));
    match cursor.read_u8().map_err(eof)? {
        NULL => return Ok(()),
        NOT_NULL => {}
        flag => return Err(Error::decode("value", format!("invalid null flag {flag}"))),
    }
    let len = match ty {
        DataType::Int | DataType::Float => 4,
        DataType::Long | DataType::Double => 8,
        DataType::Date => DATE_LEN,
        DataType::String => {
            let len = cursor.read_i32::<BigEndian>().map_err(eof)?;
            if len < 0 {
                return Err(Error::decode("string", format!("negative length {len}")));
            }
            len as usize
        }
    };
    let end = cursor.position() as usize + len;
    if end > cursor.get_ref().len() {
        return Err(Error::decode(
            "value",
            format!("{ty} column needs {len} bytes past the end of the buffer"),
        ));
    }
    cursor.set_position(end as u64);
    Ok(())
}
