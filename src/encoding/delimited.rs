//! Delimited text rows for warehouse bulk loads.
//!
//! One line per row, fields separated by `|`, the row ID last. `\N` marks a
//! null; backslash escapes `\`, `|` and newlines inside strings.

use super::{DataType, Value};
use crate::error::{Error, Result};
use crate::RowId;

pub const FIELD_DELIMITER: u8 = b'|';
pub const ROW_DELIMITER: u8 = b'\n';
const NULL_MARKER: &str = "\\N";

pub fn write_row(out: &mut Vec<u8>, values: &[Value], row_id: RowId) {
    for value in values {
        write_field(out, value);
        out.push(FIELD_DELIMITER);
    }
    out.extend_from_slice(row_id.to_string().as_bytes());
    out.push(ROW_DELIMITER);
}

fn write_field(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(NULL_MARKER.as_bytes()),
        Value::Str(s) => {
            for b in s.bytes() {
                match b {
                    b'\\' => out.extend_from_slice(b"\\\\"),
                    b'|' => out.extend_from_slice(b"\\|"),
                    b'\n' => out.extend_from_slice(b"\\n"),
                    _ => out.push(b),
                }
            }
        }
        other => out.extend_from_slice(other.to_string().as_bytes()),
    }
}

/// Parses one line (without its trailing newline) back into values.
pub fn parse_row(line: &str, types: &[DataType]) -> Result<(Vec<Value>, RowId)> {
    let fields = split_fields(line);
    if fields.len() != types.len() + 1 {
        return Err(Error::decode(
            "delimited row",
            format!("expected {} fields, got {}", types.len() + 1, fields.len()),
        ));
    }
    let mut values = Vec::with_capacity(types.len());
    for (field, ty) in fields.iter().zip(types) {
        values.push(match field {
            None => Value::Null,
            Some(text) => Value::parse(*ty, text)?,
        });
    }
    let row_id = match &fields[types.len()] {
        Some(text) => text
            .parse()
            .map_err(|e| Error::decode("delimited row id", format!("{text:?}: {e}")))?,
        None => return Err(Error::decode("delimited row id", "row id is null")),
    };
    Ok((values, row_id))
}

/// Splits on unescaped delimiters; `None` for null fields.
fn split_fields(line: &str) -> Vec<Option<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut raw = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                raw.push(c);
                match chars.next() {
                    Some('n') => {
                        current.push('\n');
                        raw.push('n');
                    }
                    Some(other) => {
                        current.push(other);
                        raw.push(other);
                    }
                    None => current.push('\\'),
                }
            }
            '|' => {
                fields.push(finish_field(&mut current, &mut raw));
            }
            _ => {
                current.push(c);
                raw.push(c);
            }
        }
    }
    fields.push(finish_field(&mut current, &mut raw));
    fields
}

fn finish_field(current: &mut String, raw: &mut String) -> Option<String> {
    let is_null = raw == NULL_MARKER;
    let value = std::mem::take(current);
    raw.clear();
    if is_null {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_write_row() {
        let mut out = Vec::new();
        write_row(
            &mut out,
            &[Value::Int(1), Value::Null, Value::Str("a|b".into())],
            12,
        );
        assert_eq!(out, b"1|\\N|a\\|b|12\n");
    }

    #[test]
    fn test_parse_written_row() {
        let types = [DataType::String, DataType::Date, DataType::Double];
        let values = vec![
            Value::Str("line\nbreak \\ and |pipe".into()),
            Value::Date(NaiveDate::from_ymd_opt(2020, 5, 17).unwrap()),
            Value::Null,
        ];
        let mut out = Vec::new();
        write_row(&mut out, &values, 3);
        let line = std::str::from_utf8(&out[..out.len() - 1]).unwrap();

        let (parsed, row_id) = parse_row(line, &types).unwrap();
        assert_eq!(parsed, values);
        assert_eq!(row_id, 3);
    }

    #[test]
    fn test_parse_wrong_field_count() {
        assert!(parse_row("1|2|3", &[DataType::Int]).is_err());
    }
}
