//! Wire protocol shared by the server and the clients.
//!
//! Every request starts with a big-endian `i32` opcode followed by its body;
//! every reply starts with [`Opcode::Ok`] or [`Opcode::Err`] (the latter
//! followed by a message string). Strings are an `i32` byte length plus
//! UTF-8. Row data travels in the row format of [`crate::encoding::row`];
//! a query reply ends with [`END_OF_STREAM`], which can never start a row.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::encoding::row::DATE_LEN;
use crate::encoding::DataType;
use crate::error::{Error, Result};

/// Terminates the row stream of a `GET_DATA` reply.
pub const END_OF_STREAM: u8 = 0xFF;

/// Freshness value meaning "no staleness bound".
pub const NO_FRESHNESS: i64 = -1;

/// Pending-time value meaning "no reader is waiting".
pub const NOT_PENDING: i64 = -1;

/// Largest string or byte payload accepted from the wire.
const MAX_FRAME_LEN: usize = 256 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    Bye = 0,
    Ok = 1,
    Err = 2,
    SyncCatalog = 10,
    CommitFlushData = 11,
    CommitFlushUd = 12,
    CommitMaterialize = 13,
    Rollback = 14,
    RegisterQuery = 20,
    UnregisterQuery = 21,
    GetData = 22,
    PingConnect = 30,
    PingEnsureAccuracy = 31,
}

impl TryFrom<i32> for Opcode {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        Ok(match code {
            0 => Opcode::Bye,
            1 => Opcode::Ok,
            2 => Opcode::Err,
            10 => Opcode::SyncCatalog,
            11 => Opcode::CommitFlushData,
            12 => Opcode::CommitFlushUd,
            13 => Opcode::CommitMaterialize,
            14 => Opcode::Rollback,
            20 => Opcode::RegisterQuery,
            21 => Opcode::UnregisterQuery,
            22 => Opcode::GetData,
            30 => Opcode::PingConnect,
            31 => Opcode::PingEnsureAccuracy,
            other => return Err(Error::Protocol(format!("unknown opcode {other}"))),
        })
    }
}

pub async fn read_opcode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Opcode> {
    Opcode::try_from(reader.read_i32().await?)
}

pub async fn write_opcode<W: AsyncWrite + Unpin>(writer: &mut W, opcode: Opcode) -> Result<()> {
    writer.write_i32(opcode as i32).await?;
    Ok(())
}

fn frame_len(len: i32, what: &str) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .filter(|&n| n <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::Protocol(format!("invalid {what} length {len}")))
}

pub async fn read_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = frame_len(reader.read_i32().await?, "payload")?;
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_bytes<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| Error::Protocol(format!("payload of {} bytes is too large", bytes.len())))?;
    writer.write_i32(len).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let bytes = read_bytes(reader).await?;
    String::from_utf8(bytes).map_err(|e| Error::Protocol(format!("string is not UTF-8: {e}")))
}

pub async fn write_string<W: AsyncWrite + Unpin>(writer: &mut W, s: &str) -> Result<()> {
    write_bytes(writer, s.as_bytes()).await
}

/// Reads a status reply; `ERR` becomes [`Error::InvalidOperation`] carrying
/// the server's message.
pub async fn read_status<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    match read_opcode(reader).await? {
        Opcode::Ok => Ok(()),
        Opcode::Err => Err(Error::InvalidOperation(read_string(reader).await?)),
        other => Err(Error::Protocol(format!("expected status, got {other:?}"))),
    }
}

pub async fn write_ok<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    write_opcode(writer, Opcode::Ok).await
}

pub async fn write_err<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> Result<()> {
    write_opcode(writer, Opcode::Err).await?;
    write_string(writer, message).await
}

/// Reads encoded rows up to and including [`END_OF_STREAM`], returning the
/// row bytes without the marker. Each row is walked column by column since
/// the stream carries no row lengths.
pub async fn read_row_stream<R: AsyncRead + Unpin>(
    reader: &mut R,
    types: &[DataType],
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let first = reader.read_u8().await?;
        if first == END_OF_STREAM {
            return Ok(out);
        }
        let row_id = std::iter::once(&DataType::Int);
        for (i, ty) in types.iter().chain(row_id).enumerate() {
            let flag = if i == 0 { first } else { reader.read_u8().await? };
            out.push(flag);
            match flag {
                1 => continue,
                0 => {}
                other => {
                    return Err(Error::Protocol(format!("invalid null flag {other} in row stream")))
                }
            }
            let len = match ty {
                DataType::Int | DataType::Float => 4,
                DataType::Long | DataType::Double => 8,
                DataType::Date => DATE_LEN,
                DataType::String => {
                    let len = reader.read_i32().await?;
                    out.extend_from_slice(&len.to_be_bytes());
                    frame_len(len, "string")?
                }
            };
            let start = out.len();
            out.resize(start + len, 0);
            reader.read_exact(&mut out[start..]).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::row::RowCodec;
    use crate::encoding::Value;

    #[tokio::test]
    async fn test_status_replies() -> Result<()> {
        let mut buf = Vec::new();
        write_ok(&mut buf).await?;
        write_err(&mut buf, "no such table").await?;

        let mut reader = buf.as_slice();
        read_status(&mut reader).await?;
        match read_status(&mut reader).await {
            Err(Error::InvalidOperation(msg)) => assert_eq!(msg, "no such table"),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let mut reader: &[u8] = &77i32.to_be_bytes();
        assert!(matches!(read_opcode(&mut reader).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_row_stream_framing() -> Result<()> {
        let types = vec![DataType::String, DataType::Date, DataType::Double];
        let codec = RowCodec::new(types.clone());
        let mut rows = Vec::new();
        codec.encode_into(
            &mut rows,
            &[Value::Str("ünï".into()), Value::Null, Value::Double(1.5)],
            1,
        )?;
        codec.encode_into(
            &mut rows,
            &[
                Value::Null,
                Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
                Value::Null,
            ],
            2,
        )?;

        let mut wire = rows.clone();
        wire.push(END_OF_STREAM);
        wire.extend_from_slice(b"next request");

        let mut reader = wire.as_slice();
        assert_eq!(read_row_stream(&mut reader, &types).await?, rows);
        assert_eq!(reader, b"next request");
        Ok(())
    }

    #[tokio::test]
    async fn test_truncated_stream_is_transport_error() {
        let mut reader: &[u8] = &[0, 0, 0];
        let err = read_row_stream(&mut reader, &[DataType::Int]).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut reader: &[u8] = &(-5i32).to_be_bytes();
        assert!(matches!(read_bytes(&mut reader).await, Err(Error::Protocol(_))));
    }
}
