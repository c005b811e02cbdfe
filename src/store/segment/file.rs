//! On-disk segment files (`seg<N>.dat`).
//!
//! ```text
//! +---------------------------+
//! | Header (64 bytes)         |
//! +---------------------------+
//! | row bytes (used)          |
//! +---------------------------+
//! | row ids (row_count x i64) |
//! +---------------------------+
//! | offsets (row_count x u32) |
//! +---------------------------+
//! | crc32 (u32)               |
//! +---------------------------+
//! ```
//!
//! Files are written to a temporary name and renamed into place, so a reader
//! never sees a half-written segment.

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::Segment;
use crate::error::{Error, Result};
use crate::{RowId, SegmentId};

pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"STGH\0SEG";
const VERSION: u32 = 1;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("seg{id}.dat"))
}

/// Parses the segment ID out of a `seg<N>.dat` file name.
pub fn parse_segment_file_name(name: &str) -> Option<SegmentId> {
    name.strip_prefix("seg")?.strip_suffix(".dat")?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentHeader {
    pub id: SegmentId,
    pub used: u32,
    pub first: RowId,
    pub last: RowId,
    pub row_count: u32,
    pub capacity: u32,
    /// Length in bytes of the row-id and offset arrays.
    pub index_len: u32,
}

impl SegmentHeader {
    fn of(segment: &Segment) -> Self {
        let row_count = segment.row_count() as u32;
        Self {
            id: segment.id(),
            used: segment.used() as u32,
            first: segment.first_row_id().unwrap_or(0),
            last: segment.last_row_id().unwrap_or(0),
            row_count,
            capacity: segment.capacity() as u32,
            index_len: row_count * 12,
        }
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        let mut w = &mut buf[8..];
        w.write_u32::<BigEndian>(VERSION)?;
        w.write_u64::<BigEndian>(self.id)?;
        w.write_u32::<BigEndian>(self.used)?;
        w.write_i64::<BigEndian>(self.first)?;
        w.write_i64::<BigEndian>(self.last)?;
        w.write_u32::<BigEndian>(self.row_count)?;
        w.write_u32::<BigEndian>(self.capacity)?;
        w.write_u32::<BigEndian>(self.index_len)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[0..8] != MAGIC {
            return Err(Error::Corrupted(
                "segment header",
                "invalid magic".to_string(),
            ));
        }
        let mut r = &buf[8..];
        let version = r.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::Corrupted(
                "segment header",
                format!("unsupported version {version}"),
            ));
        }
        let header = Self {
            id: r.read_u64::<BigEndian>()?,
            used: r.read_u32::<BigEndian>()?,
            first: r.read_i64::<BigEndian>()?,
            last: r.read_i64::<BigEndian>()?,
            row_count: r.read_u32::<BigEndian>()?,
            capacity: r.read_u32::<BigEndian>()?,
            index_len: r.read_u32::<BigEndian>()?,
        };
        if header.index_len != header.row_count * 12 {
            return Err(Error::Corrupted(
                "segment header",
                format!(
                    "index length {} does not match {} rows",
                    header.index_len, header.row_count
                ),
            ));
        }
        Ok(header)
    }
}

/// Writes `segment` to `path` atomically and syncs it.
pub fn write_segment(path: &Path, segment: &Segment) -> Result<()> {
    let header = SegmentHeader::of(segment);
    let mut body = Vec::with_capacity(segment.used() + header.index_len as usize);
    body.extend_from_slice(segment.data());
    for &id in segment.row_ids() {
        body.write_i64::<BigEndian>(id)?;
    }
    for &offset in segment.offsets() {
        body.write_u32::<BigEndian>(offset)?;
    }

    let header_bytes = header.encode()?;
    let mut digest = CRC32.digest();
    digest.update(&header_bytes);
    digest.update(&body);
    let checksum = digest.finalize();

    let tmp = path.with_extension("dat.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(&header_bytes)?;
        writer.write_all(&body)?;
        writer.write_u32::<BigEndian>(checksum)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_segment(path: &Path) -> Result<Segment> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < HEADER_SIZE + 4 {
        return Err(Error::Corrupted(
            "segment file",
            format!("{} is too short", path.display()),
        ));
    }

    let (content, trailer) = bytes.split_at(bytes.len() - 4);
    let stored = (&trailer[..]).read_u32::<BigEndian>()?;
    if CRC32.checksum(content) != stored {
        return Err(Error::ChecksumMismatch(path.display().to_string()));
    }

    let header_bytes: &[u8; HEADER_SIZE] = content[..HEADER_SIZE]
        .try_into()
        .map_err(|_| Error::Corrupted("segment file", "short header".to_string()))?;
    let header = SegmentHeader::decode(header_bytes)?;

    let body = &content[HEADER_SIZE..];
    let expected = header.used as usize + header.index_len as usize;
    if body.len() != expected {
        return Err(Error::Corrupted(
            "segment file",
            format!("{}: body is {} bytes, expected {expected}", path.display(), body.len()),
        ));
    }

    let data = body[..header.used as usize].to_vec();
    let mut cursor = Cursor::new(&body[header.used as usize..]);
    let mut row_ids = Vec::with_capacity(header.row_count as usize);
    for _ in 0..header.row_count {
        row_ids.push(cursor.read_i64::<BigEndian>()?);
    }
    let mut offsets = Vec::with_capacity(header.row_count as usize);
    for _ in 0..header.row_count {
        offsets.push(cursor.read_u32::<BigEndian>()?);
    }

    let segment = Segment::from_parts(header.id, header.capacity as usize, data, row_ids, offsets)?;
    if segment.first_row_id().unwrap_or(0) != header.first
        || segment.last_row_id().unwrap_or(0) != header.last
    {
        return Err(Error::Corrupted(
            "segment file",
            format!("{}: row bounds disagree with header", path.display()),
        ));
    }
    Ok(segment)
}
