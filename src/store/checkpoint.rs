//! Crash-recovery checkpoints.
//!
//! A checkpoint is a directory of fixed-record files describing the maps of
//! one completed flush. It is written into `tmp/`, sealed with a `COMMIT`
//! marker, then promoted:
//!
//! ```text
//!   write tmp/*  ──►  tmp/COMMIT  ──►  rm -r finalized/  ──►  mv tmp finalized
//! ```
//!
//! A crash before `COMMIT` leaves `finalized/` untouched. A crash between
//! the delete and the rename leaves a committed `tmp/` and no
//! `finalized/`, which [`LocalMaterializer::load`] promotes before reading.
//!
//! Every file carries a CRC32 trailer over its body.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::state::{SegmentHandle, StoreMisc};
use super::ud::{UdEntry, UdSeq, UdStatement};
use crate::encoding::DataType;
use crate::error::{Error, Result};
use crate::{RowId, SegmentId, Timestamp};

pub const TMP_DIR: &str = "tmp";
pub const FINALIZED_DIR: &str = "finalized";

const TIME_INDEX_FILE: &str = "time.idx";
const ROW_INDEX_FILE: &str = "row.idx";
const COUNTER_FILE: &str = "counter.idx";
const SEGMENT_FILE: &str = "segment.idx";
const UD_LOG_FILE: &str = "ud.log";
const MISC_FILE: &str = "misc";
const COMMIT_FILE: &str = "COMMIT";

const MISC_VERSION: u32 = 1;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Everything a table needs to resume after a restart or rollback.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckpointState {
    pub time_index: BTreeMap<Timestamp, RowId>,
    pub row_index: BTreeMap<RowId, SegmentId>,
    /// Materialized flag per segment key. Reference counts belong to live
    /// readers and are not persisted.
    pub counters: BTreeMap<RowId, bool>,
    pub segments: BTreeMap<RowId, SegmentHandle>,
    pub uds: BTreeMap<UdSeq, UdEntry>,
    pub misc: StoreMisc,
}

impl CheckpointState {
    /// The three segment maps must hold the same keys, and the time index
    /// must grow in both key and value.
    pub fn validate(&self) -> Result<()> {
        let corrupted = |msg: String| Err(Error::Corrupted("checkpoint", msg));
        if !self.row_index.keys().eq(self.counters.keys())
            || !self.row_index.keys().eq(self.segments.keys())
        {
            return corrupted("segment maps disagree on their keys".to_string());
        }
        if self
            .row_index
            .iter()
            .any(|(key, id)| self.segments.get(key).map(|h| h.id) != Some(*id))
        {
            return corrupted("row index and segment keys disagree on segment ids".to_string());
        }
        let rows: Vec<RowId> = self.time_index.values().copied().collect();
        if rows.windows(2).any(|w| w[0] >= w[1]) {
            return corrupted("time index is not increasing".to_string());
        }
        if self.misc.last_mat_row > self.misc.current_row {
            return corrupted(format!(
                "low-water mark {} is past the last committed row {}",
                self.misc.last_mat_row, self.misc.current_row
            ));
        }
        Ok(())
    }
}

/// Writes and reads the checkpoints of one table directory.
pub struct LocalMaterializer {
    dir: PathBuf,
    types: Vec<DataType>,
}

impl LocalMaterializer {
    pub fn new(dir: impl Into<PathBuf>, types: Vec<DataType>) -> Self {
        Self {
            dir: dir.into(),
            types,
        }
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.dir.join(TMP_DIR)
    }

    pub fn finalized_dir(&self) -> PathBuf {
        self.dir.join(FINALIZED_DIR)
    }

    /// Writes `state` into `tmp/` and promotes it to `finalized/`.
    pub fn backup(&self, state: &CheckpointState) -> Result<()> {
        let tmp = self.tmp_dir();
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        write_checked(&tmp.join(TIME_INDEX_FILE), &encode_time_index(&state.time_index)?)?;
        write_checked(&tmp.join(ROW_INDEX_FILE), &encode_row_index(&state.row_index)?)?;
        write_checked(&tmp.join(COUNTER_FILE), &encode_counters(&state.counters)?)?;
        write_checked(&tmp.join(SEGMENT_FILE), &encode_segments(&state.segments)?)?;
        write_checked(&tmp.join(UD_LOG_FILE), &self.encode_uds(&state.uds)?)?;
        write_checked(&tmp.join(MISC_FILE), &encode_misc(&state.misc)?)?;
        File::create(tmp.join(COMMIT_FILE))?.sync_all()?;
        sync_dir(&tmp)?;

        self.promote()?;
        tracing::debug!(
            dir = %self.dir.display(),
            current_row = state.misc.current_row,
            "Promoted checkpoint"
        );
        Ok(())
    }

    /// Reads `finalized/`, promoting a committed `tmp/` first if a crash
    /// interrupted the last promotion. `None` for a table that never
    /// checkpointed.
    pub fn load(&self) -> Result<Option<CheckpointState>> {
        let finalized = self.finalized_dir();
        if !finalized.exists() {
            if self.tmp_dir().join(COMMIT_FILE).exists() {
                tracing::warn!(
                    dir = %self.dir.display(),
                    "Found committed checkpoint that was never promoted"
                );
                self.promote()?;
            } else {
                return Ok(None);
            }
        }
        if !finalized.join(COMMIT_FILE).exists() {
            return Err(Error::Corrupted(
                "checkpoint",
                format!("{} has no commit marker", finalized.display()),
            ));
        }

        let state = CheckpointState {
            time_index: decode_time_index(&read_checked(&finalized.join(TIME_INDEX_FILE))?)?,
            row_index: decode_row_index(&read_checked(&finalized.join(ROW_INDEX_FILE))?)?,
            counters: decode_counters(&read_checked(&finalized.join(COUNTER_FILE))?)?,
            segments: decode_segments(&read_checked(&finalized.join(SEGMENT_FILE))?)?,
            uds: self.decode_uds(&read_checked(&finalized.join(UD_LOG_FILE))?)?,
            misc: decode_misc(&read_checked(&finalized.join(MISC_FILE))?)?,
        };
        state.validate()?;
        Ok(Some(state))
    }

    fn promote(&self) -> Result<()> {
        let finalized = self.finalized_dir();
        if finalized.exists() {
            fs::remove_dir_all(&finalized)?;
        }
        fs::rename(self.tmp_dir(), &finalized)?;
        fs::create_dir_all(self.tmp_dir())?;
        sync_dir(&self.dir)
    }

    fn encode_uds(&self, uds: &BTreeMap<UdSeq, UdEntry>) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut statement = Vec::new();
        for (&seq, entry) in uds {
            buf.write_u64::<BigEndian>(seq)?;
            buf.write_i64::<BigEndian>(entry.commit_time)?;
            buf.write_i64::<BigEndian>(entry.row_cutoff)?;
            buf.write_i64::<BigEndian>(entry.warehouse_bound)?;
            buf.write_u8(entry.warehouse_applied as u8)?;
            statement.clear();
            entry.statement.encode_into(&mut statement, &self.types)?;
            buf.write_u32::<BigEndian>(statement.len() as u32)?;
            buf.extend_from_slice(&statement);
        }
        Ok(buf)
    }

    fn decode_uds(&self, body: &[u8]) -> Result<BTreeMap<UdSeq, UdEntry>> {
        let mut uds = BTreeMap::new();
        let mut cursor = Cursor::new(body);
        while (cursor.position() as usize) < body.len() {
            let seq = cursor.read_u64::<BigEndian>()?;
            let commit_time = cursor.read_i64::<BigEndian>()?;
            let row_cutoff = cursor.read_i64::<BigEndian>()?;
            let warehouse_bound = cursor.read_i64::<BigEndian>()?;
            let warehouse_applied = cursor.read_u8()? != 0;
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let start = cursor.position() as usize;
            let bytes = body.get(start..start + len).ok_or_else(|| {
                Error::Corrupted("checkpoint", format!("ud entry {seq} is truncated"))
            })?;
            let statement = UdStatement::decode(&mut Cursor::new(bytes), &self.types)?;
            cursor.set_position((start + len) as u64);
            uds.insert(
                seq,
                UdEntry {
                    statement,
                    commit_time,
                    row_cutoff,
                    warehouse_bound,
                    warehouse_applied,
                },
            );
        }
        Ok(uds)
    }
}

fn write_checked(path: &Path, body: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(body)?;
    file.write_u32::<BigEndian>(CRC32.checksum(body))?;
    file.sync_all()?;
    Ok(())
}

fn read_checked(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Err(Error::Corrupted(
            "checkpoint",
            format!("{} is too short", path.display()),
        ));
    }
    let trailer = bytes.split_off(bytes.len() - 4);
    let stored = (&trailer[..]).read_u32::<BigEndian>()?;
    if CRC32.checksum(&bytes) != stored {
        return Err(Error::ChecksumMismatch(path.display().to_string()));
    }
    Ok(bytes)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Splits `body` into fixed-size records.
fn records<'a>(
    body: &'a [u8],
    size: usize,
    what: &'static str,
) -> Result<std::slice::ChunksExact<'a, u8>> {
    if body.len() % size != 0 {
        return Err(Error::Corrupted(
            what,
            format!("{} bytes is not a multiple of {size}", body.len()),
        ));
    }
    Ok(body.chunks_exact(size))
}

fn encode_time_index(map: &BTreeMap<Timestamp, RowId>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(map.len() * 16);
    for (&time, &row) in map {
        buf.write_i64::<BigEndian>(time)?;
        buf.write_i64::<BigEndian>(row)?;
    }
    Ok(buf)
}

fn decode_time_index(body: &[u8]) -> Result<BTreeMap<Timestamp, RowId>> {
    records(body, 16, "time index")?
        .map(|mut r| -> Result<(Timestamp, RowId)> {
            Ok((r.read_i64::<BigEndian>()?, r.read_i64::<BigEndian>()?))
        })
        .collect()
}

fn encode_row_index(map: &BTreeMap<RowId, SegmentId>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(map.len() * 16);
    for (&key, &id) in map {
        buf.write_i64::<BigEndian>(key)?;
        buf.write_u64::<BigEndian>(id)?;
    }
    Ok(buf)
}

fn decode_row_index(body: &[u8]) -> Result<BTreeMap<RowId, SegmentId>> {
    records(body, 16, "row index")?
        .map(|mut r| -> Result<(RowId, SegmentId)> {
            Ok((r.read_i64::<BigEndian>()?, r.read_u64::<BigEndian>()?))
        })
        .collect()
}

fn encode_counters(map: &BTreeMap<RowId, bool>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(map.len() * 9);
    for (&key, &materialized) in map {
        buf.write_i64::<BigEndian>(key)?;
        buf.write_u8(materialized as u8)?;
    }
    Ok(buf)
}

fn decode_counters(body: &[u8]) -> Result<BTreeMap<RowId, bool>> {
    records(body, 9, "register counter")?
        .map(|mut r| -> Result<(RowId, bool)> {
            Ok((r.read_i64::<BigEndian>()?, r.read_u8()? != 0))
        })
        .collect()
}

fn encode_segments(map: &BTreeMap<RowId, SegmentHandle>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(map.len() * 25);
    for (&key, handle) in map {
        buf.write_i64::<BigEndian>(key)?;
        buf.write_u64::<BigEndian>(handle.id)?;
        buf.write_i64::<BigEndian>(handle.last_row)?;
        buf.write_u8(handle.sealed as u8)?;
    }
    Ok(buf)
}

fn decode_segments(body: &[u8]) -> Result<BTreeMap<RowId, SegmentHandle>> {
    records(body, 25, "segment keys")?
        .map(|mut r| -> Result<(RowId, SegmentHandle)> {
            let key = r.read_i64::<BigEndian>()?;
            let handle = SegmentHandle {
                id: r.read_u64::<BigEndian>()?,
                last_row: r.read_i64::<BigEndian>()?,
                sealed: r.read_u8()? != 0,
            };
            Ok((key, handle))
        })
        .collect()
}

fn encode_misc(misc: &StoreMisc) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(48);
    buf.write_u32::<BigEndian>(MISC_VERSION)?;
    buf.write_u32::<BigEndian>(misc.segment_size)?;
    buf.write_u64::<BigEndian>(misc.segment_id)?;
    buf.write_i64::<BigEndian>(misc.current_row)?;
    buf.write_i64::<BigEndian>(misc.last_mat_row)?;
    buf.write_i64::<BigEndian>(misc.last_commit_time)?;
    buf.write_u64::<BigEndian>(misc.next_ud_seq)?;
    Ok(buf)
}

fn decode_misc(body: &[u8]) -> Result<StoreMisc> {
    let mut r = body;
    let version = r.read_u32::<BigEndian>()?;
    if version != MISC_VERSION {
        return Err(Error::Corrupted(
            "checkpoint misc",
            format!("unsupported version {version}"),
        ));
    }
    let misc = StoreMisc {
        segment_size: r.read_u32::<BigEndian>()?,
        segment_id: r.read_u64::<BigEndian>()?,
        current_row: r.read_i64::<BigEndian>()?,
        last_mat_row: r.read_i64::<BigEndian>()?,
        last_commit_time: r.read_i64::<BigEndian>()?,
        next_ud_seq: r.read_u64::<BigEndian>()?,
    };
    if !r.is_empty() {
        return Err(Error::Corrupted(
            "checkpoint misc",
            format!("{} trailing bytes", r.len()),
        ));
    }
    Ok(misc)
}
