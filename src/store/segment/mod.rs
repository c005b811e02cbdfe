//! Append-only row segments.
//!
//! A segment owns the encoded bytes of a contiguous run of rows together
//! with a sparse index of `(row_id, offset)` pairs, one per row. Row IDs are
//! strictly increasing inside a segment, so range lookups are two binary
//! searches over the index.
//!
//! ```text
//! row_ids:  [ 11 | 12 | 15 | 16 ]
//! offsets:  [  0 | 37 | 70 | 98 ]
//! data:     [row 11][row 12][row 15][row 16]....free....
//!                                           ^used      ^capacity
//! ```

pub mod cache;
pub mod file;

use std::io::{self, Write};
use std::ops::Range;

use crate::error::{Error, Result};
use crate::{RowId, SegmentId};

pub use cache::SegmentCache;

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    id: SegmentId,
    capacity: usize,
    data: Vec<u8>,
    row_ids: Vec<RowId>,
    offsets: Vec<u32>,
}

impl Segment {
    pub fn new(id: SegmentId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            data: Vec::with_capacity(capacity.min(1 << 20)),
            row_ids: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        id: SegmentId,
        capacity: usize,
        data: Vec<u8>,
        row_ids: Vec<RowId>,
        offsets: Vec<u32>,
    ) -> Result<Self> {
        let corrupted = |msg: String| Err(Error::Corrupted("segment", msg));
        if row_ids.len() != offsets.len() {
            return corrupted(format!(
                "segment {id}: {} row ids but {} offsets",
                row_ids.len(),
                offsets.len()
            ));
        }
        if data.len() > capacity {
            return corrupted(format!(
                "segment {id}: {} bytes used exceeds capacity {capacity}",
                data.len()
            ));
        }
        if row_ids.windows(2).any(|w| w[0] >= w[1]) {
            return corrupted(format!("segment {id}: row ids are not increasing"));
        }
        if offsets.windows(2).any(|w| w[0] >= w[1])
            || offsets.last().is_some_and(|&o| o as usize >= data.len())
        {
            return corrupted(format!("segment {id}: offsets are out of order"));
        }
        Ok(Self {
            id,
            capacity,
            data,
            row_ids,
            offsets,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn row_count(&self) -> usize {
        self.row_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }

    pub fn first_row_id(&self) -> Option<RowId> {
        self.row_ids.first().copied()
    }

    pub fn last_row_id(&self) -> Option<RowId> {
        self.row_ids.last().copied()
    }

    pub(crate) fn row_ids(&self) -> &[RowId] {
        &self.row_ids
    }

    pub(crate) fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    /// Appends one encoded row and returns the offset it was written at.
    pub fn add_row(&mut self, bytes: &[u8], row_id: RowId) -> Result<usize> {
        if let Some(last) = self.last_row_id() {
            if row_id <= last {
                return Err(Error::InvalidOperation(format!(
                    "row {row_id} does not follow row {last} in segment {}",
                    self.id
                )));
            }
        }
        if bytes.len() > self.remaining() {
            return Err(Error::InvalidOperation(format!(
                "row {row_id} ({} bytes) does not fit segment {} ({} bytes free)",
                bytes.len(),
                self.id,
                self.remaining()
            )));
        }
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        self.row_ids.push(row_id);
        self.offsets.push(offset as u32);
        Ok(offset)
    }

    /// Returns the byte range holding every row whose ID lies in
    /// `[from, to]`, clamped to this segment's rows, or `None` when no row
    /// matches.
    ///
    /// The lower bound rounds up to the next present row and the upper bound
    /// rounds down to the previous one.
    pub fn get_limits(&self, from: RowId, to: RowId) -> Option<Range<usize>> {
        if from > to || self.is_empty() {
            return None;
        }
        let start_idx = self.row_ids.partition_point(|&id| id < from);
        let end_idx = self.row_ids.partition_point(|&id| id <= to);
        if start_idx >= end_idx {
            return None;
        }
        let start = self.offsets[start_idx] as usize;
        let end = self
            .offsets
            .get(end_idx)
            .map_or(self.data.len(), |&o| o as usize);
        Some(start..end)
    }

    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.data[range]
    }

    /// Streams a byte range returned by [`Segment::get_limits`] into `dest`.
    pub fn transfer_data(&self, range: Range<usize>, dest: &mut impl Write) -> io::Result<usize> {
        let bytes = &self.data[range];
        dest.write_all(bytes)?;
        Ok(bytes.len())
    }

    /// Truncates the segment so that it ends just before `row_id`. Used to
    /// undo appends that were never committed.
    pub fn drop_from(&mut self, row_id: RowId) {
        let idx = self.row_ids.partition_point(|&id| id < row_id);
        if idx < self.row_ids.len() {
            self.data.truncate(self.offsets[idx] as usize);
            self.row_ids.truncate(idx);
            self.offsets.truncate(idx);
        }
    }
}
