use std::io::Cursor;
use std::sync::Arc;

use super::counter::Counter;
use super::segment::file::{segment_path, write_segment};
use super::segment::Segment;
use super::state::{SegmentHandle, StoreMisc};
use super::tuple_store::FileBasedTupleStore;
use super::ud::{UdEntry, UdStatement};
use crate::error::{Error, Result};
use crate::{RowId, Timestamp};

fn check_commit(misc: &StoreMisc, commit_time: Timestamp, count: i32) -> Result<()> {
    if count < 0 {
        return Err(Error::decode("batch", format!("negative count {count}")));
    }
    if commit_time < misc.last_commit_time {
        return Err(Error::InvalidOperation(format!(
            "commit time {commit_time} is before last commit {}",
            misc.last_commit_time
        )));
    }
    Ok(())
}

/// Appends a batch of encoded rows inside one flush. Returns the segments
/// sealed along the way so the caller can cache them once the flush is
/// durable.
///
/// Rows go straight into the open segment, so a failed batch leaves bytes
/// behind in it; the caller must roll back on error.
pub(crate) fn apply_rows(
    store: &FileBasedTupleStore,
    commit_time: Timestamp,
    row_count: i32,
    bytes: &[u8],
) -> Result<Vec<Arc<Segment>>> {
    let state = &store.state;
    check_commit(&state.misc.read(), commit_time, row_count)?;

    let flush = state.begin_flush()?;
    let mut misc = state.misc.write(|m| *m)?;
    let mut open = state.open_segment()?;
    let mut sealed = Vec::new();
    let mut appended = 0usize;
    let mut open_dirty = false;

    for row in store.codec.rows(bytes) {
        let row = row?;
        if row.row_id <= misc.current_row {
            return Err(Error::decode(
                "row batch",
                format!("row {} does not follow row {}", row.row_id, misc.current_row),
            ));
        }

        if row.bytes.len() > open.remaining() {
            if open.is_empty() {
                return Err(Error::InvalidOperation(format!(
                    "row {} ({} bytes) exceeds segment size {}",
                    row.row_id,
                    row.bytes.len(),
                    open.capacity()
                )));
            }
            let next = Segment::new(open.id() + 1, misc.segment_size as usize);
            let full = std::mem::replace(&mut *open, next);
            seal(store, &full)?;
            misc.segment_id = open.id();
            sealed.push(Arc::new(full));
        }

        if open.is_empty() {
            state.row_index.insert(row.row_id, open.id())?;
            state.counters.insert(row.row_id, Arc::new(Counter::new()))?;
        }
        open.add_row(row.bytes, row.row_id)?;
        misc.current_row = row.row_id;
        appended += 1;
        open_dirty = true;
    }

    if appended != row_count as usize {
        return Err(Error::decode(
            "row batch",
            format!("expected {row_count} rows, found {appended}"),
        ));
    }

    if open_dirty {
        write_segment(&segment_path(&store.dir, open.id()), &open)?;
        if let (Some(first), Some(last)) = (open.first_row_id(), open.last_row_id()) {
            state.segments.insert(
                first,
                SegmentHandle {
                    id: open.id(),
                    last_row: last,
                    sealed: false,
                },
            )?;
        }
    }
    drop(open);

    if appended > 0 {
        state.time_index.insert(commit_time, misc.current_row)?;
    }
    misc.last_commit_time = commit_time;
    state.misc.write(|m| *m = misc)?;
    flush.commit()?;
    Ok(sealed)
}

/// Writes a full segment to its final file and marks its handle sealed.
fn seal(store: &FileBasedTupleStore, segment: &Segment) -> Result<()> {
    let (Some(first), Some(last)) = (segment.first_row_id(), segment.last_row_id()) else {
        return Ok(());
    };
    write_segment(&segment_path(&store.dir, segment.id()), segment)?;
    store.state.segments.insert(
        first,
        SegmentHandle {
            id: segment.id(),
            last_row: last,
            sealed: true,
        },
    )?;
    tracing::debug!(
        table = %store.catalog.table,
        segment_id = segment.id(),
        first_row = first,
        last_row = last,
        bytes = segment.used(),
        "Sealed segment"
    );
    Ok(())
}

/// Appends a batch of update/delete statements inside one flush. Each
/// statement affects the rows committed before it.
pub(crate) fn apply_uds(
    store: &FileBasedTupleStore,
    commit_time: Timestamp,
    entry_count: i32,
    bytes: &[u8],
) -> Result<()> {
    let state = &store.state;
    check_commit(&state.misc.read(), commit_time, entry_count)?;

    let types = store.catalog.types();
    let mut cursor = Cursor::new(bytes);
    let statements = (0..entry_count)
        .map(|_| UdStatement::decode(&mut cursor, &types))
        .collect::<Result<Vec<_>>>()?;
    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(Error::decode(
            "ud batch",
            format!("{} trailing bytes after {entry_count} statements", bytes.len() - consumed),
        ));
    }

    let flush = state.begin_flush()?;
    let mut misc = state.misc.write(|m| *m)?;
    for statement in statements {
        let row_cutoff: RowId = misc.current_row;
        state.uds.append(
            misc.next_ud_seq,
            UdEntry {
                statement,
                commit_time,
                row_cutoff,
                warehouse_bound: misc.last_mat_row,
                warehouse_applied: false,
            },
        )?;
        misc.next_ud_seq += 1;
    }
    misc.last_commit_time = commit_time;
    state.misc.write(|m| *m = misc)?;
    flush.commit()
}
