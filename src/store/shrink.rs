use std::fs;

use super::segment::file::segment_path;
use super::tuple_store::FileBasedTupleStore;
use crate::error::Result;
use crate::{RowId, SegmentId};

/// Removes the leading run of segments that are materialized, sealed and
/// not pinned by any reader. Stops at the first segment that must stay, so
/// the staged rows remain one contiguous range.
pub(crate) fn shrink(store: &FileBasedTupleStore) -> Result<usize> {
    let snapshot = store.snapshot();
    let mut doomed: Vec<(RowId, SegmentId)> = Vec::new();
    let mut removed = None;
    for (&key, counter) in snapshot.counters.iter() {
        let Some(handle) = snapshot.segments.get(&key) else {
            break;
        };
        if !counter.can_be_deleted() || !handle.sealed || handle.id == snapshot.misc.segment_id {
            break;
        }
        doomed.push((key, handle.id));
        removed = Some((key, handle.last_row));
    }
    let Some((removed_key, removed_through)) = removed else {
        return Ok(0);
    };

    let state = &store.state;
    let flush = state.begin_flush()?;
    for (key, _) in &doomed {
        state.row_index.remove(key)?;
        state.counters.remove(key)?;
        state.segments.remove(key)?;
    }
    // Entries at or above the last removed key still bound reads of the
    // rows staged after it.
    state.time_index.retain(|_, row| *row >= removed_key)?;
    flush.commit()?;
    store.checkpoint()?;

    // Files go only once the checkpoint no longer names them; a crash in
    // between leaves orphans that recovery removes.
    for (_, id) in &doomed {
        let path = segment_path(&store.dir, *id);
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(file = %path.display(), error = %e, "Failed to remove segment file");
        }
        store.cache.remove(*id)?;
    }
    tracing::info!(
        table = %store.catalog.table,
        segments = doomed.len(),
        removed_through,
        "Reclaimed segments"
    );
    Ok(doomed.len())
}
