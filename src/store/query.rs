use super::state::Snapshot;
use super::tuple_store::FileBasedTupleStore;
use super::ud::UdOverlay;
use crate::error::Result;
use crate::protocol::END_OF_STREAM;
use crate::{RowId, Timestamp};

/// Hands `f` the encoded bytes of every committed row in `[from, to]`, one
/// contiguous run per segment, lowest rows first.
///
/// With `skip_missing`, a sealed segment whose file is gone (collected
/// while the read was in flight) is skipped instead of failing the scan.
/// Only materialized segments are skipped; any other unreadable segment
/// fails the scan since its rows exist nowhere else.
pub(crate) fn scan_segments(
    store: &FileBasedTupleStore,
    snapshot: &Snapshot,
    from: RowId,
    to: RowId,
    skip_missing: bool,
    mut f: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    for (_, handle) in snapshot.segments_in(from, to) {
        if !handle.sealed {
            let open = store.state.open_segment()?;
            if open.id() == handle.id {
                // The open segment may already hold rows of a newer flush;
                // `to` never reaches past the snapshot's last row.
                if let Some(range) = open.get_limits(from, to) {
                    f(open.bytes(range))?;
                }
                continue;
            }
        }
        let segment = match store.cache.get_or_load(handle.id) {
            Ok(segment) => segment,
            Err(e) if skip_missing && handle.last_row <= store.last_mat_row() => {
                tracing::warn!(
                    table = %store.catalog.table,
                    segment_id = handle.id,
                    error = %e,
                    "Skipping unreadable segment"
                );
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Some(range) = segment.get_limits(from, to) {
            f(segment.bytes(range))?;
        }
    }
    Ok(())
}

pub(crate) fn query(
    store: &FileBasedTupleStore,
    dest: &mut Vec<u8>,
    min: RowId,
    max: RowId,
    query_start: Timestamp,
    freshness: Option<i64>,
) -> Result<()> {
    let mut snapshot = store.snapshot();
    let (cutoff, overlay) = match freshness.filter(|_| store.ping.is_active()) {
        Some(freshness) => {
            let bound = query_start - freshness;
            if snapshot.misc.last_commit_time < bound {
                store
                    .ping
                    .locker()
                    .await_time(bound, store.config.accuracy_timeout)?;
                snapshot = store.snapshot();
            }
            let cutoff = snapshot.accuracy_cutoff(bound);
            (cutoff, UdOverlay::new(&snapshot.uds, Some(bound)))
        }
        None => (
            snapshot.misc.current_row,
            UdOverlay::new(&snapshot.uds, None),
        ),
    };

    let from = min.saturating_add(1);
    let to = max.saturating_sub(1).min(cutoff);
    let start = dest.len();
    scan_segments(store, &snapshot, from, to, true, |bytes| {
        if overlay.is_empty() {
            dest.extend_from_slice(bytes);
            Ok(())
        } else {
            overlay.transform(&store.codec, bytes, dest)
        }
    })?;
    tracing::debug!(
        table = %store.catalog.table,
        min,
        max,
        cutoff,
        bytes = dest.len() - start,
        "Served query"
    );
    dest.push(END_OF_STREAM);
    Ok(())
}

/// Increments the counter of every segment keyed strictly between `min`
/// and `max`. Returns the keys pinned.
pub(crate) fn register(store: &FileBasedTupleStore, min: RowId, max: RowId) -> Vec<RowId> {
    if max.saturating_sub(min) < 2 {
        return Vec::new();
    }
    let counters = store.state.counters.snapshot();
    counters
        .range(min + 1..max)
        .map(|(&key, counter)| {
            counter.increment();
            key
        })
        .collect()
}

/// Releases the pins taken by [`register`]. Without a recorded
/// registration, every segment in the range is released. Returns how many
/// counters were decremented.
pub(crate) fn unregister(
    store: &FileBasedTupleStore,
    min: RowId,
    max: RowId,
    keys: Option<Vec<RowId>>,
) -> usize {
    let counters = store.state.counters.snapshot();
    let keys = keys.unwrap_or_else(|| {
        tracing::warn!(
            table = %store.catalog.table,
            min,
            max,
            "Unregistering a range that was never registered"
        );
        if max.saturating_sub(min) < 2 {
            return Vec::new();
        }
        counters.range(min + 1..max).map(|(&k, _)| k).collect()
    });

    let mut released = 0;
    for key in keys {
        let Some(counter) = counters.get(&key) else {
            continue;
        };
        if counter.decrement() {
            released += 1;
        } else {
            tracing::warn!(
                table = %store.catalog.table,
                segment_key = key,
                "Reference count already zero"
            );
        }
    }
    released
}
