use super::query::scan_segments;
use super::tuple_store::FileBasedTupleStore;
use super::ud::UdOverlay;
use crate::encoding::delimited;
use crate::error::Result;
use crate::RowId;

/// Pushes pending statements and every unmaterialized row to the
/// warehouse, then advances the low-water mark.
///
/// Nothing local changes until the warehouse accepted everything, so a
/// failure needs no rollback. A retry re-applies statements that already
/// reached the warehouse; updates to constants and deletes are idempotent.
/// Rows are streamed from above the warehouse's recorded high row, so rows
/// loaded before a failed checkpoint are not loaded twice.
pub(crate) fn materialize(store: &FileBasedTupleStore) -> Result<RowId> {
    let snapshot = store.snapshot();
    let misc = *snapshot.misc;
    let table = &store.catalog.target.table;

    let mut applied = Vec::new();
    for (&seq, entry) in snapshot.uds.iter().filter(|(_, e)| e.needs_warehouse()) {
        let through = entry.warehouse_bound.min(entry.row_cutoff);
        let affected = store
            .warehouse
            .apply_ud(&store.catalog, &entry.statement, through)?;
        tracing::debug!(
            table = %table,
            statement = entry.statement.id,
            through,
            affected,
            "Applied statement to warehouse"
        );
        applied.push(seq);
    }

    let from = misc.last_mat_row + 1;
    let to = misc.current_row;
    if from <= to {
        let load_from = match store.warehouse.row_bounds(table)? {
            Some((_, hi)) => from.max(hi + 1),
            None => from,
        };
        let overlay = UdOverlay::new(&snapshot.uds, None);
        let mut out = Vec::new();
        scan_segments(store, &snapshot, load_from, to, false, |bytes| {
            overlay.for_each_row(&store.codec, bytes, |values, row_id| {
                delimited::write_row(&mut out, values, row_id)
            })
        })?;
        let loaded = if out.is_empty() {
            0
        } else {
            store.warehouse.bulk_load(&store.catalog, &out)?
        };
        store.warehouse.record_materialized(table, from, to)?;
        tracing::info!(
            table = %store.catalog.table,
            from = load_from,
            to,
            loaded,
            "Materialized rows"
        );
    }

    if from <= to || !snapshot.uds.is_empty() {
        let flush = store.state.begin_flush()?;
        store.state.misc.write(|m| m.last_mat_row = to)?;
        let settled = store.state.uds.settle(&applied, to)?;
        flush.commit()?;
        if settled > 0 {
            tracing::debug!(table = %store.catalog.table, settled, "Retired statements");
        }
    }

    // Open segments are marked once a later flush seals them.
    let snapshot = store.snapshot();
    for (key, handle) in snapshot.segments.iter() {
        if handle.sealed && handle.last_row <= to {
            if let Some(counter) = snapshot.counters.get(key) {
                counter.mark_materialized();
            }
        }
    }
    Ok(to)
}
