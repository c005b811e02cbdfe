use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::accuracy::PingServer;
use super::checkpoint::{CheckpointState, LocalMaterializer};
use super::metrics::TableMetrics;
use super::segment::{Segment, SegmentCache};
use super::state::{Snapshot, StoreMisc, TableState};
use super::{flush, materialize, query, recovery, shrink};
use crate::catalog::{Catalog, CATALOG_FILE};
use crate::config::StoreConfig;
use crate::encoding::row::RowCodec;
use crate::error::{Error, Result};
use crate::warehouse::Warehouse;
use crate::{RowId, Timestamp};

/// The staging store of one table.
///
/// Flushes, materialization, garbage collection and rollback run one at a
/// time under the flush mutex. Reads never take it: they work on a
/// [`Snapshot`] of the last completed flush.
pub struct FileBasedTupleStore {
    pub(crate) config: StoreConfig,
    pub(crate) catalog: Catalog,
    pub(crate) codec: RowCodec,
    pub(crate) dir: PathBuf,
    pub(crate) state: TableState,
    pub(crate) cache: SegmentCache,
    pub(crate) warehouse: Arc<dyn Warehouse>,
    pub(crate) ping: PingServer,
    materializer: LocalMaterializer,
    flush_lock: Mutex<()>,
    /// Segment keys pinned per registered `(min, max)` range, so that an
    /// unregister releases exactly what its register took.
    registrations: Mutex<HashMap<(RowId, RowId), Vec<Vec<RowId>>>>,
    unavailable: Mutex<Option<String>>,
}

impl FileBasedTupleStore {
    /// Opens the table described by `catalog`, creating it on first use.
    /// An existing table must have the same columns and primary key.
    pub fn open(
        config: StoreConfig,
        catalog: Catalog,
        warehouse: Arc<dyn Warehouse>,
    ) -> Result<Self> {
        catalog.validate()?;
        let dir = config.data_dir.join(&catalog.table);
        fs::create_dir_all(&dir)?;

        let catalog = if dir.join(CATALOG_FILE).exists() {
            let existing = Catalog::load(&dir)?;
            existing.ensure_compatible(&catalog)?;
            existing
        } else {
            catalog.save(&dir)?;
            catalog
        };
        Self::open_dir(config, dir, catalog, warehouse)
    }

    /// Reopens a table from its directory under the data dir.
    pub fn open_existing(
        config: StoreConfig,
        table: &str,
        warehouse: Arc<dyn Warehouse>,
    ) -> Result<Self> {
        let dir = config.data_dir.join(table);
        if !dir.join(CATALOG_FILE).exists() {
            return Err(Error::NotFound(table.to_string()));
        }
        let catalog = Catalog::load(&dir)?;
        Self::open_dir(config, dir, catalog, warehouse)
    }

    fn open_dir(
        config: StoreConfig,
        dir: PathBuf,
        catalog: Catalog,
        warehouse: Arc<dyn Warehouse>,
    ) -> Result<Self> {
        let materializer = LocalMaterializer::new(&dir, catalog.types());
        let (checkpoint, fresh) = match materializer.load()? {
            Some(checkpoint) => (checkpoint, false),
            None => (Self::initial_checkpoint(&config)?, true),
        };

        let store = Self {
            codec: catalog.codec(),
            cache: SegmentCache::new(&dir, config.segment_cache_capacity),
            state: TableState::new(StoreMisc::default(), Segment::new(0, 0)),
            ping: PingServer::new(checkpoint.misc.last_commit_time),
            config,
            catalog,
            dir,
            warehouse,
            materializer,
            flush_lock: Mutex::new(()),
            registrations: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(None),
        };
        recovery::restore(&store.dir, &store.cache, &store.state, checkpoint)?;
        if fresh {
            // finalized/ must exist before the first flush can roll back.
            store.checkpoint()?;
        }

        let misc = store.state.misc.read();
        tracing::info!(
            table = %store.catalog.table,
            current_row = misc.current_row,
            last_mat_row = misc.last_mat_row,
            segments = store.state.segments.len(),
            fresh,
            "Opened tuple store"
        );
        Ok(store)
    }

    fn initial_checkpoint(config: &StoreConfig) -> Result<CheckpointState> {
        let segment_size = u32::try_from(config.segment_size)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| {
                Error::InvalidOperation(format!("invalid segment size {}", config.segment_size))
            })?;
        Ok(CheckpointState {
            misc: StoreMisc {
                segment_size,
                segment_id: 1,
                next_ud_seq: 1,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn table(&self) -> &str {
        &self.catalog.table
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ping_server(&self) -> &PingServer {
        &self.ping
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    /// Highest committed row ID; the producer's row sequence resumes after it.
    pub fn current_row(&self) -> RowId {
        self.state.misc.read().current_row
    }

    pub fn last_mat_row(&self) -> RowId {
        self.state.misc.read().last_mat_row
    }

    pub fn last_commit_time(&self) -> Timestamp {
        self.state.misc.read().last_commit_time
    }

    /// Appends a batch of `row_count` encoded rows committed at
    /// `commit_time`. On any failure the table is rolled back to its last
    /// checkpoint and none of the batch becomes visible.
    pub fn read_rows_in(&self, commit_time: Timestamp, row_count: i32, bytes: &[u8]) -> Result<()> {
        self.ensure_available()?;
        let _flush = self.lock_flush()?;
        match flush::apply_rows(self, commit_time, row_count, bytes) {
            Ok(sealed) => {
                self.checkpoint()?;
                for segment in sealed {
                    self.cache.insert(segment)?;
                }
                self.ping.locker().signal(commit_time);
                tracing::debug!(
                    table = %self.catalog.table,
                    commit_time,
                    rows = row_count,
                    current_row = self.current_row(),
                    "Flushed rows"
                );
                Ok(())
            }
            Err(e) => self.fail_flush("rows", e),
        }
    }

    /// Appends `entry_count` encoded update/delete statements committed at
    /// `commit_time`, with the same all-or-nothing behavior as
    /// [`FileBasedTupleStore::read_rows_in`].
    pub fn read_uds_in(&self, commit_time: Timestamp, entry_count: i32, bytes: &[u8]) -> Result<()> {
        self.ensure_available()?;
        let _flush = self.lock_flush()?;
        match flush::apply_uds(self, commit_time, entry_count, bytes) {
            Ok(()) => {
                self.checkpoint()?;
                self.ping.locker().signal(commit_time);
                tracing::debug!(
                    table = %self.catalog.table,
                    commit_time,
                    entries = entry_count,
                    "Flushed update/delete statements"
                );
                Ok(())
            }
            Err(e) => self.fail_flush("update/delete statements", e),
        }
    }

    /// Moves every committed, unmaterialized row into the warehouse and
    /// returns the new low-water mark.
    pub fn materialize(&self) -> Result<RowId> {
        self.ensure_available()?;
        let _flush = self.lock_flush()?;
        let through = materialize::materialize(self)?;
        self.checkpoint()?;
        shrink::shrink(self)?;
        Ok(through)
    }

    /// Pins every segment keyed strictly between `min` and `max`.
    pub fn register(&self, min: RowId, max: RowId) -> Result<usize> {
        self.ensure_available()?;
        let keys = query::register(self, min, max);
        let pinned = keys.len();
        self.lock_registrations()?
            .entry((min, max))
            .or_default()
            .push(keys);
        Ok(pinned)
    }

    /// Releases the pins of the matching [`FileBasedTupleStore::register`].
    pub fn unregister(&self, min: RowId, max: RowId) -> Result<usize> {
        self.ensure_available()?;
        let keys = {
            let mut registrations = self.lock_registrations()?;
            let keys = registrations.get_mut(&(min, max)).and_then(|v| v.pop());
            if registrations.get(&(min, max)).is_some_and(|v| v.is_empty()) {
                registrations.remove(&(min, max));
            }
            keys
        };
        Ok(query::unregister(self, min, max, keys))
    }

    /// Streams committed rows with IDs in `(min, max)` into `dest`, followed
    /// by the end-of-stream marker. With a freshness and an active accuracy
    /// protocol the read reflects commits up to `query_start - freshness`,
    /// waiting for the producer if they have not arrived yet.
    pub fn query(
        &self,
        dest: &mut Vec<u8>,
        min: RowId,
        max: RowId,
        query_start: Timestamp,
        freshness: Option<i64>,
    ) -> Result<()> {
        self.ensure_available()?;
        query::query(self, dest, min, max, query_start, freshness)
    }

    /// Discards every change since the last checkpoint.
    pub fn rollback(&self) -> Result<()> {
        self.ensure_available()?;
        let _flush = self.lock_flush()?;
        self.rollback_locked()?;
        tracing::info!(table = %self.catalog.table, "Rolled back to last checkpoint");
        Ok(())
    }

    /// Reclaims materialized segments no reader holds. Returns how many
    /// were removed.
    pub fn shrink(&self) -> Result<usize> {
        self.ensure_available()?;
        let _flush = self.lock_flush()?;
        shrink::shrink(self)
    }

    pub fn metrics(&self) -> TableMetrics {
        let snapshot = self.snapshot();
        let (cache_hits, cache_misses, _) = self.cache.stats();
        TableMetrics {
            table: self.catalog.table.clone(),
            current_row: snapshot.misc.current_row,
            last_mat_row: snapshot.misc.last_mat_row,
            last_commit_time: snapshot.misc.last_commit_time,
            segments: snapshot.segments.len(),
            pinned_segments: snapshot
                .counters
                .values()
                .filter(|c| c.ref_count() > 0)
                .count(),
            open_segment_id: snapshot.misc.segment_id,
            pending_uds: snapshot.uds.len(),
            waiting_readers: self.ping.locker().waiting(),
            cached_segments: self.cache.len(),
            cache_hits,
            cache_misses,
            available: self.ensure_available().is_ok(),
        }
    }

    /// Fails every parked reader; used on shutdown.
    pub fn close(&self) {
        self.ping.locker().close();
    }

    pub fn is_available(&self) -> bool {
        self.ensure_available().is_ok()
    }

    /// Writes the current state as the new finalized checkpoint. A failure
    /// leaves the table unavailable.
    pub(crate) fn checkpoint(&self) -> Result<()> {
        self.materializer
            .backup(&self.state.capture())
            .map_err(|e| self.mark_unavailable("checkpoint", e))
    }

    fn rollback_locked(&self) -> Result<()> {
        let restored = self.materializer.load().and_then(|checkpoint| {
            let checkpoint = checkpoint.ok_or_else(|| {
                Error::InvalidState("no finalized checkpoint to roll back to".to_string())
            })?;
            recovery::restore(&self.dir, &self.cache, &self.state, checkpoint)
        });
        restored.map_err(|e| self.mark_unavailable("rollback", e))
    }

    fn fail_flush<T>(&self, what: &str, error: Error) -> Result<T> {
        tracing::warn!(
            table = %self.catalog.table,
            error = %error,
            "Flush of {what} failed, rolling back"
        );
        self.rollback_locked()?;
        Err(error)
    }

    fn mark_unavailable(&self, what: &str, error: Error) -> Error {
        let reason = format!("{what} failed: {error}");
        tracing::error!(table = %self.catalog.table, error = %error, "Table is now unavailable after failed {what}");
        if let Ok(mut unavailable) = self.unavailable.lock() {
            unavailable.get_or_insert(reason.clone());
        }
        Error::Unavailable(self.catalog.table.clone(), reason)
    }

    fn ensure_available(&self) -> Result<()> {
        match self.unavailable.lock() {
            Ok(unavailable) => match unavailable.as_ref() {
                Some(reason) => Err(Error::Unavailable(self.catalog.table.clone(), reason.clone())),
                None => Ok(()),
            },
            Err(_) => Err(Error::Unavailable(
                self.catalog.table.clone(),
                "availability lock poisoned".to_string(),
            )),
        }
    }

    fn lock_flush(&self) -> Result<MutexGuard<'_, ()>> {
        self.flush_lock
            .lock()
            .map_err(|_| Error::InvalidState("flush mutex poisoned".to_string()))
    }

    fn lock_registrations(&self) -> Result<MutexGuard<'_, HashMap<(RowId, RowId), Vec<Vec<RowId>>>>> {
        self.registrations
            .lock()
            .map_err(|_| Error::InvalidState("registration mutex poisoned".to_string()))
    }
}

impl Drop for FileBasedTupleStore {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::encoding::{DataType, Value};
    use crate::protocol::END_OF_STREAM;
    use crate::encoding::delimited;
    use crate::store::segment::file::segment_path;
    use crate::store::ud::{CompareOp, UdStatement};
    use crate::warehouse::{FileWarehouse, MemoryWarehouse};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn catalog() -> Catalog {
        Catalog::new(
            "orders",
            vec![
                Column::new("customer", DataType::String),
                Column::new("amount", DataType::Long),
            ],
        )
    }

    fn open_with(dir: &TempDir, segment_size: usize) -> Result<(FileBasedTupleStore, Arc<MemoryWarehouse>)> {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = StoreConfig::new(dir.path())
            .segment_size(segment_size)
            .accuracy_timeout(Duration::from_secs(5));
        let store = FileBasedTupleStore::open(config, catalog(), warehouse.clone())?;
        Ok((store, warehouse))
    }

    fn open(dir: &TempDir) -> Result<(FileBasedTupleStore, Arc<MemoryWarehouse>)> {
        open_with(dir, 4096)
    }

    fn batch(ids: std::ops::RangeInclusive<RowId>) -> (i32, Vec<u8>) {
        let codec = catalog().codec();
        let mut bytes = Vec::new();
        let mut count = 0;
        for id in ids {
            codec
                .encode_into(&mut bytes, &[Value::Str(format!("c{id}")), Value::Long(id * 10)], id)
                .unwrap();
            count += 1;
        }
        (count, bytes)
    }

    fn flush_rows(store: &FileBasedTupleStore, time: Timestamp, ids: std::ops::RangeInclusive<RowId>) -> Result<()> {
        let (count, bytes) = batch(ids);
        store.read_rows_in(time, count, &bytes)
    }

    fn read_ids(store: &FileBasedTupleStore, min: RowId, max: RowId, start: Timestamp, freshness: Option<i64>) -> Result<Vec<RowId>> {
        let mut out = Vec::new();
        store.query(&mut out, min, max, start, freshness)?;
        assert_eq!(out.pop(), Some(END_OF_STREAM));
        store
            .codec
            .rows(&out)
            .map(|r| r.map(|r| r.row_id))
            .collect()
    }

    fn uds_bytes(statements: &[UdStatement]) -> Vec<u8> {
        let types = catalog().types();
        let mut bytes = Vec::new();
        for s in statements {
            s.encode_into(&mut bytes, &types).unwrap();
        }
        bytes
    }

    #[test]
    fn test_flush_and_query() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open(&dir)?;
        flush_rows(&store, 100, 1..=5)?;
        flush_rows(&store, 200, 6..=8)?;

        assert_eq!(store.current_row(), 8);
        assert_eq!(read_ids(&store, 0, 9, 0, None)?, (1..=8).collect::<Vec<_>>());
        assert_eq!(read_ids(&store, 2, 7, 0, None)?, vec![3, 4, 5, 6]);
        assert_eq!(read_ids(&store, 8, 20, 0, None)?, Vec::<RowId>::new());
        Ok(())
    }

    #[test]
    fn test_segments_seal_and_reload() -> Result<()> {
        let dir = TempDir::new()?;
        // Rows 1..=9 encode to 21 bytes, so a 64-byte segment holds three.
        let (store, _) = open_with(&dir, 64)?;
        flush_rows(&store, 100, 1..=7)?;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.segments.len(), 3);
        assert_eq!(
            snapshot.segments.values().filter(|h| h.sealed).count(),
            2
        );
        assert_eq!(read_ids(&store, 0, 100, 0, None)?, (1..=7).collect::<Vec<_>>());
        drop(store);

        let (store, _) = open_with(&dir, 64)?;
        assert_eq!(store.current_row(), 7);
        assert_eq!(read_ids(&store, 0, 100, 0, None)?, (1..=7).collect::<Vec<_>>());
        flush_rows(&store, 200, 8..=9)?;
        assert_eq!(read_ids(&store, 6, 100, 0, None)?, vec![7, 8, 9]);
        Ok(())
    }

    #[test]
    fn test_failed_flush_restores_checkpoint() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open_with(&dir, 64)?;
        flush_rows(&store, 100, 1..=3)?;
        let before = store.state.capture();

        // Rows 4..=9 fill and seal segments before the bad count is noticed.
        let (_, bytes) = batch(4..=9);
        assert!(matches!(
            store.read_rows_in(200, 7, &bytes),
            Err(Error::Decode(..))
        ));
        assert_eq!(store.state.capture(), before);
        assert_eq!(store.materializer.load()?, Some(before));
        assert_eq!(read_ids(&store, 0, 100, 0, None)?, vec![1, 2, 3]);

        // Truncated payloads fail the same way.
        let (count, bytes) = batch(4..=5);
        assert!(store.read_rows_in(200, count, &bytes[..bytes.len() - 3]).is_err());
        assert_eq!(store.current_row(), 3);

        // The table keeps working afterwards.
        flush_rows(&store, 200, 4..=9)?;
        assert_eq!(read_ids(&store, 0, 100, 0, None)?, (1..=9).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_out_of_order_rows_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open(&dir)?;
        flush_rows(&store, 100, 1..=3)?;
        assert!(flush_rows(&store, 200, 3..=4).is_err());
        assert!(flush_rows(&store, 50, 4..=4).is_err());
        assert_eq!(store.current_row(), 3);
        Ok(())
    }

    #[test]
    fn test_register_materialize_unregister_shrink() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, warehouse) = open_with(&dir, 64)?;
        flush_rows(&store, 100, 1..=5)?;
        // Row 7 seals the segment holding rows 4..=6.
        flush_rows(&store, 110, 6..=7)?;
        let keys: Vec<RowId> = store.snapshot().segments.keys().copied().collect();
        assert_eq!(keys, vec![1, 4, 7]);

        assert_eq!(store.register(0, 5)?, 2);

        assert_eq!(store.materialize()?, 7);
        assert_eq!(warehouse.rows("orders").len(), 7);
        assert_eq!(warehouse.row_bounds("orders")?, Some((1, 7)));
        // Pinned segments survive the shrink run by materialize.
        let snapshot = store.snapshot();
        assert_eq!(snapshot.segments.len(), 3);
        assert!(snapshot.counters[&1].is_materialized());
        assert!(snapshot.counters[&4].is_materialized());
        assert!(snapshot
            .counters
            .range(1..5)
            .all(|(_, c)| c.ref_count() == 1));

        assert_eq!(store.unregister(0, 5)?, 2);
        assert!(store.snapshot().counters.values().all(|c| c.ref_count() == 0));

        assert_eq!(store.shrink()?, 2);
        assert_eq!(store.shrink()?, 0);
        assert!(!dir.path().join("orders").join("seg1.dat").exists());
        assert_eq!(read_ids(&store, 0, 100, 0, None)?, vec![7]);
        // Only the open segment is left.
        let snapshot = store.snapshot();
        assert_eq!(snapshot.segments.len(), 1);
        assert!(snapshot.segments.values().all(|h| !h.sealed));
        Ok(())
    }

    #[test]
    fn test_shrink_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open_with(&dir, 64)?;
        flush_rows(&store, 100, 1..=6)?;
        store.materialize()?;

        let first = store.state.capture();
        assert_eq!(store.shrink()?, 0);
        assert_eq!(store.state.capture(), first);
        Ok(())
    }

    #[test]
    fn test_failed_bulk_load_leaves_no_state() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, warehouse) = open_with(&dir, 64)?;
        flush_rows(&store, 100, 1..=6)?;
        let before = store.state.capture();

        warehouse.set_fail_loads(true);
        assert!(matches!(store.materialize(), Err(Error::Warehouse(_))));
        assert_eq!(store.state.capture(), before);
        assert!(store.snapshot().counters.values().all(|c| !c.is_materialized()));

        warehouse.set_fail_loads(false);
        assert_eq!(store.materialize()?, 6);
        Ok(())
    }

    #[test]
    fn test_ud_overlay_on_query_and_materialize() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, warehouse) = open(&dir)?;
        flush_rows(&store, 100, 1..=4)?;
        store.materialize()?;
        flush_rows(&store, 200, 5..=8)?;

        // Applies to rows 1..=8: the warehouse copy of rows 1..=4 and the
        // staged rows 5..=8.
        let statements = [
            UdStatement::delete(1, "DELETE FROM orders WHERE amount >= 70")
                .filter(1, CompareOp::Ge, Value::Long(70)),
            UdStatement::update(2, "UPDATE orders SET customer = 'x' WHERE amount < 30")
                .set(0, Value::Str("x".into()))
                .filter(1, CompareOp::Lt, Value::Long(30)),
        ];
        let bytes = uds_bytes(&statements);
        store.read_uds_in(250, 2, &bytes)?;
        assert_eq!(store.snapshot().uds.len(), 2);

        assert_eq!(read_ids(&store, 4, 100, 0, None)?, vec![5, 6]);
        // Rows flushed after the statements are untouched by them.
        flush_rows(&store, 300, 9..=9)?;
        assert_eq!(read_ids(&store, 4, 100, 0, None)?, vec![5, 6, 9]);

        assert_eq!(store.materialize()?, 9);
        let rows = warehouse.rows("orders");
        let ids: Vec<RowId> = rows.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 9]);
        assert_eq!(rows[0].1[0], Value::Str("x".into()));
        assert_eq!(rows[1].1[0], Value::Str("x".into()));
        assert_eq!(rows[2].1[0], Value::Str("c3".into()));
        // Both statements reached every row they can affect.
        assert!(store.snapshot().uds.is_empty());
        Ok(())
    }

    #[test]
    fn test_malformed_uds_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open(&dir)?;
        let bytes = uds_bytes(&[UdStatement::delete(1, "DELETE FROM orders")]);
        assert!(store.read_uds_in(100, 2, &bytes).is_err());
        assert!(store.read_uds_in(100, 1, &bytes[..bytes.len() - 1]).is_err());
        assert!(store.snapshot().uds.is_empty());
        store.read_uds_in(100, 1, &bytes)?;
        assert_eq!(store.snapshot().uds.len(), 1);
        Ok(())
    }

    #[test]
    fn test_accuracy_cutoff_waits_for_commit() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open(&dir)?;
        let store = Arc::new(store);
        store.ping_server().connect();

        flush_rows(&store, 100, 1..=10)?;
        flush_rows(&store, 200, 11..=25)?;

        let reader = {
            let store = store.clone();
            thread::spawn(move || read_ids(&store, 0, 1000, 350, Some(100)))
        };
        let start = Instant::now();
        while store.ping_server().pending() != Some(250) {
            assert!(start.elapsed() < Duration::from_secs(5), "reader never parked");
            thread::sleep(Duration::from_millis(1));
        }

        flush_rows(&store, 300, 26..=40)?;
        let ids = reader.join().unwrap()?;
        assert_eq!(ids, (1..=25).collect::<Vec<_>>());
        assert_eq!(store.ping_server().pending(), None);

        // Already satisfied: no wait, same cutoff.
        assert_eq!(read_ids(&store, 0, 1000, 350, Some(100))?.len(), 25);
        // Without freshness the read sees everything committed.
        assert_eq!(read_ids(&store, 0, 1000, 350, None)?.len(), 40);
        Ok(())
    }

    #[test]
    fn test_accuracy_wait_times_out() -> Result<()> {
        let dir = TempDir::new()?;
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = StoreConfig::new(dir.path()).accuracy_timeout(Duration::from_millis(20));
        let store = FileBasedTupleStore::open(config, catalog(), warehouse)?;
        store.ping_server().connect();
        flush_rows(&store, 100, 1..=2)?;

        let mut out = Vec::new();
        assert!(matches!(
            store.query(&mut out, 0, 10, 500, Some(0)),
            Err(Error::Timeout(500))
        ));
        assert_eq!(store.ping_server().pending(), None);
        Ok(())
    }

    #[test]
    fn test_rollback_discards_nothing_committed() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open(&dir)?;
        flush_rows(&store, 100, 1..=3)?;
        let before = store.state.capture();
        store.rollback()?;
        assert_eq!(store.state.capture(), before);
        Ok(())
    }

    #[test]
    fn test_reopen_rejects_changed_catalog() -> Result<()> {
        let dir = TempDir::new()?;
        drop(open(&dir)?);
        let changed = Catalog::new("orders", vec![Column::new("customer", DataType::String)]);
        let result = FileBasedTupleStore::open(
            StoreConfig::new(dir.path()),
            changed,
            Arc::new(MemoryWarehouse::new()),
        );
        assert!(matches!(result, Err(Error::CatalogMismatch(..))));

        let reopened = FileBasedTupleStore::open_existing(
            StoreConfig::new(dir.path()),
            "orders",
            Arc::new(MemoryWarehouse::new()),
        )?;
        assert_eq!(reopened.catalog(), &catalog());
        assert!(matches!(
            FileBasedTupleStore::open_existing(
                StoreConfig::new(dir.path()),
                "missing",
                Arc::new(MemoryWarehouse::new()),
            ),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_failed_rollback_makes_table_unavailable() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open(&dir)?;
        flush_rows(&store, 100, 1..=2)?;

        // A damaged checkpoint cannot be rolled back to.
        fs::write(store.materializer.finalized_dir().join("misc"), b"garbage")?;
        let (_, bytes) = batch(3..=4);
        assert!(matches!(
            store.read_rows_in(200, 3, &bytes),
            Err(Error::Unavailable(..))
        ));
        assert!(!store.is_available());
        assert!(matches!(store.register(0, 10), Err(Error::Unavailable(..))));
        assert!(matches!(store.materialize(), Err(Error::Unavailable(..))));
        Ok(())
    }

    #[test]
    fn test_shrink_keeps_accuracy_cutoff() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open_with(&dir, 64)?;
        store.ping_server().connect();
        flush_rows(&store, 100, 1..=3)?;
        flush_rows(&store, 200, 4..=6)?;
        flush_rows(&store, 300, 7..=7)?;
        assert_eq!(read_ids(&store, 0, 100, 350, Some(100))?, (1..=6).collect::<Vec<_>>());

        // Segments 1..=3 and 4..=6 are materialized and reclaimed.
        assert_eq!(store.materialize()?, 7);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.segments.keys().copied().collect::<Vec<_>>(), vec![7]);
        assert_eq!(snapshot.time_index.keys().copied().collect::<Vec<_>>(), vec![200, 300]);

        // Row 7 was committed after both bounds.
        assert_eq!(read_ids(&store, 0, 100, 350, Some(100))?, Vec::<RowId>::new());
        assert_eq!(read_ids(&store, 0, 100, 250, Some(100))?, Vec::<RowId>::new());
        assert_eq!(read_ids(&store, 0, 100, 400, Some(100))?, vec![7]);
        assert_eq!(read_ids(&store, 0, 100, 0, None)?, vec![7]);
        Ok(())
    }

    #[test]
    fn test_materialize_retry_loads_rows_once() -> Result<()> {
        let dir = TempDir::new()?;
        let wdir = TempDir::new()?;
        let warehouse = Arc::new(FileWarehouse::open(wdir.path())?);
        let store = FileBasedTupleStore::open(StoreConfig::new(dir.path()), catalog(), warehouse.clone())?;
        flush_rows(&store, 100, 1..=5)?;

        // Rows land in the warehouse but the bounds cannot be recorded.
        let blocker = wdir.path().join("orders.tmp");
        fs::create_dir(&blocker)?;
        assert!(store.materialize().is_err());
        assert_eq!(store.last_mat_row(), 0);
        fs::remove_dir(&blocker)?;
        assert_eq!(store.materialize()?, 5);

        // Rows the warehouse already recorded are not streamed again.
        flush_rows(&store, 200, 6..=7)?;
        let mut data = Vec::new();
        for id in 6..=7 {
            delimited::write_row(&mut data, &[Value::Str(format!("c{id}")), Value::Long(id * 10)], id);
        }
        warehouse.bulk_load(&catalog(), &data)?;
        warehouse.record_materialized("orders", 6, 7)?;
        assert_eq!(store.materialize()?, 7);

        let mut expected = Vec::new();
        for id in 1..=7 {
            delimited::write_row(&mut expected, &[Value::Str(format!("c{id}")), Value::Long(id * 10)], id);
        }
        assert_eq!(fs::read(warehouse.table_path("orders"))?, expected);
        assert_eq!(warehouse.row_bounds("orders")?, Some((1, 7)));
        Ok(())
    }

    #[test]
    fn test_unreadable_segment_fails_read() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open_with(&dir, 64)?;
        flush_rows(&store, 100, 1..=7)?;

        // Rows 4..=6 are staged nowhere else.
        fs::remove_file(segment_path(store.dir(), 2))?;
        store.cache.remove(2)?;
        assert!(read_ids(&store, 0, 100, 0, None).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_materialized_segment_is_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, _) = open_with(&dir, 64)?;
        flush_rows(&store, 100, 1..=7)?;
        assert_eq!(store.register(0, 5)?, 2);
        assert_eq!(store.materialize()?, 7);

        fs::remove_file(segment_path(store.dir(), 1))?;
        store.cache.remove(1)?;
        assert_eq!(read_ids(&store, 0, 100, 0, None)?, vec![4, 5, 6, 7]);
        Ok(())
    }
}
