use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::checkpoint::CheckpointState;
use super::counter::Counter;
use super::rwmap::{DoubleBuffer, FlushCoordinator, FlushGuard, ReadWriteMap};
use super::segment::Segment;
use super::ud::{UdEntry, UdSeq, UdStore};
use crate::error::{Error, Result};
use crate::{RowId, SegmentId, Timestamp};

/// What the segment-key map knows about one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHandle {
    pub id: SegmentId,
    pub last_row: RowId,
    /// Sealed segments are immutable and live in `seg<N>.dat`; the one
    /// unsealed segment is the table's open segment.
    pub sealed: bool,
}

/// Scalar state flushed alongside the maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreMisc {
    pub segment_size: u32,
    /// ID of the open segment.
    pub segment_id: SegmentId,
    /// Highest committed row ID.
    pub current_row: RowId,
    /// Low-water mark: every row up to here is in the warehouse.
    pub last_mat_row: RowId,
    pub last_commit_time: Timestamp,
    pub next_ud_seq: UdSeq,
}

/// All mutable state of one table.
///
/// The four maps are keyed by commit time (time index) or by the first row
/// ID of a segment (the rest). Every flush drives all of them plus the UD
/// log and the scalars through one [`FlushCoordinator`].
pub struct TableState {
    pub time_index: ReadWriteMap<Timestamp, RowId>,
    pub row_index: ReadWriteMap<RowId, SegmentId>,
    pub counters: ReadWriteMap<RowId, Arc<Counter>>,
    pub segments: ReadWriteMap<RowId, SegmentHandle>,
    pub uds: UdStore,
    pub misc: DoubleBuffer<StoreMisc>,
    pub coordinator: FlushCoordinator,

    open_segment: Mutex<Segment>,
}

/// A consistent view of every map, taken between two flushes.
#[derive(Clone)]
pub struct Snapshot {
    pub time_index: Arc<BTreeMap<Timestamp, RowId>>,
    pub row_index: Arc<BTreeMap<RowId, SegmentId>>,
    pub counters: Arc<BTreeMap<RowId, Arc<Counter>>>,
    pub segments: Arc<BTreeMap<RowId, SegmentHandle>>,
    pub uds: Arc<BTreeMap<UdSeq, Arc<UdEntry>>>,
    pub misc: Arc<StoreMisc>,
}

impl TableState {
    pub fn new(misc: StoreMisc, open_segment: Segment) -> Self {
        Self {
            time_index: ReadWriteMap::new(),
            row_index: ReadWriteMap::new(),
            counters: ReadWriteMap::new(),
            segments: ReadWriteMap::new(),
            uds: UdStore::new(),
            misc: DoubleBuffer::new(misc),
            coordinator: FlushCoordinator::new(),
            open_segment: Mutex::new(open_segment),
        }
    }

    /// Opens a flush over every structure of the table.
    pub fn begin_flush(&self) -> Result<FlushGuard<'_>> {
        self.coordinator.begin(&[
            &self.time_index,
            &self.row_index,
            &self.counters,
            &self.segments,
            self.uds.log(),
            &self.misc,
        ])
    }

    pub fn snapshot(&self) -> Snapshot {
        let _swap = self.coordinator.read_snapshot();
        Snapshot {
            time_index: self.time_index.snapshot(),
            row_index: self.row_index.snapshot(),
            counters: self.counters.snapshot(),
            segments: self.segments.snapshot(),
            uds: self.uds.snapshot(),
            misc: self.misc.read(),
        }
    }

    pub fn open_segment(&self) -> Result<MutexGuard<'_, Segment>> {
        self.open_segment
            .lock()
            .map_err(|_| Error::InvalidState("open segment mutex poisoned".to_string()))
    }

    /// The durable form of the last completed flush.
    pub fn capture(&self) -> CheckpointState {
        let snapshot = self.snapshot();
        CheckpointState {
            time_index: (*snapshot.time_index).clone(),
            row_index: (*snapshot.row_index).clone(),
            counters: snapshot
                .counters
                .iter()
                .map(|(&k, c)| (k, c.is_materialized()))
                .collect(),
            segments: (*snapshot.segments).clone(),
            uds: snapshot
                .uds
                .iter()
                .map(|(&seq, e)| (seq, (**e).clone()))
                .collect(),
            misc: *snapshot.misc,
        }
    }

    /// Replaces every map with `checkpoint`. Counters still alive for the
    /// same segment keep their reference counts, so readers registered
    /// before a rollback can still unregister.
    pub fn install(&self, checkpoint: CheckpointState, open_segment: Segment) -> Result<()> {
        let live = self.counters.snapshot();
        let counters = checkpoint
            .counters
            .iter()
            .map(|(&key, &materialized)| {
                let counter = match live.get(&key) {
                    Some(counter) => {
                        if materialized {
                            counter.mark_materialized();
                        }
                        counter.clone()
                    }
                    None => Arc::new(Counter::with_state(0, materialized)),
                };
                (key, counter)
            })
            .collect();

        let _swap = self.coordinator.exclusive();
        self.time_index.replace(checkpoint.time_index)?;
        self.row_index.replace(checkpoint.row_index)?;
        self.counters.replace(counters)?;
        self.segments.replace(checkpoint.segments)?;
        self.uds.log().replace(
            checkpoint
                .uds
                .into_iter()
                .map(|(seq, e)| (seq, Arc::new(e)))
                .collect(),
        )?;
        self.misc.replace(checkpoint.misc)?;
        *self.open_segment()? = open_segment;
        Ok(())
    }
}

impl Snapshot {
    /// The segments holding rows in `[from, to]`, lowest first.
    pub fn segments_in(&self, from: RowId, to: RowId) -> Vec<(RowId, SegmentHandle)> {
        if from > to {
            return Vec::new();
        }
        self.segments
            .range(..=to)
            .filter(|(_, h)| h.last_row >= from)
            .map(|(&k, &h)| (k, h))
            .collect()
    }

    /// Row-ID cutoff of the last commit at or before `time`.
    pub fn cutoff_at(&self, time: Timestamp) -> Option<RowId> {
        self.time_index.range(..=time).next_back().map(|(_, &row)| row)
    }

    /// Highest row a read bounded by `time` may see. When no retained commit
    /// is that old, every staged row is newer than the bound.
    pub fn accuracy_cutoff(&self, time: Timestamp) -> RowId {
        self.cutoff_at(time).unwrap_or_else(|| {
            self.row_index
                .keys()
                .next()
                .map_or(self.misc.last_mat_row, |&first| first - 1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: SegmentId, last_row: RowId, sealed: bool) -> SegmentHandle {
        SegmentHandle {
            id,
            last_row,
            sealed,
        }
    }

    fn state_with_segments() -> Result<TableState> {
        let state = TableState::new(StoreMisc::default(), Segment::new(3, 64));
        let flush = state.begin_flush()?;
        for (key, h) in [(1, handle(1, 10, true)), (11, handle(2, 20, true)), (21, handle(3, 25, false))] {
            state.segments.insert(key, h)?;
            state.row_index.insert(key, h.id)?;
            state.counters.insert(key, Arc::new(Counter::new()))?;
        }
        state.time_index.insert(100, 10)?;
        state.time_index.insert(200, 25)?;
        flush.commit()?;
        Ok(state)
    }

    #[test]
    fn test_segments_in() -> Result<()> {
        let snapshot = state_with_segments()?.snapshot();
        let ids = |from, to| -> Vec<SegmentId> {
            snapshot.segments_in(from, to).iter().map(|(_, h)| h.id).collect()
        };
        assert_eq!(ids(5, 15), vec![1, 2]);
        assert_eq!(ids(11, 11), vec![2]);
        assert_eq!(ids(21, 100), vec![3]);
        assert_eq!(ids(26, 100), Vec::<SegmentId>::new());
        assert_eq!(ids(15, 5), Vec::<SegmentId>::new());
        Ok(())
    }

    #[test]
    fn test_cutoff_at() -> Result<()> {
        let snapshot = state_with_segments()?.snapshot();
        assert_eq!(snapshot.cutoff_at(99), None);
        assert_eq!(snapshot.cutoff_at(150), Some(10));
        assert_eq!(snapshot.cutoff_at(200), Some(25));

        // Older than every commit: nothing staged qualifies.
        assert_eq!(snapshot.accuracy_cutoff(99), 0);
        assert_eq!(snapshot.accuracy_cutoff(150), 10);
        Ok(())
    }

    #[test]
    fn test_install_keeps_live_counters() -> Result<()> {
        let state = state_with_segments()?;
        let pinned = state.counters.get(&11).unwrap();
        pinned.increment();

        let mut checkpoint = state.capture();
        checkpoint.counters.insert(11, true);
        checkpoint.counters.remove(&21);
        checkpoint.segments.remove(&21);
        checkpoint.row_index.remove(&21);
        state.install(checkpoint, Segment::new(3, 64))?;

        let counter = state.counters.get(&11).unwrap();
        assert!(Arc::ptr_eq(&counter, &pinned));
        assert_eq!(counter.ref_count(), 1);
        assert!(counter.is_materialized());
        assert_eq!(state.segments.len(), 2);
        Ok(())
    }
}
