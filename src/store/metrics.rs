use crate::{RowId, Timestamp};

/// Point-in-time counters of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetrics {
    pub table: String,
    pub current_row: RowId,
    pub last_mat_row: RowId,
    pub last_commit_time: Timestamp,
    pub segments: usize,
    pub pinned_segments: usize,
    pub open_segment_id: u64,
    pub pending_uds: usize,
    pub waiting_readers: usize,
    pub cached_segments: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub available: bool,
}

impl TableMetrics {
    pub fn log(&self) {
        tracing::info!(
            table = %self.table,
            current_row = self.current_row,
            last_mat_row = self.last_mat_row,
            last_commit_time = self.last_commit_time,
            segments = self.segments,
            pinned_segments = self.pinned_segments,
            open_segment_id = self.open_segment_id,
            pending_uds = self.pending_uds,
            waiting_readers = self.waiting_readers,
            cached_segments = self.cached_segments,
            cache_hits = self.cache_hits,
            cache_misses = self.cache_misses,
            available = self.available,
            "Table metrics"
        );
    }
}
