use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Pins a segment against garbage collection.
///
/// One counter exists per row-index entry. Readers increment it for the
/// duration of a registered query; materialization sets the flag once every
/// row of the segment is in the warehouse. The segment may only be reclaimed
/// when both say so.
///
/// Counters are shared (`Arc`) between the read and write copies of the
/// register map, so reference counting never waits for a flush.
#[derive(Debug, Default)]
pub struct Counter {
    ref_count: AtomicI64,
    materialized: AtomicBool,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(ref_count: i64, materialized: bool) -> Self {
        Self {
            ref_count: AtomicI64::new(ref_count),
            materialized: AtomicBool::new(materialized),
        }
    }

    pub fn increment(&self) -> i64 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the count, never below zero. Returns `false` if the counter
    /// was already zero, which means an unbalanced unregister.
    pub fn decrement(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            })
            .is_ok()
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn mark_materialized(&self) {
        self.materialized.store(true, Ordering::SeqCst);
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized.load(Ordering::SeqCst)
    }

    pub fn can_be_deleted(&self) -> bool {
        self.is_materialized() && self.ref_count() == 0
    }
}
