//! Double-buffered state with an explicit flush protocol.
//!
//! Every structure a flush mutates keeps two copies: a read snapshot shared
//! by all readers and a write copy that exists only while a flush is open.
//!
//! ```text
//!            begin                 success (exclusive swap lock)
//!  read ───copy──► write ──mutate──► write becomes read
//!                    │
//!                    └── failure: write copy dropped, read untouched
//! ```
//!
//! The [`FlushCoordinator`] is handed the participating structures for each
//! flush and drives them through the three events together, so readers that
//! take their snapshots under [`FlushCoordinator::read_snapshot`] always see
//! the state of one completed flush across every map.

use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    Begin,
    Success,
    Failure,
}

/// A structure that takes part in flushes.
pub trait FlushListener: Send + Sync {
    fn on_flush(&self, event: FlushEvent) -> Result<()>;
}

/// A value with a read snapshot and a flush-scoped write copy.
pub struct DoubleBuffer<T> {
    read: RwLock<Arc<T>>,
    write: Mutex<Option<T>>,
}

impl<T: Clone + Send + Sync> DoubleBuffer<T> {
    pub fn new(value: T) -> Self {
        Self {
            read: RwLock::new(Arc::new(value)),
            write: Mutex::new(None),
        }
    }

    /// The last successfully flushed value.
    pub fn read(&self) -> Arc<T> {
        match self.read.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Mutates the write copy. Fails when no flush is open.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.lock_write()?;
        match guard.as_mut() {
            Some(value) => Ok(f(value)),
            None => Err(Error::InvalidState(
                "mutation outside of a flush".to_string(),
            )),
        }
    }

    /// Whether a flush currently holds a write copy.
    pub fn in_flush(&self) -> bool {
        self.lock_write().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Installs `value` as the read snapshot and drops any write copy. Used
    /// when state is reloaded from a checkpoint.
    pub fn replace(&self, value: T) -> Result<()> {
        self.lock_write()?.take();
        *self
            .read
            .write()
            .map_err(|_| Error::InvalidState("read snapshot lock poisoned".to_string()))? =
            Arc::new(value);
        Ok(())
    }

    fn lock_write(&self) -> Result<MutexGuard<'_, Option<T>>> {
        self.write
            .lock()
            .map_err(|_| Error::InvalidState("write copy lock poisoned".to_string()))
    }
}

impl<T: Clone + Send + Sync> FlushListener for DoubleBuffer<T> {
    fn on_flush(&self, event: FlushEvent) -> Result<()> {
        match event {
            FlushEvent::Begin => {
                let copy = (*self.read()).clone();
                *self.lock_write()? = Some(copy);
            }
            FlushEvent::Success => {
                if let Some(value) = self.lock_write()?.take() {
                    *self.read.write().map_err(|_| {
                        Error::InvalidState("read snapshot lock poisoned".to_string())
                    })? = Arc::new(value);
                }
            }
            FlushEvent::Failure => {
                self.lock_write()?.take();
            }
        }
        Ok(())
    }
}

/// An ordered map with navigable reads against the read snapshot and
/// mutation against the write copy.
pub struct ReadWriteMap<K, V> {
    inner: DoubleBuffer<BTreeMap<K, V>>,
}

impl<K, V> Default for ReadWriteMap<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ReadWriteMap<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::from_map(BTreeMap::new())
    }

    pub fn from_map(map: BTreeMap<K, V>) -> Self {
        Self {
            inner: DoubleBuffer::new(map),
        }
    }

    // ===== READ SNAPSHOT =====

    pub fn snapshot(&self) -> Arc<BTreeMap<K, V>> {
        self.inner.read()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.snapshot().contains_key(key)
    }

    pub fn first_key(&self) -> Option<K> {
        self.snapshot().keys().next().cloned()
    }

    pub fn last_key(&self) -> Option<K> {
        self.snapshot().keys().next_back().cloned()
    }

    pub fn first_entry(&self) -> Option<(K, V)> {
        first_entry(&self.snapshot())
    }

    pub fn last_entry(&self) -> Option<(K, V)> {
        self.snapshot()
            .iter()
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Greatest entry with key `<= key`.
    pub fn floor_entry(&self, key: &K) -> Option<(K, V)> {
        floor_entry(&self.snapshot(), key)
    }

    /// Least entry with key `>= key`.
    pub fn ceiling_entry(&self, key: &K) -> Option<(K, V)> {
        self.snapshot()
            .range((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Owned copy of the entries in `range`.
    pub fn sub_map(&self, range: impl RangeBounds<K>) -> Vec<(K, V)> {
        self.snapshot()
            .range(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn head_map(&self, to: &K, inclusive: bool) -> Vec<(K, V)> {
        let end = if inclusive {
            Bound::Included(to.clone())
        } else {
            Bound::Excluded(to.clone())
        };
        self.sub_map((Bound::Unbounded, end))
    }

    pub fn tail_map(&self, from: &K, inclusive: bool) -> Vec<(K, V)> {
        let start = if inclusive {
            Bound::Included(from.clone())
        } else {
            Bound::Excluded(from.clone())
        };
        self.sub_map((start, Bound::Unbounded))
    }

    // ===== WRITE COPY =====

    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.inner.write(|m| m.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.inner.write(|m| m.remove(key))
    }

    pub fn write_first_entry(&self) -> Result<Option<(K, V)>> {
        self.inner.write(|m| first_entry(m))
    }

    pub fn write_last_entry(&self) -> Result<Option<(K, V)>> {
        self.inner
            .write(|m| m.iter().next_back().map(|(k, v)| (k.clone(), v.clone())))
    }

    pub fn write_get(&self, key: &K) -> Result<Option<V>> {
        self.inner.write(|m| m.get(key).cloned())
    }

    pub fn retain(&self, f: impl FnMut(&K, &mut V) -> bool) -> Result<()> {
        self.inner.write(|m| m.retain(f))
    }

    /// Runs `f` with the whole write copy.
    pub fn write<R>(&self, f: impl FnOnce(&mut BTreeMap<K, V>) -> R) -> Result<R> {
        self.inner.write(f)
    }

    pub fn replace(&self, map: BTreeMap<K, V>) -> Result<()> {
        self.inner.replace(map)
    }
}

impl<K, V> FlushListener for ReadWriteMap<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn on_flush(&self, event: FlushEvent) -> Result<()> {
        self.inner.on_flush(event)
    }
}

pub fn first_entry<K: Clone, V: Clone>(map: &BTreeMap<K, V>) -> Option<(K, V)> {
    map.iter().next().map(|(k, v)| (k.clone(), v.clone()))
}

pub fn floor_entry<K: Ord + Clone, V: Clone>(map: &BTreeMap<K, V>, key: &K) -> Option<(K, V)> {
    map.range((Bound::Unbounded, Bound::Included(key)))
        .next_back()
        .map(|(k, v)| (k.clone(), v.clone()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Flushing,
}

/// Drives a set of [`FlushListener`]s through one flush at a time.
pub struct FlushCoordinator {
    swap_lock: RwLock<()>,
    state: Mutex<FlushState>,
}

impl Default for FlushCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushCoordinator {
    pub fn new() -> Self {
        Self {
            swap_lock: RwLock::new(()),
            state: Mutex::new(FlushState::Idle),
        }
    }

    pub fn state(&self) -> FlushState {
        self.state.lock().map(|s| *s).unwrap_or(FlushState::Idle)
    }

    /// Opens a flush over `participants`, copying each read snapshot into its
    /// write copy. Dropping the returned guard without committing fails the
    /// flush.
    pub fn begin<'a>(
        &'a self,
        participants: &[&'a dyn FlushListener],
    ) -> Result<FlushGuard<'a>> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::InvalidState("flush state lock poisoned".to_string()))?;
            if *state == FlushState::Flushing {
                return Err(Error::InvalidState("a flush is already open".to_string()));
            }
            *state = FlushState::Flushing;
        }
        let guard = FlushGuard {
            coordinator: self,
            participants: participants.to_vec(),
            done: false,
        };
        for participant in &guard.participants {
            participant.on_flush(FlushEvent::Begin)?;
        }
        Ok(guard)
    }

    /// Holds the swap lock shared, so every snapshot taken while the guard
    /// lives comes from the same completed flush.
    pub fn read_snapshot(&self) -> RwLockReadGuard<'_, ()> {
        match self.swap_lock.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Holds the swap lock exclusively, for replacing state outside of a
    /// flush.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        match self.swap_lock.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn finish(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = FlushState::Idle;
        }
    }
}

pub struct FlushGuard<'a> {
    coordinator: &'a FlushCoordinator,
    participants: Vec<&'a dyn FlushListener>,
    done: bool,
}

impl FlushGuard<'_> {
    /// Publishes every write copy as the new read snapshot in one step.
    pub fn commit(mut self) -> Result<()> {
        let result = {
            let _swap = match self.coordinator.swap_lock.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.participants
                .iter()
                .try_for_each(|p| p.on_flush(FlushEvent::Success))
        };
        self.done = true;
        self.coordinator.finish();
        result
    }

    /// Discards every write copy.
    pub fn fail(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        for participant in &self.participants {
            if let Err(e) = participant.on_flush(FlushEvent::Failure) {
                tracing::error!(error = %e, "Failed to discard flush state");
            }
        }
        self.coordinator.finish();
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(entries: &[(i64, &'static str)]) -> ReadWriteMap<i64, &'static str> {
        ReadWriteMap::from_map(entries.iter().copied().collect())
    }

    #[test]
    fn test_navigation() {
        let map = map_of(&[(10, "a"), (20, "b"), (30, "c")]);
        assert_eq!(map.first_key(), Some(10));
        assert_eq!(map.last_key(), Some(30));
        assert_eq!(map.floor_entry(&25), Some((20, "b")));
        assert_eq!(map.floor_entry(&20), Some((20, "b")));
        assert_eq!(map.floor_entry(&5), None);
        assert_eq!(map.ceiling_entry(&21), Some((30, "c")));
        assert_eq!(map.ceiling_entry(&31), None);
        assert_eq!(map.sub_map(11..30), vec![(20, "b")]);
        assert_eq!(map.head_map(&20, false), vec![(10, "a")]);
        assert_eq!(map.head_map(&20, true), vec![(10, "a"), (20, "b")]);
        assert_eq!(map.tail_map(&20, false), vec![(30, "c")]);
    }

    #[test]
    fn test_mutation_requires_flush() {
        let map = map_of(&[]);
        assert!(matches!(map.insert(1, "x"), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_flush_success_publishes_write_copy() -> Result<()> {
        let coordinator = FlushCoordinator::new();
        let map = map_of(&[(1, "a")]);

        let flush = coordinator.begin(&[&map])?;
        map.insert(2, "b")?;
        map.remove(&1)?;
        // Readers still see the old snapshot while the flush is open.
        assert_eq!(map.sub_map(..), vec![(1, "a")]);
        let pre_swap = map.write(|m| m.clone())?;
        flush.commit()?;

        assert_eq!(*map.snapshot(), pre_swap);
        assert_eq!(map.sub_map(..), vec![(2, "b")]);
        assert!(!map.inner.in_flush());
        assert_eq!(coordinator.state(), FlushState::Idle);
        Ok(())
    }

    #[test]
    fn test_flush_failure_discards_write_copy() -> Result<()> {
        let coordinator = FlushCoordinator::new();
        let map = map_of(&[(1, "a")]);

        let flush = coordinator.begin(&[&map])?;
        map.insert(2, "b")?;
        flush.fail();

        assert_eq!(map.sub_map(..), vec![(1, "a")]);
        assert!(!map.inner.in_flush());
        assert!(map.insert(3, "c").is_err());
        Ok(())
    }

    #[test]
    fn test_dropped_guard_fails_flush() -> Result<()> {
        let coordinator = FlushCoordinator::new();
        let map = map_of(&[]);
        {
            let _flush = coordinator.begin(&[&map])?;
            map.insert(1, "a")?;
        }
        assert!(map.is_empty());
        assert_eq!(coordinator.state(), FlushState::Idle);
        Ok(())
    }

    #[test]
    fn test_single_flush_at_a_time() -> Result<()> {
        let coordinator = FlushCoordinator::new();
        let map = map_of(&[]);
        let flush = coordinator.begin(&[&map])?;
        assert!(coordinator.begin(&[&map]).is_err());
        flush.commit()?;
        assert!(coordinator.begin(&[&map]).is_ok());
        Ok(())
    }

    #[test]
    fn test_range_copies_survive_swap() -> Result<()> {
        let coordinator = FlushCoordinator::new();
        let map = map_of(&[(1, "a"), (2, "b")]);
        let before = map.sub_map(..);

        let flush = coordinator.begin(&[&map])?;
        map.remove(&1)?;
        flush.commit()?;

        assert_eq!(before, vec![(1, "a"), (2, "b")]);
        Ok(())
    }

    #[test]
    fn test_multi_map_swap_is_atomic() -> Result<()> {
        let coordinator = FlushCoordinator::new();
        let a = map_of(&[]);
        let b = DoubleBuffer::new(0u64);

        let flush = coordinator.begin(&[&a, &b])?;
        a.insert(1, "x")?;
        b.write(|v| *v = 1)?;
        flush.commit()?;

        let _snapshot = coordinator.read_snapshot();
        assert_eq!(a.len(), 1);
        assert_eq!(*b.read(), 1);
        Ok(())
    }
}
