use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use super::{file, Segment};
use crate::error::{Error, Result};
use crate::SegmentId;

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct Entry<V> {
    value: V,
    freq: u8,
}

/// A bounded S3-FIFO cache: new keys enter a small probationary queue, keys
/// hit again before leaving it are promoted to the main queue, and recently
/// evicted keys are remembered in a ghost queue so that a quick re-insert
/// goes straight to main.
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    max_small_size: usize,
    max_cache_size: usize,
    small: VecDeque<K>,
    main: VecDeque<K>,
    ghost: VecDeque<K>,
    ghost_keys: HashSet<K>,
    entries: HashMap<K, Entry<V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_cache_size: usize) -> Self {
        let max_cache_size = max_cache_size.max(1);
        Cache {
            max_small_size: (max_cache_size / 10).max(1),
            max_cache_size,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            ghost_keys: HashSet::new(),
            entries: HashMap::new(),
            stats: Stats::default(),
        }
    }

    /// Returns the value for `key`, bumping its access frequency.
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.freq = (entry.freq + 1).min(MAX_FREQUENCY_LIMIT);
                self.stats.hit();
                Some(entry.value.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            return;
        }
        while self.entries.len() >= self.max_cache_size {
            self.evict();
        }
        if self.ghost_keys.remove(&key) {
            self.ghost.retain(|k| k != &key);
            self.main.push_back(key.clone());
        } else {
            self.small.push_back(key.clone());
        }
        self.entries.insert(key, Entry { value, freq: 0 });
    }

    /// Drops `key` without remembering it as a ghost.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.small.retain(|k| k != key);
        self.main.retain(|k| k != key);
        Some(entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// `(hits, misses, evictions)`
    pub fn stats(&self) -> (usize, usize, usize) {
        self.stats.get()
    }

    fn evict(&mut self) {
        if self.small.len() >= self.max_small_size || self.main.is_empty() {
            if self.evict_small() {
                return;
            }
        }
        self.evict_main();
    }

    fn evict_small(&mut self) -> bool {
        while let Some(key) = self.small.pop_front() {
            let freq = self.entries.get(&key).map_or(0, |e| e.freq);
            if freq > 1 {
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.insert_ghost(key);
                self.stats.evicted();
                return true;
            }
        }
        false
    }

    fn evict_main(&mut self) {
        while let Some(key) = self.main.pop_front() {
            match self.entries.get_mut(&key) {
                Some(entry) if entry.freq > 0 => {
                    entry.freq -= 1;
                    self.main.push_back(key);
                }
                Some(_) => {
                    self.entries.remove(&key);
                    self.stats.evicted();
                    return;
                }
                None => {}
            }
        }
    }

    fn insert_ghost(&mut self, key: K) {
        if self.ghost.len() >= self.max_cache_size {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_keys.remove(&old);
            }
        }
        self.ghost_keys.insert(key.clone());
        self.ghost.push_back(key);
    }
}

#[derive(Default)]
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
}

impl Stats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }
}

/// Sealed segments of one table, loaded from `seg<N>.dat` on a miss.
///
/// Readers get an `Arc<Segment>`, so a segment evicted or garbage collected
/// while a read is in flight stays alive until that read drops it.
pub struct SegmentCache {
    dir: PathBuf,
    inner: Mutex<Cache<SegmentId, Arc<Segment>>>,
}

impl SegmentCache {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            inner: Mutex::new(Cache::new(capacity)),
        }
    }

    pub fn get_or_load(&self, id: SegmentId) -> Result<Arc<Segment>> {
        if let Some(segment) = self.lock()?.get(&id) {
            return Ok(segment);
        }
        // Load outside the lock; a racing loader just inserts the same bytes.
        let segment = Arc::new(file::read_segment(&file::segment_path(&self.dir, id))?);
        tracing::debug!(segment_id = id, "Loaded segment into cache");
        self.lock()?.insert(id, segment.clone());
        Ok(segment)
    }

    pub fn insert(&self, segment: Arc<Segment>) -> Result<()> {
        self.lock()?.insert(segment.id(), segment);
        Ok(())
    }

    pub fn remove(&self, id: SegmentId) -> Result<()> {
        self.lock()?.remove(&id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> (usize, usize, usize) {
        self.inner.lock().map(|c| c.stats()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Cache<SegmentId, Arc<Segment>>>> {
        self.inner
            .lock()
            .map_err(|_| Error::InvalidState("segment cache mutex poisoned".to_string()))
    }
}
