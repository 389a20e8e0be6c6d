//! Identity cache for decoded objects.
//!
//! A bounded map from [`Identifier`] to the most recently stored or loaded
//! object under that identifier, evicting the least recently used entry
//! when full. One cache is shared by every session of a storage system.
//!
//! # Invariants
//!
//! - The cache is always safe to ignore: a miss only costs a raw read and a
//!   decode, and nothing relies on a hit for correctness.
//! - Only objects that exist in storage are cached; absence is never cached.
//! - `len() <= capacity()` after every operation.
//! - Every entry appears exactly once in the recency index.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::Identifier;

/// A decoded object as held by the cache.
pub type CachedObject = Arc<dyn Any + Send + Sync>;

/// Default number of objects kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheState {
    entries: HashMap<Identifier, (CachedObject, u64)>,
    /// Last-use tick to identifier; the first entry is the eviction victim.
    recency: BTreeMap<u64, Identifier>,
    tick: u64,
    stats: CacheStats,
}

impl CacheState {
    fn touch(&mut self, id: &Identifier, old_tick: u64) -> u64 {
        self.recency.remove(&old_tick);
        self.tick += 1;
        self.recency.insert(self.tick, id.clone());
        self.tick
    }
}

/// Bounded least-recently-used object cache.
pub struct IdentityCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl IdentityCache {
    /// Create a cache holding at most `capacity` objects.
    ///
    /// A capacity of zero disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::with_capacity(capacity.min(4096)),
                recency: BTreeMap::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Maximum number of cached objects.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    // Poisoning is ignored: a panic mid-update can only lose cache entries.
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the object cached under `id` and mark it recently used.
    #[must_use]
    pub fn get(&self, id: &Identifier) -> Option<CachedObject> {
        let mut state = self.state();
        let Some((object, tick)) = state.entries.get(id).map(|(o, t)| (Arc::clone(o), *t)) else {
            state.stats.misses += 1;
            return None;
        };
        let tick = state.touch(id, tick);
        if let Some(entry) = state.entries.get_mut(id) {
            entry.1 = tick;
        }
        state.stats.hits += 1;
        Some(object)
    }

    /// Look up a typed object; an entry of another type counts as a miss.
    #[must_use]
    pub fn get_as<T: Any + Clone>(&self, id: &Identifier) -> Option<T> {
        self.get(id)
            .and_then(|object| object.downcast_ref::<T>().cloned())
    }

    /// Cache `object` under `id`, evicting the least recently used entries
    /// if the cache is full.
    pub fn insert(&self, id: Identifier, object: CachedObject) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state();
        let old_tick = state.entries.get(&id).map_or(0, |(_, tick)| *tick);
        let tick = state.touch(&id, old_tick);
        state.entries.insert(id, (object, tick));
        while state.entries.len() > self.capacity {
            let Some((_, victim)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&victim);
            state.stats.evictions += 1;
        }
    }

    /// Drop the entry for `id`, if any.
    pub fn remove(&self, id: &Identifier) {
        let mut state = self.state();
        if let Some((_, tick)) = state.entries.remove(id) {
            state.recency.remove(&tick);
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.recency.clear();
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss/eviction counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state().stats
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
