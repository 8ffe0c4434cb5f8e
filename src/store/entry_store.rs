//! Key to entry map with LRU capacity and TTL eviction.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────── Mutex<StoreInner> ─────────────────────────┐
//!   │                                                                     │
//!   │   index: FxHashMap<CacheKey, SlotId>     tick / floor: u64          │
//!   │   removed_at: FxHashMap<CacheKey, u64>                              │
//!   │        │                                                            │
//!   │        ▼                                                            │
//!   │   order: RecencyList<Entry<V>>                                      │
//!   │     head (MRU) ─► [k3] ◄──► [k1] ◄──► [k2] ◄── tail (LRU, evicted)  │
//!   │                                                                     │
//!   └─────────────────────────────────────────────────────────────────────┘
//!          counters: StoreCounters (atomics, outside the lock)
//! ```
//!
//! ## Eviction
//!
//! | Trigger   | When                                  | Counted as     |
//! |-----------|---------------------------------------|----------------|
//! | capacity  | insert pushes `len` over `max_entries` | `evictions`    |
//! | TTL       | `now - created_at > ttl` on `get`/`sweep` | `expirations` |
//! | explicit  | `remove` / `clear` / `retain`         | `removes`      |
//!
//! Every hit moves its entry to the front, so recency is a strict order and
//! the least recently used entry is always well defined.
//!
//! ## Generations
//!
//! Every invalidation advances `tick`. `remove` and `retain` stamp the keys
//! they cover in `removed_at`; `clear` raises `floor` to the current tick. A
//! caller that read a [`Generation`] before starting a computation publishes
//! with [`EntryStore::put_if_generation`], which refuses the write only if
//! that key was invalidated in between:
//!
//! ```text
//!   refuse  ⇔  floor > token  ∨  removed_at[key] > token
//! ```
//!
//! `removed_at` is bounded by [`MAX_REMOVAL_STAMPS`]. Past it the stamps fold
//! into `floor`, which refuses every publish older than the fold.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::ds::{RecencyList, SlotId};
use crate::key::CacheKey;
use crate::store::traits::{Clock, StoreCounters, StoreMetrics, SweepReport, SystemClock};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A stored value and its bookkeeping.
pub struct Entry<V> {
    pub key: CacheKey,
    pub value: Arc<V>,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub size_hint: usize,
}

impl<V> Clone for Entry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            value: Arc::clone(&self.value),
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            size_hint: self.size_hint,
        }
    }
}

impl<V> fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("last_accessed_at", &self.last_accessed_at)
            .field("size_hint", &self.size_hint)
            .finish_non_exhaustive()
    }
}

/// Caller-supplied metadata for an insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMeta {
    /// Approximate size of the value; informational.
    pub size_hint: usize,
    /// Age the entry already has when inserted. Non-zero for entries restored
    /// from a persistent backend so their TTL keeps running across restarts.
    pub age: Duration,
}

impl EntryMeta {
    pub fn with_size_hint(size_hint: usize) -> Self {
        Self {
            size_hint,
            ..Self::default()
        }
    }
}

/// Value-free view of an entry, handed to invalidation predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    /// Time since `created_at`, as of the snapshot.
    pub age: Duration,
    /// Time since `last_accessed_at`, as of the snapshot.
    pub idle: Duration,
    pub size_hint: usize,
}

impl EntryInfo {
    fn of<V>(entry: &Entry<V>, now: Instant) -> Self {
        Self {
            key: entry.key,
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
            age: now.saturating_duration_since(entry.created_at),
            idle: now.saturating_duration_since(entry.last_accessed_at),
            size_hint: entry.size_hint,
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Per-key removal stamps kept before they fold into a store-wide floor.
pub const MAX_REMOVAL_STAMPS: usize = 4096;

/// Invalidation token read before a computation starts.
///
/// Pass it back to [`EntryStore::put_if_generation`] to publish the result
/// unless the same key was invalidated since.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

// ---------------------------------------------------------------------------
// EntryStore
// ---------------------------------------------------------------------------

struct StoreInner<V> {
    index: FxHashMap<CacheKey, SlotId>,
    order: RecencyList<Entry<V>>,
    tick: u64,
    floor: u64,
    removed_at: FxHashMap<CacheKey, u64>,
}

impl<V> StoreInner<V> {
    fn unlink(&mut self, key: &CacheKey) -> Option<Entry<V>> {
        let id = self.index.remove(key)?;
        self.order.remove(id)
    }

    fn advance(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn stamp(&mut self, key: CacheKey, tick: u64) {
        self.removed_at.insert(key, tick);
        if self.removed_at.len() > MAX_REMOVAL_STAMPS {
            self.floor = tick;
            self.removed_at.clear();
        }
    }

    fn invalidated_since(&self, generation: Generation, key: &CacheKey) -> bool {
        self.floor > generation.0
            || self
                .removed_at
                .get(key)
                .is_some_and(|&at| at > generation.0)
    }
}

/// Thread-safe entry store shared by value and resource caches.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use memokit::key::CacheKey;
/// use memokit::store::{EntryMeta, EntryStore};
///
/// let store = EntryStore::new(Some(2), None);
/// let (a, b, c) = (
///     CacheKey::from_bytes([1; 32]),
///     CacheKey::from_bytes([2; 32]),
///     CacheKey::from_bytes([3; 32]),
/// );
/// store.put(a, Arc::new("a"), EntryMeta::default());
/// store.put(b, Arc::new("b"), EntryMeta::default());
/// store.get(&a); // a is now most recently used
/// store.put(c, Arc::new("c"), EntryMeta::default());
///
/// assert!(store.contains(&a));
/// assert!(!store.contains(&b));
/// assert_eq!(store.len(), 2);
/// ```
pub struct EntryStore<V> {
    name: Cow<'static, str>,
    max_entries: Option<usize>,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    inner: Mutex<StoreInner<V>>,
    counters: StoreCounters,
}

impl<V> EntryStore<V> {
    pub fn new(max_entries: Option<usize>, ttl: Option<Duration>) -> Self {
        Self::with_clock(max_entries, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        max_entries: Option<usize>,
        ttl: Option<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = max_entries.unwrap_or(0).min(1024);
        Self {
            name: Cow::Borrowed("anonymous"),
            max_entries,
            ttl,
            clock,
            inner: Mutex::new(StoreInner {
                index: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
                order: RecencyList::with_capacity(capacity),
                tick: 0,
                floor: 0,
                removed_at: FxHashMap::default(),
            }),
            counters: StoreCounters::default(),
        }
    }

    /// Sets the name used in log records.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.created_at) > ttl)
    }

    /// Looks up `key`, promoting it to most recently used.
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &CacheKey) -> Option<Entry<V>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let Some(&id) = inner.index.get(key) else {
            self.counters.inc_miss();
            return None;
        };
        let expired = inner.order.get(id).is_some_and(|e| self.is_expired(e, now));
        if expired {
            inner.unlink(key);
            drop(inner);
            self.counters.add_expirations(1);
            self.counters.inc_miss();
            trace!(cache = %self.name, key = %key, "entry expired on lookup");
            return None;
        }
        inner.order.move_to_front(id);
        let hit = inner.order.get_mut(id).map(|entry| {
            entry.last_accessed_at = now;
            entry.clone()
        });
        drop(inner);
        match &hit {
            Some(_) => {
                self.counters.inc_hit();
                trace!(cache = %self.name, key = %key, "hit");
            },
            None => self.counters.inc_miss(),
        }
        hit
    }

    /// Looks up `key` without promoting it or touching metrics.
    pub fn peek(&self, key: &CacheKey) -> Option<Entry<V>> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let id = *inner.index.get(key)?;
        inner
            .order
            .get(id)
            .filter(|entry| !self.is_expired(entry, now))
            .cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.peek(key).is_some()
    }

    /// Inserts or replaces `key`. Returns `false` if nothing was stored
    /// (`max_entries == Some(0)`).
    pub fn put(&self, key: CacheKey, value: Arc<V>, meta: EntryMeta) -> bool {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, key, value, meta)
    }

    /// Inserts only if `key` was not invalidated since `generation` was read.
    pub fn put_if_generation(
        &self,
        generation: Generation,
        key: CacheKey,
        value: Arc<V>,
        meta: EntryMeta,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.invalidated_since(generation, &key) {
            drop(inner);
            debug!(cache = %self.name, key = %key, "discarding result computed before an invalidation");
            return false;
        }
        self.insert_locked(&mut inner, key, value, meta)
    }

    fn insert_locked(
        &self,
        inner: &mut StoreInner<V>,
        key: CacheKey,
        value: Arc<V>,
        meta: EntryMeta,
    ) -> bool {
        if self.max_entries == Some(0) {
            return false;
        }
        let now = self.clock.now();
        let created_at = now.checked_sub(meta.age).unwrap_or(now);

        if let Some(&id) = inner.index.get(&key) {
            if let Some(entry) = inner.order.get_mut(id) {
                entry.value = value;
                entry.created_at = created_at;
                entry.last_accessed_at = now;
                entry.size_hint = meta.size_hint;
            }
            inner.order.move_to_front(id);
            self.counters.inc_update();
            return true;
        }

        let id = inner.order.push_front(Entry {
            key,
            value,
            created_at,
            last_accessed_at: now,
            size_hint: meta.size_hint,
        });
        inner.index.insert(key, id);
        self.counters.inc_insert();

        let evicted = self.evict_over_capacity(inner);
        if evicted > 0 {
            debug!(cache = %self.name, evicted, "evicted least recently used entries");
        }
        true
    }

    fn evict_over_capacity(&self, inner: &mut StoreInner<V>) -> usize {
        let Some(max) = self.max_entries else {
            return 0;
        };
        let mut evicted = 0;
        while inner.order.len() > max {
            let Some(entry) = inner.order.pop_back() else {
                break;
            };
            inner.index.remove(&entry.key);
            evicted += 1;
        }
        self.counters.add_evictions(evicted);
        evicted
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> Generation {
        Generation(self.inner.lock().tick)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        let tick = inner.advance();
        inner.stamp(*key, tick);
        let removed = inner.unlink(key).map(|entry| entry.value);
        drop(inner);
        if removed.is_some() {
            self.counters.add_removes(1);
            debug!(cache = %self.name, key = %key, "entry removed");
        }
        removed
    }

    /// Removes every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.floor = inner.advance();
        inner.removed_at.clear();
        let removed = inner.order.len();
        inner.index.clear();
        inner.order.clear();
        drop(inner);
        self.counters.add_removes(removed);
        debug!(cache = %self.name, removed, "store cleared");
        removed
    }

    /// Keeps the entries for which `keep` returns `true` and removes the
    /// rest. Returns the keys removed.
    pub fn retain<F>(&self, mut keep: F) -> Vec<CacheKey>
    where
        F: FnMut(&EntryInfo) -> bool,
    {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let tick = inner.advance();
        let doomed: Vec<CacheKey> = inner
            .order
            .iter()
            .map(|(_, entry)| EntryInfo::of(entry, now))
            .filter(|info| !keep(info))
            .map(|info| info.key)
            .collect();
        for key in &doomed {
            inner.unlink(key);
            inner.stamp(*key, tick);
        }
        drop(inner);
        self.counters.add_removes(doomed.len());
        if !doomed.is_empty() {
            debug!(cache = %self.name, removed = doomed.len(), "entries rejected by predicate");
        }
        doomed
    }

    /// Reclaims expired entries and trims to capacity without a lookup.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let expired: Vec<CacheKey> = inner
            .order
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(_, entry)| entry.key)
            .collect();
        for key in &expired {
            inner.unlink(key);
        }
        let evicted = self.evict_over_capacity(&mut inner);
        drop(inner);

        self.counters.add_expirations(expired.len());
        let report = SweepReport {
            expired: expired.len(),
            evicted,
        };
        if report.total() > 0 {
            debug!(cache = %self.name, expired = report.expired, evicted = report.evicted, "sweep");
        }
        report
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used, expired ones included until
    /// they are swept.
    pub fn keys(&self) -> Vec<CacheKey> {
        let inner = self.inner.lock();
        inner.order.iter().map(|(_, entry)| entry.key).collect()
    }

    /// Snapshot of every entry's bookkeeping, most recently used first.
    pub fn infos(&self) -> Vec<EntryInfo> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .map(|(_, entry)| EntryInfo::of(entry, now))
            .collect()
    }

    pub fn metrics(&self) -> StoreMetrics {
        self.counters.snapshot()
    }

    #[cfg(test)]
    fn debug_validate_invariants(&self) {
        let inner = self.inner.lock();
        inner.order.debug_validate_invariants();
        assert_eq!(inner.index.len(), inner.order.len());
        for (id, entry) in inner.order.iter() {
            assert_eq!(inner.index.get(&entry.key), Some(&id));
        }
        if let Some(max) = self.max_entries {
            assert!(inner.order.len() <= max);
        }
    }
}

impl<V> fmt::Debug for EntryStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("name", &self.name)
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
