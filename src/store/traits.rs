//! Store-level metrics and clocks.
//!
//! Stores own entries and their eviction bookkeeping; caches layered on top
//! decide what to hand back to callers. Counters here are atomics so a
//! snapshot can be taken without the store lock.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Snapshot of store-level metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub updates: u64,
    pub removes: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl StoreMetrics {
    /// Fraction of lookups that hit, or `None` before the first lookup.
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}

impl Add for StoreMetrics {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            hits: self.hits + rhs.hits,
            misses: self.misses + rhs.misses,
            inserts: self.inserts + rhs.inserts,
            updates: self.updates + rhs.updates,
            removes: self.removes + rhs.removes,
            evictions: self.evictions + rhs.evictions,
            expirations: self.expirations + rhs.expirations,
        }
    }
}

/// Atomic counters behind [`StoreMetrics`].
#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl StoreCounters {
    pub(crate) fn snapshot(&self) -> StoreMetrics {
        StoreMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_removes(&self, n: usize) {
        self.removes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_evictions(&self, n: usize) {
        self.evictions.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_expirations(&self, n: usize) {
        self.expirations.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Result of a [`sweep`](crate::store::EntryStore::sweep).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed because their TTL elapsed.
    pub expired: usize,
    /// Entries removed to get back under `max_entries`.
    pub evicted: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.evicted
    }
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, rhs: Self) {
        self.expired += rhs.expired;
        self.evicted += rhs.evicted;
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for TTL decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic time used for ages and expiry.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, stamped on persisted
    /// entries so their age survives a restart.
    fn unix_millis(&self) -> u64;
}

/// The process clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    unix_origin_ms: u64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            unix_origin_ms: SystemClock.unix_millis(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn unix_millis(&self) -> u64 {
        self.unix_origin_ms + self.offset.lock().as_millis() as u64
    }
}
