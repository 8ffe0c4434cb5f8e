//! # Managed cache interface
//!
//! Every cache built by this crate, value or resource, is also a
//! [`ManagedCache`]: the type-erased surface a [`CacheRegistry`] uses to
//! sweep, clear and invalidate caches without knowing their argument or
//! value types.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────────────────────────────┐
//!   │                ManagedCache                  │
//!   │                                              │
//!   │  name(&) → &str                              │
//!   │  len(&) → usize                              │
//!   │  metrics(&) → StoreMetrics                   │
//!   │  sweep(&) → SweepReport                      │
//!   │  invalidate_key(&, &CacheKey) → bool         │
//!   │  invalidate_all(&) → usize                   │
//!   │  clear_memory(&) → usize                     │
//!   │  invalidate_if(&, &EntryPredicate) → usize   │
//!   │  revalidate_gate(&) → usize                  │
//!   └───────────────────────┬──────────────────────┘
//!                           │
//!            ┌──────────────┴───────────────┐
//!            ▼                              ▼
//!   ┌──────────────────┐          ┌────────────────────┐
//!   │ ValueCache<A, V> │          │ ResourceCache<A, R>│
//!   │ deep copies out  │          │ shared Arc out     │
//!   └──────────────────┘          └────────────────────┘
//! ```
//!
//! ## Operation Summary
//!
//! | Operation         | Memory            | Persisted copy | In-flight result |
//! |-------------------|-------------------|----------------|------------------|
//! | `invalidate_key`  | entry removed     | removed        | not published    |
//! | `invalidate_all`  | store cleared     | namespace cleared | not published |
//! | `clear_memory`    | store cleared     | kept           | not published    |
//! | `invalidate_if`   | rejected removed  | rejected removed | not published  |
//! | `revalidate_gate` | cleared if closed | cleared if closed | not published |
//! | `sweep`           | expired + over-capacity removed | untouched | unaffected |
//!
//! Invalidation is synchronous: once a call returns, the next lookup of an
//! invalidated key misses.
//!
//! [`CacheRegistry`]: crate::registry::CacheRegistry

use crate::key::CacheKey;
use crate::secrets::SecretStore;
use crate::store::{EntryInfo, StoreMetrics, SweepReport};

/// Predicate for [`ManagedCache::invalidate_if`]: entries for which it
/// returns `true` are kept.
pub type EntryPredicate<'a> = dyn Fn(&EntryInfo, &dyn SecretStore) -> bool + Send + Sync + 'a;

/// Type-erased cache operations.
pub trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;

    /// Number of resident entries, expired ones included until swept.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn metrics(&self) -> StoreMetrics;

    /// Removes expired entries and trims to capacity.
    fn sweep(&self) -> SweepReport;

    /// Removes one entry. Returns `true` if it was resident.
    fn invalidate_key(&self, key: &CacheKey) -> bool;

    /// Removes every entry. Returns how many were resident.
    fn invalidate_all(&self) -> usize;

    /// Drops the in-memory entries and leaves persisted copies for the next
    /// process. Returns how many were resident.
    fn clear_memory(&self) -> usize;

    /// Keeps exactly the entries `keep` accepts. Returns how many were
    /// removed.
    fn invalidate_if(&self, keep: &EntryPredicate<'_>) -> usize;

    /// Clears the cache if its conditional gate is closed. Returns how many
    /// entries were removed; `0` for an ungated cache.
    fn revalidate_gate(&self) -> usize;
}
