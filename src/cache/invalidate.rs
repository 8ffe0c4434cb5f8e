//! Invalidation for a single cache.
//!
//! Every removal goes through the entry store, which stamps the removed keys
//! so a computation already in flight for one of them returns its result to
//! its callers without storing it. Persisted copies are removed in the same
//! call, except by `clear_memory`.

use tracing::{debug, warn};

use crate::cache::engine::CacheState;
use crate::key::CacheKey;
use crate::store::{StoreMetrics, SweepReport};
use crate::traits::{EntryPredicate, ManagedCache};

impl<V> ManagedCache for CacheState<V>
where
    V: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.store.len()
    }

    fn metrics(&self) -> StoreMetrics {
        self.store.metrics()
    }

    fn sweep(&self) -> SweepReport {
        self.store.sweep()
    }

    fn invalidate_key(&self, key: &CacheKey) -> bool {
        let removed = self.store.remove(key).is_some();
        self.persist_remove(key);
        removed
    }

    fn invalidate_all(&self) -> usize {
        let removed = self.store.clear();
        self.persist_clear();
        debug!(cache = %self.name, removed, "cache invalidated");
        removed
    }

    fn clear_memory(&self) -> usize {
        let removed = self.store.clear();
        debug!(cache = %self.name, removed, "in-memory entries dropped");
        removed
    }

    fn invalidate_if(&self, keep: &EntryPredicate<'_>) -> usize {
        let secrets = self.secrets.as_ref();
        let removed = self.store.retain(|info| keep(info, secrets));
        for key in &removed {
            self.persist_remove(key);
        }
        removed.len()
    }

    fn revalidate_gate(&self) -> usize {
        let Some(gate) = &self.gate else {
            return 0;
        };
        if gate.is_open(self.secrets.as_ref()) {
            return 0;
        }
        warn!(cache = %self.name, gate = gate.name(), "gate closed, clearing cache");
        self.invalidate_all()
    }
}
