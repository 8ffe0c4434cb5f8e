//! Resource cache: every caller gets the same shared object.
//!
//! Suited to values that are expensive to construct and meant to be shared:
//! connection pools, loaded models, clients. A hit returns a clone of the
//! stored `Arc`, so `Arc::ptr_eq` holds between callers until the entry is
//! evicted or invalidated. Interior mutability inside the resource is the
//! caller's business.
//!
//! An optional `validate` hook is consulted on every hit; a resource that
//! fails it (a dropped connection, say) is discarded and rebuilt.

use std::fmt;
use std::sync::Arc;

use crate::cache::engine::{CacheState, ComputeFn};
use crate::config::CacheConfig;
use crate::error::{BoxError, CacheError};
use crate::key::{CacheKey, CallInput, FunctionIdentity};
use crate::secrets::SecretStore;
use crate::store::{EntryInfo, StoreMetrics, SweepReport};
use crate::traits::{EntryPredicate, ManagedCache};

/// A memoized constructor whose callers share one instance per key.
pub struct ResourceCache<A, R> {
    state: Arc<CacheState<R>>,
    func: ComputeFn<A, R>,
}

impl<A, R> Clone for ResourceCache<A, R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            func: Arc::clone(&self.func),
        }
    }
}

impl<A, R> ResourceCache<A, R>
where
    A: CallInput,
    R: Send + Sync + 'static,
{
    pub(crate) fn from_parts(state: Arc<CacheState<R>>, func: ComputeFn<A, R>) -> Self {
        Self { state, func }
    }

    /// Returns the shared resource for `args`, constructing it on a miss.
    pub fn call(&self, args: &A) -> Result<Arc<R>, CacheError> {
        let key = self.state.key_for(args)?;
        self.state.fetch(key, || (self.func)(args))
    }

    /// Returns the shared resource for `key`, running `construct` on a miss.
    pub fn get_or_construct<F, E>(&self, key: CacheKey, construct: F) -> Result<Arc<R>, CacheError>
    where
        F: FnOnce() -> Result<R, E>,
        E: Into<BoxError>,
    {
        self.state.fetch(key, || construct().map_err(Into::into))
    }

    pub fn key(&self, args: &A) -> Result<CacheKey, CacheError> {
        self.state.key_for(args)
    }

    pub fn contains(&self, args: &A) -> Result<bool, CacheError> {
        Ok(self.state.store.contains(&self.key(args)?))
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.state.invalidate_key(key)
    }

    pub fn invalidate_args(&self, args: &A) -> Result<bool, CacheError> {
        Ok(self.invalidate(&self.key(args)?))
    }

    pub fn invalidate_all(&self) -> usize {
        self.state.invalidate_all()
    }

    pub fn invalidate_if<F>(&self, keep: F) -> usize
    where
        F: Fn(&EntryInfo, &dyn SecretStore) -> bool + Send + Sync,
    {
        self.state.invalidate_if(&keep)
    }

    pub fn revalidate_gate(&self) -> usize {
        self.state.revalidate_gate()
    }

    pub fn identity(&self) -> &FunctionIdentity {
        &self.state.identity
    }

    pub fn config(&self) -> &CacheConfig {
        &self.state.config
    }

    pub fn entries(&self) -> Vec<EntryInfo> {
        self.state.store.infos()
    }
}

impl<A, R> ManagedCache for ResourceCache<A, R>
where
    R: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.state.name()
    }

    fn len(&self) -> usize {
        self.state.len()
    }

    fn metrics(&self) -> StoreMetrics {
        self.state.metrics()
    }

    fn sweep(&self) -> SweepReport {
        self.state.sweep()
    }

    fn invalidate_key(&self, key: &CacheKey) -> bool {
        self.state.invalidate_key(key)
    }

    fn invalidate_all(&self) -> usize {
        self.state.invalidate_all()
    }

    fn clear_memory(&self) -> usize {
        self.state.clear_memory()
    }

    fn invalidate_if(&self, keep: &EntryPredicate<'_>) -> usize {
        self.state.invalidate_if(keep)
    }

    fn revalidate_gate(&self) -> usize {
        self.state.revalidate_gate()
    }
}

impl<A, R> fmt::Debug for ResourceCache<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
