//! Explicit owner of a group of caches.
//!
//! A [`CacheRegistry`] replaces process-wide cache globals. It carries what
//! the caches of one application share (secrets, the argument type table,
//! the persistence directory and per-name configuration overrides) and
//! keeps a weak handle to every cache it built, so registry-wide operations
//! reach all caches that are still alive.
//!
//! ```text
//!   CacheRegistry::init(config)
//!        │
//!        ├── value_cache("a").build(f) ──► ValueCache ──► Arc<CacheState> ◄─┐
//!        ├── resource_cache("b").build(g) ► ResourceCache ► Arc<CacheState> ◄┤ Weak
//!        │                                                                  │
//!        └── RegistryShared { caches: Vec<Weak<dyn ManagedCache>> } ────────┘
//!                 ▲
//!                 └── sweeper thread (optional, every sweep_interval)
//! ```
//!
//! [`shutdown`](CacheRegistry::shutdown) drops every in-memory store, stops
//! the sweeper and makes later builds fail. Persisted entries stay on disk
//! for the next registry over the same directory. Dropping the registry stops the
//! sweeper but leaves caches that are still referenced working.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::builder::{ResourceCacheBuilder, ValueCacheBuilder};
use crate::config::RegistryConfig;
use crate::error::{CacheError, CapacityConfigError};
use crate::hash::TypeTable;
use crate::secrets::{MapSecretStore, SecretStore};
use crate::store::{Clock, DiskBackend, EntryInfo, PersistBackend, StoreMetrics, SweepReport, SystemClock};
use crate::traits::ManagedCache;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Registered {
    name: Arc<str>,
    cache: Weak<dyn ManagedCache>,
}

/// State shared between the registry, its builders and the sweeper.
pub(crate) struct RegistryShared {
    config: RegistryConfig,
    secrets: Arc<dyn SecretStore>,
    type_table: Arc<TypeTable>,
    backend: Option<Arc<dyn PersistBackend>>,
    clock: Arc<dyn Clock>,
    open: AtomicBool,
    caches: Mutex<Vec<Registered>>,
}

impl RegistryShared {
    pub(crate) fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub(crate) fn secrets(&self) -> Arc<dyn SecretStore> {
        Arc::clone(&self.secrets)
    }

    pub(crate) fn type_table(&self) -> Arc<TypeTable> {
        Arc::clone(&self.type_table)
    }

    pub(crate) fn backend(&self) -> Option<Arc<dyn PersistBackend>> {
        self.backend.clone()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CapacityConfigError::new("the cache registry has been shut down").into())
        }
    }

    /// Records a newly built cache. Names must be unique among live caches.
    pub(crate) fn register(
        &self,
        name: Arc<str>,
        cache: Weak<dyn ManagedCache>,
    ) -> Result<(), CacheError> {
        let mut caches = self.caches.lock();
        caches.retain(|r| r.cache.strong_count() > 0);
        if caches.iter().any(|r| r.name == name) {
            return Err(CapacityConfigError::new(format!(
                "a cache named `{name}` is already registered"
            ))
            .into());
        }
        debug!(cache = %name, "cache registered");
        caches.push(Registered { name, cache });
        Ok(())
    }

    /// Live caches, pruning handles whose cache has been dropped.
    fn live(&self) -> Vec<Arc<dyn ManagedCache>> {
        let mut caches = self.caches.lock();
        caches.retain(|r| r.cache.strong_count() > 0);
        caches.iter().filter_map(|r| r.cache.upgrade()).collect()
    }

    fn sweep_all(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for cache in self.live() {
            report += cache.sweep();
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

struct Sweeper {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn spawn(shared: Arc<RegistryShared>, interval: Duration) -> Option<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("memokit-sweeper".into())
            .spawn(move || {
                let (lock, cvar) = &*signal;
                let mut stopped = lock.lock();
                while !*stopped {
                    let timed_out = cvar.wait_for(&mut stopped, interval).timed_out();
                    if *stopped {
                        break;
                    }
                    if timed_out {
                        let report = MutexGuard::unlocked(&mut stopped, || shared.sweep_all());
                        if report.total() > 0 {
                            debug!(
                                expired = report.expired,
                                evicted = report.evicted,
                                "background sweep"
                            );
                        }
                    }
                }
            });
        match spawned {
            Ok(handle) => Some(Self { stop, handle }),
            Err(e) => {
                // Lazy expiry still applies on every lookup.
                warn!(error = %e, "cannot start cache sweeper");
                None
            },
        }
    }

    fn stop(self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock() = true;
        cvar.notify_all();
        if self.handle.join().is_err() {
            warn!("cache sweeper panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// CacheRegistry
// ---------------------------------------------------------------------------

/// Builder for a [`CacheRegistry`].
pub struct RegistryBuilder {
    config: RegistryConfig,
    secrets: Option<Arc<dyn SecretStore>>,
    type_table: TypeTable,
    backend: Option<Arc<dyn PersistBackend>>,
    clock: Option<Arc<dyn Clock>>,
}

impl RegistryBuilder {
    /// Secret store used by gates and `invalidate_if` predicates.
    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Classification of opaque argument types for every cache.
    pub fn type_table(mut self, table: TypeTable) -> Self {
        self.type_table = table;
        self
    }

    /// Persistence backend. Takes precedence over `persist_dir`.
    pub fn backend(mut self, backend: Arc<dyn PersistBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the configuration, opens the persistence directory and
    /// starts the sweeper.
    pub fn init(self) -> Result<CacheRegistry, CacheError> {
        let config = self.config.validate()?;
        let backend = match (self.backend, &config.persist_dir) {
            (Some(backend), _) => Some(backend),
            (None, Some(dir)) => Some(Arc::new(DiskBackend::open(dir)?) as Arc<dyn PersistBackend>),
            (None, None) => None,
        };
        let interval = config.sweep_interval();
        let shared = Arc::new(RegistryShared {
            config,
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(MapSecretStore::new())),
            type_table: Arc::new(self.type_table),
            backend,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            open: AtomicBool::new(true),
            caches: Mutex::new(Vec::new()),
        });
        let sweeper = interval.and_then(|every| Sweeper::spawn(Arc::clone(&shared), every));
        debug!(
            persist = shared.backend.is_some(),
            sweeper = sweeper.is_some(),
            overrides = shared.config.caches.len(),
            "cache registry initialised"
        );
        Ok(CacheRegistry {
            shared,
            sweeper: Mutex::new(sweeper),
        })
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("config", &self.config)
            .field("type_table", &self.type_table)
            .finish_non_exhaustive()
    }
}

/// Owner of a group of caches. See the [module docs](self).
pub struct CacheRegistry {
    shared: Arc<RegistryShared>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl CacheRegistry {
    /// Initialises a registry with default secrets and type table.
    pub fn init(config: RegistryConfig) -> Result<Self, CacheError> {
        Self::builder(config).init()
    }

    pub fn builder(config: RegistryConfig) -> RegistryBuilder {
        RegistryBuilder {
            config,
            secrets: None,
            type_table: TypeTable::new(),
            backend: None,
            clock: None,
        }
    }

    /// Starts a value cache registered under `name`.
    pub fn value_cache<A, V>(&self, name: impl Into<Arc<str>>) -> ValueCacheBuilder<A, V> {
        ValueCacheBuilder::registered(name.into(), Arc::clone(&self.shared))
    }

    /// Starts a resource cache registered under `name`.
    pub fn resource_cache<A, R>(&self, name: impl Into<Arc<str>>) -> ResourceCacheBuilder<A, R> {
        ResourceCacheBuilder::registered(name.into(), Arc::clone(&self.shared))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn secrets(&self) -> Arc<dyn SecretStore> {
        self.shared.secrets()
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Names of the live caches, in registration order.
    pub fn cache_names(&self) -> Vec<String> {
        self.shared
            .live()
            .iter()
            .map(|cache| cache.name().to_string())
            .collect()
    }

    /// Entries resident across all live caches.
    pub fn total_entries(&self) -> usize {
        self.shared.live().iter().map(|cache| cache.len()).sum()
    }

    /// Sum of every live cache's store counters.
    pub fn metrics(&self) -> StoreMetrics {
        self.shared
            .live()
            .iter()
            .fold(StoreMetrics::default(), |acc, cache| acc + cache.metrics())
    }

    /// Removes every entry of every live cache. Returns the number removed.
    pub fn clear_all(&self) -> usize {
        let removed: usize = self
            .shared
            .live()
            .iter()
            .map(|cache| cache.invalidate_all())
            .sum();
        debug!(removed, "all caches cleared");
        removed
    }

    /// Applies `keep` to every resident entry of every live cache and
    /// removes the entries it rejects.
    pub fn invalidate_if<F>(&self, keep: F) -> usize
    where
        F: Fn(&EntryInfo, &dyn SecretStore) -> bool + Send + Sync,
    {
        self.shared
            .live()
            .iter()
            .map(|cache| cache.invalidate_if(&keep))
            .sum()
    }

    /// Re-evaluates every cache's gate; caches whose gate is closed are
    /// cleared.
    pub fn revalidate_gates(&self) -> usize {
        self.shared
            .live()
            .iter()
            .map(|cache| cache.revalidate_gate())
            .sum()
    }

    /// Reclaims expired and over-capacity entries now.
    pub fn sweep(&self) -> SweepReport {
        self.shared.sweep_all()
    }

    /// Drops every in-memory store, stops the sweeper and rejects later
    /// builds. Persisted copies are kept. Calling it again has no effect.
    pub fn shutdown(&self) {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        let removed: usize = self
            .shared
            .live()
            .iter()
            .map(|cache| cache.clear_memory())
            .sum();
        debug!(removed, "cache registry shut down");
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.stop();
        }
    }
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("open", &self.is_open())
            .field("caches", &self.cache_names())
            .field("sweeper", &self.sweeper.lock().is_some())
            .finish()
    }
}
