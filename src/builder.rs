//! Builders that wrap a function into a cache.
//!
//! Wrapping is higher-order: a builder collects the cache's name, identity
//! and configuration, then [`build`](ValueCacheBuilder::build) takes the
//! function and returns the cached callable. Builders obtained from a
//! [`CacheRegistry`](crate::registry::CacheRegistry) inherit its secrets,
//! type table, persistence directory and per-name configuration overrides,
//! and register the cache for registry-wide sweeps and invalidation.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use memokit::builder::CacheBuilder;
//! use memokit::config::CacheConfig;
//!
//! let squares = CacheBuilder::value("squares")
//!     .config(CacheConfig::default().max_entries(100).ttl(Duration::from_secs(60)))
//!     .build_infallible(|x: &(u64,)| x.0 * x.0)
//!     .unwrap();
//! assert_eq!(squares.call(&(12,)).unwrap(), 144);
//! ```

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache::engine::{CacheState, Codec, ComputeFn, Persistence, ValidateFn};
use crate::cache::{DeepCopy, LazyScope, ProgressEvent, ProgressHook, ResourceCache, ValueCache};
use crate::config::{CacheConfig, PersistMode};
use crate::error::{BoxError, CacheError, CapacityConfigError};
use crate::hash::TypeTable;
use crate::key::{CallInput, FunctionIdentity, KeyDeriver};
use crate::registry::RegistryShared;
use crate::secrets::{ConditionalGate, MapSecretStore, SecretStore};
use crate::store::{Clock, EntryStore, PersistBackend, SystemClock};
use crate::traits::ManagedCache;

/// Entry point for caches built outside a registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheBuilder;

impl CacheBuilder {
    /// Starts a value cache called `name`.
    pub fn value<A, V>(name: impl Into<Arc<str>>) -> ValueCacheBuilder<A, V> {
        ValueCacheBuilder {
            opts: Options::new(name.into(), None),
            codec: None,
            _marker: PhantomData,
        }
    }

    /// Starts a resource cache called `name`.
    pub fn resource<A, R>(name: impl Into<Arc<str>>) -> ResourceCacheBuilder<A, R> {
        ResourceCacheBuilder {
            opts: Options::new(name.into(), None),
            validate: None,
            _marker: PhantomData,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared options
// ---------------------------------------------------------------------------

struct Options {
    name: Arc<str>,
    identity: Option<FunctionIdentity>,
    config: CacheConfig,
    persist_requested: bool,
    exclusions: Vec<String>,
    gate: Option<ConditionalGate>,
    secrets: Option<Arc<dyn SecretStore>>,
    type_table: Option<Arc<TypeTable>>,
    backend: Option<Arc<dyn PersistBackend>>,
    clock: Option<Arc<dyn Clock>>,
    progress: Option<ProgressHook>,
    registry: Option<Arc<RegistryShared>>,
}

impl Options {
    fn new(name: Arc<str>, registry: Option<Arc<RegistryShared>>) -> Self {
        Self {
            name,
            identity: None,
            config: CacheConfig::default(),
            persist_requested: false,
            exclusions: Vec::new(),
            gate: None,
            secrets: None,
            type_table: None,
            backend: None,
            clock: None,
            progress: None,
            registry,
        }
    }

    /// Resolves the effective configuration: builder settings, then registry
    /// overrides for this name, then validation.
    fn resolve_config(&self) -> Result<CacheConfig, CapacityConfigError> {
        let mut config = self.config.clone();
        if self.persist_requested {
            config.persist = PersistMode::Disk;
        }
        let overrides = self
            .registry
            .as_ref()
            .and_then(|registry| registry.config().cache(&self.name));
        match overrides {
            Some(raw) => raw.apply(config),
            None => config.validate(),
        }
    }

    fn into_state<V>(
        self,
        default_identity: FunctionIdentity,
        codec: Option<Codec<V>>,
        validate: Option<ValidateFn<V>>,
    ) -> Result<Arc<CacheState<V>>, CacheError>
    where
        V: Send + Sync + 'static,
    {
        if let Some(registry) = &self.registry {
            registry.ensure_open()?;
        }
        let config = self.resolve_config()?;
        let persistence = match config.persist {
            PersistMode::None => None,
            PersistMode::Disk => Some(self.persistence(codec)?),
        };

        let registry = self.registry.as_ref();
        let secrets = self
            .secrets
            .or_else(|| registry.map(|r| r.secrets()))
            .unwrap_or_else(|| Arc::new(MapSecretStore::new()));
        let type_table = self
            .type_table
            .or_else(|| registry.map(|r| r.type_table()))
            .unwrap_or_default();
        let clock = self
            .clock
            .or_else(|| registry.map(|r| r.clock()))
            .unwrap_or_else(|| Arc::new(SystemClock));

        let mut deriver = KeyDeriver::new().with_type_table(type_table);
        if let Some(registry) = registry {
            deriver = deriver.with_max_depth(registry.config().max_depth);
        }
        for name in self.exclusions {
            deriver = deriver.exclude(name);
        }

        let store = EntryStore::with_clock(config.max_entries, config.ttl, clock)
            .named(self.name.to_string());
        let state = Arc::new(CacheState {
            name: Arc::clone(&self.name),
            identity: self.identity.unwrap_or(default_identity),
            deriver,
            store,
            flights: LazyScope::new().with_timeout(config.compute_timeout),
            config,
            gate: self.gate,
            secrets,
            persistence,
            progress: self.progress,
            validate,
        });

        if let Some(registry) = registry {
            let handle: Weak<dyn ManagedCache> = Arc::downgrade(&state) as Weak<dyn ManagedCache>;
            registry.register(Arc::clone(&self.name), handle)?;
        }
        debug!(cache = %state.name, identity = state.identity.name(), "cache built");
        Ok(state)
    }

    fn persistence<V>(&self, codec: Option<Codec<V>>) -> Result<Persistence<V>, CacheError> {
        let codec = codec.ok_or_else(|| {
            CapacityConfigError::new(format!(
                "cache `{}` requests persistence but its values have no codec; \
                 build it with `.persisted()`",
                self.name
            ))
        })?;
        let backend = self
            .backend
            .clone()
            .or_else(|| self.registry.as_ref().and_then(|r| r.backend()))
            .ok_or_else(|| {
                CapacityConfigError::new(format!(
                    "cache `{}` requests persistence but no backend is configured",
                    self.name
                ))
            })?;
        // Default identities come from closure type names, which stay the
        // same when the body is edited.
        if self.identity.is_none() {
            return Err(CapacityConfigError::new(format!(
                "cache `{}` persists entries but has no explicit identity; \
                 set `.identity(..)` or use `fn_identity!`",
                self.name
            ))
            .into());
        }
        Ok(Persistence { backend, codec })
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("exclusions", &self.exclusions)
            .field("gate", &self.gate)
            .field("registered", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

/// Setters shared by both builders.
macro_rules! common_setters {
    () => {
        /// Overrides the function identity. Without one, the identity is
        /// derived from the cache name and the function's type.
        pub fn identity(mut self, identity: FunctionIdentity) -> Self {
            self.opts.identity = Some(identity);
            self
        }

        pub fn config(mut self, config: CacheConfig) -> Self {
            self.opts.config = config;
            self
        }

        /// Excludes the parameter or option `name` from the key.
        pub fn exclude(mut self, name: impl Into<String>) -> Self {
            self.opts.exclusions.push(name.into());
            self
        }

        pub fn gate(mut self, gate: ConditionalGate) -> Self {
            self.opts.gate = Some(gate);
            self
        }

        pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
            self.opts.secrets = Some(secrets);
            self
        }

        pub fn type_table(mut self, table: Arc<TypeTable>) -> Self {
            self.opts.type_table = Some(table);
            self
        }

        pub fn backend(mut self, backend: Arc<dyn PersistBackend>) -> Self {
            self.opts.backend = Some(backend);
            self
        }

        pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.opts.clock = Some(clock);
            self
        }

        /// Receives [`ProgressEvent`]s on misses while `show_spinner` is set.
        pub fn on_progress<P>(mut self, hook: P) -> Self
        where
            P: Fn(&ProgressEvent) + Send + Sync + 'static,
        {
            self.opts.progress = Some(Arc::new(hook));
            self
        }
    };
}

// ---------------------------------------------------------------------------
// ValueCacheBuilder
// ---------------------------------------------------------------------------

/// Builder for a [`ValueCache`].
pub struct ValueCacheBuilder<A, V> {
    opts: Options,
    codec: Option<Codec<V>>,
    _marker: PhantomData<fn(&A) -> V>,
}

impl<A, V> ValueCacheBuilder<A, V> {
    pub(crate) fn registered(name: Arc<str>, registry: Arc<RegistryShared>) -> Self {
        Self {
            opts: Options::new(name, Some(registry)),
            codec: None,
            _marker: PhantomData,
        }
    }

    common_setters!();

    /// Persists entries through the configured backend. The build fails
    /// unless an explicit [`identity`](Self::identity) is set.
    pub fn persisted(mut self) -> Self
    where
        V: Serialize + DeserializeOwned,
    {
        self.codec = Some(Codec::json());
        self.opts.persist_requested = true;
        self
    }

    /// Makes the values persistable without turning persistence on, so a
    /// `persist = "disk"` override can enable it.
    pub fn persistable(mut self) -> Self
    where
        V: Serialize + DeserializeOwned,
    {
        self.codec = Some(Codec::json());
        self
    }
}

impl<A, V> ValueCacheBuilder<A, V>
where
    A: CallInput,
    V: DeepCopy + Send + Sync + 'static,
{
    /// Wraps a fallible function.
    pub fn build<F, E>(self, f: F) -> Result<ValueCache<A, V>, CacheError>
    where
        F: Fn(&A) -> Result<V, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let identity = FunctionIdentity::versioned(self.opts.name.to_string(), type_name::<F>());
        let state = self.opts.into_state(identity, self.codec, None)?;
        let func: ComputeFn<A, V> = Arc::new(move |args: &A| f(args).map_err(Into::into));
        Ok(ValueCache::from_parts(state, func))
    }

    /// Wraps a function that cannot fail.
    pub fn build_infallible<F>(self, f: F) -> Result<ValueCache<A, V>, CacheError>
    where
        F: Fn(&A) -> V + Send + Sync + 'static,
    {
        let identity = FunctionIdentity::versioned(self.opts.name.to_string(), type_name::<F>());
        let state = self.opts.into_state(identity, self.codec, None)?;
        let func: ComputeFn<A, V> = Arc::new(move |args: &A| Ok(f(args)));
        Ok(ValueCache::from_parts(state, func))
    }
}

impl<A, V> fmt::Debug for ValueCacheBuilder<A, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCacheBuilder")
            .field("opts", &self.opts)
            .field("codec", &self.codec.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ResourceCacheBuilder
// ---------------------------------------------------------------------------

/// Builder for a [`ResourceCache`].
pub struct ResourceCacheBuilder<A, R> {
    opts: Options,
    validate: Option<ValidateFn<R>>,
    _marker: PhantomData<fn(&A) -> R>,
}

impl<A, R> ResourceCacheBuilder<A, R> {
    pub(crate) fn registered(name: Arc<str>, registry: Arc<RegistryShared>) -> Self {
        Self {
            opts: Options::new(name, Some(registry)),
            validate: None,
            _marker: PhantomData,
        }
    }

    common_setters!();

    /// Checks a cached resource on every hit; one that fails is rebuilt.
    pub fn validate<P>(mut self, check: P) -> Self
    where
        P: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(check));
        self
    }
}

impl<A, R> ResourceCacheBuilder<A, R>
where
    A: CallInput,
    R: Send + Sync + 'static,
{
    /// Wraps a fallible constructor.
    pub fn build<F, E>(self, f: F) -> Result<ResourceCache<A, R>, CacheError>
    where
        F: Fn(&A) -> Result<R, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let identity = FunctionIdentity::versioned(self.opts.name.to_string(), type_name::<F>());
        let state = self.opts.into_state(identity, None, self.validate)?;
        let func: ComputeFn<A, R> = Arc::new(move |args: &A| f(args).map_err(Into::into));
        Ok(ResourceCache::from_parts(state, func))
    }

    /// Wraps a constructor that cannot fail.
    pub fn build_infallible<F>(self, f: F) -> Result<ResourceCache<A, R>, CacheError>
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        let identity = FunctionIdentity::versioned(self.opts.name.to_string(), type_name::<F>());
        let state = self.opts.into_state(identity, None, self.validate)?;
        let func: ComputeFn<A, R> = Arc::new(move |args: &A| Ok(f(args)));
        Ok(ResourceCache::from_parts(state, func))
    }
}

impl<A, R> fmt::Debug for ResourceCacheBuilder<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCacheBuilder")
            .field("opts", &self.opts)
            .field("validate", &self.validate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnhashableError;
    use crate::key::CallArgs;
    use crate::store::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn value_cache_copies_are_independent() {
        let cache = CacheBuilder::value("rows")
            .build_infallible(|n: &(usize,)| vec![0u8; n.0])
            .unwrap();
        let mut a = cache.call(&(3,)).unwrap();
        a.push(9);
        let b = cache.call(&(3,)).unwrap();
        assert_eq!(b, vec![0, 0, 0]);
        assert_eq!(cache.name(), "rows");
    }

    #[test]
    fn resource_cache_shares_instance() {
        let cache = CacheBuilder::resource("pool")
            .build_infallible(|url: &(String,)| url.0.clone())
            .unwrap();
        let a = cache.call(&("db://x".to_string(),)).unwrap();
        let b = cache.call(&("db://x".to_string(),)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalid_config_fails_build() {
        let err = CacheBuilder::value("bad")
            .config(CacheConfig::default().max_entries(0))
            .build_infallible(|x: &(u8,)| x.0)
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn persistence_needs_codec_and_backend() {
        let err = CacheBuilder::value("no_backend")
            .persisted()
            .build_infallible(|x: &(u8,)| x.0)
            .unwrap_err();
        assert!(err.to_string().contains("no backend"));

        let err = CacheBuilder::value("no_codec")
            .config(CacheConfig::default().persist(PersistMode::Disk))
            .backend(Arc::new(MemoryBackend::new()))
            .build_infallible(|x: &(u8,)| crate::cache::Uncopyable(x.0))
            .unwrap_err();
        assert!(err.to_string().contains("codec"));

        let err = CacheBuilder::resource("res")
            .config(CacheConfig::default().persist(PersistMode::Disk))
            .backend(Arc::new(MemoryBackend::new()))
            .build_infallible(|x: &(u8,)| x.0)
            .unwrap_err();
        assert!(err.to_string().contains("codec"));
    }

    #[test]
    fn persistence_needs_explicit_identity() {
        let err = CacheBuilder::value("anonymous")
            .persisted()
            .backend(Arc::new(MemoryBackend::new()))
            .build_infallible(|x: &(u32,)| x.0)
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
        assert!(err.to_string().contains("identity"));
    }

    #[test]
    fn persisted_cache_writes_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheBuilder::value("persisted")
            .identity(FunctionIdentity::versioned("persisted", "1"))
            .persisted()
            .backend(backend.clone())
            .build_infallible(|x: &(u32,)| x.0 + 1)
            .unwrap();
        assert_eq!(cache.call(&(1,)).unwrap(), 2);
        assert_eq!(backend.len(), 1);
        assert!(cache.invalidate_args(&(1,)).unwrap());
        assert!(backend.is_empty());
    }

    #[test]
    fn exclusions_apply_to_keys() {
        struct Query {
            sql: String,
            verbose: bool,
        }
        impl CallInput for Query {
            fn describe<'a>(&'a self, args: &mut CallArgs<'a>) {
                args.arg("sql", &self.sql).arg("verbose", &self.verbose);
            }
        }

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cache = CacheBuilder::value("query")
            .exclude("verbose")
            .build_infallible(move |q: &Query| {
                counter.fetch_add(1, Ordering::SeqCst);
                q.sql.len()
            })
            .unwrap();

        let quiet = Query {
            sql: "select 1".into(),
            verbose: false,
        };
        let loud = Query {
            sql: "select 1".into(),
            verbose: true,
        };
        assert_eq!(cache.call(&quiet).unwrap(), 8);
        assert_eq!(cache.call(&loud).unwrap(), 8);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(loud.verbose && !quiet.verbose);
    }

    #[test]
    fn unhashable_argument_fails_before_compute() {
        struct Conn;
        struct Call<'c> {
            conn: &'c Conn,
        }
        impl CallInput for Call<'_> {
            fn describe<'a>(&'a self, args: &mut CallArgs<'a>) {
                args.opaque("conn", self.conn);
            }
        }

        let conn = Conn;
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cache = CacheBuilder::value("conn")
            .build_infallible(move |_: &Call<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                1u8
            })
            .unwrap();
        let err = cache.call(&Call { conn: &conn }).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Unhashable(UnhashableError::Unclassified { .. })
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let tolerant = CacheBuilder::value("conn_identity")
            .type_table(Arc::new(TypeTable::new().identity_only::<Conn>("conn")))
            .build_infallible(|_: &Call<'_>| 2u8)
            .unwrap();
        assert_eq!(tolerant.call(&Call { conn: &conn }).unwrap(), 2);
    }

    #[test]
    fn explicit_identity_is_used() {
        let identity = FunctionIdentity::versioned("f", "2");
        let cache = CacheBuilder::value("f")
            .identity(identity.clone())
            .build_infallible(|x: &(u8,)| x.0)
            .unwrap();
        assert_eq!(cache.identity(), &identity);
    }
}
