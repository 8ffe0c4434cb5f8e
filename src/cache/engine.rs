//! Shared machinery behind value and resource caches.
//!
//! A [`CacheState`] owns everything about a cache except the wrapped
//! function: key derivation settings, the entry store, the singleflight
//! scope, the optional gate, persistence and progress hooks. Value and
//! resource caches differ only in what they hand back from
//! [`CacheState::fetch`].
//!
//! ## Miss path
//!
//! ```text
//!   fetch(key)
//!     │ gate closed? ── yes ──► purge key, Err(GateClosed)
//!     │ store hit (and valid)? ── yes ──► Arc<V>
//!     ▼
//!   LazyScope::get_or_init_then(key)
//!     leader:  store re-check ─► backend load ─► compute()
//!     on success (in time): put_if_generation(key), backend save
//!     waiters: same Arc<V> or same error
//! ```

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::cache::lazy::LazyScope;
use crate::config::CacheConfig;
use crate::error::{BoxError, CacheError, PersistError};
use crate::key::{CacheKey, CallInput, FunctionIdentity, KeyDeriver};
use crate::secrets::{ConditionalGate, SecretStore};
use crate::store::{EntryMeta, EntryStore, Generation, PersistBackend, PersistedEntry};

/// Miss-path notifications, emitted only when `show_spinner` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        cache: Arc<str>,
        key: CacheKey,
    },
    Finished {
        cache: Arc<str>,
        key: CacheKey,
        elapsed: Duration,
        ok: bool,
    },
}

impl ProgressEvent {
    pub fn cache(&self) -> &str {
        match self {
            Self::Started { cache, .. } | Self::Finished { cache, .. } => cache,
        }
    }

    pub fn key(&self) -> CacheKey {
        match self {
            Self::Started { key, .. } | Self::Finished { key, .. } => *key,
        }
    }
}

pub type ProgressHook = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

pub(crate) type ComputeFn<A, V> = Arc<dyn Fn(&A) -> Result<V, BoxError> + Send + Sync>;

pub(crate) type ValidateFn<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// JSON conversion for persisted values.
pub(crate) struct Codec<V> {
    encode: fn(&V) -> Result<serde_json::Value, serde_json::Error>,
    decode: fn(serde_json::Value) -> Result<V, serde_json::Error>,
}

impl<V> Clone for Codec<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Codec<V> {}

impl<V: Serialize + DeserializeOwned> Codec<V> {
    pub(crate) fn json() -> Self {
        Self {
            encode: |value| serde_json::to_value(value),
            decode: serde_json::from_value::<V>,
        }
    }
}

pub(crate) struct Persistence<V> {
    pub(crate) backend: Arc<dyn PersistBackend>,
    pub(crate) codec: Codec<V>,
}

// ---------------------------------------------------------------------------
// CacheState
// ---------------------------------------------------------------------------

pub(crate) struct CacheState<V> {
    pub(crate) name: Arc<str>,
    pub(crate) identity: FunctionIdentity,
    pub(crate) deriver: KeyDeriver,
    pub(crate) config: CacheConfig,
    pub(crate) store: EntryStore<V>,
    pub(crate) flights: LazyScope<V>,
    pub(crate) gate: Option<ConditionalGate>,
    pub(crate) secrets: Arc<dyn SecretStore>,
    pub(crate) persistence: Option<Persistence<V>>,
    pub(crate) progress: Option<ProgressHook>,
    pub(crate) validate: Option<ValidateFn<V>>,
}

impl<V> CacheState<V>
where
    V: Send + Sync + 'static,
{
    pub(crate) fn key_for<A>(&self, args: &A) -> Result<CacheKey, CacheError>
    where
        A: CallInput + ?Sized,
    {
        Ok(self.deriver.derive_input(&self.identity, args)?)
    }

    /// Returns the cached value for `key`, running `compute` at most once
    /// across concurrent callers on a miss.
    pub(crate) fn fetch<F>(&self, key: CacheKey, compute: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Result<V, BoxError>,
    {
        self.check_gate(&key)?;
        if let Some(value) = self.lookup(&key) {
            return Ok(value);
        }
        debug!(cache = %self.name, key = %key, "miss");

        let publish_generation = Cell::new(None);
        self.flights.get_or_init_then(
            key,
            || self.load_or_compute(key, compute, &publish_generation),
            |value| {
                if let Some(generation) = publish_generation.get() {
                    self.publish(generation, key, value);
                }
            },
        )
    }

    fn check_gate(&self, key: &CacheKey) -> Result<(), CacheError> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        if gate.is_open(self.secrets.as_ref()) {
            return Ok(());
        }
        self.store.remove(key);
        self.persist_remove(key);
        warn!(cache = %self.name, gate = gate.name(), key = %key, "gate closed, entry purged");
        Err(CacheError::GateClosed {
            gate: gate.name().to_string(),
        })
    }

    fn accepts(&self, value: &V) -> bool {
        self.validate.as_ref().is_none_or(|validate| validate(value))
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<V>> {
        let entry = self.store.get(key)?;
        if self.accepts(&entry.value) {
            return Some(entry.value);
        }
        debug!(cache = %self.name, key = %key, "cached value failed validation");
        self.store.remove(key);
        None
    }

    fn load_or_compute<F>(
        &self,
        key: CacheKey,
        compute: F,
        publish_generation: &Cell<Option<Generation>>,
    ) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Result<V, BoxError>,
    {
        // A flight that finished between our lookup and becoming leader has
        // already published.
        if let Some(entry) = self.store.peek(&key) {
            if self.accepts(&entry.value) {
                return Ok(entry.value);
            }
        }

        let generation = self.store.generation();
        if let Some((value, meta)) = self.persist_load(&key) {
            trace!(cache = %self.name, key = %key, "restored from backend");
            self.store
                .put_if_generation(generation, key, Arc::clone(&value), meta);
            return Ok(value);
        }

        publish_generation.set(Some(generation));
        self.emit(ProgressEvent::Started {
            cache: Arc::clone(&self.name),
            key,
        });
        let started = Instant::now();
        let result = compute();
        self.emit(ProgressEvent::Finished {
            cache: Arc::clone(&self.name),
            key,
            elapsed: started.elapsed(),
            ok: result.is_ok(),
        });

        match result {
            Ok(value) => Ok(Arc::new(value)),
            Err(err) => {
                debug!(cache = %self.name, key = %key, error = %err, "computation failed");
                Err(CacheError::from_computation(key, err))
            },
        }
    }

    fn publish(&self, generation: Generation, key: CacheKey, value: &Arc<V>) {
        let meta = EntryMeta::with_size_hint(std::mem::size_of::<V>());
        if self
            .store
            .put_if_generation(generation, key, Arc::clone(value), meta)
        {
            self.persist_save(&key, value);
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if !self.config.show_spinner {
            return;
        }
        if let Some(hook) = &self.progress {
            hook(&event);
        }
    }

    // -- persistence ----------------------------------------------------------

    fn persist_load(&self, key: &CacheKey) -> Option<(Arc<V>, EntryMeta)> {
        let persistence = self.persistence.as_ref()?;
        let record = match persistence.backend.load(&self.name, key) {
            Ok(record) => record?,
            Err(err) => {
                warn!(cache = %self.name, key = %key, error = %err, "persisted entry unreadable");
                if matches!(err, PersistError::Codec(_)) {
                    self.persist_remove(key);
                }
                return None;
            },
        };

        let now_ms = self.store.clock().unix_millis();
        let age = Duration::from_millis(now_ms.saturating_sub(record.created_at_ms));
        if self.config.ttl.is_some_and(|ttl| age > ttl) {
            trace!(cache = %self.name, key = %key, "persisted entry expired");
            self.persist_remove(key);
            return None;
        }

        match (persistence.codec.decode)(record.payload) {
            Ok(value) => Some((
                Arc::new(value),
                EntryMeta {
                    size_hint: record.size_hint,
                    age,
                },
            )),
            Err(err) => {
                warn!(cache = %self.name, key = %key, error = %err, "persisted entry does not decode");
                self.persist_remove(key);
                None
            },
        }
    }

    fn persist_save(&self, key: &CacheKey, value: &V) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let payload = match (persistence.codec.encode)(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(cache = %self.name, key = %key, error = %err, "value does not encode, not persisted");
                return;
            },
        };
        let record = PersistedEntry::new(
            self.store.clock().unix_millis(),
            std::mem::size_of::<V>(),
            payload,
        );
        if let Err(err) = persistence.backend.save(&self.name, key, &record) {
            warn!(cache = %self.name, key = %key, error = %err, "persist save failed");
        }
    }

    pub(crate) fn persist_remove(&self, key: &CacheKey) {
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.backend.remove(&self.name, key) {
                warn!(cache = %self.name, key = %key, error = %err, "persist remove failed");
            }
        }
    }

    pub(crate) fn persist_clear(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.backend.clear(&self.name) {
                warn!(cache = %self.name, error = %err, "persist clear failed");
            }
        }
    }
}

impl<V> fmt::Debug for CacheState<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheState")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("gate", &self.gate)
            .field("persisted", &self.persistence.is_some())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::secrets::MapSecretStore;
    use crate::store::{ManualClock, MemoryBackend};
    use crate::traits::ManagedCache;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn state<V: Send + Sync + 'static>(config: CacheConfig) -> CacheState<V> {
        CacheState {
            name: Arc::from("test"),
            identity: FunctionIdentity::versioned("test", "1"),
            deriver: KeyDeriver::new(),
            store: EntryStore::new(config.max_entries, config.ttl),
            flights: LazyScope::new().with_timeout(config.compute_timeout),
            config,
            gate: None,
            secrets: Arc::new(MapSecretStore::new()),
            persistence: None,
            progress: None,
            validate: None,
        }
    }

    fn key(n: u8) -> CacheKey {
        CacheKey::from_bytes([n; 32])
    }

    #[test]
    fn second_fetch_hits() {
        let state = state::<u32>(CacheConfig::default());
        let runs = AtomicUsize::new(0);
        let compute = || {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        };
        let a = state.fetch(key(1), compute).unwrap();
        let b = state.fetch(key(1), compute).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let m = state.store.metrics();
        assert_eq!((m.hits, m.misses), (1, 1));
    }

    #[test]
    fn failures_are_not_cached() {
        let state = state::<u32>(CacheConfig::default());
        let err = state.fetch(key(1), || Err("nope".into())).unwrap_err();
        assert!(err.computation().is_some());
        assert!(state.store.is_empty());
        assert_eq!(*state.fetch(key(1), || Ok(1)).unwrap(), 1);
    }

    #[test]
    fn closed_gate_purges_and_refuses() {
        let secrets = Arc::new(MapSecretStore::new().with("password", "x"));
        let mut state = state::<u32>(CacheConfig::default());
        state.gate = Some(ConditionalGate::secret_present("password"));
        state.secrets = secrets.clone();

        state.fetch(key(1), || Ok(1)).unwrap();
        assert_eq!(state.store.len(), 1);

        secrets.unset("password");
        let err = state.fetch(key(1), || Ok(2)).unwrap_err();
        assert!(matches!(err, CacheError::GateClosed { ref gate } if gate == "secret_present(password)"));
        assert!(state.store.is_empty());
    }

    #[test]
    fn progress_events_follow_show_spinner() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut quiet = state::<u32>(CacheConfig::default().show_spinner(false));
        quiet.progress = Some(Arc::new(move |e: &ProgressEvent| sink.lock().push(e.clone())));
        quiet.fetch(key(1), || Ok(1)).unwrap();
        assert!(events.lock().is_empty());

        let sink = Arc::clone(&events);
        let mut loud = state::<u32>(CacheConfig::default());
        loud.progress = Some(Arc::new(move |e: &ProgressEvent| sink.lock().push(e.clone())));
        loud.fetch(key(1), || Ok(1)).unwrap();
        loud.fetch(key(1), || Ok(1)).unwrap();

        let seen = events.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], ProgressEvent::Started { .. }));
        assert!(matches!(seen[1], ProgressEvent::Finished { ok: true, .. }));
        assert_eq!(seen[1].cache(), "test");
        assert_eq!(seen[1].key(), key(1));
    }

    #[test]
    fn persisted_entries_restore_and_expire() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig::default().ttl(Duration::from_secs(10));
        let build = || {
            let mut s = state::<Vec<u32>>(config.clone());
            s.store = EntryStore::with_clock(None, config.ttl, clock.clone());
            s.persistence = Some(Persistence {
                backend: backend.clone(),
                codec: Codec::json(),
            });
            s
        };

        let first = build();
        first.fetch(key(1), || Ok(vec![1, 2])).unwrap();
        assert_eq!(backend.len(), 1);

        let runs = AtomicUsize::new(0);
        let second = build();
        let restored = second
            .fetch(key(1), || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            })
            .unwrap();
        assert_eq!(*restored, vec![1, 2]);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(11));
        let third = build();
        let fresh = third.fetch(key(1), || Ok(vec![9])).unwrap();
        assert_eq!(*fresh, vec![9]);
    }

    #[test]
    fn invalidation_during_flight_blocks_publish() {
        let state = state::<u32>(CacheConfig::default());
        let value = state
            .fetch(key(1), || {
                state.store.clear();
                Ok(5)
            })
            .unwrap();
        assert_eq!(*value, 5);
        assert!(state.store.is_empty());
    }

    #[test]
    fn invalidating_the_same_key_during_flight_blocks_publish() {
        let state = state::<u32>(CacheConfig::default());
        state
            .fetch(key(2), || {
                state.invalidate_key(&key(2));
                Ok(5)
            })
            .unwrap();
        assert!(!state.store.contains(&key(2)));
    }

    #[test]
    fn invalidating_another_key_during_flight_still_publishes() {
        let state = state::<u32>(CacheConfig::default());
        state.fetch(key(1), || Ok(1)).unwrap();
        let runs = AtomicUsize::new(0);
        let compute = || {
            runs.fetch_add(1, Ordering::SeqCst);
            state.invalidate_key(&key(1));
            Ok(2)
        };

        assert_eq!(*state.fetch(key(2), compute).unwrap(), 2);
        assert!(!state.store.contains(&key(1)));
        assert!(state.store.contains(&key(2)));
        assert_eq!(*state.fetch(key(2), compute).unwrap(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
