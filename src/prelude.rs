pub use crate::builder::{CacheBuilder, ResourceCacheBuilder, ValueCacheBuilder};
pub use crate::cache::{DeepCopy, ProgressEvent, ResourceCache, Uncopyable, ValueCache};
pub use crate::config::{CacheConfig, EvictionPolicy, PersistMode, RegistryConfig};
pub use crate::error::{CacheError, ComputationError, UnhashableError, UncopyableValueError};
pub use crate::hash::{Fingerprint, FingerprintHasher, TypeTable};
pub use crate::key::{CacheKey, CallArgs, CallInput, FunctionIdentity, KeyDeriver};
pub use crate::registry::CacheRegistry;
pub use crate::secrets::{ConditionalGate, EnvSecretStore, MapSecretStore, SecretStore, TomlSecretStore};
pub use crate::store::{DiskBackend, EntryInfo, MemoryBackend, PersistBackend, StoreMetrics};
pub use crate::traits::ManagedCache;
