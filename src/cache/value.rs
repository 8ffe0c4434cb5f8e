//! Value cache: every caller gets an independent copy.
//!
//! The computed value is stored once as the master. Hits and misses alike
//! return [`DeepCopy::deep_copy`] of the master, so callers may mutate what
//! they receive without affecting the cache or each other. A type that
//! cannot be copied is still stored; the error surfaces on copy-out.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::engine::{CacheState, ComputeFn};
use crate::config::CacheConfig;
use crate::error::{BoxError, CacheError, UncopyableValueError};
use crate::key::{CacheKey, CallInput, FunctionIdentity};
use crate::store::{EntryInfo, StoreMetrics, SweepReport};
use crate::traits::{EntryPredicate, ManagedCache};

// ---------------------------------------------------------------------------
// DeepCopy
// ---------------------------------------------------------------------------

/// Produces a copy that shares no mutable state with the original.
///
/// `Clone` is not enough in general: cloning an `Arc<Mutex<T>>` shares the
/// mutex. Implementations here recurse through containers and re-allocate
/// shared pointers. Register plain owned types with
/// [`impl_deep_copy_via_clone!`](crate::impl_deep_copy_via_clone).
pub trait DeepCopy: Sized {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError>;
}

/// Implements [`DeepCopy`] through `Clone` for types that own all their
/// data.
///
/// ```
/// #[derive(Clone, Debug, PartialEq)]
/// struct Report {
///     rows: Vec<u32>,
/// }
/// memokit::impl_deep_copy_via_clone!(Report);
///
/// use memokit::cache::DeepCopy;
/// let r = Report { rows: vec![1] };
/// assert_eq!(r.deep_copy().unwrap(), r);
/// ```
#[macro_export]
macro_rules! impl_deep_copy_via_clone {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::cache::DeepCopy for $ty {
                #[inline]
                fn deep_copy(&self) -> ::std::result::Result<Self, $crate::error::UncopyableValueError> {
                    ::std::result::Result::Ok(::std::clone::Clone::clone(self))
                }
            }
        )+
    };
}

impl_deep_copy_via_clone!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    PathBuf,
    Duration,
    CacheKey,
    serde_json::Value,
);

impl DeepCopy for Cow<'static, str> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        Ok(Cow::Owned(self.to_string()))
    }
}

impl<T: DeepCopy> DeepCopy for Box<T> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        Ok(Box::new((**self).deep_copy()?))
    }
}

/// A fresh allocation; the copy's `Arc` is not shared with the original.
impl<T: DeepCopy> DeepCopy for Arc<T> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        Ok(Arc::new((**self).deep_copy()?))
    }
}

impl<T: DeepCopy> DeepCopy for Option<T> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        self.as_ref().map(T::deep_copy).transpose()
    }
}

impl<T: DeepCopy, E: DeepCopy> DeepCopy for Result<T, E> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        Ok(match self {
            Ok(v) => Ok(v.deep_copy()?),
            Err(e) => Err(e.deep_copy()?),
        })
    }
}

impl<T: DeepCopy> DeepCopy for Vec<T> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        self.iter().map(T::deep_copy).collect()
    }
}

impl<T: DeepCopy> DeepCopy for VecDeque<T> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        self.iter().map(T::deep_copy).collect()
    }
}

impl<T: DeepCopy, const N: usize> DeepCopy for [T; N] {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        let items: Vec<T> = self.iter().map(T::deep_copy).collect::<Result<_, _>>()?;
        items
            .try_into()
            .map_err(|_| UncopyableValueError::new::<Self>("array length changed during copy"))
    }
}

impl<K, V, S> DeepCopy for HashMap<K, V, S>
where
    K: DeepCopy + Eq + Hash,
    V: DeepCopy,
    S: BuildHasher + Clone,
{
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        let mut out = HashMap::with_capacity_and_hasher(self.len(), self.hasher().clone());
        for (k, v) in self {
            out.insert(k.deep_copy()?, v.deep_copy()?);
        }
        Ok(out)
    }
}

impl<K: DeepCopy + Ord, V: DeepCopy> DeepCopy for BTreeMap<K, V> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        self.iter()
            .map(|(k, v)| Ok((k.deep_copy()?, v.deep_copy()?)))
            .collect()
    }
}

impl<T, S> DeepCopy for HashSet<T, S>
where
    T: DeepCopy + Eq + Hash,
    S: BuildHasher + Clone,
{
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        let mut out = HashSet::with_capacity_and_hasher(self.len(), self.hasher().clone());
        for item in self {
            out.insert(item.deep_copy()?);
        }
        Ok(out)
    }
}

impl<T: DeepCopy + Ord> DeepCopy for BTreeSet<T> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        self.iter().map(T::deep_copy).collect()
    }
}

macro_rules! deep_copy_tuple {
    ($($idx:tt : $name:ident),+) => {
        impl<$($name: DeepCopy),+> DeepCopy for ($($name,)+) {
            fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
                Ok(($(self.$idx.deep_copy()?,)+))
            }
        }
    };
}

deep_copy_tuple!(0: A);
deep_copy_tuple!(0: A, 1: B);
deep_copy_tuple!(0: A, 1: B, 2: C);
deep_copy_tuple!(0: A, 1: B, 2: C, 3: D);
deep_copy_tuple!(0: A, 1: B, 2: C, 3: D, 4: E);
deep_copy_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F);

/// Wrapper marking a value that must never be copied.
///
/// Storing it in a [`ValueCache`] works; every read fails with
/// [`UncopyableValueError`]. Use a resource cache for such values instead.
#[derive(Debug, Default)]
pub struct Uncopyable<T>(pub T);

impl<T> Deref for Uncopyable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Uncopyable<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> DeepCopy for Uncopyable<T> {
    fn deep_copy(&self) -> Result<Self, UncopyableValueError> {
        Err(UncopyableValueError::new::<T>(
            "marked uncopyable; cache it as a resource instead",
        ))
    }
}

// ---------------------------------------------------------------------------
// ValueCache
// ---------------------------------------------------------------------------

/// A memoized function whose callers receive independent copies.
///
/// Built with [`ValueCacheBuilder`](crate::builder::ValueCacheBuilder).
///
/// ```
/// use memokit::builder::CacheBuilder;
/// use memokit::config::CacheConfig;
///
/// let cache = CacheBuilder::value("double")
///     .config(CacheConfig::default().max_entries(2))
///     .build_infallible(|x: &(u64,)| vec![x.0 * 2])
///     .unwrap();
///
/// let mut first = cache.call(&(21,)).unwrap();
/// first.push(0);
/// assert_eq!(cache.call(&(21,)).unwrap(), vec![42]);
/// ```
pub struct ValueCache<A, V> {
    state: Arc<CacheState<V>>,
    func: ComputeFn<A, V>,
}

impl<A, V> Clone for ValueCache<A, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            func: Arc::clone(&self.func),
        }
    }
}

impl<A, V> ValueCache<A, V>
where
    A: CallInput,
    V: DeepCopy + Send + Sync + 'static,
{
    pub(crate) fn from_parts(state: Arc<CacheState<V>>, func: ComputeFn<A, V>) -> Self {
        Self { state, func }
    }

    /// Calls the wrapped function through the cache.
    pub fn call(&self, args: &A) -> Result<V, CacheError> {
        let key = self.state.key_for(args)?;
        let master = self.state.fetch(key, || (self.func)(args))?;
        Ok(V::deep_copy(&master)?)
    }

    /// Looks up `key`, running `compute` on a miss.
    pub fn get_or_compute<F, E>(&self, key: CacheKey, compute: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Result<V, E>,
        E: Into<BoxError>,
    {
        let master = self.state.fetch(key, || compute().map_err(Into::into))?;
        Ok(V::deep_copy(&master)?)
    }

    /// The key `args` map to.
    pub fn key(&self, args: &A) -> Result<CacheKey, CacheError> {
        self.state.key_for(args)
    }

    /// Whether a live entry exists for `args`. Does not count as a use.
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
        F: Fn(&EntryInfo, &dyn crate::secrets::SecretStore) -> bool + Send + Sync,
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

    /// Snapshot of resident entries, most recently used first.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.state.store.infos()
    }
}

impl<A, V> ManagedCache for ValueCache<A, V>
where
    V: Send + Sync + 'static,
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

impl<A, V> fmt::Debug for ValueCache<A, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCache")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
