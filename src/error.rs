//! Error types for the memokit engine.
//!
//! ## Key Components
//!
//! - [`CacheError`]: Returned by every fallible cache call. `Clone`, so a single
//!   failed computation can be delivered to every caller waiting on it.
//! - [`UnhashableError`]: An argument could not be fingerprinted and was not
//!   excluded or identity-tagged. Raised before any computation runs.
//! - [`UncopyableValueError`]: A value cache could not produce an independent
//!   copy of its stored master. Raised on copy-out, never on store.
//! - [`ComputationError`]: The wrapped function failed; carries its error.
//! - [`CapacityConfigError`]: Cache configuration parameters are invalid
//!   (e.g. zero capacity, negative TTL).
//! - [`PersistError`]: A persistence backend failed. Only surfaced from setup
//!   paths; on the call path persistence failures are logged and ignored.
//!
//! ## Example Usage
//!
//! ```
//! use memokit::config::CacheConfig;
//! use memokit::error::CapacityConfigError;
//!
//! // Invalid capacity is caught without panicking
//! let bad: Result<CacheConfig, CapacityConfigError> =
//!     CacheConfig::default().max_entries(0).validate();
//! assert!(bad.is_err());
//! ```

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::key::CacheKey;

/// Boxed error produced by a wrapped function.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// UnhashableError
// ---------------------------------------------------------------------------

/// Error returned when a call argument cannot be fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnhashableError {
    /// An opaque argument whose type has no entry in the type table and whose
    /// parameter is not excluded.
    #[error(
        "argument `{param}` of type `{type_name}` is not hashable; register the type as \
         identity-only or exclude the parameter"
    )]
    Unclassified {
        param: String,
        type_name: &'static str,
    },
    /// Nesting exceeded the hasher's depth guard.
    #[error("value nesting exceeds the fingerprint depth limit of {max_depth}")]
    TooDeep { max_depth: usize },
    /// A `Fingerprint` implementation refused to fingerprint its value.
    #[error("value of type `{type_name}` cannot be fingerprinted: {reason}")]
    Rejected {
        type_name: &'static str,
        reason: String,
    },
}

impl UnhashableError {
    /// Convenience constructor for `Fingerprint` impls that refuse a value.
    pub fn rejected<T: ?Sized>(reason: impl Into<String>) -> Self {
        Self::Rejected {
            type_name: std::any::type_name::<T>(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// UncopyableValueError
// ---------------------------------------------------------------------------

/// Error returned when a value cache cannot hand out an independent copy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value of type `{type_name}` cannot be deep-copied: {reason}")]
pub struct UncopyableValueError {
    type_name: &'static str,
    reason: String,
}

impl UncopyableValueError {
    /// Creates an error naming `T` as the uncopyable type.
    pub fn new<T: ?Sized>(reason: impl Into<String>) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            reason: reason.into(),
        }
    }

    /// Returns the name of the type that could not be copied.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

// ---------------------------------------------------------------------------
// ComputationError
// ---------------------------------------------------------------------------

/// The wrapped function's own failure, shared between all waiters.
#[derive(Clone)]
pub struct ComputationError(Arc<dyn StdError + Send + Sync + 'static>);

impl ComputationError {
    pub fn new(err: BoxError) -> Self {
        Self(Arc::from(err))
    }

    /// Returns the underlying error if it is of type `E`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns the shared underlying error.
    pub fn inner(&self) -> &Arc<dyn StdError + Send + Sync + 'static> {
        &self.0
    }
}

impl fmt::Debug for ComputationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComputationError").field(&self.0).finish()
    }
}

impl fmt::Display for ComputationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for ComputationError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.0)
    }
}

// ---------------------------------------------------------------------------
// CapacityConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Carries a human-readable description of which parameter failed validation.
///
/// # Example
///
/// ```
/// use memokit::config::CacheConfig;
///
/// let err = CacheConfig::default().max_entries(0).validate().unwrap_err();
/// assert!(err.to_string().contains("max_entries"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CapacityConfigError(String);

impl CapacityConfigError {
    /// Creates a new `CapacityConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// PersistError
// ---------------------------------------------------------------------------

/// Error returned by a persistence backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("persisted entry could not be encoded or decoded: {0}")]
    Codec(Arc<serde_json::Error>),
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(Arc::new(err))
    }
}

// ---------------------------------------------------------------------------
// Cancelled
// ---------------------------------------------------------------------------

/// Marker error a wrapped function returns to report that it was cancelled.
///
/// The engine maps it to [`CacheError::Cancelled`] for every waiter instead of
/// treating it as an ordinary computation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, thiserror::Error)]
#[error("computation cancelled")]
pub struct Cancelled;

// ---------------------------------------------------------------------------
// CacheError
// ---------------------------------------------------------------------------

/// Error returned by cache calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Unhashable(#[from] UnhashableError),
    #[error(transparent)]
    Uncopyable(#[from] UncopyableValueError),
    #[error("cached computation failed: {0}")]
    Computation(#[source] ComputationError),
    #[error("invalid cache configuration: {0}")]
    Config(#[from] CapacityConfigError),
    #[error("computation for key {key} was cancelled")]
    Cancelled { key: CacheKey },
    #[error("computation for key {key} exceeded its timeout of {timeout:?}")]
    TimedOut { key: CacheKey, timeout: Duration },
    #[error("gate `{gate}` is closed")]
    GateClosed { gate: String },
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl CacheError {
    /// Wraps a function failure, recognising the [`Cancelled`] marker.
    pub(crate) fn from_computation(key: CacheKey, err: BoxError) -> Self {
        if err.downcast_ref::<Cancelled>().is_some() {
            return Self::Cancelled { key };
        }
        Self::Computation(ComputationError::new(err))
    }

    /// Returns the wrapped function's error if this is a computation failure.
    pub fn computation(&self) -> Option<&ComputationError> {
        match self {
            Self::Computation(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
