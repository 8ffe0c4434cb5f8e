//! Per-key singleflight.
//!
//! ## Architecture
//!
//! ```text
//!   caller A (leader)          flights: Mutex<FxHashMap<CacheKey, Arc<Flight>>>
//!   ─────────────────          ─────────────────────────────────────────────
//!   lock map, no flight  ───►  insert Flight { Running }
//!   unlock, run init()
//!                              caller B (waiter)
//!                              lock map, flight found, unlock
//!                              lock flight state, wait on Condvar
//!   init() returns
//!   on_success(value)          (leader still owns the flight)
//!   remove flight from map
//!   state = Done(result) ───►  wakes, clones the same Arc / error
//!   notify_all
//! ```
//!
//! The flight leaves the map before its outcome is visible, so a failed
//! computation is never shared with callers that arrive afterwards: they
//! start a fresh flight.
//!
//! ## Aborts
//!
//! | Event                         | Leader sees            | Waiters see           |
//! |-------------------------------|------------------------|-----------------------|
//! | `init` returns `Err(e)`       | `e`                    | `e` (clone)           |
//! | `init` panics                 | the panic              | `Cancelled`           |
//! | `init` outlives the timeout   | `TimedOut`, discarded  | `TimedOut`            |
//!
//! A timeout does not interrupt `init`; the leader's result is dropped once
//! it returns late, and waiters stop waiting at the deadline.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::CacheError;
use crate::key::CacheKey;

enum FlightState<T> {
    Running,
    Done(Result<Arc<T>, CacheError>),
}

struct Flight<T> {
    started: Instant,
    state: Mutex<FlightState<T>>,
    done: Condvar,
}

impl<T> Flight<T> {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(FlightState::Running),
            done: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<Arc<T>, CacheError>) {
        *self.state.lock() = FlightState::Done(outcome);
        self.done.notify_all();
    }
}

/// Coalesces concurrent initialisations of the same key.
///
/// ```
/// use std::sync::Arc;
///
/// use memokit::cache::LazyScope;
/// use memokit::key::CacheKey;
///
/// let scope: LazyScope<String> = LazyScope::new();
/// let key = CacheKey::from_bytes([0; 32]);
/// let value = scope
///     .get_or_init(key, || Ok(Arc::new("built".to_string())))
///     .unwrap();
/// assert_eq!(*value, "built");
/// assert_eq!(scope.in_flight(), 0);
/// ```
pub struct LazyScope<T> {
    flights: Mutex<FxHashMap<CacheKey, Arc<Flight<T>>>>,
    timeout: Option<Duration>,
}

impl<T> Default for LazyScope<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LazyScope<T> {
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(FxHashMap::default()),
            timeout: None,
        }
    }

    /// Abandons flights that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Number of keys currently being initialised.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.flights.lock().contains_key(key)
    }

    /// Runs `init` unless another caller is already initialising `key`, in
    /// which case this call blocks and shares that caller's outcome.
    pub fn get_or_init<F>(&self, key: CacheKey, init: F) -> Result<Arc<T>, CacheError>
    where
        F: FnOnce() -> Result<Arc<T>, CacheError>,
    {
        self.get_or_init_then(key, init, |_| {})
    }

    /// Like [`get_or_init`](Self::get_or_init); `on_success` runs in the
    /// leader after a successful, in-time `init` and before any waiter is
    /// released.
    pub fn get_or_init_then<F, P>(
        &self,
        key: CacheKey,
        init: F,
        on_success: P,
    ) -> Result<Arc<T>, CacheError>
    where
        F: FnOnce() -> Result<Arc<T>, CacheError>,
        P: FnOnce(&Arc<T>),
    {
        let flight = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                Some(flight) => Some(Arc::clone(flight)),
                None => {
                    flights.insert(key, Arc::new(Flight::new()));
                    None
                },
            }
        };

        match flight {
            Some(flight) => self.wait(key, &flight),
            None => self.lead(key, init, on_success),
        }
    }

    fn lead<F, P>(&self, key: CacheKey, init: F, on_success: P) -> Result<Arc<T>, CacheError>
    where
        F: FnOnce() -> Result<Arc<T>, CacheError>,
        P: FnOnce(&Arc<T>),
    {
        let mut guard = LeaderGuard {
            scope: self,
            key,
            armed: true,
        };

        let started = Instant::now();
        let mut outcome = init();
        if let Some(timeout) = self.timeout {
            if outcome.is_ok() && started.elapsed() > timeout {
                debug!(key = %key, ?timeout, "discarding late result");
                outcome = Err(CacheError::TimedOut { key, timeout });
            }
        }
        if let Ok(value) = &outcome {
            on_success(value);
        }

        guard.armed = false;
        if let Some(flight) = self.take_flight(&key) {
            flight.finish(outcome.clone());
        }
        outcome
    }

    fn wait(&self, key: CacheKey, flight: &Flight<T>) -> Result<Arc<T>, CacheError> {
        let deadline = self.timeout.map(|t| (t, flight.started + t));
        let mut state = flight.state.lock();
        loop {
            if let FlightState::Done(outcome) = &*state {
                return outcome.clone();
            }
            match deadline {
                Some((timeout, at)) => {
                    if flight.done.wait_until(&mut state, at).timed_out() {
                        if let FlightState::Done(outcome) = &*state {
                            return outcome.clone();
                        }
                        return Err(CacheError::TimedOut { key, timeout });
                    }
                },
                None => flight.done.wait(&mut state),
            }
        }
    }

    fn take_flight(&self, key: &CacheKey) -> Option<Arc<Flight<T>>> {
        self.flights.lock().remove(key)
    }
}

impl<T> fmt::Debug for LazyScope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyScope")
            .field("in_flight", &self.in_flight())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Releases waiters with `Cancelled` if the leader unwinds.
struct LeaderGuard<'a, T> {
    scope: &'a LazyScope<T>,
    key: CacheKey,
    armed: bool,
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(key = %self.key, "leader unwound, cancelling waiters");
        if let Some(flight) = self.scope.take_flight(&self.key) {
            flight.finish(Err(CacheError::Cancelled { key: self.key }));
        }
    }
}
