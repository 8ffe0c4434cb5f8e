//! memokit: memoization and shared-resource caching.
//!
//! A function wrapped by a [`ValueCache`](cache::ValueCache) or
//! [`ResourceCache`](cache::ResourceCache) runs at most once per distinct
//! argument set while its result stays cached. Keys are SHA-256
//! fingerprints of the function identity and its arguments, so they are
//! stable across processes and usable as persistence file names.
//!
//! ```text
//!   call(args)
//!     │
//!     ▼
//!   KeyDeriver ──► CacheKey ──► gate? ──► EntryStore (LRU + TTL) ── hit ──► copy / Arc
//!                                              │
//!                                             miss
//!                                              ▼
//!                                  LazyScope (one flight per key)
//!                                              │
//!                                   persisted copy? else compute
//!                                              ▼
//!                                  publish to store and backend
//! ```
//!
//! | Module       | Responsibility                                             |
//! |--------------|------------------------------------------------------------|
//! | [`hash`]     | canonical fingerprints and argument classification         |
//! | [`key`]      | function identity, call description, key derivation        |
//! | [`store`]    | entry store, clocks, metrics, persistence backends         |
//! | [`cache`]    | value and resource caches, singleflight, invalidation      |
//! | [`secrets`]  | secret stores and conditional gates                        |
//! | [`builder`]  | wrapping functions into caches                             |
//! | [`registry`] | explicit cache registry with init and shutdown             |
//! | [`config`]   | programmatic and TOML configuration                        |
//!
//! ## Example
//!
//! ```rust
//! use memokit::prelude::*;
//!
//! let registry = CacheRegistry::init(RegistryConfig::default()).unwrap();
//! let double = registry
//!     .value_cache("double")
//!     .config(CacheConfig::default().max_entries(2))
//!     .build_infallible(|x: &(i64,)| x.0 * 2)
//!     .unwrap();
//!
//! assert_eq!(double.call(&(3,)).unwrap(), 6);
//! assert_eq!(double.call(&(3,)).unwrap(), 6);
//! assert_eq!(double.metrics().hits, 1);
//! registry.shutdown();
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod ds;
pub mod error;
pub mod hash;
pub mod key;
pub mod prelude;
pub mod registry;
pub mod secrets;
pub mod store;
pub mod traits;
