//! Stable content fingerprints for cache keys.
//!
//! ## Key Components
//! - [`FingerprintHasher`]: streaming SHA-256 with a nesting depth guard.
//! - [`Fingerprint`]: structural fingerprinting for primitives and containers.
//! - [`TypeTable`]: host-supplied classification for values that cannot be
//!   fingerprinted by content (live handles, streams).
//!
//! Sequences are order-sensitive; maps and sets are fingerprinted by content,
//! independent of iteration order, so a `HashMap` and a `BTreeMap` holding
//! the same pairs produce the same digest.

pub mod classify;
pub mod fingerprint;
pub mod hasher;

pub use classify::{ArgClass, TypeTable};
pub use fingerprint::{Fingerprint, fingerprint};
pub use hasher::{DEFAULT_MAX_DEPTH, Digest, FingerprintHasher};
