//! Streaming digest used by every fingerprint.
//!
//! ## Architecture
//!
//! ```text
//!   value.fingerprint(&mut hasher)
//!        │
//!        ├── write_tag("seq") / write_len(n)      type tag + length prefix
//!        ├── nested(|h| ...)                      depth + 1, guarded
//!        │      └── sub_digest(elem)              child hasher (unordered containers)
//!        ▼
//!   Sha256 ──finish()──► Digest([u8; 32])
//! ```
//!
//! Every write is length-prefixed or fixed-width, so adjacent values cannot
//! run together (`("ab", "c")` and `("a", "bc")` produce different digests).

use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::error::UnhashableError;
use crate::hash::fingerprint::Fingerprint;

/// Default nesting limit for container fingerprints.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Fixed-width content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Wraps raw digest bytes.
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the output of [`to_hex`](Self::to_hex).
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 bytes are enough to tell digests apart in logs.
        write!(f, "Digest({}…)", hex::encode(&self.0[..8]))
    }
}

/// Streaming fingerprint state.
#[derive(Clone)]
pub struct FingerprintHasher {
    sha: Sha256,
    depth: usize,
    max_depth: usize,
}

impl FingerprintHasher {
    /// Creates a hasher with [`DEFAULT_MAX_DEPTH`].
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    /// Creates a hasher that rejects values nested deeper than `max_depth`.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            sha: Sha256::new(),
            depth: 0,
            max_depth,
        }
    }

    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Writes a type tag. Tags keep values of different shapes apart.
    #[inline]
    pub fn write_tag(&mut self, tag: &str) {
        self.write_bytes(tag.as_bytes());
    }

    /// Writes a length-prefixed byte string.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.sha.update(bytes);
    }

    /// Writes fixed-width bytes without a length prefix.
    #[inline]
    pub fn write_fixed(&mut self, bytes: &[u8]) {
        self.sha.update(bytes);
    }

    #[inline]
    pub fn write_len(&mut self, len: usize) {
        self.write_u64(len as u64);
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.sha.update([value]);
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.sha.update(value.to_le_bytes());
    }

    #[inline]
    pub fn write_digest(&mut self, digest: &Digest) {
        self.sha.update(digest.0);
    }

    /// Runs `f` one nesting level deeper.
    ///
    /// Containers wrap their element writes in `nested` so that pathological
    /// nesting fails with [`UnhashableError::TooDeep`] instead of recursing
    /// without bound.
    pub fn nested<F>(&mut self, f: F) -> Result<(), UnhashableError>
    where
        F: FnOnce(&mut Self) -> Result<(), UnhashableError>,
    {
        if self.depth >= self.max_depth {
            return Err(UnhashableError::TooDeep {
                max_depth: self.max_depth,
            });
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// Fingerprints `value` with a fresh child hasher at the current depth.
    ///
    /// Used by unordered containers: element digests are sorted before being
    /// fed to the parent.
    pub fn sub_digest<T>(&self, value: &T) -> Result<Digest, UnhashableError>
    where
        T: Fingerprint + ?Sized,
    {
        let mut child = Self {
            sha: Sha256::new(),
            depth: self.depth,
            max_depth: self.max_depth,
        };
        value.fingerprint(&mut child)?;
        Ok(child.finish())
    }

    /// Writes a set of digests independent of their order.
    pub fn write_unordered(&mut self, mut digests: Vec<Digest>) {
        digests.sort_unstable();
        self.write_len(digests.len());
        for digest in &digests {
            self.write_digest(digest);
        }
    }

    /// Consumes the hasher and returns the digest.
    pub fn finish(self) -> Digest {
        Digest(self.sha.finalize().into())
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FingerprintHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintHasher")
            .field("depth", &self.depth)
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}
