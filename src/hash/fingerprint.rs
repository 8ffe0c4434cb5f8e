//! Structural fingerprints for primitives and std containers.
//!
//! | Shape                         | Rule                                         |
//! |-------------------------------|----------------------------------------------|
//! | integers, `bool`, `char`      | type tag + little-endian bytes               |
//! | `f32` / `f64`                 | `-0.0 == 0.0`; every NaN fingerprints alike  |
//! | `str`, `String`, `Cow<str>`   | same tag, so borrowed and owned agree        |
//! | slices, `Vec`, arrays, deques | order-sensitive                              |
//! | maps, sets                    | order-insensitive over content               |
//! | tuples                        | order-sensitive, arity included              |
//!
//! Types that hold live resources should not implement [`Fingerprint`];
//! pass them as opaque arguments and classify their type in a
//! [`TypeTable`](crate::hash::TypeTable) instead.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::error::UnhashableError;
use crate::hash::hasher::{Digest, FingerprintHasher};

/// A value with a stable content fingerprint.
///
/// Object safe, so call arguments can be held as `&dyn Fingerprint`.
///
/// # Example
///
/// ```
/// use memokit::error::UnhashableError;
/// use memokit::hash::{Fingerprint, FingerprintHasher, fingerprint};
///
/// struct Query {
///     table: String,
///     limit: u32,
/// }
///
/// impl Fingerprint for Query {
///     fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
///         h.write_tag("Query");
///         self.table.fingerprint(h)?;
///         self.limit.fingerprint(h)
///     }
/// }
///
/// let a = fingerprint(&Query { table: "loans".into(), limit: 10 }).unwrap();
/// let b = fingerprint(&Query { table: "loans".into(), limit: 10 }).unwrap();
/// assert_eq!(a, b);
/// ```
pub trait Fingerprint {
    /// Feeds this value's content into `hasher`.
    fn fingerprint(&self, hasher: &mut FingerprintHasher) -> Result<(), UnhashableError>;
}

/// Fingerprints a single value with default limits.
pub fn fingerprint<T>(value: &T) -> Result<Digest, UnhashableError>
where
    T: Fingerprint + ?Sized,
{
    let mut hasher = FingerprintHasher::new();
    value.fingerprint(&mut hasher)?;
    Ok(hasher.finish())
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

macro_rules! fingerprint_int {
    ($($t:ty),*) => {
        $(
            impl Fingerprint for $t {
                #[inline]
                fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
                    h.write_tag(stringify!($t));
                    h.write_fixed(&self.to_le_bytes());
                    Ok(())
                }
            }
        )*
    };
}

fingerprint_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl Fingerprint for usize {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("usize");
        h.write_u64(*self as u64);
        Ok(())
    }
}

impl Fingerprint for isize {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("isize");
        h.write_fixed(&(*self as i64).to_le_bytes());
        Ok(())
    }
}

impl Fingerprint for bool {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("bool");
        h.write_u8(u8::from(*self));
        Ok(())
    }
}

impl Fingerprint for char {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("char");
        h.write_fixed(&u32::from(*self).to_le_bytes());
        Ok(())
    }
}

impl Fingerprint for f64 {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        let canonical = if *self == 0.0 {
            0.0f64
        } else if self.is_nan() {
            f64::NAN
        } else {
            *self
        };
        h.write_tag("f64");
        h.write_fixed(&canonical.to_bits().to_le_bytes());
        Ok(())
    }
}

impl Fingerprint for f32 {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        let canonical = if *self == 0.0 {
            0.0f32
        } else if self.is_nan() {
            f32::NAN
        } else {
            *self
        };
        h.write_tag("f32");
        h.write_fixed(&canonical.to_bits().to_le_bytes());
        Ok(())
    }
}

impl Fingerprint for () {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("unit");
        Ok(())
    }
}

impl Fingerprint for str {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("str");
        h.write_bytes(self.as_bytes());
        Ok(())
    }
}

impl Fingerprint for String {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        self.as_str().fingerprint(h)
    }
}

impl Fingerprint for Cow<'_, str> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        self.as_ref().fingerprint(h)
    }
}

impl Fingerprint for Path {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("path");
        h.write_bytes(self.as_os_str().as_encoded_bytes());
        Ok(())
    }
}

impl Fingerprint for PathBuf {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        self.as_path().fingerprint(h)
    }
}

impl Fingerprint for Duration {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("duration");
        h.write_u64(self.as_secs());
        h.write_fixed(&self.subsec_nanos().to_le_bytes());
        Ok(())
    }
}

impl Fingerprint for Digest {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("digest");
        h.write_digest(self);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pointers
// ---------------------------------------------------------------------------

impl<T: Fingerprint + ?Sized> Fingerprint for &T {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        (**self).fingerprint(h)
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for Box<T> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        (**self).fingerprint(h)
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for Arc<T> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        (**self).fingerprint(h)
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for Rc<T> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        (**self).fingerprint(h)
    }
}

// ---------------------------------------------------------------------------
// Sequences (order-sensitive)
// ---------------------------------------------------------------------------

fn fingerprint_seq<'a, T, I>(
    h: &mut FingerprintHasher,
    len: usize,
    items: I,
) -> Result<(), UnhashableError>
where
    T: Fingerprint + 'a,
    I: IntoIterator<Item = &'a T>,
{
    h.write_tag("seq");
    h.write_len(len);
    h.nested(|h| {
        for item in items {
            item.fingerprint(h)?;
        }
        Ok(())
    })
}

impl<T: Fingerprint> Fingerprint for [T] {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        fingerprint_seq(h, self.len(), self)
    }
}

impl<T: Fingerprint, const N: usize> Fingerprint for [T; N] {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        fingerprint_seq(h, N, self)
    }
}

impl<T: Fingerprint> Fingerprint for Vec<T> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        fingerprint_seq(h, self.len(), self)
    }
}

impl<T: Fingerprint> Fingerprint for VecDeque<T> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        fingerprint_seq(h, self.len(), self)
    }
}

impl<T: Fingerprint> Fingerprint for Option<T> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("option");
        match self {
            None => {
                h.write_u8(0);
                Ok(())
            },
            Some(value) => {
                h.write_u8(1);
                h.nested(|h| value.fingerprint(h))
            },
        }
    }
}

impl<T: Fingerprint, E: Fingerprint> Fingerprint for Result<T, E> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("result");
        match self {
            Ok(value) => {
                h.write_u8(0);
                h.nested(|h| value.fingerprint(h))
            },
            Err(err) => {
                h.write_u8(1);
                h.nested(|h| err.fingerprint(h))
            },
        }
    }
}

macro_rules! fingerprint_tuple {
    ($len:expr => $($name:ident),+) => {
        impl<$($name: Fingerprint),+> Fingerprint for ($($name,)+) {
            #[allow(non_snake_case)]
            fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
                let ($($name,)+) = self;
                h.write_tag("tuple");
                h.write_len($len);
                h.nested(|h| {
                    $($name.fingerprint(h)?;)+
                    Ok(())
                })
            }
        }
    };
}

fingerprint_tuple!(1 => A);
fingerprint_tuple!(2 => A, B);
fingerprint_tuple!(3 => A, B, C);
fingerprint_tuple!(4 => A, B, C, D);
fingerprint_tuple!(5 => A, B, C, D, E);
fingerprint_tuple!(6 => A, B, C, D, E, F);
fingerprint_tuple!(7 => A, B, C, D, E, F, G);
fingerprint_tuple!(8 => A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// Maps and sets (order-insensitive)
// ---------------------------------------------------------------------------

fn fingerprint_map<'a, K, V, I>(h: &mut FingerprintHasher, entries: I) -> Result<(), UnhashableError>
where
    K: Fingerprint + ?Sized + 'a,
    V: Fingerprint + ?Sized + 'a,
    I: IntoIterator<Item = (&'a K, &'a V)>,
{
    h.write_tag("map");
    h.nested(|h| {
        let digests = entries
            .into_iter()
            .map(|(k, v)| h.sub_digest(&(MapEntry(k, v))))
            .collect::<Result<Vec<_>, _>>()?;
        h.write_unordered(digests);
        Ok(())
    })
}

fn fingerprint_set<'a, T, I>(h: &mut FingerprintHasher, items: I) -> Result<(), UnhashableError>
where
    T: Fingerprint + 'a,
    I: IntoIterator<Item = &'a T>,
{
    h.write_tag("set");
    h.nested(|h| {
        let digests = items
            .into_iter()
            .map(|item| h.sub_digest(item))
            .collect::<Result<Vec<_>, _>>()?;
        h.write_unordered(digests);
        Ok(())
    })
}

struct MapEntry<'a, K: ?Sized, V: ?Sized>(&'a K, &'a V);

impl<K: Fingerprint + ?Sized, V: Fingerprint + ?Sized> Fingerprint for MapEntry<'_, K, V> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        self.0.fingerprint(h)?;
        self.1.fingerprint(h)
    }
}

impl<K: Fingerprint, V: Fingerprint, S> Fingerprint for HashMap<K, V, S> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        fingerprint_map(h, self.iter())
    }
}

impl<K: Fingerprint, V: Fingerprint> Fingerprint for BTreeMap<K, V> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        fingerprint_map(h, self.iter())
    }
}

impl<T: Fingerprint, S> Fingerprint for HashSet<T, S> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        fingerprint_set(h, self.iter())
    }
}

impl<T: Fingerprint> Fingerprint for BTreeSet<T> {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        fingerprint_set(h, self.iter())
    }
}

impl Fingerprint for serde_json::Value {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        use serde_json::Value;

        match self {
            Value::Null => {
                h.write_tag("json.null");
                Ok(())
            },
            Value::Bool(b) => b.fingerprint(h),
            Value::Number(n) => {
                h.write_tag("json.number");
                h.write_bytes(n.to_string().as_bytes());
                Ok(())
            },
            Value::String(s) => s.fingerprint(h),
            Value::Array(items) => items.fingerprint(h),
            Value::Object(map) => fingerprint_map(h, map.iter()),
        }
    }
}
