//! Cache key derivation.
//!
//! ## Architecture
//!
//! ```text
//!   FunctionIdentity ──┐
//!                      │
//!   CallArgs           │        KeyDeriver::derive
//!   ├── positional ────┼──►  ┌──────────────────────────────┐
//!   │   (ordered)      │     │ "memokit.key.v1"             │
//!   └── options ───────┘     │ identity digest              │──► CacheKey
//!       (sorted by name)     │ per-param: arg | identity |  │
//!                            │            excluded          │
//!                            │ options: (name, digest)*     │
//!                            └──────────────────────────────┘
//! ```
//!
//! Two calls produce the same key iff the function identity, the positional
//! argument contents (in order) and the option contents (by name) agree.
//! Distinct functions never share keys because the identity digest is the
//! first thing hashed. Editing a function body changes its identity, which
//! orphans its old entries; those age out through TTL or capacity eviction.

use std::any::{TypeId, type_name};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::error::UnhashableError;
use crate::hash::{ArgClass, DEFAULT_MAX_DEPTH, Digest, Fingerprint, FingerprintHasher, TypeTable};

const KEY_FORMAT: &str = "memokit.key.v1";

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Opaque, immutable cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Digest);

impl CacheKey {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Digest::from_bytes(bytes))
    }

    #[inline]
    pub fn digest(&self) -> &Digest {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        Digest::from_hex(s).map(Self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.0.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// FunctionIdentity
// ---------------------------------------------------------------------------

/// Fingerprint of a callable's behaviour-defining content.
///
/// Prefer [`fn_identity!`](crate::fn_identity), which hashes the full
/// function definition so that any edit to the body yields a new identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FunctionIdentity {
    name: Cow<'static, str>,
    digest: Digest,
}

impl FunctionIdentity {
    /// Identity derived from a function's name and source text.
    pub fn from_source(name: impl Into<Cow<'static, str>>, source: &str) -> Self {
        let name = name.into();
        let mut h = FingerprintHasher::new();
        h.write_tag("fn.source");
        h.write_bytes(name.as_bytes());
        h.write_bytes(source.as_bytes());
        Self {
            digest: h.finish(),
            name,
        }
    }

    /// Identity from a name and a host-maintained version string.
    ///
    /// For callables whose source is not available (closures built at
    /// runtime, trait objects); bump `version` whenever behaviour changes.
    pub fn versioned(name: impl Into<Cow<'static, str>>, version: &str) -> Self {
        let name = name.into();
        let mut h = FingerprintHasher::new();
        h.write_tag("fn.version");
        h.write_bytes(name.as_bytes());
        h.write_bytes(version.as_bytes());
        Self {
            digest: h.finish(),
            name,
        }
    }

    /// Identity from the Rust type name of `F`.
    ///
    /// Used when a builder is given no identity. Type names are stable within
    /// a build but do not change when a closure body is edited.
    pub fn of_type<F: ?Sized>() -> Self {
        Self::versioned(type_name::<F>(), "")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl fmt::Debug for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionIdentity")
            .field("name", &self.name)
            .field("digest", &self.digest)
            .finish()
    }
}

impl Fingerprint for FunctionIdentity {
    fn fingerprint(&self, h: &mut FingerprintHasher) -> Result<(), UnhashableError> {
        h.write_tag("fn.identity");
        h.write_digest(&self.digest);
        Ok(())
    }
}

/// Defines a function and returns `(FunctionIdentity, function)`.
///
/// The identity digests the stringified definition, signature and body
/// included, so editing the function invalidates its cached entries.
///
/// ```
/// let (identity, double) = memokit::fn_identity!(
///     fn double(x: &(u64,)) -> u64 {
///         x.0 * 2
///     }
/// );
/// assert_eq!(identity.name(), "double");
/// assert_eq!(double(&(21,)), 42);
///
/// let (edited, _) = memokit::fn_identity!(
///     fn double(x: &(u64,)) -> u64 {
///         x.0 + x.0
///     }
/// );
/// assert_ne!(identity, edited);
/// ```
#[macro_export]
macro_rules! fn_identity {
    ($(#[$meta:meta])* fn $name:ident $($rest:tt)*) => {{
        $(#[$meta])*
        fn $name $($rest)*

        (
            $crate::key::FunctionIdentity::from_source(
                stringify!($name),
                stringify!($(#[$meta])* fn $name $($rest)*),
            ),
            $name,
        )
    }};
}

// ---------------------------------------------------------------------------
// CallArgs / CallInput
// ---------------------------------------------------------------------------

enum ParamValue<'a> {
    Content(&'a dyn Fingerprint),
    Opaque {
        type_id: TypeId,
        type_name: &'static str,
    },
    Tagged(Cow<'a, str>),
}

struct Param<'a> {
    name: &'a str,
    value: ParamValue<'a>,
}

/// Description of one call's arguments, borrowed from the caller.
#[derive(Default)]
pub struct CallArgs<'a> {
    params: Vec<Param<'a>>,
    options: Vec<(&'a str, &'a dyn Fingerprint)>,
}

impl<'a> CallArgs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a positional argument fingerprinted by content.
    pub fn arg(&mut self, name: &'a str, value: &'a dyn Fingerprint) -> &mut Self {
        self.params.push(Param {
            name,
            value: ParamValue::Content(value),
        });
        self
    }

    /// Adds a positional argument that cannot be fingerprinted.
    ///
    /// Its type must be classified in the deriver's [`TypeTable`] or its
    /// parameter name excluded, otherwise derivation fails.
    pub fn opaque<T: 'static>(&mut self, name: &'a str, _value: &'a T) -> &mut Self {
        self.params.push(Param {
            name,
            value: ParamValue::Opaque {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
            },
        });
        self
    }

    /// Adds a positional argument identified only by a caller-declared tag.
    pub fn identity(&mut self, name: &'a str, tag: impl Into<Cow<'a, str>>) -> &mut Self {
        self.params.push(Param {
            name,
            value: ParamValue::Tagged(tag.into()),
        });
        self
    }

    /// Adds a named option. Options are keyed by name; their order of
    /// declaration does not affect the key. A repeated name keeps the last
    /// value.
    pub fn option(&mut self, name: &'a str, value: &'a dyn Fingerprint) -> &mut Self {
        self.options.push((name, value));
        self
    }

    /// Number of positional parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.options.is_empty()
    }

    /// Positional parameter names, in order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.params.iter().map(|p| p.name)
    }
}

impl fmt::Debug for CallArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArgs")
            .field("params", &self.params.iter().map(|p| p.name).collect::<Vec<_>>())
            .field(
                "options",
                &self.options.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Typed input of a cached function.
///
/// Implemented for `()` and tuples of [`Fingerprint`] values (positional
/// names `"0"`, `"1"`, ...). Implement it for argument structs that carry
/// named, opaque or excluded parameters.
///
/// A parameter whose name starts with `_` never reaches the key, so a
/// connection handle can ride along without being hashable:
///
/// ```
/// use memokit::key::{CallArgs, CallInput, FunctionIdentity, KeyDeriver};
///
/// struct Conn {
///     session: u32,
/// }
///
/// struct LoadLoans<'c> {
///     lender: String,
///     conn: &'c Conn,
/// }
///
/// impl CallInput for LoadLoans<'_> {
///     fn describe<'a>(&'a self, args: &mut CallArgs<'a>) {
///         args.arg("lender", &self.lender).opaque("_conn", self.conn);
///     }
/// }
///
/// let deriver = KeyDeriver::new();
/// let identity = FunctionIdentity::versioned("load_loans", "1");
/// let (primary, replica) = (Conn { session: 1 }, Conn { session: 2 });
/// let on_primary = LoadLoans { lender: "acme".into(), conn: &primary };
/// let on_replica = LoadLoans { lender: "acme".into(), conn: &replica };
///
/// let a = deriver.derive_input(&identity, &on_primary).unwrap();
/// let b = deriver.derive_input(&identity, &on_replica).unwrap();
/// assert_eq!(a, b);
/// assert_ne!(on_primary.conn.session, on_replica.conn.session);
/// ```
pub trait CallInput {
    fn describe<'a>(&'a self, args: &mut CallArgs<'a>);
}

impl CallInput for () {
    fn describe<'a>(&'a self, _args: &mut CallArgs<'a>) {}
}

macro_rules! call_input_tuple {
    ($($idx:tt : $name:ident),+) => {
        impl<$($name: Fingerprint),+> CallInput for ($($name,)+) {
            fn describe<'a>(&'a self, args: &mut CallArgs<'a>) {
                $(args.arg(stringify!($idx), &self.$idx);)+
            }
        }
    };
}

call_input_tuple!(0: A);
call_input_tuple!(0: A, 1: B);
call_input_tuple!(0: A, 1: B, 2: C);
call_input_tuple!(0: A, 1: B, 2: C, 3: D);
call_input_tuple!(0: A, 1: B, 2: C, 3: D, 4: E);
call_input_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F);
call_input_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F, 6: G);
call_input_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F, 6: G, 7: H);

// ---------------------------------------------------------------------------
// KeyDeriver
// ---------------------------------------------------------------------------

/// Combines function identity, arguments and options into a [`CacheKey`].
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    exclusions: FxHashSet<String>,
    type_table: Arc<TypeTable>,
    max_depth: usize,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self {
            exclusions: FxHashSet::default(),
            type_table: Arc::new(TypeTable::new()),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_type_table(mut self, table: Arc<TypeTable>) -> Self {
        self.type_table = table;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Excludes the parameter (or option) called `name` from the key.
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclusions.insert(name.into());
        self
    }

    /// Names with a leading underscore are always excluded.
    pub fn is_excluded(&self, name: &str) -> bool {
        name.starts_with('_') || self.exclusions.contains(name)
    }

    pub fn type_table(&self) -> &TypeTable {
        &self.type_table
    }

    /// Derives the key for a typed input.
    pub fn derive_input<A>(
        &self,
        identity: &FunctionIdentity,
        input: &A,
    ) -> Result<CacheKey, UnhashableError>
    where
        A: CallInput + ?Sized,
    {
        let mut args = CallArgs::new();
        input.describe(&mut args);
        self.derive(identity, &args)
    }

    /// Derives the key for described arguments.
    pub fn derive(
        &self,
        identity: &FunctionIdentity,
        args: &CallArgs<'_>,
    ) -> Result<CacheKey, UnhashableError> {
        let mut h = FingerprintHasher::with_max_depth(self.max_depth);
        h.write_tag(KEY_FORMAT);
        h.write_digest(identity.digest());

        h.write_len(args.params.len());
        for param in &args.params {
            if self.is_excluded(param.name) {
                h.write_tag("excluded");
                continue;
            }
            match &param.value {
                ParamValue::Content(value) => {
                    let digest = h.sub_digest(*value)?;
                    h.write_tag("arg");
                    h.write_digest(&digest);
                },
                ParamValue::Tagged(tag) => {
                    h.write_tag("identity");
                    h.write_tag(tag);
                },
                ParamValue::Opaque { type_id, type_name } => {
                    match self.type_table.classify(*type_id) {
                        Some(ArgClass::IdentityOnly { tag }) => {
                            h.write_tag("identity");
                            h.write_tag(tag);
                        },
                        Some(ArgClass::Excluded) => h.write_tag("excluded"),
                        Some(ArgClass::Hashable) | None => {
                            return Err(UnhashableError::Unclassified {
                                param: param.name.to_string(),
                                type_name: *type_name,
                            });
                        },
                    }
                },
            }
        }

        let mut options = BTreeMap::new();
        for (name, value) in &args.options {
            if self.is_excluded(name) {
                continue;
            }
            options.insert(*name, h.sub_digest(*value)?);
        }
        h.write_len(options.len());
        for (name, digest) in &options {
            h.write_tag(name);
            h.write_digest(digest);
        }

        Ok(CacheKey(h.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &'static str) -> FunctionIdentity {
        FunctionIdentity::from_source(name, "body")
    }

    struct Conn;

    mod identity {
        use super::*;

        #[test]
        fn distinct_functions_never_collide() {
            let deriver = KeyDeriver::new();
            let a = deriver.derive_input(&ident("a"), &(1u64,)).unwrap();
            let b = deriver.derive_input(&ident("b"), &(1u64,)).unwrap();
            assert_ne!(a, b);
        }

        #[test]
        fn edited_body_changes_key() {
            let deriver = KeyDeriver::new();
            let v1 = FunctionIdentity::from_source("f", "x * 2");
            let v2 = FunctionIdentity::from_source("f", "x + x");
            assert_ne!(
                deriver.derive_input(&v1, &(3u64,)).unwrap(),
                deriver.derive_input(&v2, &(3u64,)).unwrap()
            );
        }

        #[test]
        fn versioned_and_source_identities_differ() {
            assert_ne!(
                FunctionIdentity::versioned("f", "1"),
                FunctionIdentity::from_source("f", "1")
            );
            assert_eq!(
                FunctionIdentity::versioned("f", "1"),
                FunctionIdentity::versioned("f", "1")
            );
        }

        #[test]
        fn macro_identity_tracks_definition() {
            let (a, f) = crate::fn_identity!(
                fn triple(x: &(u32,)) -> u32 {
                    x.0 * 3
                }
            );
            let (b, _) = crate::fn_identity!(
                fn triple(x: &(u32,)) -> u32 {
                    x.0 * 3
                }
            );
            let (c, _) = crate::fn_identity!(
                fn triple(x: &(u32,)) -> u32 {
                    x.0 + x.0 + x.0
                }
            );
            assert_eq!(f(&(2,)), 6);
            assert_eq!(a, b);
            assert_ne!(a, c);
        }
    }

    mod arguments {
        use super::*;

        #[test]
        fn positional_order_matters() {
            let deriver = KeyDeriver::new();
            let id = ident("f");
            assert_ne!(
                deriver.derive_input(&id, &(1u8, 2u8)).unwrap(),
                deriver.derive_input(&id, &(2u8, 1u8)).unwrap()
            );
        }

        #[test]
        fn equal_content_equal_key() {
            let deriver = KeyDeriver::new();
            let id = ident("f");
            let a = deriver
                .derive_input(&id, &(String::from("loans"), vec![1, 2]))
                .unwrap();
            let b = deriver
                .derive_input(&id, &(String::from("loans"), vec![1, 2]))
                .unwrap();
            assert_eq!(a, b);
        }

        #[test]
        fn options_are_order_insensitive() {
            let deriver = KeyDeriver::new();
            let id = ident("f");
            let (sep, na) = (",", "None");

            let mut first = CallArgs::new();
            first.option("sep", &sep).option("fillna", &na);
            let mut second = CallArgs::new();
            second.option("fillna", &na).option("sep", &sep);

            assert_eq!(
                deriver.derive(&id, &first).unwrap(),
                deriver.derive(&id, &second).unwrap()
            );
        }

        #[test]
        fn option_values_matter() {
            let deriver = KeyDeriver::new();
            let id = ident("f");
            let (comma, tab) = (",", "\t");

            let mut a = CallArgs::new();
            a.option("sep", &comma);
            let mut b = CallArgs::new();
            b.option("sep", &tab);

            assert_ne!(
                deriver.derive(&id, &a).unwrap(),
                deriver.derive(&id, &b).unwrap()
            );
        }

        #[test]
        fn excluded_params_do_not_affect_key() {
            let deriver = KeyDeriver::new().exclude("verbose");
            let id = ident("f");
            let (x, t, f) = (1u64, true, false);

            let mut a = CallArgs::new();
            a.arg("x", &x).arg("verbose", &t);
            let mut b = CallArgs::new();
            b.arg("x", &x).arg("verbose", &f);

            assert_eq!(
                deriver.derive(&id, &a).unwrap(),
                deriver.derive(&id, &b).unwrap()
            );
        }

        #[test]
        fn underscore_params_are_excluded() {
            let deriver = KeyDeriver::new();
            let id = ident("f");
            let x = 1u64;
            let conn = Conn;

            let mut args = CallArgs::new();
            args.arg("x", &x).opaque("_conn", &conn);
            let key = deriver.derive(&id, &args).unwrap();

            let mut plain = CallArgs::new();
            plain.arg("x", &x).identity("_other", "anything");
            assert_eq!(key, deriver.derive(&id, &plain).unwrap());
        }

        #[test]
        fn unclassified_opaque_is_an_error() {
            let deriver = KeyDeriver::new();
            let conn = Conn;
            let mut args = CallArgs::new();
            args.opaque("conn", &conn);

            let err = deriver.derive(&ident("f"), &args).unwrap_err();
            match err {
                UnhashableError::Unclassified { param, type_name } => {
                    assert_eq!(param, "conn");
                    assert!(type_name.ends_with("Conn"));
                },
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[test]
        fn identity_only_opaque_uses_tag() {
            let table = Arc::new(TypeTable::new().identity_only::<Conn>("pg"));
            let deriver = KeyDeriver::new().with_type_table(table);
            let id = ident("f");
            let (c1, c2) = (Conn, Conn);

            let mut a = CallArgs::new();
            a.opaque("conn", &c1);
            let mut b = CallArgs::new();
            b.opaque("conn", &c2);
            let mut tagged = CallArgs::new();
            tagged.identity("conn", "pg");

            let key = deriver.derive(&id, &a).unwrap();
            assert_eq!(key, deriver.derive(&id, &b).unwrap());
            assert_eq!(key, deriver.derive(&id, &tagged).unwrap());
        }

        #[test]
        fn excluded_type_keeps_position() {
            let table = Arc::new(TypeTable::new().exclude::<Conn>());
            let deriver = KeyDeriver::new().with_type_table(table);
            let id = ident("f");
            let (x, conn) = (5u64, Conn);

            let mut with_conn = CallArgs::new();
            with_conn.opaque("conn", &conn).arg("x", &x);
            let mut without = CallArgs::new();
            without.arg("x", &x);

            assert_ne!(
                deriver.derive(&id, &with_conn).unwrap(),
                deriver.derive(&id, &without).unwrap()
            );
        }

        #[test]
        fn depth_limit_is_configurable() {
            let deriver = KeyDeriver::new().with_max_depth(1);
            let nested = vec![vec![1u8]];
            let err = deriver.derive_input(&ident("f"), &(nested,)).unwrap_err();
            assert!(matches!(err, UnhashableError::TooDeep { max_depth: 1 }));
        }

        #[test]
        fn unit_input_has_stable_key() {
            let deriver = KeyDeriver::new();
            let id = ident("f");
            assert_eq!(
                deriver.derive_input(&id, &()).unwrap(),
                deriver.derive_input(&id, &()).unwrap()
            );
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_option_declaration_order_irrelevant(
                values in proptest::collection::vec(any::<u32>(), 1..8)
            ) {
                let names: Vec<String> = (0..values.len()).map(|i| format!("opt{i}")).collect();
                let deriver = KeyDeriver::new();
                let id = ident("f");

                let mut forward = CallArgs::new();
                for (name, value) in names.iter().zip(&values) {
                    forward.option(name, value);
                }
                let mut reverse = CallArgs::new();
                for (name, value) in names.iter().zip(&values).rev() {
                    reverse.option(name, value);
                }

                prop_assert_eq!(
                    deriver.derive(&id, &forward).unwrap(),
                    deriver.derive(&id, &reverse).unwrap()
                );
            }

            #[test]
            fn prop_key_hex_round_trips(a in any::<u64>(), b in ".{0,12}") {
                let key = KeyDeriver::new().derive_input(&ident("f"), &(a, b)).unwrap();
                prop_assert_eq!(CacheKey::from_hex(&key.to_hex()), Some(key));
            }
        }
    }
}
