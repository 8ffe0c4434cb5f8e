//! Capability classification for call arguments.
//!
//! Arguments reach the key deriver in one of three classes:
//!
//! | Class          | Key contribution                          | Typical values           |
//! |----------------|-------------------------------------------|--------------------------|
//! | `Hashable`     | content fingerprint                       | ids, paths, query params |
//! | `IdentityOnly` | the declared type tag only                | connection pools, models |
//! | `Excluded`     | a fixed placeholder (keeps positions)     | loggers, progress sinks  |
//!
//! `Hashable` arguments are the ones implementing
//! [`Fingerprint`](crate::hash::Fingerprint). Everything else is passed as an
//! opaque argument and classified through the host's [`TypeTable`]; an opaque
//! argument whose type is not in the table is an error, never a silent miss.

use std::any::{TypeId, type_name};
use std::borrow::Cow;

use rustc_hash::FxHashMap;

/// How an argument contributes to a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgClass {
    Hashable,
    IdentityOnly { tag: Cow<'static, str> },
    Excluded,
}

#[derive(Debug, Clone)]
struct Registration {
    class: ArgClass,
    type_name: &'static str,
}

/// Host-supplied classification table for opaque argument types.
///
/// # Example
///
/// ```
/// use std::net::TcpStream;
///
/// use memokit::hash::{ArgClass, TypeTable};
///
/// let table = TypeTable::new()
///     .identity_only::<TcpStream>("tcp-stream")
///     .exclude::<std::fs::File>();
///
/// assert_eq!(
///     table.classify_type::<TcpStream>(),
///     Some(&ArgClass::IdentityOnly { tag: "tcp-stream".into() })
/// );
/// assert_eq!(table.classify_type::<std::fs::File>(), Some(&ArgClass::Excluded));
/// assert_eq!(table.classify_type::<String>(), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    entries: FxHashMap<TypeId, Registration>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` so that any value of it fingerprints as `tag`.
    pub fn identity_only<T: 'static>(mut self, tag: impl Into<Cow<'static, str>>) -> Self {
        self.register::<T>(ArgClass::IdentityOnly { tag: tag.into() });
        self
    }

    /// Registers `T` so that values of it never affect the key.
    pub fn exclude<T: 'static>(mut self) -> Self {
        self.register::<T>(ArgClass::Excluded);
        self
    }

    /// Registers or replaces the class for `T`.
    ///
    /// Registering `ArgClass::Hashable` for an opaque type is accepted but
    /// has no effect on derivation: opaque values carry no content to hash, so
    /// they are treated as unclassified.
    pub fn register<T: 'static>(&mut self, class: ArgClass) {
        self.entries.insert(
            TypeId::of::<T>(),
            Registration {
                class,
                type_name: type_name::<T>(),
            },
        );
    }

    pub fn classify(&self, type_id: TypeId) -> Option<&ArgClass> {
        self.entries.get(&type_id).map(|reg| &reg.class)
    }

    pub fn classify_type<T: 'static>(&self) -> Option<&ArgClass> {
        self.classify(TypeId::of::<T>())
    }

    /// Registered type names, for diagnostics.
    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.values().map(|reg| reg.type_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pool;
    struct Sink;

    #[test]
    fn unregistered_types_are_unclassified() {
        let table = TypeTable::new();
        assert!(table.is_empty());
        assert_eq!(table.classify_type::<Pool>(), None);
    }

    #[test]
    fn registration_replaces_previous_class() {
        let mut table = TypeTable::new().identity_only::<Pool>("pool");
        table.register::<Pool>(ArgClass::Excluded);
        assert_eq!(table.len(), 1);
        assert_eq!(table.classify_type::<Pool>(), Some(&ArgClass::Excluded));
    }

    #[test]
    fn type_names_are_reported() {
        let table = TypeTable::new().identity_only::<Pool>("pool").exclude::<Sink>();
        let mut names: Vec<_> = table.type_names().collect();
        names.sort_unstable();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with("Pool")));
        assert!(names.iter().any(|n| n.ends_with("Sink")));
    }
}
