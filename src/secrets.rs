//! Secret lookup and the conditional gates built on it.
//!
//! The engine never stores secret values. A [`ConditionalGate`] asks a
//! [`SecretStore`] a yes/no question at call time; when the answer is no, the
//! gated cache purges the entry and refuses to compute.

use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::CapacityConfigError;

/// Read-only view of the host's secrets.
pub trait SecretStore: Send + Sync + fmt::Debug {
    fn get(&self, name: &str) -> Option<String>;

    fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl<S: SecretStore + ?Sized> SecretStore for Arc<S> {
    fn get(&self, name: &str) -> Option<String> {
        (**self).get(name)
    }

    fn exists(&self, name: &str) -> bool {
        (**self).exists(name)
    }
}

// ---------------------------------------------------------------------------
// MapSecretStore
// ---------------------------------------------------------------------------

/// In-memory secrets, mutable at runtime.
#[derive(Default)]
pub struct MapSecretStore {
    values: RwLock<FxHashMap<String, String>>,
}

impl MapSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(name.into(), value.into());
    }

    pub fn unset(&self, name: &str) -> bool {
        self.values.write().remove(name).is_some()
    }
}

impl fmt::Debug for MapSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.values.read().keys().cloned().collect();
        names.sort_unstable();
        f.debug_struct("MapSecretStore")
            .field("names", &names)
            .finish()
    }
}

impl SecretStore for MapSecretStore {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    fn exists(&self, name: &str) -> bool {
        self.values.read().contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// EnvSecretStore
// ---------------------------------------------------------------------------

/// Secrets from environment variables.
///
/// `get("db.password")` with prefix `APP_` reads `APP_DB_PASSWORD`: dots
/// become underscores and the name is upper-cased.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, name: &str) -> String {
        let mut var = self.prefix.clone();
        var.extend(name.chars().map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        }));
        var
    }
}

impl SecretStore for EnvSecretStore {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(self.var_name(name)).ok()
    }
}

// ---------------------------------------------------------------------------
// TomlSecretStore
// ---------------------------------------------------------------------------

/// Secrets from a TOML file; nested tables are addressed as `section.key`.
///
/// ```
/// use memokit::secrets::{SecretStore, TomlSecretStore};
///
/// let store = TomlSecretStore::from_toml_str(
///     r#"
///     password = "hunter2"
///
///     [db]
///     user = "svc"
///     port = 5432
///     "#,
/// )
/// .unwrap();
/// assert_eq!(store.get("password").as_deref(), Some("hunter2"));
/// assert_eq!(store.get("db.port").as_deref(), Some("5432"));
/// assert!(!store.exists("db.password"));
/// ```
pub struct TomlSecretStore {
    path: Option<PathBuf>,
    values: RwLock<FxHashMap<String, String>>,
}

impl TomlSecretStore {
    pub fn from_toml_str(input: &str) -> Result<Self, CapacityConfigError> {
        Ok(Self {
            path: None,
            values: RwLock::new(parse_secrets(input)?),
        })
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CapacityConfigError> {
        let path = path.into();
        let values = read_secrets(&path)?;
        Ok(Self {
            path: Some(path),
            values: RwLock::new(values),
        })
    }

    /// Re-reads the backing file. A store built from a string keeps its
    /// values.
    pub fn reload(&self) -> Result<(), CapacityConfigError> {
        if let Some(path) = &self.path {
            *self.values.write() = read_secrets(path)?;
        }
        Ok(())
    }
}

fn read_secrets(path: &Path) -> Result<FxHashMap<String, String>, CapacityConfigError> {
    let input = fs::read_to_string(path).map_err(|e| {
        CapacityConfigError::new(format!("cannot read secrets file {}: {e}", path.display()))
    })?;
    parse_secrets(&input)
}

fn parse_secrets(input: &str) -> Result<FxHashMap<String, String>, CapacityConfigError> {
    let table: toml::Table = input
        .parse()
        .map_err(|e| CapacityConfigError::new(format!("invalid secrets file: {e}")))?;
    let mut values = FxHashMap::default();
    flatten("", &table, &mut values);
    Ok(values)
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut FxHashMap<String, String>) {
    for (name, value) in table {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::Table(inner) => flatten(&path, inner, out),
            toml::Value::String(s) => {
                out.insert(path, s.clone());
            },
            other => {
                out.insert(path, other.to_string());
            },
        }
    }
}

impl fmt::Debug for TomlSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TomlSecretStore")
            .field("path", &self.path)
            .field("len", &self.values.read().len())
            .finish()
    }
}

impl SecretStore for TomlSecretStore {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    fn exists(&self, name: &str) -> bool {
        self.values.read().contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// ConditionalGate
// ---------------------------------------------------------------------------

type GatePredicate = dyn Fn(&dyn SecretStore) -> bool + Send + Sync;

/// Named predicate over a [`SecretStore`], evaluated on every call.
#[derive(Clone)]
pub struct ConditionalGate {
    name: Cow<'static, str>,
    predicate: Arc<GatePredicate>,
}

impl ConditionalGate {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, predicate: F) -> Self
    where
        F: Fn(&dyn SecretStore) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Open while the secret `secret` exists.
    pub fn secret_present(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Self::new(format!("secret_present({secret})"), move |store| {
            store.exists(&secret)
        })
    }

    /// Open while the secret `secret` equals `expected`. The comparison
    /// does not short-circuit on the first differing byte.
    pub fn secret_equals(secret: impl Into<String>, expected: impl Into<String>) -> Self {
        let secret = secret.into();
        let expected = expected.into();
        Self::new(format!("secret_equals({secret})"), move |store| {
            store
                .get(&secret)
                .is_some_and(|actual| constant_time_eq(actual.as_bytes(), expected.as_bytes()))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self, store: &dyn SecretStore) -> bool {
        (self.predicate)(store)
    }
}

impl fmt::Debug for ConditionalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalGate")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_store_set_and_unset() {
        let store = MapSecretStore::new().with("token", "abc");
        assert!(store.exists("token"));
        assert_eq!(store.get("token").as_deref(), Some("abc"));
        assert!(store.unset("token"));
        assert!(!store.exists("token"));
        assert!(!format!("{store:?}").contains("abc"));
    }

    #[test]
    fn env_store_maps_names() {
        let store = EnvSecretStore::with_prefix("MEMOKIT_TEST_");
        assert_eq!(store.var_name("db.password"), "MEMOKIT_TEST_DB_PASSWORD");
        assert_eq!(store.var_name("api-key"), "MEMOKIT_TEST_API_KEY");
        assert!(!store.exists("surely.not.set.anywhere"));
        assert!(EnvSecretStore::new().exists("PATH") || std::env::var("PATH").is_err());
    }

    #[test]
    fn toml_store_flattens_tables() {
        let store = TomlSecretStore::from_toml_str(
            r#"
            password = "pw"
            [a.b]
            c = true
            "#,
        )
        .unwrap();
        assert_eq!(store.get("a.b.c").as_deref(), Some("true"));
        assert!(store.exists("password"));
        assert!(!store.exists("a"));
        store.reload().unwrap();
        assert!(store.exists("password"));
    }

    #[test]
    fn toml_store_reloads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.toml");
        fs::write(&path, "password = \"one\"\n").unwrap();
        let store = TomlSecretStore::load(&path).unwrap();
        assert_eq!(store.get("password").as_deref(), Some("one"));

        fs::write(&path, "other = \"x\"\n").unwrap();
        store.reload().unwrap();
        assert!(!store.exists("password"));
    }

    #[test]
    fn toml_store_rejects_garbage() {
        assert!(TomlSecretStore::from_toml_str("= nope").is_err());
        assert!(TomlSecretStore::load("/definitely/missing/secrets.toml").is_err());
    }

    #[test]
    fn gates_follow_secrets() {
        let store = MapSecretStore::new();
        let present = ConditionalGate::secret_present("password");
        let equals = ConditionalGate::secret_equals("password", "letmein");
        assert!(!present.is_open(&store));
        assert!(!equals.is_open(&store));

        store.set("password", "wrong");
        assert!(present.is_open(&store));
        assert!(!equals.is_open(&store));

        store.set("password", "letmein");
        assert!(equals.is_open(&store));
        assert_eq!(equals.name(), "secret_equals(password)");
    }

    #[test]
    fn custom_gate() {
        let gate = ConditionalGate::new("two_secrets", |s| s.exists("a") && s.exists("b"));
        let store = MapSecretStore::new().with("a", "1");
        assert!(!gate.is_open(&store));
        store.set("b", "2");
        assert!(gate.is_open(&store));
    }

    #[test]
    fn constant_time_eq_matches_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"", b""));
    }
}
