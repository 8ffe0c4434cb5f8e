//! Cache and registry configuration.
//!
//! [`CacheConfig`] is built in code and checked with
//! [`CacheConfig::validate`]. File-based configuration goes through
//! [`RegistryConfig`], whose `[caches.<name>]` tables are
//! [`RawCacheConfig`] overrides applied when a cache of that name is built.
//!
//! ```toml
//! persist_dir = "/var/cache/app"
//! sweep_interval_ms = 30000
//!
//! [caches.load_loans]
//! max_entries = 64
//! ttl_secs = 600
//! persist = "disk"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::CapacityConfigError;
use crate::hash::DEFAULT_MAX_DEPTH;

/// Eviction order applied when `max_entries` is exceeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
}

/// Where entries live besides memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    #[default]
    None,
    Disk,
}

/// Per-cache configuration.
///
/// ```
/// use std::time::Duration;
///
/// use memokit::config::CacheConfig;
///
/// let config = CacheConfig::default()
///     .max_entries(128)
///     .ttl(Duration::from_secs(60))
///     .validate()
///     .unwrap();
/// assert_eq!(config.max_entries, Some(128));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on live entries; `None` is unbounded.
    pub max_entries: Option<usize>,
    /// Maximum age of an entry; `None` never expires.
    pub ttl: Option<Duration>,
    pub eviction: EvictionPolicy,
    /// Emit progress events while computing on a miss.
    pub show_spinner: bool,
    pub persist: PersistMode,
    /// Abandon a computation that runs longer than this.
    pub compute_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            ttl: None,
            eviction: EvictionPolicy::Lru,
            show_spinner: true,
            persist: PersistMode::None,
            compute_timeout: None,
        }
    }
}

impl CacheConfig {
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.max_entries = None;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn no_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }

    pub fn eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn show_spinner(mut self, show: bool) -> Self {
        self.show_spinner = show;
        self
    }

    pub fn persist(mut self, mode: PersistMode) -> Self {
        self.persist = mode;
        self
    }

    pub fn compute_timeout(mut self, timeout: Duration) -> Self {
        self.compute_timeout = Some(timeout);
        self
    }

    /// Rejects zero capacity and zero durations.
    pub fn validate(self) -> Result<Self, CapacityConfigError> {
        if self.max_entries == Some(0) {
            return Err(CapacityConfigError::new(
                "max_entries must be greater than zero",
            ));
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(CapacityConfigError::new("ttl must be greater than zero"));
        }
        if self.compute_timeout == Some(Duration::ZERO) {
            return Err(CapacityConfigError::new(
                "compute_timeout must be greater than zero",
            ));
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// RawCacheConfig
// ---------------------------------------------------------------------------

/// Cache configuration as read from a file.
///
/// Numbers are signed so that a negative value in the file is reported as a
/// configuration error rather than a parse error. Unset fields leave the
/// base configuration untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCacheConfig {
    pub max_entries: Option<i64>,
    pub ttl_secs: Option<f64>,
    pub show_spinner: Option<bool>,
    pub persist: Option<PersistMode>,
    pub eviction: Option<EvictionPolicy>,
    pub compute_timeout_secs: Option<f64>,
}

fn secs_to_duration(field: &str, secs: f64) -> Result<Duration, CapacityConfigError> {
    if secs <= 0.0 {
        return Err(CapacityConfigError::new(format!(
            "{field} must be greater than zero, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| CapacityConfigError::new(format!("{field} is out of range: {e}")))
}

impl RawCacheConfig {
    /// Applies these overrides on top of `base` and validates the result.
    pub fn apply(&self, base: CacheConfig) -> Result<CacheConfig, CapacityConfigError> {
        let mut config = base;
        if let Some(max) = self.max_entries {
            let max = usize::try_from(max).map_err(|_| {
                CapacityConfigError::new(format!("max_entries must be positive, got {max}"))
            })?;
            config.max_entries = Some(max);
        }
        if let Some(secs) = self.ttl_secs {
            config.ttl = Some(secs_to_duration("ttl_secs", secs)?);
        }
        if let Some(show) = self.show_spinner {
            config.show_spinner = show;
        }
        if let Some(mode) = self.persist {
            config.persist = mode;
        }
        if let Some(eviction) = self.eviction {
            config.eviction = eviction;
        }
        if let Some(secs) = self.compute_timeout_secs {
            config.compute_timeout = Some(secs_to_duration("compute_timeout_secs", secs)?);
        }
        config.validate()
    }

    pub fn into_config(self) -> Result<CacheConfig, CapacityConfigError> {
        self.apply(CacheConfig::default())
    }
}

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Registry-wide configuration, usually loaded from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Root directory for disk persistence. Required by caches configured
    /// with `persist = "disk"`.
    pub persist_dir: Option<PathBuf>,
    /// Period of the background sweeper; no sweeper when unset.
    pub sweep_interval_ms: Option<u64>,
    /// Nesting limit for argument fingerprints.
    pub max_depth: usize,
    /// Per-cache overrides keyed by cache name.
    pub caches: BTreeMap<String, RawCacheConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            persist_dir: None,
            sweep_interval_ms: None,
            max_depth: DEFAULT_MAX_DEPTH,
            caches: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, CapacityConfigError> {
        let config: Self = toml::from_str(input)
            .map_err(|e| CapacityConfigError::new(format!("invalid registry config: {e}")))?;
        config.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CapacityConfigError> {
        let path = path.as_ref();
        let input = fs::read_to_string(path).map_err(|e| {
            CapacityConfigError::new(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }

    pub fn validate(self) -> Result<Self, CapacityConfigError> {
        if self.sweep_interval_ms == Some(0) {
            return Err(CapacityConfigError::new(
                "sweep_interval_ms must be greater than zero",
            ));
        }
        if self.max_depth == 0 {
            return Err(CapacityConfigError::new(
                "max_depth must be greater than zero",
            ));
        }
        for (name, raw) in &self.caches {
            raw.apply(CacheConfig::default()).map_err(|e| {
                CapacityConfigError::new(format!("caches.{name}: {}", e.message()))
            })?;
        }
        Ok(self)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms.map(Duration::from_millis)
    }

    /// Overrides for the cache called `name`, if any.
    pub fn cache(&self, name: &str) -> Option<&RawCacheConfig> {
        self.caches.get(name)
    }
}
