//! Proxy configuration and TOML loading.
//!
//! [`ProxyConfig`] is the runtime configuration, built in code with
//! builder-style setters or converted from a [`FileConfig`].
//!
//! File configuration is loaded from TOML with the following resolution order:
//! 1. `--config <path>` (explicit path)
//! 2. `~/.fleetcache/config.toml` (user)
//! 3. `/etc/fleetcache/config.toml` (system)
//!
//! Durations in files are whole milliseconds:
//!
//! ```toml
//! [proxy]
//! backend_timeout_ms = 2000
//! cache_ttl_ms = 600000
//! max_concurrency = 8
//! lease_timeout_ms = 10000
//! max_wait_budget_ms = 4000
//! failure_policy = "retain"
//!
//! [backend]
//! base_url = "http://10.0.0.5:8080"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::WaitBackoff;
use crate::types::InstanceId;
use crate::{FleetCacheError, Result};

/// What a failed fetch does to the value already stored in the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Leave `value`/`expires_at` untouched; only the lease is cleared.
    #[default]
    Retain,
    /// Also drop the stored value if it has already expired. A value that
    /// is still fresh is never cleared.
    ClearStale,
}

/// Runtime configuration for a [`CacheProxy`](crate::CacheProxy).
///
/// ```rust
/// # use fleetcache::ProxyConfig;
/// # use std::time::Duration;
/// let config = ProxyConfig::new()
///     .cache_ttl(Duration::from_secs(60))
///     .lease_timeout(Duration::from_secs(5))
///     .max_concurrency(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upper bound on one backend call. Default: 2s.
    pub backend_timeout: Duration,
    /// How long a fetched value is served. Default: 10 minutes.
    pub cache_ttl: Duration,
    /// Simultaneous backend calls allowed from this instance. Default: 8.
    pub max_concurrency: usize,
    /// How long a lease holder may fetch before peers may steal the key.
    /// Must exceed `backend_timeout`. Default: 10s.
    pub lease_timeout: Duration,
    /// Local-cache sweep period. Default: `cache_ttl / 10`.
    pub cleanup_interval: Option<Duration>,
    /// Longest a caller waits behind another instance's lease. Default: 4s.
    pub max_wait_budget: Duration,
    /// Re-check schedule while waiting on a lease.
    pub wait_backoff: WaitBackoff,
    /// Handling of stored values when a fetch fails.
    pub failure_policy: FailurePolicy,
    /// Fixed instance identity. Generated at startup when unset.
    pub instance_id: Option<InstanceId>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_millis(default_backend_timeout_ms()),
            cache_ttl: Duration::from_millis(default_cache_ttl_ms()),
            max_concurrency: default_max_concurrency(),
            lease_timeout: Duration::from_millis(default_lease_timeout_ms()),
            cleanup_interval: None,
            max_wait_budget: Duration::from_millis(default_max_wait_budget_ms()),
            wait_backoff: WaitBackoff::default(),
            failure_policy: FailurePolicy::default(),
            instance_id: None,
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn max_wait_budget(mut self, budget: Duration) -> Self {
        self.max_wait_budget = budget;
        self
    }

    pub fn wait_backoff(mut self, backoff: WaitBackoff) -> Self {
        self.wait_backoff = backoff;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn instance_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// The sweep period actually used: the configured one, or a tenth of
    /// the TTL (never below 1ms).
    pub fn effective_cleanup_interval(&self) -> Duration {
        self.cleanup_interval
            .unwrap_or(self.cache_ttl / 10)
            .max(Duration::from_millis(1))
    }

    /// Reject configurations the lease protocol cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(FleetCacheError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("backend_timeout", self.backend_timeout),
            ("cache_ttl", self.cache_ttl),
            ("lease_timeout", self.lease_timeout),
            ("max_wait_budget", self.max_wait_budget),
        ] {
            if value.is_zero() {
                return Err(FleetCacheError::Configuration(format!(
                    "{name} must be non-zero"
                )));
            }
        }
        if self.cleanup_interval.is_some_and(|d| d.is_zero()) {
            return Err(FleetCacheError::Configuration(
                "cleanup_interval must be non-zero".to_string(),
            ));
        }
        if self.lease_timeout <= self.backend_timeout {
            return Err(FleetCacheError::Configuration(format!(
                "lease_timeout ({:?}) must exceed backend_timeout ({:?})",
                self.lease_timeout, self.backend_timeout
            )));
        }
        Ok(())
    }
}

/// Configuration file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub backend: BackendSection,
}

/// `[proxy]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
    #[serde(default)]
    pub cleanup_interval_ms: Option<u64>,
    #[serde(default = "default_max_wait_budget_ms")]
    pub max_wait_budget_ms: u64,
    #[serde(default = "default_wait_initial_delay_ms")]
    pub wait_initial_delay_ms: u64,
    #[serde(default = "default_wait_max_delay_ms")]
    pub wait_max_delay_ms: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            backend_timeout_ms: default_backend_timeout_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            max_concurrency: default_max_concurrency(),
            lease_timeout_ms: default_lease_timeout_ms(),
            cleanup_interval_ms: None,
            max_wait_budget_ms: default_max_wait_budget_ms(),
            wait_initial_delay_ms: default_wait_initial_delay_ms(),
            wait_max_delay_ms: default_wait_max_delay_ms(),
            failure_policy: FailurePolicy::default(),
            instance_id: None,
        }
    }
}

fn default_backend_timeout_ms() -> u64 {
    2_000
}

fn default_cache_ttl_ms() -> u64 {
    600_000
}

fn default_max_concurrency() -> usize {
    8
}

fn default_lease_timeout_ms() -> u64 {
    10_000
}

fn default_max_wait_budget_ms() -> u64 {
    4_000
}

fn default_wait_initial_delay_ms() -> u64 {
    100
}

fn default_wait_max_delay_ms() -> u64 {
    1_000
}

impl From<ProxySection> for ProxyConfig {
    fn from(section: ProxySection) -> Self {
        Self {
            backend_timeout: Duration::from_millis(section.backend_timeout_ms),
            cache_ttl: Duration::from_millis(section.cache_ttl_ms),
            max_concurrency: section.max_concurrency,
            lease_timeout: Duration::from_millis(section.lease_timeout_ms),
            cleanup_interval: section.cleanup_interval_ms.map(Duration::from_millis),
            max_wait_budget: Duration::from_millis(section.max_wait_budget_ms),
            wait_backoff: WaitBackoff::new()
                .initial_delay(Duration::from_millis(section.wait_initial_delay_ms))
                .max_delay(Duration::from_millis(section.wait_max_delay_ms)),
            failure_policy: section.failure_policy,
            instance_id: section.instance_id.map(InstanceId::from),
        }
    }
}

/// `[backend]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// Base URL of the backend service (default: http://127.0.0.1:8080).
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl FileConfig {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.fleetcache/config.toml`
    /// 3. `/etc/fleetcache/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            FleetCacheError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The runtime proxy configuration this file describes.
    pub fn proxy_config(&self) -> ProxyConfig {
        self.proxy.clone().into()
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(FleetCacheError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".fleetcache").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/fleetcache/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(FleetCacheError::Configuration(
            "No config file found. Create ~/.fleetcache/config.toml or /etc/fleetcache/config.toml"
                .to_string(),
        ))
    }
}
