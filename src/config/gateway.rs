//! Gateway configuration structures.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::admission::{BucketPolicy, RoutePolicy};
use crate::core::cache::CacheSettings;
use crate::core::dispatcher::DispatcherSettings;
use crate::core::resource_pool::PoolLimits;
use crate::core::AppResult;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";
/// Override for `pool.max_size`.
pub const POOL_MAX_SIZE_ENV: &str = "GATEWAY_POOL_MAX_SIZE";
/// Override for `cache.max_entries`.
pub const CACHE_MAX_ENTRIES_ENV: &str = "GATEWAY_CACHE_MAX_ENTRIES";

/// Resource pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Slots kept open even when idle.
    pub min_size: usize,
    /// Upper bound on live slots.
    pub max_size: usize,
    /// Idle slots older than this are closed (ms).
    pub max_idle_ms: u64,
    /// Default acquire wait (ms).
    pub acquire_timeout_ms: u64,
    /// Failed replacements tolerated before `PoolExhausted`.
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            max_idle_ms: 300_000,
            acquire_timeout_ms: 5_000,
            max_retries: 3,
        }
    }
}

impl PoolConfig {
    /// Validate pool values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".into());
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            ));
        }
        Ok(())
    }

    /// Runtime limits.
    pub const fn limits(&self) -> PoolLimits {
        PoolLimits {
            min_size: self.min_size,
            max_size: self.max_size,
            max_idle: Duration::from_millis(self.max_idle_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Admission configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Shared fallback bucket for route/tier pairs without a policy.
    pub default_policy: BucketPolicy,
    /// Route/tier specific policies.
    pub policies: Vec<RoutePolicy>,
    /// Buckets idle for longer are dropped (ms).
    pub idle_eviction_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_policy: BucketPolicy::default(),
            policies: Vec::new(),
            idle_eviction_ms: 600_000,
        }
    }
}

fn validate_policy(name: &str, policy: &BucketPolicy) -> Result<(), String> {
    if !(policy.capacity >= 1.0 && policy.capacity.is_finite()) {
        return Err(format!("{name}: capacity must be at least 1"));
    }
    if !(policy.refill_per_sec > 0.0 && policy.refill_per_sec.is_finite()) {
        return Err(format!("{name}: refill_per_sec must be greater than 0"));
    }
    Ok(())
}

impl AdmissionConfig {
    /// Validate every bucket policy.
    pub fn validate(&self) -> Result<(), String> {
        validate_policy("default_policy", &self.default_policy)?;
        for p in &self.policies {
            validate_policy(&format!("policy `{}/{}`", p.route, p.tier), &p.policy)?;
        }
        Ok(())
    }

    /// Idle window as a duration.
    pub const fn idle_eviction(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_ms)
    }
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for entries whose operation does not set one (ms).
    pub default_ttl_ms: u64,
    /// Window past expiry in which a stale value is served while it
    /// refreshes (ms). Zero disables stale serving.
    pub stale_while_revalidate_ms: u64,
    /// LRU capacity.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 60_000,
            stale_while_revalidate_ms: 0,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    /// Validate cache values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be greater than 0".into());
        }
        if self.default_ttl_ms == 0 {
            return Err("default_ttl_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Runtime settings.
    pub const fn settings(&self) -> CacheSettings {
        CacheSettings {
            default_ttl: Duration::from_millis(self.default_ttl_ms),
            stale_while_revalidate: Duration::from_millis(self.stale_while_revalidate_ms),
            max_entries: self.max_entries,
        }
    }
}

/// Task store backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskStoreConfig {
    /// In-memory table; tasks are lost on restart.
    #[default]
    InMemory,
    /// JSON lines file under `dir`.
    File {
        /// Directory holding the file.
        dir: PathBuf,
        /// File stem.
        stream: String,
    },
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Attempts before dead-lettering a transiently failing task.
    pub max_attempts: u32,
    /// First retry delay (ms).
    pub backoff_base_ms: u64,
    /// Retry delay cap (ms).
    pub max_backoff_ms: u64,
    /// Running tasks silent for longer are reclaimed (ms).
    pub liveness_deadline_ms: u64,
    /// Idle poll interval (ms).
    pub poll_interval_ms: u64,
    /// Concurrent attempts per pass.
    pub concurrency: usize,
    /// Tasks claimed per pass.
    pub batch_size: usize,
    /// Where tasks are stored.
    pub store: TaskStoreConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            max_backoff_ms: 300_000,
            liveness_deadline_ms: 30_000,
            poll_interval_ms: 250,
            concurrency: num_cpus::get(),
            batch_size: 32,
            store: TaskStoreConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Validate dispatcher values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".into());
        }
        if self.backoff_base_ms > self.max_backoff_ms {
            return Err("backoff_base_ms must not exceed max_backoff_ms".into());
        }
        if self.liveness_deadline_ms == 0 {
            return Err("liveness_deadline_ms must be greater than 0".into());
        }
        if self.concurrency == 0 || self.batch_size == 0 {
            return Err("concurrency and batch_size must be greater than 0".into());
        }
        Ok(())
    }

    /// Runtime settings.
    pub const fn settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            liveness_deadline: Duration::from_millis(self.liveness_deadline_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            concurrency: self.concurrency,
            batch_size: self.batch_size,
        }
    }
}

/// Outbox configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Published records are kept this long before purge (ms).
    pub retention_ms: u64,
    /// Records drained per publisher pass.
    pub batch_size: usize,
    /// Idle publisher poll interval (ms).
    pub poll_interval_ms: u64,
    /// Event ids remembered by deduplicating subscribers.
    pub dedup_capacity: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            retention_ms: 86_400_000,
            batch_size: 100,
            poll_interval_ms: 500,
            dedup_capacity: 10_000,
        }
    }
}

impl OutboxConfig {
    /// Validate outbox values.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Resource pool.
    pub pool: PoolConfig,
    /// Admission control.
    pub admission: AdmissionConfig,
    /// Response cache.
    pub cache: CacheConfig,
    /// Task dispatcher.
    pub dispatcher: DispatcherConfig,
    /// Outbox.
    pub outbox: OutboxConfig,
    /// Period of the maintenance loop (ms).
    pub maintenance_interval_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            admission: AdmissionConfig::default(),
            cache: CacheConfig::default(),
            dispatcher: DispatcherConfig::default(),
            outbox: OutboxConfig::default(),
            maintenance_interval_ms: 30_000,
        }
    }
}

impl GatewayConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate().map_err(|e| format!("pool: {e}"))?;
        self.admission
            .validate()
            .map_err(|e| format!("admission: {e}"))?;
        self.cache.validate().map_err(|e| format!("cache: {e}"))?;
        self.dispatcher
            .validate()
            .map_err(|e| format!("dispatcher: {e}"))?;
        self.outbox.validate().map_err(|e| format!("outbox: {e}"))?;
        if self.maintenance_interval_ms == 0 {
            return Err("maintenance_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse gateway configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `.env`, then the JSON file named by `GATEWAY_CONFIG` (defaults
    /// when unset), then apply single-value overrides from the environment.
    ///
    /// # Errors
    ///
    /// Unreadable or invalid config file, unparsable override, or failed
    /// validation.
    pub fn from_env() -> AppResult<Self> {
        // A missing .env is normal outside development.
        let _ = dotenvy::dotenv();
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {CONFIG_PATH_ENV}={path}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?
            }
            Err(_) => Self::default(),
        };
        if let Ok(raw) = std::env::var(POOL_MAX_SIZE_ENV) {
            cfg.pool.max_size = raw
                .parse()
                .with_context(|| format!("{POOL_MAX_SIZE_ENV}={raw}"))?;
        }
        if let Ok(raw) = std::env::var(CACHE_MAX_ENTRIES_ENV) {
            cfg.cache.max_entries = raw
                .parse()
                .with_context(|| format!("{CACHE_MAX_ENTRIES_ENV}={raw}"))?;
        }
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    /// Maintenance period as a duration.
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}
