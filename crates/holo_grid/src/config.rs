//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};

/// Per-cache configuration and operational tuning.
///
/// Timeouts are stored in milliseconds so the struct stays readable in JSON;
/// accessors return `Duration`s. A transaction timeout of zero means no
/// timeout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub name: String,
    /// Backup owners per partition in addition to the primary.
    pub backups: usize,
    pub tx_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Whether this node keeps a near cache for keys it does not own.
    pub near_enabled: bool,
    /// Hand out private copies of values instead of shared references.
    pub clone_on_read: bool,
    pub store_enabled: bool,
    /// LRU bound for near storage; zero disables near eviction.
    pub near_max_size: usize,
    /// LRU bound for DHT storage; zero disables DHT eviction.
    pub dht_max_size: usize,
    pub entry_shards: usize,
    /// Completed transaction versions remembered for lock-order resolution.
    pub completed_history: usize,
    /// Upper bound a reader registration waits for in-flight transactions.
    pub reader_wait_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            backups: 0,
            tx_timeout_ms: 0,
            lock_timeout_ms: 2_000,
            rpc_timeout_ms: 2_000,
            near_enabled: true,
            clone_on_read: false,
            store_enabled: false,
            near_max_size: 0,
            dht_max_size: 0,
            entry_shards: 16,
            completed_history: 1_024,
            reader_wait_ms: 2_000,
        }
    }
}

impl CacheConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CacheConfig =
            serde_json::from_str(json).map_err(|e| GridError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HOLO_GRID_*` environment overrides.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_env_from(|name| std::env::var(name).ok())?;
        self.validate()?;
        Ok(self)
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| GridError::Config(format!("{name}: cannot parse {raw:?}")))
        }

        if let Some(raw) = get("HOLO_GRID_NAME") {
            self.name = raw;
        }
        if let Some(raw) = get("HOLO_GRID_BACKUPS") {
            self.backups = parse("HOLO_GRID_BACKUPS", raw)?;
        }
        if let Some(raw) = get("HOLO_GRID_TX_TIMEOUT_MS") {
            self.tx_timeout_ms = parse("HOLO_GRID_TX_TIMEOUT_MS", raw)?;
        }
        if let Some(raw) = get("HOLO_GRID_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = parse("HOLO_GRID_LOCK_TIMEOUT_MS", raw)?;
        }
        if let Some(raw) = get("HOLO_GRID_RPC_TIMEOUT_MS") {
            self.rpc_timeout_ms = parse("HOLO_GRID_RPC_TIMEOUT_MS", raw)?;
        }
        if let Some(raw) = get("HOLO_GRID_NEAR_ENABLED") {
            self.near_enabled = parse("HOLO_GRID_NEAR_ENABLED", raw)?;
        }
        if let Some(raw) = get("HOLO_GRID_CLONE_ON_READ") {
            self.clone_on_read = parse("HOLO_GRID_CLONE_ON_READ", raw)?;
        }
        if let Some(raw) = get("HOLO_GRID_NEAR_MAX_SIZE") {
            self.near_max_size = parse("HOLO_GRID_NEAR_MAX_SIZE", raw)?;
        }
        if let Some(raw) = get("HOLO_GRID_DHT_MAX_SIZE") {
            self.dht_max_size = parse("HOLO_GRID_DHT_MAX_SIZE", raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_shards == 0 {
            return Err(GridError::Config("entry_shards must be > 0".into()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(GridError::Config("rpc_timeout_ms must be > 0".into()));
        }
        if self.completed_history == 0 {
            return Err(GridError::Config("completed_history must be > 0".into()));
        }
        Ok(())
    }

    pub fn tx_timeout(&self) -> Option<Duration> {
        (self.tx_timeout_ms > 0).then(|| Duration::from_millis(self.tx_timeout_ms))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn reader_wait(&self) -> Duration {
        Duration::from_millis(self.reader_wait_ms)
    }
}
