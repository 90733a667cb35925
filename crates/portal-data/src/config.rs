use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Top-level configuration for a [`crate::Portal`].
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// JSON-RPC endpoint of the node.
    pub rpc_url: String,

    /// Base URL of the external price/logo service.
    pub price_api_url: String,

    /// Chain the portal reads from.
    pub chain_id: u64,

    /// Ceiling for a single HTTP request, in seconds.
    pub http_timeout_secs: u64,

    /// Maximum requests per batch round trip when enriching.
    pub chunk_size: usize,

    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub persistence: PersistenceConfig,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            price_api_url: "http://127.0.0.1:3000/api".to_string(),
            chain_id: 42000,
            http_timeout_secs: 60,
            chunk_size: 50,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_tokens: u32,
    pub refill_per_sec: f64,
    /// Queued requests older than this are rejected.
    pub queue_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            refill_per_sec: 5.0,
            queue_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub stale_time_secs: u64,
    /// Zero disables periodic refetching.
    pub refetch_interval_secs: u64,
    pub gc_time_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_secs: 30,
            refetch_interval_secs: 60,
            gc_time_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory for the persistent storage tier. `None` keeps everything in
    /// memory.
    pub storage_dir: Option<PathBuf>,
    pub max_votes: usize,
    pub max_recent_etfs: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            max_votes: 50,
            max_recent_etfs: 10,
        }
    }
}

impl PortalConfig {
    /// Parse a config from TOML and validate it.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: PortalConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.rpc_url.trim().is_empty() {
            return Err(Error::Config("rpc_url must not be empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than 0".to_string()));
        }
        if self.http_timeout_secs == 0 {
            return Err(Error::Config(
                "http_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.rate_limit.max_tokens == 0 {
            return Err(Error::Config(
                "rate_limit.max_tokens must be greater than 0".to_string(),
            ));
        }
        if !(self.rate_limit.refill_per_sec > 0.0 && self.rate_limit.refill_per_sec.is_finite()) {
            return Err(Error::Config(
                "rate_limit.refill_per_sec must be a positive number".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
