//! Configuration
//!
//! All engine tunables live here: store batching/throttling/retry bounds,
//! advisory-lock parameters, and graph-resolver retry defaults. Values come
//! from defaults, an optional TOML file, and `WEFT_`-prefixed environment
//! variables, in increasing priority.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Store adapter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Max addresses per multi-get batch.
    #[serde(default = "default_get_batch_size")]
    pub get_batch_size: usize,

    /// Max rows per multi-put batch.
    #[serde(default = "default_put_batch_size")]
    pub put_batch_size: usize,

    /// Max timelines per get-newer query round.
    #[serde(default = "default_query_batch_size")]
    pub query_batch_size: usize,

    /// Delay between consecutive batches of one logical operation.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// Bound on no-progress retries of unprocessed batch subsets.
    #[serde(default = "default_max_unprocessed_retries")]
    pub max_unprocessed_retries: u32,

    /// Bound on retries of backend capacity/throughput errors.
    #[serde(default = "default_max_capacity_retries")]
    pub max_capacity_retries: u32,

    /// Base for exponential backoff, `2^attempt * base` milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Serialized frames at or above this size go to the blob store, with
    /// only a placeholder row in the structured store.
    #[serde(default = "default_blob_threshold_bytes")]
    pub blob_threshold_bytes: usize,
}

fn default_get_batch_size() -> usize {
    100
}
fn default_put_batch_size() -> usize {
    25
}
fn default_query_batch_size() -> usize {
    25
}
fn default_throttle_ms() -> u64 {
    500
}
fn default_max_unprocessed_retries() -> u32 {
    5
}
fn default_max_capacity_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    10
}
fn default_blob_threshold_bytes() -> usize {
    256 * 1024
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            get_batch_size: default_get_batch_size(),
            put_batch_size: default_put_batch_size(),
            query_batch_size: default_query_batch_size(),
            throttle_ms: default_throttle_ms(),
            max_unprocessed_retries: default_max_unprocessed_retries(),
            max_capacity_retries: default_max_capacity_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            blob_threshold_bytes: default_blob_threshold_bytes(),
        }
    }
}

/// Advisory lock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Seconds a held lock stays valid before expiring.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: i64,

    /// Max acquisition attempts before giving up.
    #[serde(default = "default_lock_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on the randomized delay between attempts.
    #[serde(default = "default_lock_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_lock_ttl_secs() -> i64 {
    60
}
fn default_lock_max_attempts() -> u32 {
    10
}
fn default_lock_max_delay_ms() -> u64 {
    500
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            max_attempts: default_lock_max_attempts(),
            max_delay_ms: default_lock_max_delay_ms(),
        }
    }
}

/// Dependency-graph resolver defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Delayed re-fetch attempts for addresses missing from the space.
    #[serde(default = "default_graph_max_retries")]
    pub max_retries: u32,

    /// Delay before each re-fetch attempt.
    #[serde(default = "default_graph_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_graph_max_retries() -> u32 {
    3
}
fn default_graph_retry_delay_ms() -> u64 {
    500
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_retries: default_graph_max_retries(),
            retry_delay_ms: default_graph_retry_delay_ms(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub graph: GraphConfig,

    /// When true, `put` commands must carry a 1:1 address↔frame
    /// correspondence and every incoming frame is validated intrinsically.
    #[serde(default = "default_true")]
    pub validate_addr_frame_correspondence: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock: LockConfig::default(),
            graph: GraphConfig::default(),
            validate_addr_frame_correspondence: default_true(),
        }
    }
}

impl WeftConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `WEFT_`-prefixed environment variables (e.g.
    /// `WEFT_STORE__GET_BATCH_SIZE=50`).
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("WEFT").separator("__"),
        );
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = WeftConfig::default();
        assert_eq!(cfg.store.get_batch_size, 100);
        assert_eq!(cfg.store.put_batch_size, 25);
        assert_eq!(cfg.lock.max_attempts, 10);
        assert!(cfg.validate_addr_frame_correspondence);
    }

    #[test]
    fn test_toml_overrides() {
        let toml = r#"
            [store]
            get_batch_size = 10
            throttle_ms = 0
        "#;
        let cfg: WeftConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.store.get_batch_size, 10);
        assert_eq!(cfg.store.throttle_ms, 0);
        // untouched values keep defaults
        assert_eq!(cfg.store.put_batch_size, 25);
    }
}
