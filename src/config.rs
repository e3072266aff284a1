use serde::Deserialize;

/// Tunables of the service core. Every field has a default, so a partial JSON document is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Byte budget of the normal transactions packed into one block.
    pub max_tx_bytes_in_block: usize,
    /// Count budget of the normal transactions packed into one block (0 means unlimited).
    pub max_tx_count: usize,
    pub normal_tx_pool_size: usize,
    pub patch_tx_pool_size: usize,
    /// Accepted distance (in microseconds) between a transaction timestamp and the reference time.
    pub tx_timestamp_threshold_us: i64,
    /// Number of world snapshots kept by the transition result cache.
    pub result_cache_entry_count: usize,
    /// Byte budget of the transition result cache.
    pub result_cache_entry_size: usize,
    pub wait_timeout_ms: u64,
    /// Network id; transactions carrying another one are rejected. 0 accepts any.
    pub nid: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_tx_bytes_in_block: 1024 * 1024,
            max_tx_count: 0,
            normal_tx_pool_size: 5000,
            patch_tx_pool_size: 1000,
            tx_timestamp_threshold_us: 5 * 60 * 1_000_000,
            result_cache_entry_count: 10,
            result_cache_entry_size: 1024 * 1024,
            wait_timeout_ms: 1000,
            nid: 0,
        }
    }
}

impl ServiceConfig {
    pub fn from_json(s: &str) -> crate::error::Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| crate::error::Error::IllegalArgument(e.to_string()))
    }
}
