//! Engine configuration
//!
//! Tunables that apply to the whole engine rather than to a single volume.
//! Per-volume settings (page size, growth policy) live in
//! [`crate::volume::VolumeSpecification`].

use serde::{Deserialize, Serialize};

/// Default number of page frames per buffer pool.
pub const DEFAULT_BUFFER_POOL_FRAMES: usize = 512;

/// Default number of transaction-index buckets. Must be a power of two.
pub const DEFAULT_TRANSACTION_BUCKETS: usize = 128;

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Page frames per buffer pool. One pool is created per distinct page
    /// size in use.
    pub buffer_pool_frames: usize,

    /// Lock-stripe bucket count of the transaction index. Power of two.
    pub transaction_buckets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool_frames: DEFAULT_BUFFER_POOL_FRAMES,
            transaction_buckets: DEFAULT_TRANSACTION_BUCKETS,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.buffer_pool_frames == 0 {
            return Err(crate::PersistitError::IllegalArgument(
                "buffer_pool_frames must be positive".into(),
            ));
        }
        if self.transaction_buckets == 0 || !self.transaction_buckets.is_power_of_two() {
            return Err(crate::PersistitError::IllegalArgument(format!(
                "transaction_buckets must be a power of two, got {}",
                self.transaction_buckets
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bucket_count_must_be_power_of_two() {
        let config = EngineConfig {
            transaction_buckets: 100,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
