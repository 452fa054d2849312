//! Pool configuration.

use std::path::PathBuf;

use crate::error::{Result, TierError};
use crate::io::WritePolicy;
use crate::store::MIN_POOL_BYTES;
use crate::types::WORD_BYTES;

/// Default pool size: 8 GiB.
pub const DEFAULT_POOL_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Default region size: 256 MiB.
pub const DEFAULT_REGION_SIZE: u64 = 256 * 1024 * 1024;

/// Default alignment of the usable pool start within the mapping: 32 MiB
/// (the card-table granule the collector's bookkeeping assumes).
pub const DEFAULT_ALIGNMENT: u64 = 32 * 1024 * 1024;

/// Default partitions per group.
pub const DEFAULT_MAX_PARTITIONS: u64 = 256;

/// Default total in-flight write-request slots, shared across workers.
pub const DEFAULT_WRITE_SLOTS: usize = 64;

/// Default promotion-buffer capacity per region: 8 MiB.
pub const DEFAULT_PROMO_CAPACITY: usize = 8 * 1024 * 1024;

/// Default direct-write threshold: payloads above this size bypass the
/// promotion buffer.
pub const DEFAULT_PROMO_THRESHOLD: usize = 64 * 1024;

/// Configuration for pool creation.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Total size of the mapped pool in bytes.
    pub size: u64,
    /// Alignment of the usable start address within the mapping.
    pub alignment: u64,
    /// Directory for the (unlinked) backing file.
    pub directory: PathBuf,
    /// Region size in bytes.
    pub region_size: u64,
    /// Partitions per group; partition ids must stay below this.
    pub max_partitions: u64,
    /// Number of write-back workers.
    pub workers: usize,
    /// Total in-flight write-request slots, divided evenly across workers.
    pub total_write_slots: usize,
    /// Threads servicing the write-back queue.
    pub io_threads: usize,
    /// How payloads reach the backing store.
    pub write_policy: WritePolicy,
    /// Promotion-buffer capacity per (region, worker), in bytes.
    pub promo_capacity: usize,
    /// Payloads larger than this bypass the promotion buffer, in bytes.
    pub promo_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            alignment: DEFAULT_ALIGNMENT,
            directory: std::env::temp_dir(),
            region_size: DEFAULT_REGION_SIZE,
            max_partitions: DEFAULT_MAX_PARTITIONS,
            workers: 8,
            total_write_slots: DEFAULT_WRITE_SLOTS,
            io_threads: 4,
            write_policy: WritePolicy::Async,
            promo_capacity: DEFAULT_PROMO_CAPACITY,
            promo_threshold: DEFAULT_PROMO_THRESHOLD,
        }
    }
}

impl PoolConfig {
    /// Create a small configuration for tests: minimum-size pool, 1 MiB
    /// regions, a narrow key space, and two workers.
    ///
    /// The backing file is sparse, so the pool costs virtual address space
    /// rather than disk until pages are written.
    pub fn scratch(directory: impl Into<PathBuf>) -> Self {
        Self {
            size: MIN_POOL_BYTES,
            alignment: 4096,
            directory: directory.into(),
            region_size: 1024 * 1024,
            max_partitions: 4,
            workers: 2,
            total_write_slots: 8,
            io_threads: 2,
            write_policy: WritePolicy::Async,
            promo_capacity: 64 * 1024,
            promo_threshold: 8 * 1024,
        }
    }

    /// Set the pool size in bytes.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Set the alignment of the usable start address.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the backing-file directory.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Set the region size in bytes.
    pub fn with_region_size(mut self, region_size: u64) -> Self {
        self.region_size = region_size;
        self
    }

    /// Set the partitions-per-group bound.
    pub fn with_max_partitions(mut self, max_partitions: u64) -> Self {
        self.max_partitions = max_partitions;
        self
    }

    /// Set the write-back worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the write policy.
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Set the promotion-buffer capacity and direct-write threshold.
    pub fn with_promotion(mut self, capacity: usize, threshold: usize) -> Self {
        self.promo_capacity = capacity;
        self.promo_threshold = threshold;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.size < MIN_POOL_BYTES {
            return Err(TierError::PoolTooSmall {
                requested: self.size,
                minimum: MIN_POOL_BYTES,
            });
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(TierError::InvalidConfig {
                cause: format!("alignment {} is not a power of two", self.alignment),
            });
        }
        if self.region_size == 0 || self.region_size % WORD_BYTES != 0 {
            return Err(TierError::InvalidConfig {
                cause: format!(
                    "region size {} is not a positive multiple of {} bytes",
                    self.region_size, WORD_BYTES
                ),
            });
        }
        if self.region_size > self.size {
            return Err(TierError::InvalidConfig {
                cause: format!(
                    "region size {} exceeds pool size {}",
                    self.region_size, self.size
                ),
            });
        }
        if self.max_partitions == 0 {
            return Err(TierError::InvalidConfig {
                cause: "max_partitions must be at least 1".into(),
            });
        }
        if self.workers == 0 {
            return Err(TierError::InvalidConfig {
                cause: "at least one worker is required".into(),
            });
        }
        if self.total_write_slots < self.workers {
            return Err(TierError::InvalidConfig {
                cause: format!(
                    "{} write slots cannot cover {} workers",
                    self.total_write_slots, self.workers
                ),
            });
        }
        if self.io_threads == 0 {
            return Err(TierError::InvalidConfig {
                cause: "at least one I/O thread is required".into(),
            });
        }
        if self.promo_capacity == 0 || self.promo_threshold >= self.promo_capacity {
            return Err(TierError::InvalidConfig {
                cause: format!(
                    "promotion threshold {} must be below capacity {}",
                    self.promo_threshold, self.promo_capacity
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn scratch_config_validates() {
        PoolConfig::scratch("/tmp").validate().unwrap();
    }

    #[test]
    fn rejects_undersized_pool() {
        let config = PoolConfig::default().with_size(1024);
        assert!(matches!(
            config.validate(),
            Err(TierError::PoolTooSmall { .. })
        ));
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let config = PoolConfig::default().with_alignment(3000);
        assert!(matches!(
            config.validate(),
            Err(TierError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_threshold_at_capacity() {
        let config = PoolConfig::default().with_promotion(4096, 4096);
        assert!(matches!(
            config.validate(),
            Err(TierError::InvalidConfig { .. })
        ));
    }
}
