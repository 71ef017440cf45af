//! Tuning knobs of the dynamic core.

use dynx86_backend::Protection;
use dynx86_frontend::BlockLimits;
use thiserror::Error;

/// Smallest accepted cache; anything less cannot hold the shared
/// trampoline plus a worst-case block.
pub const MIN_CACHE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cache size {size:#x} is below the minimum of {min:#x} bytes")]
    CacheTooSmall { size: usize, min: usize },
    #[error("block alignment {0} is not a power of two")]
    BadAlignment(usize),
    #[error("blocks must be allowed at least one instruction")]
    NoInstructions,
    #[error("per-block byte limit {limit:#x} must be below half the cache size {cache:#x}")]
    BlockBytes { limit: usize, cache: usize },
}

/// Dynamic core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynrecConfig {
    /// Executable arena size in bytes.
    pub cache_size: usize,
    pub max_block_insns: u32,
    /// Host code size at which translation of a block stops.
    pub max_block_bytes: usize,
    pub block_align: usize,
    pub protection: Protection,
    /// Chain direct branches between blocks.
    pub link_blocks: bool,
    /// Invalidations of one page before it is left to the
    /// interpreter until the next cache reset.
    pub smc_threshold: u32,
}

impl Default for DynrecConfig {
    fn default() -> Self {
        Self {
            cache_size: 8 * 1024 * 1024,
            max_block_insns: 32,
            max_block_bytes: 12 * 1024,
            block_align: 16,
            protection: Protection::WriteXorExecute,
            link_blocks: true,
            smc_threshold: 4,
        }
    }
}

impl DynrecConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size < MIN_CACHE_SIZE {
            return Err(ConfigError::CacheTooSmall {
                size: self.cache_size,
                min: MIN_CACHE_SIZE,
            });
        }
        if !self.block_align.is_power_of_two() {
            return Err(ConfigError::BadAlignment(self.block_align));
        }
        if self.max_block_insns == 0 {
            return Err(ConfigError::NoInstructions);
        }
        if self.max_block_bytes == 0 || self.max_block_bytes >= self.cache_size / 2 {
            return Err(ConfigError::BlockBytes {
                limit: self.max_block_bytes,
                cache: self.cache_size,
            });
        }
        Ok(())
    }

    pub fn limits(&self) -> BlockLimits {
        BlockLimits {
            max_insns: self.max_block_insns,
            max_bytes: self.max_block_bytes,
        }
    }
}
