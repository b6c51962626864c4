//! Bin-caching allocator used by GPU device contexts
//!
//! Released blocks are kept in per-bin free lists and handed back to later
//! requests of the same bin, capped by `max_cached_bytes`. Bin sizes are
//! powers of `bin_growth` between `min_bin` and `max_bin`; larger requests
//! bypass the cache entirely.

use std::collections::HashMap;

use crate::error::{Error, Result};

pub const CONFIG_ENV_VAR: &str = "CT2_CUDA_CACHING_ALLOCATOR_CONFIG";

const DEFAULT_MAX_CACHED_BYTES: usize = 200 * (1 << 20); // 200MB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub bin_growth: u32,
    pub min_bin: u32,
    pub max_bin: u32,
    pub max_cached_bytes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            bin_growth: 4,
            min_bin: 3,
            max_bin: 12,
            max_cached_bytes: DEFAULT_MAX_CACHED_BYTES,
        }
    }
}

impl AllocatorConfig {
    /// Reads the configuration from `CT2_CUDA_CACHING_ALLOCATOR_CONFIG`,
    /// falling back to the defaults when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Parses `"bin_growth,min_bin,max_bin,max_cached_bytes"`.
    pub fn parse(value: &str) -> Result<Self> {
        let fields: Vec<&str> = value.split(',').collect();
        if fields.len() != 4 {
            return Err(Error::configuration(format!(
                "{} should have format: bin_growth,min_bin,max_bin,max_cached_bytes",
                CONFIG_ENV_VAR
            )));
        }
        let parse_field = |field: &str| -> Result<u64> {
            field
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::configuration(format!("invalid value in {}: {}", CONFIG_ENV_VAR, field)))
        };
        let config = AllocatorConfig {
            bin_growth: parse_field(fields[0])? as u32,
            min_bin: parse_field(fields[1])? as u32,
            max_bin: parse_field(fields[2])? as u32,
            max_cached_bytes: parse_field(fields[3])? as usize,
        };
        if config.bin_growth < 2 || config.min_bin > config.max_bin {
            return Err(Error::configuration(format!(
                "inconsistent {} value: {}",
                CONFIG_ENV_VAR, value
            )));
        }
        Ok(config)
    }

    /// Allocated size of bin `index`.
    pub fn bin_bytes(&self, index: u32) -> usize {
        (self.bin_growth as usize).pow(index)
    }

    /// Smallest bin holding `bytes`, or `None` when the request is larger
    /// than the biggest bin and must bypass the cache.
    pub fn bin_index(&self, bytes: usize) -> Option<u32> {
        let mut index = self.min_bin;
        while index <= self.max_bin {
            if self.bin_bytes(index) >= bytes {
                return Some(index);
            }
            index += 1;
        }
        None
    }
}

/// Device-specific block source backing a `CachingPool`.
pub trait BlockAllocator {
    type Block;

    fn allocate(&self, bytes: usize) -> Result<Self::Block>;
}

/// A block handed out by the pool, tagged with the bin it returns to.
pub struct PooledBlock<B> {
    pub block: B,
    pub bin: Option<u32>,
}

pub struct CachingPool<A: BlockAllocator> {
    config: AllocatorConfig,
    allocator: A,
    bins: HashMap<u32, Vec<A::Block>>,
    cached_bytes: usize,
}

impl<A: BlockAllocator> CachingPool<A> {
    pub fn new(config: AllocatorConfig, allocator: A) -> Self {
        CachingPool {
            config,
            allocator,
            bins: HashMap::new(),
            cached_bytes: 0,
        }
    }

    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    /// Takes a block of at least `bytes`, reusing a cached block of the same
    /// bin when one is available.
    pub fn get(&mut self, bytes: usize) -> Result<PooledBlock<A::Block>> {
        match self.config.bin_index(bytes) {
            Some(bin) => {
                if let Some(block) = self.bins.get_mut(&bin).and_then(Vec::pop) {
                    self.cached_bytes -= self.config.bin_bytes(bin);
                    return Ok(PooledBlock { block, bin: Some(bin) });
                }
                let block = self.allocator.allocate(self.config.bin_bytes(bin))?;
                Ok(PooledBlock { block, bin: Some(bin) })
            }
            // Oversized request: exact allocation, never cached.
            None => {
                let block = self.allocator.allocate(bytes)?;
                Ok(PooledBlock { block, bin: None })
            }
        }
    }

    /// Returns a block to its bin, or drops it when the cache is full or the
    /// block was oversized.
    pub fn put(&mut self, pooled: PooledBlock<A::Block>) {
        if let Some(bin) = pooled.bin {
            let bin_bytes = self.config.bin_bytes(bin);
            if self.cached_bytes + bin_bytes <= self.config.max_cached_bytes {
                self.bins.entry(bin).or_default().push(pooled.block);
                self.cached_bytes += bin_bytes;
            }
        }
    }
}
