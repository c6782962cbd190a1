use crate::error::{Error, Result};

/// Native disk block size (`DEV_BSIZE`).
pub const DEV_BSIZE: usize = 512;

/// Page size the default disk size is rounded up to.
pub const PAGE_SIZE: usize = 4096;

/// Largest contiguous region requested while reserving backing memory.
pub const REGION_MAX_SIZE: usize = 1024 * 1024;

/// Largest single transfer handed to strategy by the read/write path.
pub const MAX_TRANSFER: usize = 64 * 1024;

/// Default logical size of the device.
pub const DEFAULT_DISK_SIZE: usize = (50 * 1000 * 1000 + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;

/// Configuration for a compressed RAM disk
#[derive(Debug, Clone)]
pub struct ZdConfig {
    /// Unit number; the device is named `zd<unit>` (default: 0)
    pub unit: u32,

    /// Logical capacity in bytes (default: 50MB rounded up to a page)
    pub disk_size: usize,

    /// Fixed block size (default: 512)
    pub block_size: usize,

    /// Largest region requested from the memory source (default: 1MB)
    pub region_max_size: usize,

    /// zstd compression level (default: zstd's default level)
    pub compression_level: i32,

    /// Number of codec contexts (default: available parallelism)
    pub workers: usize,

    /// Largest transfer issued by read/write (default: 64KB)
    pub max_transfer: usize,

    /// Cap on backing memory handed out by the heap source (default: none)
    pub memory_limit: Option<usize>,
}

impl Default for ZdConfig {
    fn default() -> Self {
        Self {
            unit: 0,
            disk_size: DEFAULT_DISK_SIZE,
            block_size: DEV_BSIZE,
            region_max_size: REGION_MAX_SIZE,
            compression_level: zstd::DEFAULT_COMPRESSION_LEVEL,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_transfer: MAX_TRANSFER,
            memory_limit: None,
        }
    }
}

impl ZdConfig {
    /// Create a config for the given unit number
    pub fn new(unit: u32) -> Self {
        Self {
            unit,
            ..Default::default()
        }
    }

    /// Set the logical disk size in bytes
    pub fn disk_size(mut self, size: usize) -> Self {
        self.disk_size = size;
        self
    }

    /// Set the fixed block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the maximum region size
    pub fn region_max_size(mut self, size: usize) -> Self {
        self.region_max_size = size;
        self
    }

    /// Set the zstd compression level
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Set the number of codec workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the maximum transfer size
    pub fn max_transfer(mut self, size: usize) -> Self {
        self.max_transfer = size;
        self
    }

    /// Limit the backing memory the heap source may hand out
    pub fn memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Device name, e.g. `zd0`
    pub fn xname(&self) -> String {
        format!("zd{}", self.unit)
    }

    /// Number of logical blocks
    pub fn block_count(&self) -> u64 {
        (self.disk_size / self.block_size) as u64
    }

    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || !(DEV_BSIZE..=65536).contains(&self.block_size) {
            return Err(Error::InvalidConfig(format!(
                "block size {} must be a power of two between {} and 65536",
                self.block_size, DEV_BSIZE
            )));
        }
        if self.disk_size == 0 || self.disk_size % self.block_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "disk size {} is not a non-zero multiple of the block size {}",
                self.disk_size, self.block_size
            )));
        }
        if self.region_max_size < self.block_size {
            return Err(Error::InvalidConfig(format!(
                "region size {} is smaller than the block size {}",
                self.region_max_size, self.block_size
            )));
        }
        if self.max_transfer == 0 || self.max_transfer % self.block_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "max transfer {} is not a non-zero multiple of the block size {}",
                self.max_transfer, self.block_size
            )));
        }
        if self.workers == 0 {
            return Err(Error::InvalidConfig("at least one worker is required".into()));
        }
        Ok(())
    }
}
