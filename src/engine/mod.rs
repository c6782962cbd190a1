//! Block I/O engine.
//!
//! Every logical block is compressed on write and decompressed on read. The
//! compressed payloads live in an arena carved out of pre-reserved backing
//! regions; the block map records where each payload sits.
//!
//! # Data Flow
//!
//! ## Write Path
//! 1. **Entry**: lock the block's map entry
//! 2. **Compress**: bind a codec slot and compress into its scratch buffer
//! 3. **Place**: under the backing lock, free the old payload if its size
//!    changed, reuse it if not, otherwise allocate a new segment
//! 4. **Copy**: copy the compressed bytes into the backing region
//!
//! ## Read Path
//! 1. **Sparse**: an unallocated entry reads as zeros without touching a codec
//! 2. **Stage**: copy the payload into a codec slot's scratch under the
//!    backing lock
//! 3. **Decompress**: inflate into the caller's buffer with no lock held but
//!    the codec slot's
//!
//! Locks are always taken in the order entry, codec slot, backing, so a
//! reader and a writer can never wait on each other in a cycle.

pub mod metrics;

pub use metrics::{Counters, EngineStats};

use std::sync::Mutex;

use crate::{
    arena::{Arena, RegionPool, RegionSource},
    blockmap::{BlockMap, Extent},
    codec::CodecPool,
    config::ZdConfig,
    error::{Error, Result},
};

/// Fixed-size block storage.
pub trait BlockStore: Send + Sync {
    /// Size in bytes of every block.
    fn block_size(&self) -> usize;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Stores one block of exactly `block_size()` bytes.
    fn write_block(&self, blkno: u64, data: &[u8]) -> Result<()>;

    /// Fills `out` (exactly `block_size()` bytes) with the block's content.
    fn read_block(&self, blkno: u64, out: &mut [u8]) -> Result<()>;
}

struct Backing {
    arena: Arena,
    regions: RegionPool,
}

pub struct BlockEngine {
    xname: String,
    block_size: usize,
    codecs: CodecPool,
    blocks: BlockMap,
    backing: Mutex<Backing>,
    counters: Counters,
}

impl BlockEngine {
    /// Builds the codec pool, reserves `disk_size` bytes of backing memory
    /// from `source` and sizes the block map.
    pub fn new(config: &ZdConfig, source: &mut dyn RegionSource) -> Result<Self> {
        config.validate()?;

        let codecs = CodecPool::new(
            config.workers,
            config.block_size,
            config.compression_level,
        )?;

        let mut arena = Arena::new(config.xname());
        let regions = RegionPool::reserve(
            config.disk_size,
            config.region_max_size,
            config.block_size,
            source,
            &mut arena,
        )?;

        Ok(Self {
            xname: config.xname(),
            block_size: config.block_size,
            codecs,
            blocks: BlockMap::new(config.block_count()),
            backing: Mutex::new(Backing { arena, regions }),
            counters: Counters::new(),
        })
    }

    /// Compresses `data` and stores it as block `blkno`.
    ///
    /// If the arena cannot hold the compressed payload the block is left
    /// unallocated (its old payload, if freed for being the wrong size, is
    /// gone) and `OutOfSpace` is returned.
    pub fn compress_block(&self, blkno: u64, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        let mut entry = self.blocks.entry(blkno)?;

        let mut codec = self.codecs.acquire()?;
        let payload = codec.context().compress(data)?;
        let len = payload.len();

        let mut backing = self.backing.lock()?;

        if let Some(old) = entry.extent {
            if old.len != len {
                backing.arena.free(old.addr, old.len);
                entry.extent = None;
                self.counters.block_free(old.len);
            }
        }

        let extent = match entry.extent {
            Some(extent) => {
                self.counters.block_reuse();
                extent
            }
            None => match backing.arena.allocate(len) {
                Ok(addr) => {
                    let extent = Extent { addr, len };
                    entry.extent = Some(extent);
                    self.counters.block_alloc(len);
                    extent
                }
                Err(Error::OutOfSpace { .. }) => {
                    self.counters.block_error();
                    tracing::warn!(
                        device = %self.xname,
                        blkno,
                        size = len,
                        available = backing.arena.available(),
                        largest_free = backing.arena.largest_free(),
                        "Block allocation failed"
                    );
                    return Err(Error::OutOfSpace { blkno, size: len });
                }
                Err(e) => {
                    self.counters.block_error();
                    return Err(e);
                }
            },
        };

        backing.regions.write(extent.addr, payload);
        Ok(())
    }

    /// Decompresses block `blkno` into `out`. Never-written blocks read as
    /// zeros.
    pub fn decompress_block(&self, blkno: u64, out: &mut [u8]) -> Result<()> {
        self.check_len(out.len())?;
        let entry = self.blocks.entry(blkno)?;

        let extent = match entry.extent {
            Some(extent) => extent,
            None => {
                self.counters.block_zero();
                out.fill(0);
                return Ok(());
            }
        };

        let mut codec = self.codecs.acquire()?;
        {
            let staged = codec.context().stage(extent.len)?;
            self.backing.lock()?.regions.read(extent.addr, staged);
        }
        drop(entry);

        match codec.context().decompress(out) {
            Ok(n) if n == out.len() => Ok(()),
            Ok(n) => self.corrupted(blkno, format!("inflated to {} of {} bytes", n, out.len())),
            Err(e) => self.corrupted(blkno, e.to_string()),
        }
    }

    pub fn xname(&self) -> &str {
        &self.xname
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Arena capacity and bytes in use.
    pub fn arena_usage(&self) -> Result<(u64, u64)> {
        let backing = self.backing.lock()?;
        Ok((backing.arena.size(), backing.arena.in_use()))
    }

    /// Number of backing regions reserved at construction.
    pub fn region_count(&self) -> Result<usize> {
        Ok(self.backing.lock()?.regions.len())
    }

    pub fn codec_workers(&self) -> usize {
        self.codecs.workers()
    }

    /// Collect and log metrics
    pub fn collect_metrics(&self) -> Result<()> {
        let (size, in_use) = self.arena_usage()?;
        let allocated = self.blocks.allocated()?;
        metrics::collect_metrics(&self.xname, &self.stats(), allocated, size, in_use);
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.block_size {
            return Err(Error::InvalidOperation(format!(
                "block transfer of {} bytes, expected {}",
                len, self.block_size
            )));
        }
        Ok(())
    }

    fn corrupted(&self, blkno: u64, reason: String) -> Result<()> {
        self.counters.block_error();
        tracing::error!(device = %self.xname, blkno, %reason, "Corrupted block payload");
        Err(Error::Corrupted { blkno, reason })
    }
}

impl BlockStore for BlockEngine {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks.len()
    }

    fn write_block(&self, blkno: u64, data: &[u8]) -> Result<()> {
        self.compress_block(blkno, data)
    }

    fn read_block(&self, blkno: u64, out: &mut [u8]) -> Result<()> {
        self.decompress_block(blkno, out)
    }
}

impl std::fmt::Debug for BlockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockEngine")
            .field("xname", &self.xname)
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks.len())
            .field("codecs", &self.codecs)
            .finish()
    }
}
