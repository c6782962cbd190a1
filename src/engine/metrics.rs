use std::sync::atomic::{AtomicU64, Ordering};

/// Event counters maintained by the block engine.
#[derive(Debug, Default)]
pub struct Counters {
    blkalloc: AtomicU64,
    blkfree: AtomicU64,
    blkreuse: AtomicU64,
    blkzero: AtomicU64,
    blkerr: AtomicU64,
    zused: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn block_alloc(&self, len: usize) {
        self.blkalloc.fetch_add(1, Ordering::SeqCst);
        self.zused.fetch_add(len as u64, Ordering::SeqCst);
    }

    pub(crate) fn block_free(&self, len: usize) {
        self.blkfree.fetch_add(1, Ordering::SeqCst);
        self.zused.fetch_sub(len as u64, Ordering::SeqCst);
    }

    pub(crate) fn block_reuse(&self) {
        self.blkreuse.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn block_zero(&self) {
        self.blkzero.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn block_error(&self) {
        self.blkerr.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            blkalloc: self.blkalloc.load(Ordering::SeqCst),
            blkfree: self.blkfree.load(Ordering::SeqCst),
            blkreuse: self.blkreuse.load(Ordering::SeqCst),
            blkzero: self.blkzero.load(Ordering::SeqCst),
            blkerr: self.blkerr.load(Ordering::SeqCst),
            zused: self.zused.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Payload allocations made
    pub blkalloc: u64,
    /// Payloads freed because a rewrite changed the compressed size
    pub blkfree: u64,
    /// Rewrites stored in place
    pub blkreuse: u64,
    /// Reads of never-written blocks
    pub blkzero: u64,
    /// Failed block operations
    pub blkerr: u64,
    /// Bytes of compressed data currently stored
    pub zused: u64,
}

impl EngineStats {
    /// Blocks currently holding a payload.
    pub fn live_blocks(&self) -> u64 {
        self.blkalloc - self.blkfree
    }

    /// Ratio of logical bytes stored to compressed bytes used.
    pub fn compression_ratio(&self, block_size: usize) -> f64 {
        if self.zused == 0 {
            return 0.0;
        }
        (self.live_blocks() * block_size as u64) as f64 / self.zused as f64
    }

    /// Counter name, description and value, in listing order.
    pub fn describe(&self) -> [(&'static str, &'static str, u64); 6] {
        [
            ("blkalloc", "allocated blocks", self.blkalloc),
            ("blkfree", "freed blocks", self.blkfree),
            ("blkreuse", "reused blocks", self.blkreuse),
            ("blkzero", "unallocated block reads", self.blkzero),
            ("blkerr", "block allocation errors", self.blkerr),
            ("zused", "compressed data size", self.zused),
        ]
    }
}

/// Log the engine counters together with block map and arena occupancy
pub fn collect_metrics(
    xname: &str,
    stats: &EngineStats,
    allocated_blocks: u64,
    arena_size: u64,
    arena_in_use: u64,
) {
    tracing::info!(
        device = xname,
        blkalloc = stats.blkalloc,
        blkfree = stats.blkfree,
        blkreuse = stats.blkreuse,
        blkzero = stats.blkzero,
        blkerr = stats.blkerr,
        zused = stats.zused,
        live_blocks = stats.live_blocks(),
        allocated_blocks = allocated_blocks,
        arena_size = arena_size,
        arena_in_use = arena_in_use,
        "zd metrics"
    );
}
