use std::collections::BTreeMap;

use super::Arena;
use crate::error::{Error, Result};

/// Where backing regions come from.
pub trait RegionSource: Send {
    /// Returns a zeroed region of exactly `len` bytes, or `None` if the
    /// memory is not available right now.
    fn acquire(&mut self, len: usize) -> Option<Box<[u8]>>;
}

/// Heap-backed source using fallible reservation, optionally capped at a
/// fixed number of bytes.
#[derive(Debug, Default)]
pub struct HeapSource {
    limit: Option<usize>,
    handed_out: usize,
}

impl HeapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            handed_out: 0,
        }
    }
}

impl RegionSource for HeapSource {
    fn acquire(&mut self, len: usize) -> Option<Box<[u8]>> {
        if let Some(limit) = self.limit {
            if self.handed_out + len > limit {
                return None;
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(len).ok()?;
        data.resize(len, 0);
        self.handed_out += len;
        Some(data.into_boxed_slice())
    }
}

/// One contiguous chunk of backing memory and the arena address it was
/// registered at.
pub struct Region {
    base: u64,
    data: Box<[u8]>,
}

impl Region {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The memory behind an arena. Regions live until the pool is dropped.
pub struct RegionPool {
    regions: Vec<Region>,
    /// region base -> index into `regions`
    index: BTreeMap<u64, usize>,
    total: usize,
}

impl RegionPool {
    /// Reserves `target` bytes of backing memory in chunks of at most
    /// `max_span` bytes and registers each chunk with `arena`.
    ///
    /// When the source refuses a chunk the request size is halved; once it
    /// drops below `min_span` reservation stops. Falling short of `target`
    /// releases everything acquired so far.
    pub fn reserve(
        target: usize,
        max_span: usize,
        min_span: usize,
        source: &mut dyn RegionSource,
        arena: &mut Arena,
    ) -> Result<Self> {
        let mut pool = Self {
            regions: Vec::new(),
            index: BTreeMap::new(),
            total: 0,
        };

        let mut resid = target;
        let mut allocsz = max_span;
        let mut next_base = 0u64;

        while resid >= min_span && allocsz >= min_span {
            let datalen = allocsz.min(resid);
            let data = match source.acquire(datalen) {
                Some(data) => data,
                None => {
                    allocsz >>= 1;
                    tracing::debug!(
                        arena = arena.name(),
                        request = datalen,
                        next_request = allocsz,
                        "Region acquisition failed, shrinking request"
                    );
                    continue;
                }
            };

            arena.add_span(next_base, datalen as u64)?;
            pool.index.insert(next_base, pool.regions.len());
            pool.regions.push(Region {
                base: next_base,
                data,
            });
            pool.total += datalen;

            next_base += datalen as u64;
            resid -= datalen;
        }

        if resid > 0 {
            return Err(Error::Resource {
                requested: target as u64,
                acquired: pool.total as u64,
            });
        }

        tracing::debug!(
            arena = arena.name(),
            regions = pool.regions.len(),
            bytes = pool.total,
            "Reserved backing regions"
        );

        Ok(pool)
    }

    /// Copies `buf.len()` bytes starting at arena address `addr` into `buf`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) {
        let (region, offset) = self.locate(addr, buf.len());
        buf.copy_from_slice(&region.data[offset..offset + buf.len()]);
    }

    /// Copies `data` into the backing memory at arena address `addr`.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let idx = self.locate_index(addr, data.len());
        let region = &mut self.regions[idx];
        let offset = (addr - region.base) as usize;
        region.data[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    fn locate(&self, addr: u64, len: usize) -> (&Region, usize) {
        let idx = self.locate_index(addr, len);
        let region = &self.regions[idx];
        (region, (addr - region.base) as usize)
    }

    // Arena segments never straddle spans, so a miss here means the caller
    // handed us an address the arena did not produce.
    fn locate_index(&self, addr: u64, len: usize) -> usize {
        match self.index.range(..=addr).next_back() {
            Some((&base, &idx)) if addr + len as u64 <= base + self.regions[idx].len() as u64 => {
                idx
            }
            _ => panic!("address {:#x}+{} outside every region", addr, len),
        }
    }
}
