//! Variable-size arena allocator for compressed block payloads.
//!
//! The arena manages an abstract address space assembled from one or more
//! spans. It never touches the memory behind those addresses; the region
//! pool owns that and resolves addresses to bytes.
//!
//! # Allocation policy
//!
//! Free segments are indexed twice:
//!
//! - by address, so a freed segment can find its neighbours and coalesce
//! - by `(length, address)`, so best-fit is a single ordered range lookup
//!
//! Coalescing never crosses a span boundary, even when two spans happen to
//! be adjacent in the address space.
//!
//! The arena does no locking of its own. Callers serialize access.

pub mod region;

pub use region::{HeapSource, Region, RegionPool, RegionSource};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Error, Result};

pub struct Arena {
    name: String,
    /// span base -> span length
    spans: BTreeMap<u64, u64>,
    /// free segment address -> length
    free_by_addr: BTreeMap<u64, u64>,
    /// (length, address) of every free segment
    free_by_size: BTreeSet<(u64, u64)>,
    /// outstanding allocations, address -> length
    allocated: HashMap<u64, u64>,
    size: u64,
    in_use: u64,
}

impl Arena {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spans: BTreeMap::new(),
            free_by_addr: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            allocated: HashMap::new(),
            size: 0,
            in_use: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `[base, base + len)` as backing address space.
    pub fn add_span(&mut self, base: u64, len: u64) -> Result<()> {
        let end = base
            .checked_add(len)
            .ok_or(Error::InvalidSpan { base, len })?;
        if len == 0 || self.overlaps_span(base, end) {
            return Err(Error::InvalidSpan { base, len });
        }

        self.spans.insert(base, len);
        self.insert_free(base, len);
        self.size += len;
        Ok(())
    }

    /// Returns the address of a segment of exactly `size` bytes, carved from
    /// the smallest free segment that fits.
    ///
    /// Contents are whatever the previous owner left behind.
    pub fn allocate(&mut self, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidOperation(format!(
                "{}: zero-length allocation",
                self.name
            )));
        }
        let size = size as u64;

        let (seg_len, seg_addr) = match self.free_by_size.range((size, 0)..).next() {
            Some(&fit) => fit,
            None => {
                return Err(Error::OutOfSpace {
                    blkno: 0,
                    size: size as usize,
                })
            }
        };

        self.remove_free(seg_addr, seg_len);
        if seg_len > size {
            self.insert_free(seg_addr + size, seg_len - size);
        }

        self.allocated.insert(seg_addr, size);
        self.in_use += size;
        Ok(seg_addr)
    }

    /// Returns a segment obtained from [`Arena::allocate`].
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not an outstanding allocation of exactly `size`
    /// bytes. The arena's bookkeeping cannot be trusted after such a call.
    pub fn free(&mut self, addr: u64, size: usize) {
        let size = size as u64;
        match self.allocated.get(&addr) {
            Some(&len) if len == size => {}
            Some(&len) => panic!(
                "{}: free of {:#x} with size {} but {} bytes were allocated",
                self.name, addr, size, len
            ),
            None => panic!("{}: free of unallocated segment {:#x}", self.name, addr),
        }
        self.allocated.remove(&addr);
        self.in_use -= size;

        let (span_base, span_len) = self.span_of(addr);
        let span_end = span_base + span_len;

        let mut start = addr;
        let mut len = size;

        // Merge with the segment that ends where this one starts.
        if let Some((&prev_addr, &prev_len)) = self.free_by_addr.range(..addr).next_back() {
            if prev_addr + prev_len == addr && prev_addr >= span_base {
                self.remove_free(prev_addr, prev_len);
                start = prev_addr;
                len += prev_len;
            }
        }

        // Merge with the segment that starts where this one ends.
        let end = addr + size;
        if end < span_end {
            if let Some(&next_len) = self.free_by_addr.get(&end) {
                self.remove_free(end, next_len);
                len += next_len;
            }
        }

        self.insert_free(start, len);
    }

    /// Total bytes contributed by spans.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes held by outstanding allocations.
    pub fn in_use(&self) -> u64 {
        self.in_use
    }

    pub fn available(&self) -> u64 {
        self.size - self.in_use
    }

    /// Length of the largest free segment, i.e. the largest allocation that
    /// can currently succeed.
    pub fn largest_free(&self) -> u64 {
        self.free_by_size
            .iter()
            .next_back()
            .map(|&(len, _)| len)
            .unwrap_or(0)
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocated.len()
    }

    fn overlaps_span(&self, base: u64, end: u64) -> bool {
        if let Some((&prev_base, &prev_len)) = self.spans.range(..end).next_back() {
            if prev_base + prev_len > base {
                return true;
            }
        }
        false
    }

    fn span_of(&self, addr: u64) -> (u64, u64) {
        match self.spans.range(..=addr).next_back() {
            Some((&base, &len)) if addr < base + len => (base, len),
            _ => panic!("{}: address {:#x} outside every span", self.name, addr),
        }
    }

    fn insert_free(&mut self, addr: u64, len: u64) {
        self.free_by_addr.insert(addr, len);
        self.free_by_size.insert((len, addr));
    }

    fn remove_free(&mut self, addr: u64, len: u64) {
        self.free_by_addr.remove(&addr);
        self.free_by_size.remove(&(len, addr));
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("spans", &self.spans.len())
            .field("size", &self.size)
            .field("in_use", &self.in_use)
            .field("free_segments", &self.free_by_addr.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_spans(spans: &[(u64, u64)]) -> Arena {
        let mut arena = Arena::new("test");
        for &(base, len) in spans {
            arena.add_span(base, len).expect("Failed to add span");
        }
        arena
    }

    #[test]
    fn test_add_span() {
        let mut arena = arena_with_spans(&[(0, 1024), (4096, 512)]);
        assert_eq!(arena.size(), 1536);
        assert_eq!(arena.span_count(), 2);
        assert_eq!(arena.largest_free(), 1024);

        // Overlapping and empty spans are rejected
        assert!(matches!(
            arena.add_span(512, 1024),
            Err(Error::InvalidSpan { .. })
        ));
        assert!(matches!(
            arena.add_span(4000, 100),
            Err(Error::InvalidSpan { .. })
        ));
        assert!(arena.add_span(8192, 0).is_err());
        assert_eq!(arena.size(), 1536);

        // Adjacent is fine
        arena.add_span(1024, 1024).unwrap();
        assert_eq!(arena.span_count(), 3);
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let mut arena = arena_with_spans(&[(0, 4096)]);
        let mut segments = Vec::new();
        for size in [10usize, 100, 37, 512, 1, 999] {
            let addr = arena.allocate(size).unwrap();
            segments.push((addr, addr + size as u64));
        }

        segments.sort();
        for pair in segments.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "segments overlap: {:?}", pair);
        }
        for &(_, end) in &segments {
            assert!(end <= 4096);
        }
        assert_eq!(arena.in_use(), 10 + 100 + 37 + 512 + 1 + 999);
    }

    #[test]
    fn test_best_fit() {
        let mut arena = arena_with_spans(&[(0, 1000), (10_000, 100), (20_000, 300)]);

        // The 100 byte span is the tightest fit
        assert_eq!(arena.allocate(90).unwrap(), 10_000);
        // 300 byte span beats the 1000 byte one
        assert_eq!(arena.allocate(250).unwrap(), 20_000);
        // Only the big span is left for this one
        assert_eq!(arena.allocate(200).unwrap(), 0);
    }

    #[test]
    fn test_out_of_space() {
        let mut arena = arena_with_spans(&[(0, 512), (1024, 512)]);
        assert!(matches!(
            arena.allocate(600),
            Err(Error::OutOfSpace { size: 600, .. })
        ));

        arena.allocate(512).unwrap();
        arena.allocate(500).unwrap();
        assert_eq!(arena.largest_free(), 12);
        assert!(arena.allocate(13).is_err());
        assert!(arena.allocate(12).is_ok());
        assert_eq!(arena.available(), 0);
    }

    #[test]
    fn test_free_coalesces() {
        let mut arena = arena_with_spans(&[(0, 300)]);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        let c = arena.allocate(100).unwrap();
        assert_eq!(arena.largest_free(), 0);

        arena.free(a, 100);
        arena.free(c, 100);
        assert_eq!(arena.largest_free(), 100);

        // Freeing the middle merges all three back into one segment
        arena.free(b, 100);
        assert_eq!(arena.largest_free(), 300);
        assert_eq!(arena.in_use(), 0);
        assert_eq!(arena.allocation_count(), 0);
        assert_eq!(arena.allocate(300).unwrap(), 0);
    }

    #[test]
    fn test_no_coalescing_across_spans() {
        let mut arena = arena_with_spans(&[(0, 100), (100, 100)]);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        arena.free(a, 100);
        arena.free(b, 100);

        assert_eq!(arena.largest_free(), 100);
        assert!(arena.allocate(150).is_err());
    }

    #[test]
    fn test_reuse_after_free() {
        let mut arena = arena_with_spans(&[(0, 256)]);
        let a = arena.allocate(256).unwrap();
        assert!(arena.allocate(1).is_err());
        arena.free(a, 256);
        assert_eq!(arena.allocate(256).unwrap(), a);
    }

    #[test]
    fn test_zero_size_allocation() {
        let mut arena = arena_with_spans(&[(0, 256)]);
        assert!(matches!(
            arena.allocate(0),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    #[should_panic(expected = "free of unallocated segment")]
    fn test_free_unknown_address_panics() {
        let mut arena = arena_with_spans(&[(0, 256)]);
        arena.allocate(16).unwrap();
        arena.free(128, 16);
    }

    #[test]
    #[should_panic(expected = "bytes were allocated")]
    fn test_free_wrong_size_panics() {
        let mut arena = arena_with_spans(&[(0, 256)]);
        let a = arena.allocate(16).unwrap();
        arena.free(a, 32);
    }

    #[test]
    #[should_panic(expected = "free of unallocated segment")]
    fn test_double_free_panics() {
        let mut arena = arena_with_spans(&[(0, 256)]);
        let a = arena.allocate(16).unwrap();
        arena.free(a, 16);
        arena.free(a, 16);
    }
}
