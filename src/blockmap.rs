use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Location of a compressed payload inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub addr: u64,
    pub len: usize,
}

/// Per-block record. `None` means the block was never written (or its
/// payload was dropped) and reads as zeros.
#[derive(Debug, Default)]
pub struct BlockEntry {
    pub extent: Option<Extent>,
}

impl BlockEntry {
    pub fn is_allocated(&self) -> bool {
        self.extent.is_some()
    }

    /// Stored payload length, 0 when unallocated.
    pub fn len(&self) -> usize {
        self.extent.map_or(0, |e| e.len)
    }

    pub fn is_empty(&self) -> bool {
        self.extent.is_none()
    }
}

/// Dense map from block number to [`BlockEntry`].
///
/// Every entry has its own lock so that the check/free/allocate/update
/// sequence for one block is atomic with respect to other writers of that
/// block while different blocks proceed independently.
pub struct BlockMap {
    entries: Vec<Mutex<BlockEntry>>,
}

impl BlockMap {
    pub fn new(nblocks: u64) -> Self {
        let entries = (0..nblocks).map(|_| Mutex::new(BlockEntry::default())).collect();
        Self { entries }
    }

    pub fn entry(&self, blkno: u64) -> Result<MutexGuard<'_, BlockEntry>> {
        let entry = usize::try_from(blkno)
            .ok()
            .and_then(|idx| self.entries.get(idx))
            .ok_or(Error::OutOfRange {
                blkno,
                count: 1,
                capacity: self.entries.len() as u64,
            })?;
        Ok(entry.lock()?)
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries currently holding a payload.
    pub fn allocated(&self) -> Result<u64> {
        let mut count = 0;
        for entry in &self.entries {
            if entry.lock()?.is_allocated() {
                count += 1;
            }
        }
        Ok(count)
    }
}

impl std::fmt::Debug for BlockMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMap")
            .field("blocks", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_start_unallocated() {
        let map = BlockMap::new(16);
        assert_eq!(map.len(), 16);
        for blkno in 0..16 {
            let entry = map.entry(blkno).unwrap();
            assert!(!entry.is_allocated());
            assert_eq!(entry.len(), 0);
        }
        assert_eq!(map.allocated().unwrap(), 0);
    }

    #[test]
    fn test_entry_out_of_range() {
        let map = BlockMap::new(4);
        assert!(matches!(
            map.entry(4),
            Err(Error::OutOfRange {
                blkno: 4,
                capacity: 4,
                ..
            })
        ));
        assert!(map.entry(u64::MAX).is_err());
    }

    #[test]
    fn test_update_entry() {
        let map = BlockMap::new(4);
        map.entry(2).unwrap().extent = Some(Extent { addr: 64, len: 17 });

        let entry = map.entry(2).unwrap();
        assert!(entry.is_allocated());
        assert_eq!(entry.len(), 17);
        drop(entry);
        assert_eq!(map.allocated().unwrap(), 1);
    }
}
