//! Per-worker compression state.
//!
//! Each worker slot owns a zstd compressor, a decompressor and a scratch
//! buffer large enough for the worst-case compressed form of one block. A
//! caller holds a slot through a [`CodecGuard`] for the duration of one block
//! operation; no other caller can touch that slot until the guard drops.
//!
//! Slot selection prefers a slot derived from the calling thread so a thread
//! keeps hitting warm state, then falls back to any idle slot, and only
//! blocks when every slot is busy.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    io,
    ops::Deref,
    sync::{Mutex, MutexGuard, TryLockError},
};

use zstd::bulk::{Compressor, Decompressor};

use crate::error::{Error, Result};

/// Worst-case compressed size of a `block_size` byte input.
pub fn scratch_size(block_size: usize) -> usize {
    zstd::zstd_safe::compress_bound(block_size)
}

pub struct CodecContext {
    compressor: Compressor<'static>,
    decompressor: Decompressor<'static>,
    scratch: Box<[u8]>,
    /// Bytes of valid data in `scratch`.
    filled: usize,
}

impl CodecContext {
    fn new(block_size: usize, level: i32) -> io::Result<Self> {
        Ok(Self {
            compressor: Compressor::new(level)?,
            decompressor: Decompressor::new()?,
            scratch: vec![0u8; scratch_size(block_size)].into_boxed_slice(),
            filled: 0,
        })
    }

    /// Compresses `input` into the scratch buffer and returns the compressed
    /// bytes. Every call starts a fresh frame; the context's tables carry over.
    pub fn compress(&mut self, input: &[u8]) -> Result<&[u8]> {
        self.filled = 0;
        let len = self
            .compressor
            .compress_to_buffer(input, &mut self.scratch[..])
            .map_err(Error::Codec)?;
        self.filled = len;
        Ok(&self.scratch[..len])
    }

    /// Copies a stored payload into scratch ahead of [`CodecContext::decompress`].
    pub fn stage(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > self.scratch.len() {
            return Err(Error::InvalidOperation(format!(
                "payload of {} bytes exceeds scratch buffer of {} bytes",
                len,
                self.scratch.len()
            )));
        }
        self.filled = len;
        Ok(&mut self.scratch[..len])
    }

    /// Decompresses the staged payload into `out`, returning the number of
    /// bytes produced.
    pub fn decompress(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let len = self.filled;
        self.filled = 0;
        self.decompressor
            .decompress_to_buffer(&self.scratch[..len], out)
    }

    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }
}

pub struct CodecPool {
    slots: Vec<Mutex<CodecContext>>,
}

impl CodecPool {
    pub fn new(workers: usize, block_size: usize, level: i32) -> Result<Self> {
        if workers == 0 {
            return Err(Error::InvalidConfig("codec pool needs at least one worker".into()));
        }

        let slots = (0..workers)
            .map(|_| CodecContext::new(block_size, level).map(Mutex::new))
            .collect::<io::Result<Vec<_>>>()
            .map_err(Error::Codec)?;

        Ok(Self { slots })
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    /// Binds the caller to a codec slot until the returned guard is dropped.
    pub fn acquire(&self) -> Result<CodecGuard<'_>> {
        let preferred = self.preferred_slot();
        let n = self.slots.len();

        for i in 0..n {
            let worker = (preferred + i) % n;
            match self.slots[worker].try_lock() {
                Ok(ctx) => return Ok(CodecGuard { worker, ctx }),
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => return Err(Error::MutexPoisoned),
            }
        }

        let ctx = self.slots[preferred].lock()?;
        Ok(CodecGuard {
            worker: preferred,
            ctx,
        })
    }

    fn preferred_slot(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() % self.slots.len() as u64) as usize
    }
}

impl std::fmt::Debug for CodecPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecPool")
            .field("workers", &self.slots.len())
            .finish()
    }
}

/// Exclusive use of one codec slot. Dropping the guard releases it.
pub struct CodecGuard<'a> {
    worker: usize,
    ctx: MutexGuard<'a, CodecContext>,
}

impl CodecGuard<'_> {
    pub fn worker_id(&self) -> usize {
        self.worker
    }

    pub fn context(&mut self) -> &mut CodecContext {
        &mut self.ctx
    }
}

impl Deref for CodecGuard<'_> {
    type Target = CodecContext;

    fn deref(&self) -> &CodecContext {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    fn random_block(seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; 512];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn roundtrip(guard: &mut CodecGuard<'_>, input: &[u8]) -> Vec<u8> {
        let compressed = guard.context().compress(input).unwrap().to_vec();
        guard.context().stage(compressed.len()).unwrap().copy_from_slice(&compressed);
        let mut out = vec![0xAAu8; input.len()];
        let n = guard.context().decompress(&mut out).unwrap();
        assert_eq!(n, input.len());
        out
    }

    #[test]
    fn test_scratch_holds_worst_case() {
        let pool = CodecPool::new(1, 512, 3).unwrap();
        let mut guard = pool.acquire().unwrap();
        assert_eq!(guard.scratch_len(), scratch_size(512));

        let data = random_block(1);
        let compressed = guard.context().compress(&data).unwrap();
        assert!(compressed.len() > 0);
        assert!(compressed.len() <= scratch_size(512));
    }

    #[test]
    fn test_zero_block_compresses_well() {
        let pool = CodecPool::new(1, 512, 3).unwrap();
        let mut guard = pool.acquire().unwrap();
        let len = guard.context().compress(&[0u8; 512]).unwrap().len();
        assert!(len < 64, "zero block compressed to {} bytes", len);
    }

    #[test]
    fn test_context_reuse_does_not_leak_state() {
        let pool = CodecPool::new(1, 512, 3).unwrap();
        let mut guard = pool.acquire().unwrap();

        let zeros = vec![0u8; 512];
        let random = random_block(7);
        let text: Vec<u8> = b"compressed ram disk ".iter().cycle().take(512).copied().collect();

        // Alternate inputs through the same context
        for _ in 0..3 {
            assert_eq!(roundtrip(&mut guard, &random), random);
            assert_eq!(roundtrip(&mut guard, &zeros), zeros);
            assert_eq!(roundtrip(&mut guard, &text), text);
        }

        // Same input always compresses to the same bytes
        let first = guard.context().compress(&text).unwrap().to_vec();
        guard.context().compress(&random).unwrap();
        let second = guard.context().compress(&text).unwrap().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let pool = CodecPool::new(1, 512, 3).unwrap();
        let mut guard = pool.acquire().unwrap();
        guard.context().stage(16).unwrap().copy_from_slice(&[0x5Au8; 16]);
        let mut out = vec![0u8; 512];
        assert!(guard.context().decompress(&mut out).is_err());
    }

    #[test]
    fn test_stage_rejects_oversized_payload() {
        let pool = CodecPool::new(1, 512, 3).unwrap();
        let mut guard = pool.acquire().unwrap();
        assert!(guard.context().stage(scratch_size(512) + 1).is_err());
    }

    #[test]
    fn test_acquire_distinct_slots() {
        let pool = CodecPool::new(4, 512, 3).unwrap();
        let guards: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();

        let mut ids: Vec<_> = guards.iter().map(|g| g.worker_id()).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        drop(guards);
        let guard = pool.acquire().unwrap();
        assert!(guard.worker_id() < 4);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = CodecPool::new(1, 512, 3).unwrap();
        let guard = pool.acquire().unwrap();

        std::thread::scope(|s| {
            let handle = s.spawn(|| pool.acquire().map(|g| g.worker_id()));
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(guard);
            assert_eq!(handle.join().unwrap().unwrap(), 0);
        });
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            CodecPool::new(0, 512, 3),
            Err(Error::InvalidConfig(_))
        ));
    }
}
