//! Primary key hash index
//!
//! Open addressing over cache-line sized chunks. Each 64-byte chunk holds
//! 12 one-byte tags, a fill count and 12 row ids. A lookup visits a probe
//! sequence of chunks and compares its tag against all 12 tags at once
//! (SSE2 on x86_64, scalar elsewhere); only tag matches are handed back to
//! the caller, which confirms them against the stored keys.
//!
//! The index never stores keys or full hashes, so it never decides key
//! equality itself.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use crate::error::{MvccError, Result};
use crate::types::RowId;

/// Entries per chunk
pub const CHUNK_CAPACITY: usize = 12;

/// Returned by [`HashIndex::find`] when no empty slot was reached
pub const NOSLOT: u32 = u32::MAX;

/// Target load factor is 12/14
const LOAD_NUM: usize = 12;
const LOAD_DEN: usize = 14;

#[repr(C, align(64))]
#[derive(Clone, Copy, Default)]
struct HashChunk {
    tags: [u8; CHUNK_CAPACITY],
    size: u32,
    values: [u32; CHUNK_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<HashChunk>() == 64);

/// A candidate returned by [`HashIndex::find`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Encoded slot position: `chunk << 4 | index`
    pub slot: u32,
    /// Stored row id
    pub value: RowId,
}

/// Probe counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashIndexStats {
    pub finds: u64,
    pub entries: u64,
    pub probes: u64,
    pub sets: u64,
}

#[derive(Default)]
struct Counters {
    finds: AtomicU64,
    entries: AtomicU64,
    probes: AtomicU64,
    sets: AtomicU64,
}

/// Tag-filtered hash index mapping key hashes to row ids
pub struct HashIndex {
    chunks: Vec<HashChunk>,
    chunk_mask: u64,
    size: usize,
    max_size: usize,
    counters: Counters,
}

#[inline]
fn tag_of(hash: u64) -> u8 {
    match hash as u8 {
        0 => 1,
        t => t,
    }
}

#[inline]
fn encode_slot(chunk: usize, idx: usize) -> u32 {
    ((chunk as u32) << 4) | idx as u32
}

/// Bit `i` is set when `tags[i] == tag`
#[inline]
fn match_tags(chunk: &HashChunk, tag: u8) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        // SSE2 is part of the x86_64 baseline
        unsafe { match_tags_sse2(chunk, tag) }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        match_tags_scalar(chunk, tag)
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn match_tags_sse2(chunk: &HashChunk, tag: u8) -> u32 {
    // first 16 bytes: 12 tags then the fill count, masked off below
    let lanes = _mm_load_si128(chunk as *const HashChunk as *const __m128i);
    let probe = _mm_set1_epi8(tag as i8);
    (_mm_movemask_epi8(_mm_cmpeq_epi8(lanes, probe)) as u32) & 0xfff
}

#[cfg_attr(target_arch = "x86_64", allow(dead_code))]
#[inline]
fn match_tags_scalar(chunk: &HashChunk, tag: u8) -> u32 {
    let mut mask = 0u32;
    for (i, &t) in chunk.tags.iter().enumerate() {
        if t == tag {
            mask |= 1 << i;
        }
    }
    mask
}

impl HashIndex {
    /// Create an index able to hold `capacity` entries below the target load
    pub fn new(capacity: usize) -> Result<Self> {
        let min_chunk = (capacity * LOAD_DEN / LOAD_NUM + CHUNK_CAPACITY - 1) / CHUNK_CAPACITY;
        let num_chunks = if min_chunk == 0 {
            0
        } else {
            min_chunk.checked_next_power_of_two().ok_or_else(|| {
                MvccError::OutOfMemory(format!("hash index capacity {} too large", capacity))
            })?
        };
        if num_chunks > (1 << 28) {
            return Err(MvccError::InvalidArgument(format!(
                "hash index capacity {} exceeds slot encoding",
                capacity
            )));
        }

        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(num_chunks)
            .map_err(|e| MvccError::OutOfMemory(format!("hash index of {} chunks: {}", num_chunks, e)))?;
        chunks.resize(num_chunks, HashChunk::default());

        Ok(Self {
            chunks,
            chunk_mask: num_chunks.saturating_sub(1) as u64,
            size: 0,
            max_size: num_chunks * CHUNK_CAPACITY * LOAD_NUM / LOAD_DEN,
            counters: Counters::default(),
        })
    }

    /// Number of stored entries
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total slots
    pub fn capacity(&self) -> usize {
        self.chunks.len() * CHUNK_CAPACITY
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Entries allowed before [`need_rehash`](Self::need_rehash) turns true
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// True once the load factor reaches 12/14
    pub fn need_rehash(&self) -> bool {
        self.size >= self.max_size
    }

    #[inline]
    fn start_chunk(&self, hash: u64) -> usize {
        ((hash >> 8) & self.chunk_mask) as usize
    }

    #[inline]
    fn step(&self, tag: u8) -> usize {
        // odd, so the probe sequence visits every chunk of the power-of-two table
        tag as usize * 2 + 1
    }

    /// Collect every entry whose tag matches `hash` into `entries` (cleared first),
    /// stopping at the first chunk with a free slot. Returns that free slot, or
    /// [`NOSLOT`] if every chunk was visited without finding one.
    pub fn find(&self, hash: u64, entries: &mut Vec<Entry>) -> u32 {
        entries.clear();
        self.counters.finds.fetch_add(1, Ordering::Relaxed);
        let n = self.chunks.len();
        if n == 0 {
            return NOSLOT;
        }
        let tag = tag_of(hash);
        let step = self.step(tag);
        let mut pos = self.start_chunk(hash);
        let mut probes = 0u64;
        let mut result = NOSLOT;

        for _ in 0..n {
            probes += 1;
            let chunk = &self.chunks[pos];
            let mut mask = match_tags(chunk, tag);
            while mask != 0 {
                let i = mask.trailing_zeros() as usize;
                entries.push(Entry {
                    slot: encode_slot(pos, i),
                    value: chunk.values[i],
                });
                mask &= mask - 1;
            }
            let size = chunk.size as usize;
            if size < CHUNK_CAPACITY {
                result = encode_slot(pos, size);
                break;
            }
            pos = (pos + step) & self.chunk_mask as usize;
        }

        self.counters.probes.fetch_add(probes, Ordering::Relaxed);
        self.counters
            .entries
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        result
    }

    /// Store `value` under `hash` in a slot returned by [`find`](Self::find).
    ///
    /// Writing the next free position of a chunk appends to it; writing an
    /// occupied position overwrites that entry.
    pub fn set(&mut self, slot: u32, hash: u64, value: RowId) -> Result<()> {
        let pos = (slot >> 4) as usize;
        let idx = (slot & 0xf) as usize;
        let chunk = self
            .chunks
            .get_mut(pos)
            .filter(|_| slot != NOSLOT && idx < CHUNK_CAPACITY)
            .ok_or_else(|| MvccError::InvalidArgument(format!("bad hash index slot {:#x}", slot)))?;
        let size = chunk.size as usize;
        if idx > size {
            return Err(MvccError::InvalidArgument(format!(
                "slot {:#x} is past the end of its chunk",
                slot
            )));
        }
        chunk.tags[idx] = tag_of(hash);
        chunk.values[idx] = value;
        if idx == size {
            chunk.size += 1;
            self.size += 1;
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append `value` under `hash` without looking at existing entries.
    /// Returns false if the probe sequence has no free slot.
    pub fn add(&mut self, hash: u64, value: RowId) -> bool {
        let n = self.chunks.len();
        if n == 0 {
            return false;
        }
        let tag = tag_of(hash);
        let step = self.step(tag);
        let mut pos = self.start_chunk(hash);
        for _ in 0..n {
            let chunk = &mut self.chunks[pos];
            let size = chunk.size as usize;
            if size < CHUNK_CAPACITY {
                chunk.tags[size] = tag;
                chunk.values[size] = value;
                chunk.size += 1;
                self.size += 1;
                return true;
            }
            pos = (pos + step) & self.chunk_mask as usize;
        }
        false
    }

    /// Deep copy for copy-on-write publication
    pub fn try_clone(&self) -> Result<Self> {
        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(self.chunks.len())
            .map_err(|e| MvccError::OutOfMemory(format!("hash index copy: {}", e)))?;
        chunks.extend_from_slice(&self.chunks);
        Ok(Self {
            chunks,
            chunk_mask: self.chunk_mask,
            size: self.size,
            max_size: self.max_size,
            counters: Counters::default(),
        })
    }

    pub fn stats(&self) -> HashIndexStats {
        HashIndexStats {
            finds: self.counters.finds.load(Ordering::Relaxed),
            entries: self.counters.entries.load(Ordering::Relaxed),
            probes: self.counters.probes.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
        }
    }

    pub fn clear_stats(&self) {
        self.counters.finds.store(0, Ordering::Relaxed);
        self.counters.entries.store(0, Ordering::Relaxed);
        self.counters.probes.store(0, Ordering::Relaxed);
        self.counters.sets.store(0, Ordering::Relaxed);
    }

    /// Log occupancy and probe statistics
    pub fn dump(&self) {
        let full = self
            .chunks
            .iter()
            .filter(|c| c.size as usize == CHUNK_CAPACITY)
            .count();
        let stats = self.stats();
        let per_find = |n: u64| {
            if stats.finds == 0 {
                0.0
            } else {
                n as f64 / stats.finds as f64
            }
        };
        debug!(
            size = self.size,
            capacity = self.capacity(),
            chunks = self.chunks.len(),
            full_chunks = full,
            finds = stats.finds,
            sets = stats.sets,
            entries_per_find = per_find(stats.entries),
            probes_per_find = per_find(stats.probes),
            "hash index"
        );
    }

    pub fn memory_usage(&self) -> usize {
        self.chunks.capacity() * std::mem::size_of::<HashChunk>()
    }
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hash_code;
    use proptest::prelude::*;

    #[test]
    fn test_sizing() {
        let index = HashIndex::new(1 << 16).unwrap();
        // 65536 * 14 / 12 / 12 rounds up to 6372 chunks, then to a power of two
        assert_eq!(index.num_chunks(), 8192);
        assert_eq!(index.capacity(), 8192 * 12);
        assert_eq!(index.max_size(), 8192 * 12 * 12 / 14);

        let empty = HashIndex::new(0).unwrap();
        assert_eq!(empty.capacity(), 0);
        let mut entries = Vec::new();
        assert_eq!(empty.find(1, &mut entries), NOSLOT);
    }

    #[test]
    fn test_simd_matches_scalar() {
        let mut chunk = HashChunk::default();
        chunk.tags = [3, 7, 3, 1, 0, 0, 3, 9, 9, 3, 0, 3];
        chunk.size = 0x0303_0303;
        for tag in [0u8, 1, 3, 7, 9, 200] {
            assert_eq!(match_tags(&chunk, tag), match_tags_scalar(&chunk, tag), "tag {}", tag);
        }
        assert_eq!(match_tags(&chunk, 3), 0b1010_0100_0101);
    }

    #[test]
    fn test_find_then_set() {
        let mut index = HashIndex::new(100).unwrap();
        let mut entries = Vec::new();
        for i in 0..50u32 {
            let h = hash_code(i as u64);
            let slot = index.find(h, &mut entries);
            assert_ne!(slot, NOSLOT);
            assert!(entries.iter().all(|e| e.value != i));
            index.set(slot, h, i).unwrap();
        }
        assert_eq!(index.size(), 50);
        for i in 0..50u32 {
            index.find(hash_code(i as u64), &mut entries);
            assert!(entries.iter().any(|e| e.value == i));
        }

        // overwriting an existing slot keeps the size
        index.find(hash_code(7), &mut entries);
        let e = *entries.iter().find(|e| e.value == 7).unwrap();
        index.set(e.slot, hash_code(7), 700).unwrap();
        assert_eq!(index.size(), 50);
        index.find(hash_code(7), &mut entries);
        assert!(entries.iter().any(|e| e.value == 700));

        assert!(index.set(NOSLOT, 1, 1).is_err());
        let stats = index.stats();
        assert!(stats.finds >= 102 && stats.sets == 51);
        index.dump();
        index.clear_stats();
        assert_eq!(index.stats(), HashIndexStats::default());
    }

    #[test]
    fn test_zero_tag_is_remapped() {
        let mut index = HashIndex::new(24).unwrap();
        assert!(index.add(0x1200, 5)); // low byte 0
        let mut entries = Vec::new();
        index.find(0x1200, &mut entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, 5);
        // a zero tag would have matched empty slots too
        index.find(0x1201, &mut entries);
        assert!(entries.iter().all(|e| e.value == 5));
    }

    #[test]
    fn test_need_rehash_threshold() {
        let mut index = HashIndex::new(1000).unwrap();
        let max = index.max_size();
        for i in 0..max as u32 {
            assert!(!index.need_rehash());
            assert!(index.add(hash_code(i as u64), i));
        }
        assert!(index.need_rehash());
    }

    #[test]
    fn test_add_fails_when_full() {
        let mut index = HashIndex::new(1).unwrap();
        assert_eq!(index.capacity(), 12);
        for i in 0..12 {
            assert!(index.add(i, i as u32));
        }
        assert!(!index.add(99, 99));
        let mut entries = Vec::new();
        assert_eq!(index.find(99, &mut entries), NOSLOT);
    }

    #[test]
    fn test_try_clone_is_independent() {
        let mut index = HashIndex::new(64).unwrap();
        index.add(hash_code(1), 1);
        let mut copy = index.try_clone().unwrap();
        copy.add(hash_code(2), 2);
        assert_eq!(index.size(), 1);
        assert_eq!(copy.size(), 2);
        let mut entries = Vec::new();
        index.find(hash_code(2), &mut entries);
        assert!(entries.iter().all(|e| e.value != 2));
    }

    proptest! {
        #[test]
        fn prop_added_values_are_found(keys in proptest::collection::hash_set(any::<u64>(), 1..2000)) {
            let mut index = HashIndex::new(keys.len()).unwrap();
            let keys: Vec<u64> = keys.into_iter().collect();
            for (i, k) in keys.iter().enumerate() {
                prop_assert!(index.add(hash_code(*k), i as u32));
            }
            let mut entries = Vec::new();
            for (i, k) in keys.iter().enumerate() {
                index.find(hash_code(*k), &mut entries);
                prop_assert!(entries.iter().any(|e| e.value == i as u32));
            }
        }
    }
}
