//! Sparse per-version column deltas
//!
//! A delta holds the cells one commit changed in existing rows. Entries are
//! sorted by row id and grouped by base page: `block_ends[b]` is the
//! cumulative entry count through block `b`, and `offsets` holds the
//! in-block offset of every entry, so a lookup is one range fetch plus a
//! binary search inside that block's slice.

use std::collections::BTreeMap;

use crate::column::{block_of, offset_of};
use crate::error::{MvccError, Result};
use crate::memory::Buffer;
use crate::types::{NativeType, RowId};

/// Sorted row-id index of a delta
#[derive(Debug)]
pub struct DeltaIndex {
    block_ends: Vec<u32>,
    offsets: Buffer,
    size: usize,
}

impl DeltaIndex {
    /// Build from strictly ascending row ids, all inside the first `nblock` blocks
    pub fn from_rids(nblock: usize, rids: impl IntoIterator<Item = RowId>) -> Result<Self> {
        let rids = rids.into_iter();
        let mut pending: Vec<RowId> = Vec::new();
        pending
            .try_reserve_exact(rids.size_hint().0)
            .map_err(|e| MvccError::OutOfMemory(format!("delta index: {}", e)))?;
        pending.extend(rids);

        let mut block_ends = Vec::new();
        block_ends
            .try_reserve_exact(nblock)
            .map_err(|e| MvccError::OutOfMemory(format!("delta index: {}", e)))?;
        block_ends.resize(nblock, 0u32);

        let mut offsets = Buffer::alloc_elements::<u16>(pending.len())?;
        let slots = offsets.as_mut_slice::<u16>();
        let mut last: Option<RowId> = None;
        for (i, &rid) in pending.iter().enumerate() {
            if last.map_or(false, |prev| rid <= prev) {
                return Err(MvccError::InvalidArgument(format!(
                    "delta row ids must be strictly ascending, {} after {:?}",
                    rid, last
                )));
            }
            let block = block_of(rid);
            if block >= nblock {
                return Err(MvccError::InvalidArgument(format!(
                    "row id {} is beyond the {} base pages",
                    rid, nblock
                )));
            }
            slots[i] = offset_of(rid) as u16;
            block_ends[block] += 1;
            last = Some(rid);
        }

        let mut total = 0u32;
        for end in block_ends.iter_mut() {
            total += *end;
            *end = total;
        }

        Ok(Self {
            block_ends,
            offsets,
            size: pending.len(),
        })
    }

    /// Number of entries
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of base pages this index covers
    pub fn nblock(&self) -> usize {
        self.block_ends.len()
    }

    /// Entry range `[start, end)` of `block`; `(0, 0)` if the block is out of range
    pub fn block_range(&self, block: usize) -> (u32, u32) {
        if block >= self.block_ends.len() {
            return (0, 0);
        }
        let start = if block == 0 { 0 } else { self.block_ends[block - 1] };
        (start, self.block_ends[block])
    }

    /// Entry index of `rid`, if this delta has one
    pub fn find_idx(&self, rid: RowId) -> Option<usize> {
        let block = block_of(rid);
        if block >= self.block_ends.len() {
            return None;
        }
        let (start, end) = self.block_range(block);
        let offsets = &self.offsets.as_slice::<u16>()[start as usize..end as usize];
        offsets
            .binary_search(&(offset_of(rid) as u16))
            .ok()
            .map(|i| start as usize + i)
    }

    /// In-block offsets of `block`'s entries
    pub fn block_offsets(&self, block: usize) -> &[u16] {
        let (start, end) = self.block_range(block);
        &self.offsets.as_slice::<u16>()[start as usize..end as usize]
    }

    /// All row ids, ascending
    pub fn rids(&self) -> impl Iterator<Item = RowId> + '_ {
        (0..self.nblock()).flat_map(move |block| {
            self.block_offsets(block)
                .iter()
                .map(move |&off| ((block as u32) << 16) | off as u32)
        })
    }

    pub fn memory_usage(&self) -> usize {
        self.block_ends.capacity() * 4 + self.offsets.bsize()
    }
}

/// Changed cells of one commit
#[derive(Debug)]
pub struct ColumnDelta {
    index: DeltaIndex,
    data: Buffer,
    /// One byte per entry, allocated only when some entry is null
    nulls: Option<Buffer>,
}

impl ColumnDelta {
    /// Build from an ordered map of row id to new value (`None` is null)
    pub fn build<T: NativeType>(nblock: usize, updates: &BTreeMap<RowId, Option<T>>) -> Result<Self> {
        let index = DeltaIndex::from_rids(nblock, updates.keys().copied())?;
        let mut data = Buffer::alloc_elements::<T>(updates.len())?;
        let has_null = updates.values().any(Option::is_none);
        let mut nulls = if has_null {
            Some(Buffer::alloc(updates.len())?)
        } else {
            None
        };

        let values = data.as_mut_slice::<T>();
        for (i, value) in updates.values().enumerate() {
            match value {
                Some(v) => values[i] = *v,
                None => {
                    if let Some(flags) = nulls.as_mut() {
                        flags.as_mut_slice::<u8>()[i] = 1;
                    }
                }
            }
        }

        Ok(Self { index, data, nulls })
    }

    /// Merge-compaction of several deltas into one
    pub fn create_for_compaction(_deltas: &[&ColumnDelta]) -> Result<Self> {
        Err(MvccError::NotSupported("delta compaction".to_string()))
    }

    pub fn index(&self) -> &DeltaIndex {
        &self.index
    }

    pub fn size(&self) -> usize {
        self.index.size()
    }

    #[inline]
    pub fn find_idx(&self, rid: RowId) -> Option<usize> {
        self.index.find_idx(rid)
    }

    #[inline]
    pub fn value<T: NativeType>(&self, idx: usize) -> T {
        self.data.as_slice::<T>()[idx]
    }

    #[inline]
    pub fn is_null(&self, idx: usize) -> bool {
        self.nulls
            .as_ref()
            .map_or(false, |n| n.as_slice::<u8>()[idx] != 0)
    }

    pub fn has_nulls(&self) -> bool {
        self.nulls.is_some()
    }

    pub fn memory_usage(&self) -> usize {
        self.index.memory_usage()
            + self.data.bsize()
            + self.nulls.as_ref().map_or(0, Buffer::bsize)
    }
}
