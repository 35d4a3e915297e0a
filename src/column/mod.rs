//! Versioned columns
//!
//! A [`Column`] stores one attribute of a sub-tablet as:
//! - **Base pages**: fixed blocks of [`BLOCK_SIZE`] rows holding the values
//!   of the base version, plus every row appended since
//! - **Deltas**: one sparse [`ColumnDelta`] per commit that updated rows
//! - **Versions**: ascending `(version, delta)` list; the entry at
//!   `base_idx` is fully represented by the base pages
//!
//! A published `Column` is never mutated. Writers work on private copies of
//! the page list and produce a new generation that shares every untouched
//! page and delta with the old one; readers keep whichever generation they
//! captured alive through `Arc`.

mod block;
mod delta;
mod reader;
mod writer;

pub use block::{ColumnBlock, ColumnValues};
pub use delta::{ColumnDelta, DeltaIndex};
pub use reader::{ColumnReader, TypedColumnReader};
pub use writer::{ColumnWriter, TypedColumnWriter};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MvccError, Result};
use crate::memory::{Buffer, Pod};
use crate::schema::ColumnSchema;
use crate::types::{PhysicalType, RowId, Version};

/// Rows per base page
pub const BLOCK_SIZE: usize = 1 << 16;
/// `rid >> BLOCK_SHIFT` is the page number
pub const BLOCK_SHIFT: u32 = 16;
/// `rid & BLOCK_MASK` is the offset in the page
pub const BLOCK_MASK: u32 = (BLOCK_SIZE as u32) - 1;

const MAX_GROWTH_STEP: usize = 256;
const GROWTH_PADDING: usize = 8;

#[inline]
pub fn block_of(rid: RowId) -> usize {
    (rid >> BLOCK_SHIFT) as usize
}

#[inline]
pub fn offset_of(rid: RowId) -> usize {
    (rid & BLOCK_MASK) as usize
}

/// Next capacity of a growing reference vector: add up to 256 slots, rounded to the padding.
pub(crate) fn expanded_capacity(current: usize) -> usize {
    let step = current.clamp(1, MAX_GROWTH_STEP);
    (current + step + GROWTH_PADDING - 1) / GROWTH_PADDING * GROWTH_PADDING
}

/// Copy `items` into a vector with room for at least one more element
pub(crate) fn clone_with_room<T: Clone>(items: &[T]) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve_exact(expanded_capacity(items.len()))
        .map_err(|e| MvccError::OutOfMemory(format!("reference vector: {}", e)))?;
    out.extend_from_slice(items);
    Ok(out)
}

/// One block of [`BLOCK_SIZE`] values with a lazily allocated null bitmap
pub struct ColumnPage {
    data: Buffer,
    nulls: Option<Buffer>,
}

impl ColumnPage {
    /// Allocate a zeroed page for elements of `esize` bytes
    pub fn alloc(esize: usize) -> Result<Self> {
        Ok(Self {
            data: Buffer::alloc(BLOCK_SIZE * esize)?,
            nulls: None,
        })
    }

    #[inline]
    pub fn values<T: Pod>(&self) -> &[T] {
        self.data.as_slice::<T>()
    }

    #[inline]
    pub fn values_mut<T: Pod>(&mut self) -> &mut [T] {
        self.data.as_mut_slice::<T>()
    }

    #[inline]
    pub fn is_null(&self, offset: usize) -> bool {
        match &self.nulls {
            Some(bits) => bits.as_slice::<u64>()[offset >> 6] & (1u64 << (offset & 63)) != 0,
            None => false,
        }
    }

    /// Mark `offset` null, allocating the bitmap on first use
    pub fn set_null(&mut self, offset: usize) -> Result<()> {
        if self.nulls.is_none() {
            self.nulls = Some(Buffer::alloc_elements::<u64>(BLOCK_SIZE / 64)?);
        }
        if let Some(bits) = self.nulls.as_mut() {
            bits.as_mut_slice::<u64>()[offset >> 6] |= 1u64 << (offset & 63);
        }
        Ok(())
    }

    pub fn set_not_null(&mut self, offset: usize) {
        if let Some(bits) = self.nulls.as_mut() {
            bits.as_mut_slice::<u64>()[offset >> 6] &= !(1u64 << (offset & 63));
        }
    }

    pub fn has_nulls(&self) -> bool {
        self.nulls.is_some()
    }

    /// Deep copy, used when a writer must modify a published page
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            data: self.data.try_clone()?,
            nulls: match &self.nulls {
                Some(bits) => Some(bits.try_clone()?),
                None => None,
            },
        })
    }

    pub fn memory_usage(&self) -> usize {
        self.data.bsize() + self.nulls.as_ref().map_or(0, Buffer::bsize)
    }
}

impl std::fmt::Debug for ColumnPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnPage")
            .field("bsize", &self.data.bsize())
            .field("has_nulls", &self.has_nulls())
            .finish()
    }
}

/// One entry of a column's version list
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: Version,
    /// `None` for the base version and for commits that only appended rows
    pub delta: Option<Arc<ColumnDelta>>,
}

/// Deltas a reader must consult, in priority order (first match wins)
pub(crate) struct CapturedVersion {
    pub real_version: Version,
    pub deltas: Vec<Arc<ColumnDelta>>,
}

/// Releases a column's writer token when dropped
pub(crate) struct WriteToken(Arc<AtomicBool>);

impl Drop for WriteToken {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A versioned column generation
pub struct Column {
    schema: ColumnSchema,
    storage_type: PhysicalType,
    base_idx: usize,
    base: Vec<Arc<ColumnPage>>,
    versions: Vec<VersionInfo>,
    /// Shared by every generation of this column
    writing: Arc<AtomicBool>,
}

impl Column {
    /// Create an empty column whose base version is `version`
    pub fn new(schema: ColumnSchema, version: Version) -> Result<Self> {
        let storage_type = schema.ptype;
        if storage_type.size().is_none() {
            return Err(MvccError::NotSupported(format!(
                "{} column {}",
                storage_type, schema.name
            )));
        }
        Ok(Self {
            schema,
            storage_type,
            base_idx: 0,
            base: Vec::new(),
            versions: vec![VersionInfo {
                version,
                delta: None,
            }],
            writing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A new generation sharing this column's token
    pub(crate) fn next_generation(
        &self,
        base: Vec<Arc<ColumnPage>>,
        versions: Vec<VersionInfo>,
    ) -> Self {
        Self {
            schema: self.schema.clone(),
            storage_type: self.storage_type,
            base_idx: self.base_idx,
            base,
            versions,
            writing: self.writing.clone(),
        }
    }

    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    pub fn storage_type(&self) -> PhysicalType {
        self.storage_type
    }

    /// Element size in bytes
    pub fn esize(&self) -> usize {
        self.storage_type.size().unwrap_or(0)
    }

    /// Row capacity of the allocated base pages
    pub fn capacity(&self) -> usize {
        self.base.len() * BLOCK_SIZE
    }

    pub fn base_pages(&self) -> &[Arc<ColumnPage>] {
        &self.base
    }

    pub fn base_version(&self) -> Version {
        self.versions[self.base_idx].version
    }

    pub fn latest_version(&self) -> Version {
        self.versions.last().map_or(0, |v| v.version)
    }

    pub(crate) fn version_list(&self) -> &[VersionInfo] {
        &self.versions
    }

    /// All retained versions, ascending
    pub fn versions(&self) -> Vec<Version> {
        self.versions.iter().map(|v| v.version).collect()
    }

    /// Number of versions that carry a delta
    pub fn num_deltas(&self) -> usize {
        self.versions.iter().filter(|v| v.delta.is_some()).count()
    }

    /// Resolve `version` to the newest retained version at or below it and the deltas to consult
    pub(crate) fn capture_version(&self, version: Version) -> Result<CapturedVersion> {
        let oldest = self.versions[0].version;
        if version < oldest {
            return Err(MvccError::NotFound(format!(
                "version {} of column {} (oldest retained is {})",
                version, self.schema.name, oldest
            )));
        }

        let mut deltas = Vec::new();
        let mut real_version = self.base_version();
        if version < real_version {
            // Entries before the base carry undo images; the one closest to
            // the target wins, so collect backwards and flip.
            for info in self.versions[..self.base_idx].iter().rev() {
                if let Some(delta) = &info.delta {
                    deltas.push(delta.clone());
                }
                real_version = info.version;
                if info.version <= version {
                    break;
                }
            }
            deltas.reverse();
        } else {
            for info in &self.versions[self.base_idx + 1..] {
                if info.version > version {
                    break;
                }
                if let Some(delta) = &info.delta {
                    deltas.push(delta.clone());
                }
                real_version = info.version;
            }
            // newest first
            deltas.reverse();
        }
        Ok(CapturedVersion {
            real_version,
            deltas,
        })
    }

    /// Open a snapshot reader at `version`
    pub fn read(self: &Arc<Self>, version: Version) -> Result<Box<dyn ColumnReader>> {
        let captured = self.capture_version(version)?;
        Ok(match self.storage_type {
            PhysicalType::Int8 => Box::new(TypedColumnReader::<i8>::new(self.clone(), captured)),
            PhysicalType::Int16 => Box::new(TypedColumnReader::<i16>::new(self.clone(), captured)),
            PhysicalType::Int32 => Box::new(TypedColumnReader::<i32>::new(self.clone(), captured)),
            PhysicalType::Int64 => Box::new(TypedColumnReader::<i64>::new(self.clone(), captured)),
            PhysicalType::Int128 => Box::new(TypedColumnReader::<i128>::new(self.clone(), captured)),
            PhysicalType::Float32 => Box::new(TypedColumnReader::<f32>::new(self.clone(), captured)),
            PhysicalType::Float64 => Box::new(TypedColumnReader::<f64>::new(self.clone(), captured)),
            PhysicalType::String => {
                return Err(MvccError::NotSupported("string column reader".to_string()))
            }
        })
    }

    /// Open the single writer of this column, based on the latest version
    pub fn write(self: &Arc<Self>) -> Result<Box<dyn ColumnWriter>> {
        let token = self.acquire_write_token()?;
        let captured = self.capture_version(self.latest_version())?;
        Ok(match self.storage_type {
            PhysicalType::Int8 => Box::new(TypedColumnWriter::<i8>::new(self.clone(), captured, token)?),
            PhysicalType::Int16 => Box::new(TypedColumnWriter::<i16>::new(self.clone(), captured, token)?),
            PhysicalType::Int32 => Box::new(TypedColumnWriter::<i32>::new(self.clone(), captured, token)?),
            PhysicalType::Int64 => Box::new(TypedColumnWriter::<i64>::new(self.clone(), captured, token)?),
            PhysicalType::Int128 => Box::new(TypedColumnWriter::<i128>::new(self.clone(), captured, token)?),
            PhysicalType::Float32 => Box::new(TypedColumnWriter::<f32>::new(self.clone(), captured, token)?),
            PhysicalType::Float64 => Box::new(TypedColumnWriter::<f64>::new(self.clone(), captured, token)?),
            PhysicalType::String => {
                return Err(MvccError::NotSupported("string column writer".to_string()))
            }
        })
    }

    fn acquire_write_token(&self) -> Result<WriteToken> {
        self.writing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| {
                MvccError::IllegalState(format!(
                    "column {} already has an active writer",
                    self.schema.name
                ))
            })?;
        Ok(WriteToken(self.writing.clone()))
    }

    /// Fold deltas up to `to_version` into the base pages
    pub fn delta_compaction(&self, to_version: Version) -> Result<Arc<Column>> {
        Err(MvccError::NotSupported(format!(
            "delta compaction of column {} to version {}",
            self.schema.name, to_version
        )))
    }

    pub fn memory_usage(&self) -> usize {
        let pages: usize = self.base.iter().map(|p| p.memory_usage()).sum();
        let deltas: usize = self
            .versions
            .iter()
            .filter_map(|v| v.delta.as_ref())
            .map(|d| d.memory_usage())
            .sum();
        pages + deltas
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.schema.name)
            .field("type", &self.storage_type)
            .field("pages", &self.base.len())
            .field("versions", &self.versions())
            .finish()
    }
}
