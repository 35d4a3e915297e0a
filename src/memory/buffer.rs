//! Aligned, zero-initialized heap buffers
//!
//! Column pages, delta payloads and delta offsets all live in a [`Buffer`].
//! Large buffers are page aligned, small ones cache-line aligned, and a
//! failed allocation is reported as [`MvccError::OutOfMemory`] instead of
//! aborting the process.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::size_of;
use std::ptr::NonNull;

use crate::error::{MvccError, Result};

const PAGE_ALIGN: usize = 4096;
const LINE_ALIGN: usize = 64;

/// Plain-old-data element types a [`Buffer`] can be viewed as.
///
/// # Safety
///
/// Implementors must be `Copy`, have no padding, be valid for every bit
/// pattern (including all zeroes) and have alignment of at most 64.
pub unsafe trait Pod: Copy + Send + Sync + 'static {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl Pod for i8 {}
unsafe impl Pod for i16 {}
unsafe impl Pod for i32 {}
unsafe impl Pod for i64 {}
unsafe impl Pod for i128 {}
unsafe impl Pod for f32 {}
unsafe impl Pod for f64 {}

/// A single owned, aligned allocation
pub struct Buffer {
    ptr: NonNull<u8>,
    bsize: usize,
}

// Safety: Buffer uniquely owns its allocation; shared access is read-only.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// A buffer with no allocation behind it
    pub const fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            bsize: 0,
        }
    }

    /// Allocate `bsize` zeroed bytes
    pub fn alloc(bsize: usize) -> Result<Self> {
        if bsize == 0 {
            return Ok(Self::empty());
        }
        let layout = Self::layout(bsize)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            MvccError::OutOfMemory(format!("failed to allocate {} bytes", bsize))
        })?;
        Ok(Self { ptr, bsize })
    }

    /// Allocate a zeroed buffer holding `len` elements of `T`
    pub fn alloc_elements<T: Pod>(len: usize) -> Result<Self> {
        let bsize = len.checked_mul(size_of::<T>()).ok_or_else(|| {
            MvccError::OutOfMemory(format!("{} elements overflow the address space", len))
        })?;
        Self::alloc(bsize)
    }

    fn layout(bsize: usize) -> Result<Layout> {
        let align = if bsize >= PAGE_ALIGN { PAGE_ALIGN } else { LINE_ALIGN };
        Layout::from_size_align(bsize, align)
            .map_err(|e| MvccError::OutOfMemory(format!("bad layout for {} bytes: {}", bsize, e)))
    }

    /// Size in bytes
    #[inline]
    pub fn bsize(&self) -> usize {
        self.bsize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bsize == 0
    }

    /// View the buffer as a slice of `T`
    #[inline]
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        if self.bsize == 0 {
            return &[];
        }
        let len = self.bsize / size_of::<T>();
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const T, len) }
    }

    /// View the buffer as a mutable slice of `T`
    #[inline]
    pub fn as_mut_slice<T: Pod>(&mut self) -> &mut [T] {
        if self.bsize == 0 {
            return &mut [];
        }
        let len = self.bsize / size_of::<T>();
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut T, len) }
    }

    /// Zero every byte
    pub fn set_zero(&mut self) {
        self.as_mut_slice::<u8>().fill(0);
    }

    /// Deep copy into a fresh allocation
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::alloc(self.bsize)?;
        copy.as_mut_slice::<u8>().copy_from_slice(self.as_slice::<u8>());
        Ok(copy)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.bsize == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(self.bsize) {
            unsafe {
                dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("bsize", &self.bsize).finish()
    }
}
