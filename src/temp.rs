//! Ring-style temporary allocation.
//!
//! A [`Temporary`] hands out scratch memory with no deallocation: a cursor
//! runs through the region and, once it would pass the end, simply starts
//! over at the base. Allocations are therefore valid only until the cursor
//! laps them, which makes this suitable for short-lived values whose
//! combined working set stays well under the region size.
//!
//! Requests larger than half the region are refused outright; anything
//! smaller is guaranteed not to be overwritten by the very next allocation.

use core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull};

use crate::{polyfill::*, AllocInitError, BackingAllocator, BasePtr, Hooks, Raw};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// A ring-style scratch allocator.
pub struct Temporary<H: Hooks, A: BackingAllocator> {
    base: BasePtr,
    size: usize,
    cursor: NonZeroUsize,
    layout: Layout,
    hooks: H,
    backing_allocator: A,
}

impl<H: Hooks> Temporary<H, Raw> {
    /// Constructs a new `Temporary` over a caller-owned region.
    ///
    /// # Errors
    ///
    /// Returns an error (after invoking `hooks.bad_alloc()`) if `size` is
    /// zero or if `region` is not word-aligned.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes, and the
    /// memory must be unused by anything else for the allocator's lifetime.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        size: usize,
        hooks: H,
    ) -> Result<Temporary<H, Raw>, AllocInitError> {
        if size == 0 {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidConfig);
        }

        if region.addr().get() % core::mem::size_of::<usize>() != 0
            || region.addr().get().checked_add(size).is_none()
        {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidLocation);
        }

        let layout = Layout::from_size_align(size, core::mem::align_of::<usize>())
            .map_err(|_| AllocInitError::InvalidConfig)?;

        Ok(Temporary {
            base: BasePtr::new(region, size),
            size,
            cursor: region.addr(),
            layout,
            hooks,
            backing_allocator: Raw,
        })
    }
}

#[cfg(any(feature = "alloc", test))]
impl<H: Hooks> Temporary<H, Global> {
    /// Attempts to construct a new `Temporary` over a region of `size` bytes
    /// obtained from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or the global allocator fails.
    pub fn try_new(size: usize, hooks: H) -> Result<Temporary<H, Global>, AllocInitError> {
        if size == 0 {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidConfig);
        }

        let layout = Layout::from_size_align(size, core::mem::align_of::<usize>())
            .map_err(|_| AllocInitError::InvalidConfig)?;

        let region = unsafe {
            match NonNull::new(alloc::alloc::alloc(layout)) {
                Some(r) => r,
                None => {
                    hooks.bad_alloc();
                    return Err(AllocInitError::AllocFailed(layout));
                }
            }
        };

        Ok(Temporary {
            base: BasePtr::new(region, size),
            size,
            cursor: region.addr(),
            layout,
            hooks,
            backing_allocator: Global,
        })
    }
}

impl<H: Hooks, A: BackingAllocator> Temporary<H, A> {
    /// Attempts to allocate `size` bytes of scratch memory.
    ///
    /// When the cursor would pass the region's end, the allocation restarts
    /// at the base, silently reusing the oldest scratch space.
    ///
    /// # Errors
    ///
    /// Returns `None` (after invoking `hooks.bad_alloc()`) if `size` exceeds
    /// [`max_size`](Self::max_size).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > self.max_size() {
            self.hooks.bad_alloc();
            return None;
        }

        let mut pointer = self.cursor;
        let next = pointer.get() + size;
        if next >= self.base.limit().get() {
            pointer = self.base.addr();
            self.cursor = NonZeroUsize::new(self.base.addr().get() + size).unwrap();
        } else {
            self.cursor = NonZeroUsize::new(next).unwrap();
        }

        Some(self.base.with_addr(pointer))
    }

    /// Returns the largest serviceable request: half the region.
    pub fn max_size(&self) -> usize {
        self.size >> 1
    }
}

impl<H: Hooks, A: BackingAllocator> Drop for Temporary<H, A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), self.layout)
        };
    }
}

impl<H: Hooks, A: BackingAllocator> fmt::Debug for Temporary<H, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Temporary")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .finish()
    }
}
