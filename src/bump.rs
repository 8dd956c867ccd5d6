//! Bump allocation.
//!
//! A bump allocator is the simplest and fastest allocator there is: a
//! single cursor advances monotonically through the region and nothing is
//! ever freed.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(1)      | O(1)       |
//!
//! #### Concurrency
//!
//! Unlike the rest of the crate, [`Bump`] takes `&self` everywhere: the
//! cursor is an atomic and `allocate` is a single fetch-add, so it may be
//! shared between threads without any locking. It is the only allocator in
//! this crate with internal multi-thread semantics.
//!
//! Requests are raw byte counts; the allocator hands out addresses exactly
//! as dense as the request stream, so callers wanting aligned blocks must
//! request aligned sizes.

use core::{
    alloc::Layout,
    fmt,
    num::NonZeroUsize,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    polyfill::*, AllocInitError, BackingAllocator, BasePtr, Hooks, Raw, MAX_ALIGN,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// A monotonic bump allocator.
pub struct Bump<H: Hooks, A: BackingAllocator> {
    base: BasePtr,
    size: usize,
    cursor: AtomicUsize,
    layout: Layout,
    hooks: H,
    backing_allocator: A,
}

impl<H: Hooks> Bump<H, Raw> {
    /// Constructs a new `Bump` over a caller-owned region.
    ///
    /// # Errors
    ///
    /// Returns an error (after invoking `hooks.bad_alloc()`) unless both
    /// `region` and `size` are [`MAX_ALIGN`]-aligned.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes, and the
    /// memory must be unused by anything else for the allocator's lifetime.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        size: usize,
        hooks: H,
    ) -> Result<Bump<H, Raw>, AllocInitError> {
        if size % MAX_ALIGN != 0 {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidConfig);
        }

        if region.addr().get() % MAX_ALIGN != 0
            || region.addr().get().checked_add(size).is_none()
        {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidLocation);
        }

        let layout = Layout::from_size_align(size.max(1), MAX_ALIGN)
            .map_err(|_| AllocInitError::InvalidConfig)?;

        Ok(Bump {
            base: BasePtr::new(region, size),
            size,
            cursor: AtomicUsize::new(region.addr().get()),
            layout,
            hooks,
            backing_allocator: Raw,
        })
    }
}

#[cfg(any(feature = "alloc", test))]
impl<H: Hooks> Bump<H, Global> {
    /// Attempts to construct a new `Bump` over a region of `size` bytes
    /// obtained from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or not [`MAX_ALIGN`]-aligned, or
    /// if the global allocator fails.
    pub fn try_new(size: usize, hooks: H) -> Result<Bump<H, Global>, AllocInitError> {
        if size == 0 || size % MAX_ALIGN != 0 {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidConfig);
        }

        let layout = Layout::from_size_align(size, MAX_ALIGN)
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

        Ok(Bump {
            base: BasePtr::new(region, size),
            size,
            cursor: AtomicUsize::new(region.addr().get()),
            layout,
            hooks,
            backing_allocator: Global,
        })
    }
}

impl<H: Hooks, A: BackingAllocator> Bump<H, A> {
    /// Attempts to allocate `size` bytes.
    ///
    /// The cursor advances atomically; on success the returned pointer is
    /// the cursor's previous position. Once the region is exhausted every
    /// further call reports `hooks.bad_alloc()` and returns `None`.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let old = self.cursor.fetch_add(size, Ordering::Relaxed);

        let fits = old
            .checked_add(size)
            .map_or(false, |new| new <= self.base.limit().get());

        if !fits {
            self.hooks.bad_alloc();
            return None;
        }

        // SAFETY: `old` started at the non-null base and only grows.
        let addr = unsafe { NonZeroUsize::new_unchecked(old) };

        // Not `BasePtr::with_addr`: a zero-size allocation of the very last
        // byte yields a one-past-the-end pointer, which is legal to hand out.
        Some(self.base.ptr().with_addr(addr))
    }

    /// Returns the number of bytes not yet handed out.
    pub fn free_space(&self) -> usize {
        self.base
            .limit()
            .get()
            .saturating_sub(self.cursor.load(Ordering::Relaxed))
    }

    /// Returns the size of the managed region.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl<H: Hooks, A: BackingAllocator> Drop for Bump<H, A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), self.layout)
        };
    }
}

impl<H: Hooks, A: BackingAllocator> fmt::Debug for Bump<H, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bump")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .finish()
    }
}
