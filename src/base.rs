use core::{
    mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::polyfill::*;

/// A pointer to the base of the region of memory managed by an allocator.
///
/// All block bookkeeping in this crate stores plain addresses rather than
/// pointers; this avoids accidentally violating stacked borrows, since an
/// address implies no borrow. Any actual pointer into the region must be
/// reconstituted through a `BasePtr`, and NOT by casting an address directly,
/// so that every access carries the region's provenance.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Returns the address one past the end of the region.
    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        NonZeroUsize::new(self.ptr.addr().get() + self.extent).unwrap()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr));

        let ptr = self.ptr.as_ptr().with_addr(addr.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Reads a `T` from the region at `addr`.
    ///
    /// Reads are by-value; metadata mutation in this crate is a read, a
    /// computation on the copy, and a write-back, which keeps long-lived
    /// references out of the region entirely.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be aligned for `T` and `[addr, addr + size_of::<T>())`
    ///   must lie within the region.
    /// - The memory at `addr` must contain a properly initialized `T`.
    #[inline]
    pub unsafe fn read_at<T: Copy>(self, addr: NonZeroUsize) -> T {
        debug_assert!(self.contains_addr(addr));
        debug_assert_eq!(addr.get() % mem::align_of::<T>(), 0);

        unsafe { self.with_addr(addr).cast::<T>().as_ptr().read() }
    }

    /// Writes a `T` into the region at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be aligned for `T` and `[addr, addr + size_of::<T>())`
    ///   must lie within the region.
    /// - The memory at `addr` must be unused by any live allocation other
    ///   than the metadata slot being written.
    #[inline]
    pub unsafe fn write_at<T>(self, addr: NonZeroUsize, value: T) {
        debug_assert!(self.contains_addr(addr));
        debug_assert_eq!(addr.get() % mem::align_of::<T>(), 0);

        unsafe { self.with_addr(addr).cast::<T>().as_ptr().write(value) }
    }
}
