//! A fixed-slot pool allocator.
//!
//! A [`Pool`] hands out uniform slots from a chunk of
//! `(pool_size + 1) * slot` bytes, where `slot` is the node size rounded up
//! to a machine word. Free slots form an intrusive singly-linked freelist
//! through their first word. The final slot is a sentinel that is never
//! handed out, so the empty test is a single address comparison.
//!
//! The Fibonacci allocator carves one of these out of its managed region to
//! back its free-set nodes; the pool is equally usable on its own for any
//! fixed-size-node workload. Only single-element requests are supported.

use core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull};

use crate::{
    align_up, free_set::NodeSource, plan::WORD, polyfill::*, AllocError, AllocInitError,
    BackingAllocator, BasePtr, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// A link in the freelist, embedded in the first word of each free slot.
#[repr(C)]
#[derive(Copy, Clone)]
struct SlotLink {
    next: Option<NonZeroUsize>,
}

/// A fixed-slot freelist allocator.
pub struct Pool<A: BackingAllocator> {
    base: BasePtr,
    slot_bytes: usize,
    first: NonZeroUsize,
    prohibited: NonZeroUsize,
    layout: Layout,
    backing_allocator: A,
}

impl Pool<Raw> {
    /// Constructs a new `Pool` of `pool_size` usable slots of `node_size`
    /// bytes each from a raw pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if `node_size` is zero or if `region` is not aligned
    /// to a machine word.
    ///
    /// # Safety
    ///
    /// `region` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`Self::region_layout(pool_size, node_size)`], and it must
    /// be valid for reads and writes for the entire size indicated by that
    /// `Layout`.
    ///
    /// [`Self::region_layout(pool_size, node_size)`]: Pool::region_layout
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        pool_size: usize,
        node_size: usize,
    ) -> Result<Pool<Raw>, AllocInitError> {
        let layout = Self::region_layout(pool_size, node_size)?;

        if region.addr().get() % WORD != 0 {
            return Err(AllocInitError::InvalidLocation);
        }

        region
            .addr()
            .get()
            .checked_add(layout.size())
            .ok_or(AllocInitError::InvalidLocation)?;

        let base = BasePtr::new(region, layout.size());
        let slot_bytes = align_up(node_size, WORD).unwrap();

        Ok(unsafe { RawPool::new(base, slot_bytes, pool_size, layout).with_backing_allocator(Raw) })
    }
}

#[cfg(any(feature = "alloc", test))]
impl Pool<Global> {
    /// Attempts to construct a new `Pool` of `pool_size` usable slots of
    /// `node_size` bytes each, backed by the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or if sufficient
    /// memory could not be allocated from the global allocator.
    pub fn try_new(pool_size: usize, node_size: usize) -> Result<Pool<Global>, AllocInitError> {
        let layout = Self::region_layout(pool_size, node_size)?;

        let region = unsafe {
            let raw = alloc::alloc::alloc(layout);
            NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))?
        };

        let base = BasePtr::new(region, layout.size());
        let slot_bytes = align_up(node_size, WORD).unwrap();

        Ok(unsafe {
            RawPool::new(base, slot_bytes, pool_size, layout).with_backing_allocator(Global)
        })
    }
}

impl<A: BackingAllocator> Pool<A> {
    /// Returns the layout requirements of the chunk managed by a `Pool` with
    /// the given configuration.
    ///
    /// The chunk holds `pool_size + 1` slots: one extra for the sentinel.
    pub fn region_layout(pool_size: usize, node_size: usize) -> Result<Layout, AllocInitError> {
        if node_size == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let slot = align_up(node_size, WORD).ok_or(AllocInitError::InvalidConfig)?;
        let total = pool_size
            .checked_add(1)
            .and_then(|slots| slots.checked_mul(slot))
            .ok_or(AllocInitError::InvalidConfig)?;

        Layout::from_size_align(total, WORD).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns whether at least one slot is free.
    #[inline]
    pub fn has_free(&self) -> bool {
        self.first != self.prohibited
    }

    /// Attempts to allocate one slot.
    ///
    /// Only single-element requests are supported: `layout` must fit within
    /// one slot and must not demand more than word alignment.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no slot is free or if `layout` does not fit a slot.
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() > self.slot_bytes || layout.align() > WORD {
            return Err(AllocError);
        }

        let slot = self.pop().ok_or(AllocError)?;

        Ok(self.base.with_addr_and_size(slot, self.slot_bytes))
    }

    /// Deallocates the slot referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a slot previously allocated from this pool, and it
    /// must not be deallocated twice.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.push(ptr.addr()) };
    }

    fn pop(&mut self) -> Option<NonZeroUsize> {
        if self.first == self.prohibited {
            return None;
        }

        let slot = self.first;
        let link = unsafe { self.base.read_at::<SlotLink>(slot) };
        self.first = link.next.expect("freelist broken before the sentinel");

        Some(slot)
    }

    unsafe fn push(&mut self, slot: NonZeroUsize) {
        debug_assert!(self.base.contains_addr(slot));
        debug_assert_eq!(slot.get() % WORD, 0);

        unsafe {
            self.base.write_at(
                slot,
                SlotLink {
                    next: Some(self.first),
                },
            );
        }
        self.first = slot;
    }
}

impl<A: BackingAllocator> NodeSource for Pool<A> {
    fn acquire(&mut self, layout: Layout) -> Option<NonZeroUsize> {
        if layout.size() > self.slot_bytes || layout.align() > WORD {
            return None;
        }

        self.pop()
    }

    unsafe fn release(&mut self, node: NonZeroUsize, _layout: Layout) {
        unsafe { self.push(node) };
    }
}

impl<A: BackingAllocator> Drop for Pool<A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), self.layout)
        };
    }
}

impl<A: BackingAllocator> fmt::Debug for Pool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("base", &self.base)
            .field("slot_bytes", &self.slot_bytes)
            .field("first", &self.first)
            .field("prohibited", &self.prohibited)
            .finish()
    }
}

/// Like a `Pool`, but without a `Drop` impl or an associated allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `Pool` itself cannot.
struct RawPool {
    base: BasePtr,
    slot_bytes: usize,
    first: NonZeroUsize,
    prohibited: NonZeroUsize,
    layout: Layout,
}

impl RawPool {
    /// Chains up the freelist over the chunk at `base`.
    ///
    /// # Safety
    ///
    /// `base` must span `(pool_size + 1) * slot_bytes` bytes, word-aligned,
    /// valid for reads and writes, and unused by anything else.
    unsafe fn new(base: BasePtr, slot_bytes: usize, pool_size: usize, layout: Layout) -> RawPool {
        let start = base.addr();

        for i in 0..pool_size {
            let slot = NonZeroUsize::new(start.get() + i * slot_bytes).unwrap();
            let next = NonZeroUsize::new(start.get() + (i + 1) * slot_bytes).unwrap();
            unsafe { base.write_at(slot, SlotLink { next: Some(next) }) };
        }

        let prohibited = NonZeroUsize::new(start.get() + pool_size * slot_bytes).unwrap();
        unsafe { base.write_at(prohibited, SlotLink { next: None }) };

        RawPool {
            base,
            slot_bytes,
            first: start,
            prohibited,
            layout,
        }
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> Pool<A> {
        Pool {
            base: self.base,
            slot_bytes: self.slot_bytes,
            first: self.first,
            prohibited: self.prohibited,
            layout: self.layout,
            backing_allocator,
        }
    }
}
