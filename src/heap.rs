//! Typed construction over a shared [`Fibonacci`] allocator.
//!
//! A [`Heap`] wraps one allocator instance together with the caller's
//! [`Hooks`] and exposes `new`/`delete`-style operations behind a shared
//! reference: [`alloc_value`] constructs a value in place and returns an
//! owning [`HeapBox`]; [`alloc_slice_with`] does the same for a slice. Both
//! handles destruct their payload and return the block on drop.
//!
//! Sharing is what the hooks' `lock`/`unlock` pair is for: every operation
//! on the heap runs inside one lock/unlock bracket, so a heap whose hooks
//! wrap a real mutex may be used as a process-wide allocator singleton.
//!
//! [`alloc_value`]: Heap::alloc_value
//! [`alloc_slice_with`]: Heap::alloc_slice_with

use core::{
    cell::UnsafeCell,
    fmt, mem,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    slice,
};

use crate::{fibonacci::Fibonacci, AllocError, BackingAllocator, Hooks};

/// A shareable `new`/`delete` façade over a [`Fibonacci`] allocator.
pub struct Heap<
    const MIN_BLOCK: usize,
    const ALIGN: usize,
    const DIFF: usize,
    H: Hooks,
    A: BackingAllocator,
> {
    hooks: H,
    inner: UnsafeCell<Fibonacci<MIN_BLOCK, ALIGN, DIFF, (), A>>,
}

// SAFETY: all access to the inner allocator goes through `with`, which
// brackets it in the hooks' lock; the constructor's contract makes that
// bracket mutually exclusive whenever the heap is actually shared.
unsafe impl<
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks + Send,
        A: BackingAllocator + Send,
    > Send for Heap<MIN_BLOCK, ALIGN, DIFF, H, A>
{
}

unsafe impl<
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks + Sync,
        A: BackingAllocator + Sync,
    > Sync for Heap<MIN_BLOCK, ALIGN, DIFF, H, A>
{
}

impl<
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks,
        A: BackingAllocator,
    > Heap<MIN_BLOCK, ALIGN, DIFF, H, A>
{
    /// Wraps `allocator` for shared, typed use.
    ///
    /// The allocator's own hooks slot is the unit no-op bundle; `hooks`
    /// supplied here observes every heap operation instead.
    ///
    /// # Safety
    ///
    /// If the heap is shared between threads, `hooks.lock()` must provide
    /// mutual exclusion until the matching `hooks.unlock()`, as for a mutex.
    /// A heap used from a single thread may pass no-op hooks.
    pub unsafe fn new(
        allocator: Fibonacci<MIN_BLOCK, ALIGN, DIFF, (), A>,
        hooks: H,
    ) -> Heap<MIN_BLOCK, ALIGN, DIFF, H, A> {
        Heap {
            hooks,
            inner: UnsafeCell::new(allocator),
        }
    }

    /// Returns the wrapped allocator.
    ///
    /// Compiles only once every handle allocated from this heap has been
    /// dropped, since the handles borrow the heap.
    pub fn into_allocator(self) -> Fibonacci<MIN_BLOCK, ALIGN, DIFF, (), A> {
        self.inner.into_inner()
    }

    /// Allocates a block for `value` and constructs it in place.
    ///
    /// # Errors
    ///
    /// Returns `Err` (after invoking `hooks.bad_alloc()`) if `T` demands
    /// more than `ALIGN` alignment or the allocator is out of space.
    /// Zero-sized values never touch the allocator.
    pub fn alloc_value<T>(
        &self,
        value: T,
    ) -> Result<HeapBox<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>, AllocError> {
        if mem::align_of::<T>() > ALIGN {
            self.hooks.bad_alloc();
            return Err(AllocError);
        }

        if mem::size_of::<T>() == 0 {
            // The value is reconstructed by `drop_in_place` at handle drop.
            mem::forget(value);
            return Ok(HeapBox {
                heap: self,
                ptr: NonNull::dangling(),
            });
        }

        match self.with(|fib| fib.allocate(mem::size_of::<T>())) {
            Ok(raw) => {
                let ptr = raw.cast::<T>();
                unsafe { ptr.as_ptr().write(value) };
                Ok(HeapBox { heap: self, ptr })
            }
            Err(e) => {
                self.hooks.bad_alloc();
                Err(e)
            }
        }
    }

    /// Allocates a slice of `len` elements, constructing element `i` from
    /// `f(i)`.
    ///
    /// # Errors
    ///
    /// As for [`alloc_value`](Self::alloc_value); empty and zero-sized
    /// slices never touch the allocator.
    pub fn alloc_slice_with<T>(
        &self,
        len: usize,
        mut f: impl FnMut(usize) -> T,
    ) -> Result<HeapSlice<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>, AllocError> {
        if mem::align_of::<T>() > ALIGN {
            self.hooks.bad_alloc();
            return Err(AllocError);
        }

        let bytes = match mem::size_of::<T>().checked_mul(len) {
            Some(b) => b,
            None => {
                self.hooks.bad_alloc();
                return Err(AllocError);
            }
        };

        if bytes == 0 {
            for i in 0..len {
                mem::forget(f(i));
            }
            return Ok(HeapSlice {
                heap: self,
                ptr: NonNull::dangling(),
                len,
            });
        }

        match self.with(|fib| fib.allocate(bytes)) {
            Ok(raw) => {
                let ptr = raw.cast::<T>();
                for i in 0..len {
                    unsafe { ptr.as_ptr().add(i).write(f(i)) };
                }
                Ok(HeapSlice {
                    heap: self,
                    ptr,
                    len,
                })
            }
            Err(e) => {
                self.hooks.bad_alloc();
                Err(e)
            }
        }
    }

    /// Returns the total user payload of all free blocks.
    pub fn free_space(&self) -> usize {
        self.with(|fib| fib.free_space())
    }

    /// Returns the user payload capacity of the largest class.
    pub fn max_user_block_size(&self) -> usize {
        self.with(|fib| fib.max_user_block_size())
    }

    /// Returns the user payload capacity of the largest class with a free
    /// block, or zero when nothing is free.
    pub fn max_free_user_block_size(&self) -> usize {
        self.with(|fib| fib.max_free_user_block_size())
    }

    /// Returns the alignment of allocated payloads.
    pub const fn alignment() -> usize {
        ALIGN
    }

    /// Returns whether the allocator has returned to its initial state.
    pub fn is_correct_empty(&self) -> bool {
        self.with(|fib| fib.is_correct_empty())
    }

    fn with<R>(&self, f: impl FnOnce(&mut Fibonacci<MIN_BLOCK, ALIGN, DIFF, (), A>) -> R) -> R {
        self.hooks.lock();

        // SAFETY: per the construction contract, the lock/unlock bracket is
        // mutually exclusive whenever `self` is shared, so no other mutable
        // reference to the inner allocator can exist here.
        let result = f(unsafe { &mut *self.inner.get() });

        self.hooks.unlock();

        result
    }

    /// # Safety
    ///
    /// `ptr` must be the payload pointer of a live allocation made through
    /// this heap.
    unsafe fn dealloc_raw(&self, ptr: NonNull<u8>) {
        let ok = self.with(|fib| unsafe { fib.deallocate_inner(ptr) });
        if !ok {
            self.hooks.bad_alloc();
        }
    }
}

impl<
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks,
        A: BackingAllocator,
    > fmt::Debug for Heap<MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap").finish_non_exhaustive()
    }
}

/// An owning handle to a value allocated from a [`Heap`].
///
/// Destructs the value and returns its block on drop.
pub struct HeapBox<
    'h,
    T,
    const MIN_BLOCK: usize,
    const ALIGN: usize,
    const DIFF: usize,
    H: Hooks,
    A: BackingAllocator,
> {
    heap: &'h Heap<MIN_BLOCK, ALIGN, DIFF, H, A>,
    ptr: NonNull<T>,
}

impl<T, const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks, A: BackingAllocator>
    Deref for HeapBox<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>
{
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks, A: BackingAllocator>
    DerefMut for HeapBox<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks, A: BackingAllocator>
    Drop for HeapBox<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());

            if mem::size_of::<T>() != 0 {
                self.heap.dealloc_raw(self.ptr.cast());
            }
        }
    }
}

impl<
        T: fmt::Debug,
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks,
        A: BackingAllocator,
    > fmt::Debug for HeapBox<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// An owning handle to a slice allocated from a [`Heap`].
///
/// Destructs the elements and returns their block on drop.
pub struct HeapSlice<
    'h,
    T,
    const MIN_BLOCK: usize,
    const ALIGN: usize,
    const DIFF: usize,
    H: Hooks,
    A: BackingAllocator,
> {
    heap: &'h Heap<MIN_BLOCK, ALIGN, DIFF, H, A>,
    ptr: NonNull<T>,
    len: usize,
}

impl<T, const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks, A: BackingAllocator>
    Deref for HeapSlice<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>
{
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T, const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks, A: BackingAllocator>
    DerefMut for HeapSlice<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T, const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks, A: BackingAllocator>
    Drop for HeapSlice<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));

            if mem::size_of::<T>() != 0 && self.len != 0 {
                self.heap.dealloc_raw(self.ptr.cast());
            }
        }
    }
}

impl<
        T: fmt::Debug,
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks,
        A: BackingAllocator,
    > fmt::Debug for HeapSlice<'_, T, MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::Cell;
    use std::{prelude::rust_2021::*, rc::Rc};

    use super::*;
    use crate::Global;

    fn new_heap() -> Heap<128, 8, 3, (), Global> {
        let fib = Fibonacci::try_new(1 << 20, false, ()).unwrap();
        unsafe { Heap::new(fib, ()) }
    }

    #[test]
    fn value_round_trip() {
        let heap = new_heap();

        {
            let mut boxed = heap.alloc_value(41u64).unwrap();
            *boxed += 1;
            assert_eq!(*boxed, 42);
        }

        assert!(heap.is_correct_empty());
    }

    #[test]
    fn drop_destructs_exactly_once() {
        struct Witness(Rc<Cell<usize>>);

        impl Drop for Witness {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let heap = new_heap();
        let drops = Rc::new(Cell::new(0));

        {
            let _a = heap.alloc_value(Witness(Rc::clone(&drops))).unwrap();
            let _b = heap
                .alloc_slice_with(3, |_| Witness(Rc::clone(&drops)))
                .unwrap();
        }

        assert_eq!(drops.get(), 4);
        assert!(heap.is_correct_empty());
    }

    #[test]
    fn slice_contents_are_constructed_in_order() {
        let heap = new_heap();

        let slice = heap.alloc_slice_with(5, |i| (i * i) as u32).unwrap();
        assert_eq!(&slice[..], &[0, 1, 4, 9, 16][..]);
    }

    #[test]
    fn zero_sized_values_skip_the_allocator() {
        let heap = new_heap();
        let before = heap.free_space();

        let unit = heap.alloc_value(()).unwrap();
        assert_eq!(heap.free_space(), before);
        drop(unit);

        let empty = heap.alloc_slice_with(0, |_| 0u32).unwrap();
        assert!(empty.is_empty());
        drop(empty);

        assert!(heap.is_correct_empty());
    }

    #[test]
    fn overaligned_types_are_rejected() {
        #[repr(align(64))]
        struct Wide(#[allow(dead_code)] u8);

        let heap = new_heap();
        assert!(heap.alloc_value(Wide(7)).is_err());
        assert!(heap.is_correct_empty());
    }

    #[test]
    fn exhaustion_surfaces_bad_alloc() {
        #[derive(Default)]
        struct Failures(Cell<usize>);

        impl crate::Hooks for Failures {
            fn bad_alloc(&self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let failures = Failures::default();
        let fib = Fibonacci::<128, 8, 3, (), Global>::try_new(1 << 20, false, ()).unwrap();
        let max = fib.max_user_block_size();
        let heap = unsafe { Heap::new(fib, &failures) };

        assert!(heap.alloc_slice_with(max + 1, |_| 0u8).is_err());
        assert_eq!(failures.0.get(), 1);
        assert!(heap.is_correct_empty());
    }
}
