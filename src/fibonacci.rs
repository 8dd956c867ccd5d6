//! The Fibonacci-buddy allocator.
//!
//! A [`Fibonacci`] serves variable-size requests from a single contiguous
//! region. Block sizes are multiples of a technical block size `b` by the
//! generalized Fibonacci sequence `F[0..N)`; a block of class `k` splits
//! into a *left* child of class `k - DIFF - 1` and a *right* child of class
//! `k - 1`, so freed buddies can coalesce back without the power-of-two
//! rounding loss of a binary buddy system.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(N)      | O(N + s)   |
//! | Deallocate               | O(1)      | O(N + s)   |
//!
//! where `N` is the number of size classes and `s` the population of the
//! free sets touched.
//!
//! #### Fragmentation
//!
//! Internal fragmentation per allocation is bounded by the gap to the next
//! Fibonacci size; larger `DIFF` values make the classes denser. In exact
//! mode the allocator spends extra search effort to pick a source block
//! whose split path leaves no residual waste at all.
//!
//! ## Self-hosted bookkeeping
//!
//! All metadata lives inside the managed region: the per-class free-set
//! heads, the size table, the precomputed split-direction table and the
//! node pool backing the free sets. The layout is fixed up front by the
//! planner; after construction the allocator never touches memory outside
//! its region.
//!
//! Every block, free or live, starts with a one-word header recording its
//! size class and its role in the split that produced it (`buddy`), plus
//! its sibling's role (`memory`). The pair of bits is what allows
//! multi-level coalescing: merging two children must reconstruct the
//! parent's own role, which neither child's `buddy` bit alone encodes.

use core::{alloc::Layout, fmt, mem::ManuallyDrop, num::NonZeroUsize, ptr, ptr::NonNull};

use crate::{
    free_set::SetArray,
    measure,
    plan::{RegionPlan, WORD},
    polyfill::*,
    AllocError, AllocInitError, BackingAllocator, BasePtr, Hooks, Pool, Raw, MAX_ALIGN,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The smallest region a `Fibonacci` accepts.
pub const MIN_REGION: usize = 16384;

/// The role a class plays on a block's split path.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Direction {
    /// The class itself is the answer; stop splitting.
    Here,
    /// Descend into the left child (class `i - DIFF - 1`).
    Left,
    /// Descend into the right child (class `i - 1`).
    Right,
}

/// One cell of the split-direction table.
///
/// Bit 7 is the exact flag; bits 5 and 6 encode the direction, with zero
/// reserved for cells that are never consulted.
#[derive(Copy, Clone, PartialEq, Eq)]
struct DirCell(u8);

impl DirCell {
    const INVALID: DirCell = DirCell(0);

    const MASK_DIRECTION: u8 = 0b0110_0000;
    const MASK_EXACT: u8 = 0b1000_0000;

    const LEFT: u8 = 1 << 5;
    const RIGHT: u8 = 2 << 5;
    const HERE: u8 = 3 << 5;

    fn new(exact: bool, direction: Direction) -> DirCell {
        let dir = match direction {
            Direction::Here => Self::HERE,
            Direction::Left => Self::LEFT,
            Direction::Right => Self::RIGHT,
        };

        DirCell(if exact { Self::MASK_EXACT | dir } else { dir })
    }

    fn is_exact(self) -> bool {
        self.0 & Self::MASK_EXACT != 0
    }

    fn direction(self) -> Direction {
        match self.0 & Self::MASK_DIRECTION {
            Self::LEFT => Direction::Left,
            Self::RIGHT => Direction::Right,
            Self::HERE => Direction::Here,
            _ => unreachable!("consulted an unfilled direction cell"),
        }
    }
}

impl fmt::Debug for DirCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            return f.write_str("DirCell(invalid)");
        }

        f.debug_struct("DirCell")
            .field("exact", &self.is_exact())
            .field("direction", &self.direction())
            .finish()
    }
}

/// The per-block header word.
///
/// Occupies the first `ALIGN` bytes of every technical block; the user
/// pointer is the block pointer plus `ALIGN`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(transparent)]
struct BlockHeader(u32);

impl BlockHeader {
    const MASK_BUDDY: u32 = 1 << 31;
    const MASK_MEMORY: u32 = 1 << 30;
    const MASK_INDEX: u32 = (1 << 30) - 1;

    /// `buddy` is this block's role in the split that produced it (set for
    /// the right child), `memory` is its sibling's role, `index` its class.
    fn new(buddy: bool, memory: bool, index: usize) -> BlockHeader {
        debug_assert!(index as u32 & !Self::MASK_INDEX == 0);

        BlockHeader(
            if buddy { Self::MASK_BUDDY } else { 0 }
                | if memory { Self::MASK_MEMORY } else { 0 }
                | (index as u32 & Self::MASK_INDEX),
        )
    }

    fn buddy(self) -> bool {
        self.0 & Self::MASK_BUDDY != 0
    }

    fn memory(self) -> bool {
        self.0 & Self::MASK_MEMORY != 0
    }

    fn index(self) -> usize {
        (self.0 & Self::MASK_INDEX) as usize
    }
}

/// The `N x N` split-direction table, resident in the region.
#[derive(Copy, Clone, Debug)]
struct DirTable {
    cells: NonZeroUsize,
    count: usize,
}

impl DirTable {
    /// Fills the table for `count` classes at `cells` and returns it.
    ///
    /// In exact mode a cell records whether its target class is reachable
    /// without residual waste, preferring the left (smaller) subtree; in
    /// first-fit mode the left child is taken whenever it exists.
    ///
    /// # Safety
    ///
    /// `cells` and the following `count * count` bytes must lie within
    /// `base`'s region, unused by anything else.
    unsafe fn init(
        base: BasePtr,
        cells: NonZeroUsize,
        count: usize,
        diff: usize,
        exact: bool,
    ) -> DirTable {
        let table = DirTable { cells, count };

        unsafe {
            for big in 0..count {
                for small in 0..count {
                    table.set(base, big, small, DirCell::INVALID);
                }
            }

            for k in 0..count {
                table.set(base, k, k, DirCell::new(true, Direction::Here));
            }

            // Classes up to `diff` cannot split; requests below them are
            // served whole.
            for big in 1..=diff {
                for small in 0..big {
                    table.set(base, big, small, DirCell::new(false, Direction::Here));
                }
            }

            for big in diff + 1..count {
                for small in 0..big {
                    let left_exists = small <= big - diff - 1;
                    let left = table.get(base, big - diff - 1, small);
                    let right = table.get(base, big - 1, small);

                    let cell = if exact {
                        if left_exists && left.is_exact() {
                            DirCell::new(true, Direction::Left)
                        } else if right.is_exact() {
                            DirCell::new(true, Direction::Right)
                        } else if left_exists {
                            DirCell::new(false, Direction::Left)
                        } else {
                            DirCell::new(false, Direction::Right)
                        }
                    } else if left_exists {
                        DirCell::new(left.is_exact(), Direction::Left)
                    } else {
                        DirCell::new(right.is_exact(), Direction::Right)
                    };

                    table.set(base, big, small, cell);
                }
            }
        }

        table
    }

    fn cell_addr(self, big: usize, small: usize) -> NonZeroUsize {
        debug_assert!(big < self.count && small < self.count);

        NonZeroUsize::new(self.cells.get() + big * self.count + small).unwrap()
    }

    unsafe fn get(self, base: BasePtr, big: usize, small: usize) -> DirCell {
        DirCell(unsafe { base.read_at::<u8>(self.cell_addr(big, small)) })
    }

    unsafe fn set(self, base: BasePtr, big: usize, small: usize, cell: DirCell) {
        unsafe { base.write_at::<u8>(self.cell_addr(big, small), cell.0) };
    }
}

/// A fixed-region Fibonacci-buddy allocator.
///
/// This takes three const parameters:
/// - `MIN_BLOCK` is the smallest technical block size the planner will
///   accept, a multiple of `ALIGN` of at least `2 * ALIGN`.
/// - `ALIGN` is the alignment of returned user pointers and the size of the
///   per-block header, a power of two of at least 4.
/// - `DIFF` is the Fibonacci index difference between a block and its left
///   child, between 1 and 8. `1` gives the classical Fibonacci buddy
///   system.
///
/// The region size is a runtime argument; see [`MIN_REGION`].
pub struct Fibonacci<
    const MIN_BLOCK: usize,
    const ALIGN: usize,
    const DIFF: usize,
    H: Hooks,
    A: BackingAllocator,
> {
    base: BasePtr,
    layout: Layout,
    exact: bool,
    class_count: usize,
    block_size: usize,
    sets: SetArray,
    fibs: NonZeroUsize,
    dirs: DirTable,
    pool: Pool<Raw>,
    data: NonZeroUsize,
    free_space: usize,
    hooks: H,
    backing_allocator: A,
}

impl<const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks>
    Fibonacci<MIN_BLOCK, ALIGN, DIFF, H, Raw>
{
    /// Constructs a new `Fibonacci` over a caller-owned region.
    ///
    /// `exact` selects the allocation policy: when set, a source block is
    /// preferred whose split path reaches the requested class with no
    /// residual waste.
    ///
    /// # Errors
    ///
    /// Returns an error (after invoking `hooks.bad_alloc()`) if `region` is
    /// not [`MAX_ALIGN`]-aligned, if `size` is below [`MIN_REGION`] or not a
    /// multiple of [`MAX_ALIGN`], or if no feasible layout exists for the
    /// const parameters.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes, and the
    /// memory must be unused by anything else for the allocator's lifetime.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        size: usize,
        exact: bool,
        hooks: H,
    ) -> Result<Fibonacci<MIN_BLOCK, ALIGN, DIFF, H, Raw>, AllocInitError> {
        unsafe {
            RawFibonacci::<MIN_BLOCK, ALIGN, DIFF, H>::new(region, size, exact, hooks)
                .map(|parts| parts.with_backing_allocator(Raw))
        }
    }

    /// Decomposes the allocator into its region pointer and hooks.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned pointer becomes the sole owner of the region.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, H) {
        let this = ManuallyDrop::new(self);
        let region = this.base.ptr();

        // SAFETY: `this` is never dropped, so the hooks are read exactly
        // once. The pool holds no resources under a `Raw` backing.
        let hooks = unsafe { ptr::read(&this.hooks) };

        (region, hooks)
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks>
    Fibonacci<MIN_BLOCK, ALIGN, DIFF, H, Global>
{
    /// Attempts to construct a new `Fibonacci` over a region of `size` bytes
    /// obtained from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error (after invoking `hooks.bad_alloc()`) if the
    /// configuration is infeasible or the region could not be allocated.
    pub fn try_new(
        size: usize,
        exact: bool,
        hooks: H,
    ) -> Result<Fibonacci<MIN_BLOCK, ALIGN, DIFF, H, Global>, AllocInitError> {
        let layout = match Layout::from_size_align(size, MAX_ALIGN) {
            Ok(l) => l,
            Err(_) => {
                hooks.bad_alloc();
                return Err(AllocInitError::InvalidConfig);
            }
        };

        unsafe {
            let region = match NonNull::new(alloc::alloc::alloc(layout)) {
                Some(r) => r,
                None => {
                    hooks.bad_alloc();
                    return Err(AllocInitError::AllocFailed(layout));
                }
            };

            match RawFibonacci::<MIN_BLOCK, ALIGN, DIFF, H>::new(region, size, exact, hooks) {
                Ok(parts) => Ok(parts.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks,
        A: BackingAllocator,
    > Fibonacci<MIN_BLOCK, ALIGN, DIFF, H, A>
{
    /// Attempts to allocate a block whose user payload holds at least `size`
    /// bytes.
    ///
    /// The returned pointer is `ALIGN`-aligned and spans the full payload of
    /// the class that served the request, which may exceed `size`.
    ///
    /// # Errors
    ///
    /// Returns `Err` (after invoking `hooks.bad_alloc()`) if `size` is zero,
    /// exceeds the largest class's payload, or no free block can serve it.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.hooks.lock();
        let result = self.allocate_inner(size);
        if result.is_err() {
            self.hooks.bad_alloc();
        }
        self.hooks.unlock();

        result
    }

    /// Deallocates the block referenced by `ptr`.
    ///
    /// The block coalesces with its buddy repeatedly while the buddy is
    /// free. An unaligned or out-of-region pointer is rejected: state is
    /// untouched and `hooks.bad_alloc()` is invoked.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// allocator and must not be deallocated twice.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.hooks.lock();
        let ok = unsafe { self.deallocate_inner(ptr) };
        if !ok {
            self.hooks.bad_alloc();
        }
        self.hooks.unlock();
    }

    /// Returns the total user payload of all free blocks.
    pub fn free_space(&self) -> usize {
        self.free_space
    }

    /// Returns the user payload capacity of the largest class.
    pub fn max_user_block_size(&self) -> usize {
        self.user_size(self.class_count - 1)
    }

    /// Returns the user payload capacity of the largest class with a free
    /// block, or zero when nothing is free.
    pub fn max_free_user_block_size(&self) -> usize {
        self.hooks.lock();
        let result = match self.largest_free_class_inner() {
            Some(class) => self.user_size(class),
            None => 0,
        };
        self.hooks.unlock();

        result
    }

    /// Returns the largest class with a free block.
    pub fn largest_free_class(&self) -> Option<usize> {
        self.hooks.lock();
        let result = self.largest_free_class_inner();
        self.hooks.unlock();

        result
    }

    /// Returns the alignment of user pointers.
    pub const fn alignment() -> usize {
        ALIGN
    }

    /// Returns the number of size classes `N`.
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Returns the sequence value of `class`, clamped to the largest class.
    pub fn fibonacci(&self, class: usize) -> usize {
        self.fib(class.min(self.class_count - 1))
    }

    /// Returns the sequence value of the largest class.
    pub fn max_fibonacci(&self) -> usize {
        self.fib(self.class_count - 1)
    }

    /// Returns the technical block size `b`; class `k` blocks span
    /// `b * F[k]` bytes.
    pub fn technical_block_size(&self) -> usize {
        self.block_size
    }

    /// Returns whether the allocator has returned to its initial state: the
    /// whole data area free as one top-class block and the free-space
    /// counter agreeing with it.
    pub fn is_correct_empty(&self) -> bool {
        self.hooks.lock();

        let top = self.class_count - 1;
        let first_occupied = (0..self.class_count).find(|&k| unsafe { self.sets.len(self.base, k) } > 0);

        let result = first_occupied == Some(top)
            && unsafe { self.sets.len(self.base, top) } == 1
            && unsafe { self.sets.first(self.base, top) } == Some(self.data)
            && self.free_space == self.user_size(top);

        self.hooks.unlock();

        result
    }

    fn allocate_inner(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let with_header = size.checked_add(ALIGN).ok_or(AllocError)?;
        let units = (with_header - 1) / self.block_size + 1;

        let smallest = self.class_for_units(units);
        if smallest == self.class_count {
            return Err(AllocError);
        }

        let mut source = self.class_count;
        if self.exact {
            let mut class = smallest;
            while class < self.class_count
                && (unsafe { self.sets.len(self.base, class) } == 0
                    || !unsafe { self.dirs.get(self.base, class, smallest) }.is_exact())
            {
                class += 1;
            }
            source = class;
        }

        if source == self.class_count {
            let mut class = smallest;
            while class < self.class_count && unsafe { self.sets.len(self.base, class) } == 0 {
                class += 1;
            }
            if class == self.class_count {
                return Err(AllocError);
            }
            source = class;
        }

        let mut class = source;
        let mut block = unsafe { self.sets.pop_first(self.base, &mut self.pool, class) }
            .expect("selected source class has no free block");
        self.free_space -= self.user_size(class);

        while class > smallest
            && unsafe { self.dirs.get(self.base, class, smallest) }.direction() != Direction::Here
        {
            let left_class = class - DIFF - 1;
            let right_class = class - 1;

            // The parent's role bits feed the children before its header is
            // overwritten by the left child's.
            let parent = unsafe { self.base.read_at::<BlockHeader>(block) };
            let right_block =
                NonZeroUsize::new(block.get() + self.block_size * self.fib(left_class)).unwrap();

            unsafe {
                self.base
                    .write_at(block, BlockHeader::new(false, parent.buddy(), left_class));
                self.base.write_at(
                    right_block,
                    BlockHeader::new(true, parent.memory(), right_class),
                );
            }

            let step = unsafe { self.dirs.get(self.base, class, smallest) }.direction();
            if step == Direction::Left {
                unsafe {
                    self.sets
                        .insert(self.base, &mut self.pool, right_class, right_block)
                };
                self.free_space += self.user_size(right_class);
                class = left_class;
            } else {
                unsafe { self.sets.insert(self.base, &mut self.pool, left_class, block) };
                self.free_space += self.user_size(left_class);
                block = right_block;
                class = right_class;
            }
        }

        let user = NonZeroUsize::new(block.get() + ALIGN).unwrap();

        Ok(self.base.with_addr_and_size(user, self.user_size(class)))
    }

    /// Validates `ptr`, coalesces and reinserts the block. Returns whether
    /// the pointer was accepted; on `false`, state is untouched.
    pub(crate) unsafe fn deallocate_inner(&mut self, ptr: NonNull<u8>) -> bool {
        let block = match ptr.addr().get().checked_sub(ALIGN).and_then(NonZeroUsize::new) {
            Some(b) => b,
            None => return false,
        };

        let data_end = self.data.get() + self.block_size * self.fib(self.class_count - 1);
        if block.get() % ALIGN != 0 || block < self.data || block.get() >= data_end {
            return false;
        }

        let mut block = block;
        let mut header = unsafe { self.base.read_at::<BlockHeader>(block) };
        let mut class = header.index();
        if class >= self.class_count {
            return false;
        }

        while class < self.class_count - 1 {
            // The `buddy` bit says which side of its parent this block came
            // from; the sibling's class and address follow from the split
            // geometry. Left child: class `p - DIFF - 1` at the parent's
            // address. Right child: class `p - 1`, `b * F[p - DIFF - 1]`
            // bytes in.
            let (buddy_class, buddy_block) = if header.buddy() {
                let buddy_class = match class.checked_sub(DIFF) {
                    Some(c) => c,
                    None => break,
                };
                let buddy_block = match block
                    .get()
                    .checked_sub(self.block_size * self.fib(buddy_class))
                    .and_then(NonZeroUsize::new)
                {
                    Some(b) => b,
                    None => break,
                };
                (buddy_class, buddy_block)
            } else {
                let buddy_class = class + DIFF;
                if buddy_class >= self.class_count {
                    break;
                }
                let buddy_block =
                    NonZeroUsize::new(block.get() + self.block_size * self.fib(class)).unwrap();
                (buddy_class, buddy_block)
            };

            if !unsafe {
                self.sets
                    .remove(self.base, &mut self.pool, buddy_class, buddy_block)
            } {
                break;
            }

            self.free_space -= self.user_size(buddy_class);
            let buddy_header = unsafe { self.base.read_at::<BlockHeader>(buddy_block) };

            // The merged parent's `buddy` bit is whichever child recorded the
            // sibling role of the *left* position, and its `memory` bit comes
            // from the right child; both were stashed at split time.
            if header.buddy() {
                class += 1;
                header = BlockHeader::new(buddy_header.memory(), header.memory(), class);
                block = buddy_block;
            } else {
                class += DIFF + 1;
                header = BlockHeader::new(header.memory(), buddy_header.memory(), class);
            }

            unsafe { self.base.write_at(block, header) };
        }

        unsafe { self.sets.insert(self.base, &mut self.pool, class, block) };
        self.free_space += self.user_size(class);

        true
    }

    /// The smallest class whose sequence value is at least `units`, or `N`
    /// when the request exceeds every class.
    fn class_for_units(&self, units: usize) -> usize {
        let mut lo = 0;
        let mut hi = self.class_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.fib(mid) < units {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        lo
    }

    fn largest_free_class_inner(&self) -> Option<usize> {
        (0..self.class_count)
            .rev()
            .find(|&k| unsafe { self.sets.len(self.base, k) } > 0)
    }

    fn fib(&self, class: usize) -> usize {
        debug_assert!(class < self.class_count);

        let addr = NonZeroUsize::new(self.fibs.get() + class * WORD).unwrap();
        unsafe { self.base.read_at::<usize>(addr) }
    }

    fn user_size(&self, class: usize) -> usize {
        self.block_size * self.fib(class) - ALIGN
    }

    /// Recomputes the free-space sum from the sets and checks every free
    /// block's header against the set that holds it.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self) {
        let mut sum = 0;
        for class in 0..self.class_count {
            unsafe {
                self.sets.for_each(self.base, class, |block| {
                    let header = unsafe { self.base.read_at::<BlockHeader>(block) };
                    assert_eq!(header.index(), class, "free block header disagrees with set");
                    sum += self.user_size(class);
                });
            }
        }

        assert_eq!(sum, self.free_space, "free-space accounting drifted");
    }
}

impl<
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks,
        A: BackingAllocator,
    > Drop for Fibonacci<MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), self.layout)
        };
    }
}

impl<
        const MIN_BLOCK: usize,
        const ALIGN: usize,
        const DIFF: usize,
        H: Hooks,
        A: BackingAllocator,
    > fmt::Debug for Fibonacci<MIN_BLOCK, ALIGN, DIFF, H, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fibonacci")
            .field("exact", &self.exact)
            .field("class_count", &self.class_count)
            .field("block_size", &self.block_size)
            .field("free_space", &self.free_space)
            .finish()
    }
}

/// Like a `Fibonacci`, but without a `Drop` impl or an associated allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `Fibonacci` itself cannot.
struct RawFibonacci<const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks> {
    base: BasePtr,
    layout: Layout,
    exact: bool,
    class_count: usize,
    block_size: usize,
    sets: SetArray,
    fibs: NonZeroUsize,
    dirs: DirTable,
    pool: Pool<Raw>,
    data: NonZeroUsize,
    free_space: usize,
    hooks: H,
}

impl<const MIN_BLOCK: usize, const ALIGN: usize, const DIFF: usize, H: Hooks>
    RawFibonacci<MIN_BLOCK, ALIGN, DIFF, H>
{
    /// Plans the region and writes all resident metadata.
    ///
    /// # Safety
    ///
    /// As for [`Fibonacci::new_raw`].
    unsafe fn new(
        region: NonNull<u8>,
        size: usize,
        exact: bool,
        hooks: H,
    ) -> Result<RawFibonacci<MIN_BLOCK, ALIGN, DIFF, H>, AllocInitError> {
        assert!(ALIGN.is_power_of_two() && ALIGN >= 4);
        assert!(MIN_BLOCK % ALIGN == 0 && MIN_BLOCK >= 2 * ALIGN);
        assert!((1..=8).contains(&DIFF));

        if size < MIN_REGION || size % MAX_ALIGN != 0 {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidConfig);
        }

        if region.addr().get() % MAX_ALIGN != 0 {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidLocation);
        }

        if region.addr().get().checked_add(size).is_none() {
            hooks.bad_alloc();
            return Err(AllocInitError::InvalidLocation);
        }

        let node_size = measure::set_node_size();
        let plan = match RegionPlan::compute(size, MIN_BLOCK, ALIGN, DIFF, node_size) {
            Ok(p) => p,
            Err(e) => {
                hooks.bad_alloc();
                return Err(e);
            }
        };

        // `size` and `MAX_ALIGN` were validated above.
        let layout = Layout::from_size_align(size, MAX_ALIGN).unwrap();
        let base = BasePtr::new(region, size);
        let at = |offset: usize| NonZeroUsize::new(base.addr().get() + offset).unwrap();

        unsafe {
            let sets = SetArray::init(base, at(plan.heads_offset), plan.class_count);

            plan.write_fib_table(base, DIFF);
            let fibs = at(plan.fibs_offset);

            let dirs = DirTable::init(base, at(plan.dirs_offset), plan.class_count, DIFF, exact);

            let pool_region = base.with_addr(at(plan.pool_offset));
            let mut pool = Pool::new_raw(pool_region, plan.pool_slots, node_size)
                .expect("planned pool slab is aligned and in bounds");

            let top = plan.class_count - 1;
            let data = at(plan.data_offset);
            base.write_at(data, BlockHeader::new(false, false, top));
            sets.insert(base, &mut pool, top, data);

            let top_fib = base.read_at::<usize>(NonZeroUsize::new(fibs.get() + top * WORD).unwrap());
            let free_space = plan.block_size * top_fib - ALIGN;

            Ok(RawFibonacci {
                base,
                layout,
                exact,
                class_count: plan.class_count,
                block_size: plan.block_size,
                sets,
                fibs,
                dirs,
                pool,
                data,
                free_space,
                hooks,
            })
        }
    }

    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> Fibonacci<MIN_BLOCK, ALIGN, DIFF, H, A> {
        let RawFibonacci {
            base,
            layout,
            exact,
            class_count,
            block_size,
            sets,
            fibs,
            dirs,
            pool,
            data,
            free_space,
            hooks,
        } = self;

        Fibonacci {
            base,
            layout,
            exact,
            class_count,
            block_size,
            sets,
            fibs,
            dirs,
            pool,
            data,
            free_space,
            hooks,
            backing_allocator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Fib = Fibonacci<128, 8, 3, (), Global>;

    #[test]
    fn header_round_trips() {
        for buddy in [false, true] {
            for memory in [false, true] {
                for index in [0, 1, 26, (1 << 30) - 1] {
                    let header = BlockHeader::new(buddy, memory, index);
                    assert_eq!(header.buddy(), buddy);
                    assert_eq!(header.memory(), memory);
                    assert_eq!(header.index(), index);
                }
            }
        }
    }

    #[test]
    fn direction_cell_round_trips() {
        for exact in [false, true] {
            for direction in [Direction::Here, Direction::Left, Direction::Right] {
                let cell = DirCell::new(exact, direction);
                assert_eq!(cell.is_exact(), exact);
                assert_eq!(cell.direction(), direction);
            }
        }
    }

    #[test]
    fn direction_table_diagonal_and_tiny_rows() {
        let fib = Fib::try_new(1 << 20, true, ()).unwrap();

        for k in 0..fib.class_count {
            let cell = unsafe { fib.dirs.get(fib.base, k, k) };
            assert!(cell.is_exact());
            assert_eq!(cell.direction(), Direction::Here);
        }

        // Rows at or below DIFF cannot split: served whole, inexactly.
        for big in 1..=3 {
            for small in 0..big {
                let cell = unsafe { fib.dirs.get(fib.base, big, small) };
                assert!(!cell.is_exact());
                assert_eq!(cell.direction(), Direction::Here);
            }
        }
    }

    #[test]
    fn exact_table_prefers_left_subtree() {
        let fib = Fibonacci::<128, 8, 1, (), Global>::try_new(1 << 20, true, ()).unwrap();

        // With DIFF = 1, class 2 splits into classes 0 (left) and 1 (right):
        // both reachable exactly, left preferred for class 0.
        let cell = unsafe { fib.dirs.get(fib.base, 2, 0) };
        assert!(cell.is_exact());
        assert_eq!(cell.direction(), Direction::Left);

        let cell = unsafe { fib.dirs.get(fib.base, 2, 1) };
        assert!(cell.is_exact());
        assert_eq!(cell.direction(), Direction::Right);

        // Class 3 reaches class 0 exactly only through its right child
        // (class 2): the left child (class 1) cannot split.
        let cell = unsafe { fib.dirs.get(fib.base, 3, 0) };
        assert!(cell.is_exact());
        assert_eq!(cell.direction(), Direction::Right);
    }

    #[test]
    fn first_fit_table_always_descends_left_when_possible() {
        let fib = Fib::try_new(1 << 20, false, ()).unwrap();

        for big in 4..fib.class_count {
            for small in 0..big {
                let cell = unsafe { fib.dirs.get(fib.base, big, small) };
                if small <= big - 4 {
                    assert_eq!(cell.direction(), Direction::Left);
                } else {
                    assert_eq!(cell.direction(), Direction::Right);
                }
            }
        }
    }

    #[test]
    fn class_search_matches_linear_scan() {
        let fib = Fib::try_new(1 << 20, false, ()).unwrap();

        for units in 1..=fib.max_fibonacci() + 1 {
            let expected = (0..fib.class_count)
                .find(|&k| fib.fib(k) >= units)
                .unwrap_or(fib.class_count);
            assert_eq!(fib.class_for_units(units), expected);
        }
    }

    #[test]
    #[should_panic]
    fn zero_diff_panics() {
        let _ = Fibonacci::<128, 8, 0, (), Global>::try_new(1 << 20, false, ());
    }

    #[test]
    #[should_panic]
    fn undersized_min_block_panics() {
        let _ = Fibonacci::<8, 8, 3, (), Global>::try_new(1 << 20, false, ());
    }
}
