extern crate std;

use core::{cell::Cell, ptr::NonNull, slice};
use std::prelude::rust_2021::*;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{fibonacci::Fibonacci, polyfill::*, AllocInitError, Global, Hooks};

const REGION: usize = 1 << 20;

#[derive(Default)]
struct Counting {
    bad_allocs: Cell<usize>,
    locks: Cell<usize>,
    unlocks: Cell<usize>,
}

impl Hooks for Counting {
    fn bad_alloc(&self) {
        self.bad_allocs.set(self.bad_allocs.get() + 1);
    }

    fn lock(&self) {
        self.locks.set(self.locks.get() + 1);
    }

    fn unlock(&self) {
        self.unlocks.set(self.unlocks.get() + 1);
    }
}

type Fib<'a> = Fibonacci<128, 8, 3, &'a Counting, Global>;

fn new_fib(exact: bool, hooks: &Counting) -> Fib<'_> {
    Fibonacci::try_new(REGION, exact, hooks).unwrap()
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a payload of `size` bytes.
    Allocate { size: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 20;

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                size: {
                    // Try to distribute sizes evenly across the classes,
                    // which are roughly exponential.
                    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
                    1 + usize::arbitrary(g) % 2_usize.pow(exp.into())
                },
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

struct Allocation {
    id: u8,
    ptr: NonNull<[u8]>,
}

#[test]
fn fresh_allocator_is_correct_empty() {
    for exact in [false, true] {
        let hooks = Counting::default();
        let fib = new_fib(exact, &hooks);

        assert!(fib.class_count() >= 3 + 3);
        assert!(fib.is_correct_empty());
        assert_eq!(fib.free_space(), fib.max_user_block_size());
        assert_eq!(fib.max_free_user_block_size(), fib.max_user_block_size());
        assert_eq!(hooks.bad_allocs.get(), 0);
    }
}

#[test]
fn smallest_payload_round_trip() {
    for exact in [false, true] {
        let hooks = Counting::default();
        let mut fib = new_fib(exact, &hooks);

        let size = fib.technical_block_size() - 8;
        let ptr = fib.allocate(size).unwrap();

        assert_eq!(ptr.cast::<u8>().as_ptr() as usize % 8, 0);
        assert_eq!(ptr.len(), size);

        unsafe {
            let buf = slice::from_raw_parts_mut(ptr.cast::<u8>().as_ptr(), ptr.len());
            buf.fill(0xA5);

            fib.deallocate(ptr.cast());
        }

        assert!(fib.is_correct_empty());
        assert_eq!(hooks.bad_allocs.get(), 0);
        assert_eq!(hooks.locks.get(), hooks.unlocks.get());
    }
}

#[test]
fn fill_then_drain_in_either_order() {
    for exact in [false, true] {
        for reverse in [false, true] {
            let hooks = Counting::default();
            let mut fib = new_fib(exact, &hooks);

            let mut held = Vec::new();
            while let Ok(ptr) = fib.allocate(1000) {
                held.push(ptr);
            }

            assert!(!held.is_empty());
            assert_eq!(hooks.bad_allocs.get(), 1);
            fib.check_consistency();

            if reverse {
                held.reverse();
            }

            for ptr in held {
                unsafe { fib.deallocate(ptr.cast()) };
            }

            assert!(fib.is_correct_empty());
            assert_eq!(hooks.bad_allocs.get(), 1);
        }
    }
}

#[test]
fn whole_region_in_one_block() {
    let hooks = Counting::default();
    let mut fib = new_fib(false, &hooks);

    let max = fib.max_user_block_size();
    let ptr = fib.allocate(max).unwrap();
    assert_eq!(ptr.len(), max);
    assert_eq!(fib.free_space(), 0);
    assert_eq!(fib.max_free_user_block_size(), 0);

    fib.allocate(1).unwrap_err();

    unsafe { fib.deallocate(ptr.cast()) };
    assert!(fib.is_correct_empty());
}

#[test]
fn oversized_allocation_fails_cleanly() {
    for exact in [false, true] {
        let hooks = Counting::default();
        let mut fib = new_fib(exact, &hooks);

        let before = fib.free_space();
        fib.allocate(fib.max_user_block_size() + 1).unwrap_err();

        assert_eq!(hooks.bad_allocs.get(), 1);
        assert_eq!(fib.free_space(), before);
        assert!(fib.is_correct_empty());
    }
}

#[test]
fn zero_size_allocation_fails_cleanly() {
    let hooks = Counting::default();
    let mut fib = new_fib(false, &hooks);

    fib.allocate(0).unwrap_err();

    assert_eq!(hooks.bad_allocs.get(), 1);
    assert!(fib.is_correct_empty());
}

#[test]
fn invalid_deallocate_is_rejected() {
    let hooks = Counting::default();
    let mut fib = new_fib(false, &hooks);

    // A pointer that cannot be a payload: its block address underflows.
    unsafe { fib.deallocate(NonNull::dangling()) };
    assert_eq!(hooks.bad_allocs.get(), 1);
    assert!(fib.is_correct_empty());

    // A misaligned pointer inside the data area.
    let ptr = fib.allocate(64).unwrap().cast::<u8>();
    let skewed = NonNull::new(ptr.as_ptr().wrapping_add(1)).unwrap();
    unsafe { fib.deallocate(skewed) };
    assert_eq!(hooks.bad_allocs.get(), 2);

    let before = fib.free_space();
    unsafe { fib.deallocate(ptr) };
    assert!(fib.free_space() > before);
    assert!(fib.is_correct_empty());
    assert_eq!(hooks.bad_allocs.get(), 2);
}

#[test]
fn every_class_payload_round_trips() {
    for exact in [false, true] {
        let hooks = Counting::default();
        let mut fib = new_fib(exact, &hooks);

        for class in 0..fib.class_count() {
            let size = fib.technical_block_size() * fib.fibonacci(class) - 8;
            let ptr = fib.allocate(size).unwrap();

            assert!(ptr.len() >= size);
            fib.check_consistency();

            unsafe { fib.deallocate(ptr.cast()) };
            assert!(fib.is_correct_empty(), "class {class} did not drain");
        }

        assert_eq!(hooks.bad_allocs.get(), 0);
    }
}

#[test]
fn exact_mode_serves_residue_classes_without_splitting() {
    let hooks = Counting::default();
    let mut fib = new_fib(true, &hooks);

    // Splitting the root for a smallest-class block leaves the split path's
    // siblings free. A request sized exactly to the smallest free class must
    // then be served from that class alone: free space drops by exactly its
    // payload.
    let first = fib.allocate(1).unwrap();
    fib.check_consistency();

    let before = fib.free_space();
    let class = fib.largest_free_class().unwrap();
    let payload = fib.technical_block_size() * fib.fibonacci(class) - 8;
    let second = fib.allocate(payload).unwrap();

    assert_eq!(second.len(), payload);
    assert_eq!(fib.free_space(), before - payload);
    fib.check_consistency();

    unsafe {
        fib.deallocate(first.cast());
        fib.deallocate(second.cast());
    }
    assert!(fib.is_correct_empty());
}

#[test]
fn lock_unlock_are_balanced() {
    let hooks = Counting::default();
    let mut fib = new_fib(true, &hooks);

    let a = fib.allocate(100).unwrap();
    let b = fib.allocate(5000).unwrap();
    fib.allocate(usize::MAX).unwrap_err();
    let _ = fib.max_free_user_block_size();
    let _ = fib.is_correct_empty();

    unsafe {
        fib.deallocate(a.cast());
        fib.deallocate(b.cast());
    }

    assert_eq!(hooks.locks.get(), hooks.unlocks.get());
    assert!(hooks.locks.get() >= 7);
}

#[test]
fn rejects_infeasible_regions() {
    let hooks = Counting::default();

    // Below the minimum region size.
    assert!(matches!(
        Fib::try_new(8192, false, &hooks),
        Err(AllocInitError::InvalidConfig)
    ));

    // Not a multiple of the maximum alignment.
    assert!(matches!(
        Fib::try_new(REGION + 8, false, &hooks),
        Err(AllocInitError::InvalidConfig)
    ));

    assert_eq!(hooks.bad_allocs.get(), 2);
}

#[test]
fn rejects_misaligned_raw_regions() {
    let hooks = Counting::default();
    let mut backing: Vec<u128> = Vec::with_capacity(16384 / 16 + 1);
    backing.resize(16384 / 16 + 1, 0);

    let skewed = NonNull::new((backing.as_mut_ptr() as *mut u8).wrapping_add(8)).unwrap();
    let result = unsafe {
        Fibonacci::<128, 8, 3, _, _>::new_raw(skewed, 16384, false, &hooks)
    };

    assert!(matches!(result, Err(AllocInitError::InvalidLocation)));
    assert_eq!(hooks.bad_allocs.get(), 1);
}

#[test]
fn raw_region_round_trip() {
    let mut backing: Vec<u128> = Vec::with_capacity(REGION / 16);
    backing.resize(REGION / 16, 0);
    let region = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();

    let mut fib = unsafe {
        Fibonacci::<128, 8, 3, (), _>::new_raw(region, REGION, true, ()).unwrap()
    };

    let ptr = fib.allocate(4096).unwrap();
    unsafe { fib.deallocate(ptr.cast()) };
    assert!(fib.is_correct_empty());

    let (recovered, ()) = unsafe { fib.into_raw_parts() };
    assert_eq!(recovered.addr(), region.addr());
}

#[test]
fn allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        for exact in [false, true] {
            let hooks = Counting::default();
            let mut fib = new_fib(exact, &hooks);

            let mut allocations: Vec<Allocation> = Vec::with_capacity(ops.len());

            for (id, op) in ops.iter().enumerate() {
                let id = id as u8;

                match *op {
                    AllocatorOp::Allocate { size } => {
                        let ptr = match fib.allocate(size) {
                            Ok(p) => p,
                            Err(_) => continue,
                        };

                        if ptr.cast::<u8>().as_ptr() as usize % 8 != 0 {
                            return false;
                        }

                        let payload = unsafe {
                            slice::from_raw_parts_mut(ptr.cast::<u8>().as_ptr(), ptr.len())
                        };
                        payload.fill(id);

                        allocations.push(Allocation { id, ptr });
                    }

                    AllocatorOp::Free { index } => {
                        if allocations.is_empty() {
                            continue;
                        }

                        let a = allocations.swap_remove(index % allocations.len());

                        let payload = unsafe {
                            slice::from_raw_parts(a.ptr.cast::<u8>().as_ptr(), a.ptr.len())
                        };
                        if payload.iter().any(|&byte| byte != a.id) {
                            return false;
                        }

                        unsafe { fib.deallocate(a.ptr.cast()) };
                    }
                }

                fib.check_consistency();
            }

            for a in allocations {
                unsafe { fib.deallocate(a.ptr.cast()) };
            }

            fib.check_consistency();
            if !fib.is_correct_empty() {
                return false;
            }
        }

        true
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}
