//! Randomized alloc/free replay against the segmented pool allocator (§4.2),
//! adapted from the `Operations` pattern a sibling allocator crate in this
//! retrieval pack uses for its own quickcheck suite: a sequence of `Alloc`/
//! `Free` operations is generated, then replayed against the real allocator
//! while an independent model checks that no two simultaneously-live
//! allocations ever alias.

use bedrock::heap::HeapAllocator;
use bedrock::pool::PoolSet;
use quickcheck::{Arbitrary, Gen};
use rand::Rng;

#[derive(Debug, Clone, Copy)]
enum Operation {
    Alloc(usize),
    Free(usize),
}

use Operation::*;

#[derive(Debug, Clone)]
struct Operations(Vec<Operation>);

const NUM_OPERATIONS: usize = 500;
const MAX_ALLOC_SIZE: usize = 2048; // spans a few pool classes plus the heap fallback

impl Arbitrary for Operations {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let mut num_allocs = 0usize;
        let mut active: Vec<usize> = Vec::new();
        let mut ops = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            if !active.is_empty() && g.gen_ratio(1, 3) {
                let i = g.gen_range(0, active.len());
                ops.push(Free(active.swap_remove(i)));
            } else {
                ops.push(Alloc(g.gen_range(1, MAX_ALLOC_SIZE)));
                active.push(num_allocs);
                num_allocs += 1;
            }
        }
        while !active.is_empty() {
            let i = g.gen_range(0, active.len());
            ops.push(Free(active.swap_remove(i)));
        }
        Operations(ops)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let ops = self.0.clone();
        Box::new((0..self.0.len()).rev().map(move |n| Operations(ops[..n].to_vec())))
    }
}

fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    let (a_start, a_len) = a;
    let (b_start, b_len) = b;
    a_start < b_start + b_len && b_start < a_start + a_len
}

fn run(ops: Operations) -> bool {
    let mut heap = HeapAllocator::new();
    let mut pools = PoolSet::new(1, 64, false);
    let mut live: Vec<Option<(usize, usize)>> = Vec::new();

    for op in ops.0 {
        match op {
            Alloc(size) => {
                let ptr = pools.alloc_bytes(&mut heap, size).expect("heap fallback must not fail at this scale");
                let span = (ptr.as_ptr() as usize, size);
                for other in live.iter().flatten() {
                    if overlaps(span, *other) {
                        return false;
                    }
                }
                live.push(Some(span));
            }
            Free(idx) => {
                if let Some(slot) = live.get_mut(idx) {
                    if let Some((addr, size)) = slot.take() {
                        unsafe {
                            pools.free_bytes(&mut heap, std::ptr::NonNull::new_unchecked(addr as *mut u8), size);
                        }
                    }
                }
            }
        }
    }
    pools.release_all(&mut heap);
    true
}

#[test]
fn no_two_live_allocations_alias() {
    let _ = env_logger::try_init();
    quickcheck::QuickCheck::new().tests(30).quickcheck(run as fn(Operations) -> bool);
}
