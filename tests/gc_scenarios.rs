//! End-to-end collector scenarios (§8 "Concrete end-to-end scenarios").
//!
//! Each test stands up a `Runtime`, wires together managed array stubs by
//! hand (stand-in for a host evaluator's datatype layer), and asserts on the
//! observable GC state afterwards: whether a stub's pool unit reads back as
//! free, or whether a stale reference has been canonicalized.

mod common;

use bedrock::stub::GuardedRef;
use common::*;

#[test]
fn cycle_is_collected_when_unrooted() {
    let mut rt = new_runtime();
    let a = alloc_array(&mut rt, 1);
    let b = alloc_array(&mut rt, 1);
    set_ref(a, 0, b);
    set_ref(b, 0, a);

    rt.recycle();

    assert!(is_free(a), "A should have been swept: nothing roots the A/B cycle");
    assert!(is_free(b), "B should have been swept: nothing roots the A/B cycle");
}

#[test]
fn lifeguard_keeps_a_rooted_cycle_alive() {
    let mut rt = new_runtime();
    let a = alloc_array(&mut rt, 1);
    let b = alloc_array(&mut rt, 1);
    set_ref(a, 0, b);
    set_ref(b, 0, a);

    let guard = rt.push_lifeguard(GuardedRef::Stub(a));
    rt.recycle();
    assert!(!is_free(a), "A is lifeguarded and must survive");
    assert!(!is_free(b), "B is reachable from A and must survive");

    guard.release();
    rt.recycle();
    assert!(is_free(a), "once unguarded, the cycle is unreachable again");
    assert!(is_free(b), "once unguarded, the cycle is unreachable again");
}

#[test]
fn diminished_stub_is_canonicalized_then_reclaimed() {
    let mut rt = new_runtime();
    let a = alloc_array(&mut rt, 0);
    let b = alloc_array(&mut rt, 1);
    set_ref(b, 0, a);

    // A is never managed: it stands in for an evaluator-owned handle that is
    // explicitly diminished (payload released) without immediately being
    // returned to the pool (§4.3 step 1 only).
    rt.unmanage(a);
    rt.diminish_unmanaged(a);
    assert!(is_unreadable(a), "diminish must mark the stub unreadable");
    assert!(!is_free(a), "a diminished-but-not-yet-killed unit is still pool-resident");

    let guard = rt.push_lifeguard(GuardedRef::Stub(b));
    rt.recycle();

    // B's reference has been rewritten to the canon diminished stub, and A's
    // old unit has finally been returned to the pool by sweep (§4.8, §8 P3).
    assert!(is_free(a), "sweep must finish reclaiming the diminished stub's unit");
    let b_ref = unsafe { b.as_ref().dynamic() }.ptr.unwrap().as_ptr() as *const bedrock::cell::Cell;
    let rewritten = unsafe { (*b_ref).payload_one };
    assert_ne!(rewritten, a.as_ptr() as usize, "B's stale pointer to A must be rewritten");
    assert_ne!(rewritten, 0);

    guard.release();
}

#[test]
fn deep_nesting_does_not_overflow_the_native_stack() {
    let mut rt = new_runtime();
    // Scaled down from the spec's 200,000 to keep the test suite fast while
    // still exercising depths well beyond any plausible native stack budget.
    const DEPTH: usize = 20_000;

    let mut current = alloc_array(&mut rt, 0);
    for _ in 0..DEPTH {
        let wrapper = alloc_array(&mut rt, 1);
        set_ref(wrapper, 0, current);
        current = wrapper;
    }

    let guard = rt.push_lifeguard(GuardedRef::Stub(current));
    let swept = rt.recycle();
    assert_eq!(swept, 0, "every wrapper is reachable from the lifeguarded outermost array");
    assert!(!is_free(current));

    guard.release();
    rt.recycle();
}

#[test]
fn data_stack_expansion_preserves_indices_not_pointers() {
    let mut rt = new_runtime();
    let start_cap = {
        // Push one cell to force the stack to materialize its cache, then
        // read back capacity indirectly via repeated pushes below.
        rt.push_data_stack(bedrock::cell::Cell::new_readable(HEART_REF)).unwrap();
        rt.drop_to(0);
        64usize // matches DataStack::new's INITIAL_STACK_CELLS
    };

    let mut last_idx = 0;
    for i in 0..(start_cap + 8) {
        let mut c = bedrock::cell::Cell::new_readable(HEART_REF);
        c.payload_one = i + 1;
        last_idx = rt.push_data_stack(c).unwrap();
    }

    for i in 1..=last_idx {
        assert_eq!(rt.stack_get(i).payload_one, i, "index {i} must still resolve to the value pushed there");
    }
    rt.drop_to(0);
}

#[test]
fn freeze_deep_rejects_mutation_and_is_monotonic() {
    use bedrock::error::MemError;
    use bedrock::protect::ProtectFlags;

    let mut rt = new_runtime();
    let arr = alloc_array(&mut rt, 3);
    let guard = rt.push_lifeguard(GuardedRef::Stub(arr));

    assert!(!rt.is_frozen_deep(GuardedRef::Stub(arr)));
    rt.protect(GuardedRef::Stub(arr), ProtectFlags::freeze_deep());
    assert!(rt.is_frozen_deep(GuardedRef::Stub(arr)));
    assert!(rt.is_locked(GuardedRef::Stub(arr)));

    // Appending requires growing the dynamic buffer; a frozen stub rejects it.
    let result = rt.expand_at(arr, 3, 1);
    assert_eq!(result, Err(MemError::Locked));

    // Freezing is monotonic (P8): still frozen after the rejected attempt.
    assert!(rt.is_frozen_deep(GuardedRef::Stub(arr)));

    guard.release();
}

#[test]
fn recycle_twice_reclaims_nothing_on_the_second_pass() {
    let mut rt = new_runtime();
    let a = alloc_array(&mut rt, 1);
    let b = alloc_array(&mut rt, 1);
    set_ref(a, 0, b);
    set_ref(b, 0, a);

    let (first, second) = rt.recycle_twice();
    assert!(first >= 2, "first pass must reclaim the unrooted cycle");
    assert_eq!(second, 0, "second back-to-back pass must reclaim nothing (P7)");
}

#[test]
fn sweeplist_mode_reports_without_freeing() {
    let mut rt = new_runtime();
    let a = alloc_array(&mut rt, 0);
    let mut sweeplist = Vec::new();
    rt.recycle_core(Some(&mut sweeplist));
    assert!(sweeplist.iter().any(|s| *s == a), "unrooted A should appear in the sweeplist");
    assert!(!is_free(a), "sweeplist mode must not actually free anything");

    // A real recycle (not sweeplist mode) does free it.
    rt.recycle();
    assert!(is_free(a));
}

#[test]
fn shutdown_leaves_the_heap_counter_at_zero() {
    let mut rt = new_runtime();
    let _ = alloc_array(&mut rt, 4);
    rt.shutdown().expect("a runtime with no leaked unmanaged stubs shuts down cleanly");
}
