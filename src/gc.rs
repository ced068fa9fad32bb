//! Collector (§4.8): a non-recursive, non-concurrent, non-generational
//! mark/sweep pass over stubs and pairings, with root enumeration, delegated
//! per-flavor cleanup, and canonicalization of dead references.
//!
//! The mark queue replaces native recursion (§9 "Non-recursive traversal");
//! every marking entry point below takes the *address* of a pointer slot
//! (`*mut Word`/`*mut Cell`), never a borrowed reference, so it can both
//! recurse through `Runtime` and rewrite a dead reference in place (§4.8
//! "Marking protocol").

use std::ptr::NonNull;

use crate::cell::{Cell, Heart, Word, BIT_CANON_DIMINISHED};
use crate::runtime::Runtime;
use crate::stub::{FlavorClass, GuardedRef, Pairing, Stub, StubRef};

/// What kind of reference (if any) a heart's `extra`/`payload.one`/`payload.two`
/// slot carries (§3: "extra slot traceability is determined by a table keyed
/// by heart, not a flag"; this crate extends the same idea to the two payload
/// slots, gated per-cell by the existing skip-mark flags).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PayloadKind {
    #[default]
    None,
    Stub,
    Pairing,
}

#[derive(Clone, Copy, Default)]
pub struct HeartTraits {
    pub extra_kind: PayloadKind,
    pub payload_one_kind: PayloadKind,
    pub payload_two_kind: PayloadKind,
}

/// Runs one full collection: mark every root, drain the queue, then sweep.
/// Returns the swept count (or, in `sweeplist` mode, fills `sweeplist` and
/// returns its length without freeing anything — §4.8 "A sweeplist mode").
pub(crate) fn recycle_core(rt: &mut Runtime, sweeplist: Option<&mut Vec<StubRef>>) -> usize {
    let marks_before = rt.marks_added;
    unsafe {
        mark_roots(rt);
        drain_mark_queue(rt);
    }
    let swept = sweep(rt, sweeplist);
    let marks_after_sweep_clears = rt.marks_removed;
    debug_assert!(
        rt.marks_added >= marks_before,
        "marks_added must not decrease across a collection"
    );
    let _ = marks_after_sweep_clears;
    swept
}

unsafe fn mark_roots(rt: &mut Runtime) {
    // 1. built-in type-descriptor / library patches (fixed storage outside the stub pool).
    for p in rt.fixed_patches.clone() {
        ensure_marked_stub(rt, p);
    }

    // 2. the current thrown value and label slots.
    let thrown_ptr = &mut rt.thrown as *mut Cell;
    mark_cell(rt, thrown_ptr);
    let label_ptr = &mut rt.label as *mut Cell;
    mark_cell(rt, label_ptr);

    // 3. root stubs: every stub-pool unit whose root bit is set.
    let units: Vec<NonNull<u8>> = rt.pools.stub_units().collect();
    for unit in units {
        if crate::pool::Pool::is_free_unit(unit) {
            continue;
        }
        let flag = crate::cell::FlagByte(*unit.as_ptr());
        if flag.is_cell() {
            continue; // a pairing, not a stub; pairings are never roots.
        }
        let stub_ptr = unit.as_ptr() as *mut Stub;
        if (*stub_ptr).root() {
            let sref = StubRef(NonNull::new_unchecked(stub_ptr));
            ensure_marked_stub(rt, sref);
        }
    }

    // 4. the data stack, indices 1..=top.
    for i in 1..=rt.data_stack.top() {
        let cp = rt.data_stack.cell_ptr_mut(i);
        mark_cell(rt, cp);
    }

    // 5. the lifeguard registry.
    let guarded: Vec<GuardedRef> = rt.lifeguards.iter().copied().collect();
    for g in guarded {
        match g {
            GuardedRef::Cell(c) => mark_cell(rt, c.as_ptr()),
            GuardedRef::Stub(s) => ensure_marked_stub(rt, s),
        }
    }

    // 6. every allocated call level: feed/binding/output/scratch/spare, and
    // argument slots up to their fulfillment progress (§4.8 step 6).
    for idx in 0..rt.call_levels.len() {
        mark_call_level(rt, idx);
    }

    // 7. iterated module-patch sweep, to a fixpoint (§4.8 step 7).
    loop {
        let before = rt.marks_added;
        let entries = rt.module_patches.clone();
        for (patch, owner) in entries {
            if (*owner.as_ptr()).marked() {
                ensure_marked_stub(rt, patch);
            }
        }
        drain_mark_queue(rt);
        if rt.marks_added == before {
            break;
        }
    }
}

unsafe fn mark_call_level(rt: &mut Runtime, idx: usize) {
    if !rt.call_levels[idx].active {
        return;
    }
    let p = &mut rt.call_levels[idx].feed as *mut Cell;
    mark_cell(rt, p);
    let p = &mut rt.call_levels[idx].binding as *mut Cell;
    mark_cell(rt, p);
    let p = &mut rt.call_levels[idx].output as *mut Cell;
    mark_cell(rt, p);
    let p = &mut rt.call_levels[idx].scratch as *mut Cell;
    mark_cell(rt, p);
    let p = &mut rt.call_levels[idx].spare as *mut Cell;
    mark_cell(rt, p);
    let fulfilled = rt.call_levels[idx].fulfilled;
    for i in 0..fulfilled {
        let p = &mut rt.call_levels[idx].args[i] as *mut Cell;
        mark_cell(rt, p);
    }
}

/// Mark `stub_ref` unconditionally: used for roots, which are never
/// diminished and so never need the canonicalization rewrite.
unsafe fn ensure_marked_stub(rt: &mut Runtime, stub_ref: StubRef) {
    let ptr = stub_ref.as_ptr();
    if (*ptr).marked() {
        return;
    }
    (*ptr).set_marked(true);
    rt.marks_added += 1;
    let flavor = (*ptr).flavor();
    let traits = rt.flavor_traits(flavor);
    if traits.trace_link {
        mark_word_as_stub_ref(rt, &mut (*ptr).link as *mut Word);
    }
    if traits.trace_misc {
        mark_word_as_stub_ref(rt, &mut (*ptr).misc as *mut Word);
    }
    if traits.trace_info {
        mark_word_as_stub_ref(rt, &mut (*ptr).info as *mut Word);
    }
    if traits.class == FlavorClass::HoldsCells {
        rt.mark_queue.push(stub_ref);
    }
}

/// Marking protocol step for a `Word` slot known to hold a stub reference
/// (§4.8 "Marking protocol"):
/// 1. already marked / is the canon diminished stub → return.
/// 2. non-canon diminished → rewrite the slot to the canon diminished stub, return.
/// 3. otherwise mark it (and, transitively, its own traced slots).
unsafe fn mark_word_as_stub_ref(rt: &mut Runtime, slot: *mut Word) {
    let raw = *slot;
    if raw == 0 {
        return; // null is tolerated (§3: extra slot "must tolerate a null value").
    }
    let candidate = StubRef(NonNull::new_unchecked(raw as *mut Stub));
    if candidate == rt.canon_diminished {
        return;
    }
    if (*candidate.as_ptr()).marked() {
        return;
    }
    if (*candidate.as_ptr()).unreadable() {
        // Non-canon diminished: canonicalize (§4.3, §9 "Dead-reference canonicalization").
        *slot = rt.canon_diminished.as_ptr() as Word;
        return;
    }
    ensure_marked_stub(rt, candidate);
}

unsafe fn mark_word_as_pairing_ref(rt: &mut Runtime, slot: *mut Word) {
    let raw = *slot;
    if raw == 0 {
        return;
    }
    let ptr = raw as *mut Pairing;
    if (*ptr).marked() {
        return;
    }
    mark_cell(rt, &mut (*ptr).cells[0] as *mut Cell);
    mark_cell(rt, &mut (*ptr).cells[1] as *mut Cell);
    (*ptr).set_marked(true);
    rt.marks_added += 1;
}

/// Cell scanning (§4.8 "Cell scanning"): skip unreadable cells; otherwise
/// trace `extra` per the heart table (tolerating null) and each payload slot
/// per the heart table, gated by that cell's own skip-mark flags.
unsafe fn mark_cell(rt: &mut Runtime, cell: *mut Cell) {
    if (*cell).is_unreadable() {
        return;
    }
    let heart: Heart = (*cell).heart();
    let traits = rt.heart_traits(heart);

    if traits.extra_kind == PayloadKind::Stub {
        mark_word_as_stub_ref(rt, &mut (*cell).extra as *mut Word);
    }

    if !(*cell).skip_mark_payload_one() {
        match traits.payload_one_kind {
            PayloadKind::Stub => mark_word_as_stub_ref(rt, &mut (*cell).payload_one as *mut Word),
            PayloadKind::Pairing => mark_word_as_pairing_ref(rt, &mut (*cell).payload_one as *mut Word),
            PayloadKind::None => {}
        }
    }
    if !(*cell).skip_mark_payload_two() {
        match traits.payload_two_kind {
            PayloadKind::Stub => mark_word_as_stub_ref(rt, &mut (*cell).payload_two as *mut Word),
            PayloadKind::Pairing => mark_word_as_pairing_ref(rt, &mut (*cell).payload_two as *mut Word),
            PayloadKind::None => {}
        }
    }
}

unsafe fn drain_mark_queue(rt: &mut Runtime) {
    while let Some(stub_ref) = rt.mark_queue.pop() {
        scan_stub_cells(rt, stub_ref);
    }
}

unsafe fn scan_stub_cells(rt: &mut Runtime, stub_ref: StubRef) {
    let ptr = stub_ref.as_ptr();
    if (*ptr).is_dynamic() {
        let db = (*ptr).dynamic();
        if let Some(buf) = db.ptr {
            let cells = buf.as_ptr() as *mut Cell;
            for i in 0..db.used {
                mark_cell(rt, cells.add(i));
            }
        }
    } else {
        mark_cell(rt, (*ptr).inline_mut() as *mut Cell);
    }
}

/// Sweep (§4.8 "Sweep"): walk every stub-pool unit in allocation order. A
/// unit's first byte (free sentinel) and, failing that, its `BIT_IS_CELL`
/// bit (set for a pairing's first cell, clear for a stub) dispatch the
/// per-unit handling without a typed match (§9 "Pointer-based polymorphism").
fn sweep(rt: &mut Runtime, mut sweeplist: Option<&mut Vec<StubRef>>) -> usize {
    let mut swept = 0usize;
    let units: Vec<NonNull<u8>> = rt.pools.stub_units().collect();
    for unit in units {
        if crate::pool::Pool::is_free_unit(unit) {
            continue;
        }
        let flag = crate::cell::FlagByte(unsafe { *unit.as_ptr() });
        if flag.is_cell() {
            swept += sweep_pairing(rt, unit, &mut sweeplist);
        } else {
            swept += sweep_stub(rt, unit, &mut sweeplist);
        }
    }

    for p in rt.fixed_patches.clone() {
        unsafe { (*p.as_ptr()).set_marked(false) };
    }
    rt.marks_removed += rt.fixed_patches.len() as u64;

    rt.depletion = rt.ballast;
    log::info!(target: "bedrock::gc", "recycle: swept {} units (stub pool occupancy {:?})", swept, rt.pools.occupancy());
    swept
}

fn sweep_pairing(rt: &mut Runtime, unit: NonNull<u8>, sweeplist: &mut Option<&mut Vec<StubRef>>) -> usize {
    let p = unit.as_ptr() as *mut Pairing;
    unsafe {
        debug_assert!((*p).managed(), "an unmanaged pairing should never exist");
        if (*p).marked() {
            (*p).set_marked(false);
            rt.marks_removed += 1;
            0
        } else if let Some(list) = sweeplist.as_deref_mut() {
            list.push(StubRef(NonNull::new_unchecked(unit.as_ptr() as *mut Stub)));
            0
        } else {
            rt.pools.free_stub_unit(&mut rt.heap, unit.cast());
            1
        }
    }
}

fn sweep_stub(rt: &mut Runtime, unit: NonNull<u8>, sweeplist: &mut Option<&mut Vec<StubRef>>) -> usize {
    let s = unit.as_ptr() as *mut Stub;
    unsafe {
        let flags = (*s).flags();
        if !flags.managed() {
            // The canon diminished stub is unmanaged and permanently marked
            // by construction (§4.3); it is never reclaimed by sweep.
            if flags.get(BIT_CANON_DIMINISHED) {
                return 0;
            }
            debug_assert!(!flags.marked(), "a mark reached an unmanaged stub (§3 Lifetimes)");
            // A stub `diminish_unmanaged`'d earlier but never explicitly
            // killed: its unit is reclaimed now (§4.3 step 2, §4.8 "Sweep").
            if flags.unreadable() {
                let sref = StubRef(NonNull::new_unchecked(s));
                if let Some(list) = sweeplist.as_deref_mut() {
                    list.push(sref);
                    return 0;
                }
                rt.kill_stub(sref);
                return 1;
            }
            return 0;
        }
        if flags.marked() {
            (*s).set_marked(false);
            rt.marks_removed += 1;
            return 0;
        }
        // Managed and unmarked: garbage.
        let sref = StubRef(NonNull::new_unchecked(s));
        if let Some(list) = sweeplist.as_deref_mut() {
            list.push(sref);
            return 0;
        }
        if !flags.unreadable() {
            rt.diminish_stub(sref);
        }
        rt.kill_stub(sref);
        1
    }
}
