//! Protection Registry (§4.7): the per-cell and per-stub flags controlling
//! mutability and visibility, and the deep freeze/protect traversal that
//! uses black-coloring (not the collector's mark bit) to guard against cycles.

use crate::runtime::Runtime;
use crate::stub::{FlavorClass, GuardedRef, StubRef};

/// Flags accepted by `Runtime::protect`/`unprotect` (§6, §4.7).
#[derive(Clone, Copy, Default)]
pub struct ProtectFlags {
    /// Recurse into arrays/contexts/series reachable from the value.
    pub deep: bool,
    /// Toggle the cell-level `hidden` bit instead of (or in addition to) `protected`.
    pub hide: bool,
    /// Make the change permanent (monotonic): sets `frozen_shallow`/`frozen_deep` instead of the toggle-able `protected` bit.
    pub freeze: bool,
    /// Apply to word (cell) slots.
    pub words: bool,
    /// Apply to the referenced object's stub.
    pub values: bool,
    /// Set vs. clear (ignored when `freeze` is set: freezing never un-sets).
    pub set: bool,
}

impl ProtectFlags {
    pub fn freeze_deep() -> Self {
        ProtectFlags { deep: true, freeze: true, values: true, set: true, ..Default::default() }
    }
    pub fn freeze_shallow() -> Self {
        ProtectFlags { freeze: true, values: true, set: true, ..Default::default() }
    }
    pub fn protect_values(set: bool) -> Self {
        ProtectFlags { values: true, set, ..Default::default() }
    }
}

/// Optional diagnostic tag recorded on auto-locked objects (§4.7), e.g.
/// "used as a map key". Retrievable via `Runtime::locker_of`.
pub type Locker = &'static str;

impl Runtime {
    /// Apply `flags` to `value` (§6). Freezing an already-immutable value
    /// (no stub payload to protect) is a no-op (§4.7).
    pub fn protect(&mut self, value: GuardedRef, flags: ProtectFlags) {
        self.protect_with_locker(value, flags, None)
    }

    pub fn protect_with_locker(&mut self, value: GuardedRef, flags: ProtectFlags, locker: Option<Locker>) {
        let stub = match value {
            GuardedRef::Stub(s) => s,
            GuardedRef::Cell(c) => {
                if flags.words {
                    let cell = unsafe { c.as_mut() };
                    if flags.hide {
                        cell.set_hidden(flags.freeze || flags.set);
                    } else {
                        cell.set_protected(flags.freeze || flags.set);
                    }
                }
                return;
            }
        };
        if flags.values {
            self.apply_protect_to_stub(stub, &flags);
            if let Some(tag) = locker {
                self.lockers.insert(stub, tag);
                log::debug!(target: "bedrock::protect", "auto-locked stub: {}", tag);
            }
        }
        if flags.deep {
            self.protect_deep(stub, &flags);
        }
    }

    pub fn unprotect(&mut self, value: GuardedRef, flags: ProtectFlags) {
        debug_assert!(!flags.freeze, "freezing is monotonic; unprotect must not request freeze");
        let mut f = flags;
        f.set = false;
        self.protect(value, f);
    }

    fn apply_protect_to_stub(&mut self, stub: StubRef, flags: &ProtectFlags) {
        let s = unsafe { stub.as_mut() };
        if flags.freeze {
            if flags.deep {
                s.freeze_deep();
            } else {
                s.freeze_shallow();
            }
        } else {
            s.set_protected(flags.set);
        }
    }

    /// Recurse into every cell-holding stub reachable from `root`, applying
    /// the same protect/freeze flags. Cycle safety: stubs visited this pass
    /// are "blackened" (`BIT_BLACK`, independent of the collector's mark
    /// bit) and uncolored again once the whole traversal completes (§4.7).
    fn protect_deep(&mut self, root: StubRef, flags: &ProtectFlags) {
        let mut blackened = Vec::new();
        self.protect_deep_visit(root, flags, &mut blackened);
        for s in blackened {
            unsafe { s.as_mut() }.set_black(false);
        }
    }

    fn protect_deep_visit(&mut self, stub: StubRef, flags: &ProtectFlags, blackened: &mut Vec<StubRef>) {
        let s = unsafe { stub.as_mut() };
        if s.black() {
            return;
        }
        s.set_black(true);
        blackened.push(stub);
        self.apply_protect_to_stub(stub, flags);

        let traits = self.flavor_traits(s.flavor());
        if traits.class != FlavorClass::HoldsCells {
            return;
        }
        let is_dynamic = s.is_dynamic();
        let count = if is_dynamic { unsafe { s.dynamic() }.used } else { 1 };
        for i in 0..count {
            for child in self.cell_payload_stubs_at(stub, i).into_iter().flatten() {
                self.protect_deep_visit(child, flags, blackened);
            }
        }
    }

    /// Look up the `i`th cell of `stub`'s content and return every one of its
    /// `payload_one`/`payload_two` slots that is heart-tagged as a stub
    /// reference (a cell can carry two independent references at once, and
    /// deep freeze must reach both — §4.7). Returned by value so the borrow
    /// of `stub`'s content ends before the caller recurses.
    fn cell_payload_stubs_at(&self, stub: StubRef, i: usize) -> [Option<StubRef>; 2] {
        let s = unsafe { stub.as_ref() };
        let cell = if s.is_dynamic() {
            let db = unsafe { s.dynamic() };
            db.ptr.map(|base| unsafe { &*((base.as_ptr() as *const crate::cell::Cell).add(i)) })
        } else {
            Some(unsafe { &*(&s.content.inline as *const crate::cell::Cell) })
        };
        let cell = match cell {
            Some(cell) => cell,
            None => return [None, None],
        };
        let traits = self.heart_traits(cell.heart());
        let to_stub = |kind: crate::gc::PayloadKind, word: usize| {
            if kind == crate::gc::PayloadKind::Stub && word != 0 {
                std::ptr::NonNull::new(word as *mut crate::stub::Stub).map(StubRef)
            } else {
                None
            }
        };
        [to_stub(traits.payload_one_kind, cell.payload_one), to_stub(traits.payload_two_kind, cell.payload_two)]
    }

    /// Deep freeze is transitive and monotonic (§4.7, P8): once a value's
    /// stub (or any stub reachable via a cell-holding chain) is `frozen_deep`,
    /// this continues to report true for the lifetime of the object graph.
    pub fn is_frozen_deep(&self, value: GuardedRef) -> bool {
        match value {
            GuardedRef::Stub(s) => unsafe { s.as_ref() }.is_frozen_deep(),
            GuardedRef::Cell(_) => false,
        }
    }

    pub fn is_locked(&self, value: GuardedRef) -> bool {
        match value {
            GuardedRef::Stub(s) => unsafe { s.as_ref() }.is_locked(),
            GuardedRef::Cell(c) => unsafe { c.as_ref() }.protected(),
        }
    }

    pub fn locker_of(&self, stub: StubRef) -> Option<Locker> {
        self.lockers.get(&stub).copied()
    }

    /// Toggle-protect `value` and return a guard that unprotects it again on
    /// `Drop` (§9 "Scoped acquisition"). Not offered for `freeze`, which is
    /// monotonic and so has nothing to scope.
    pub fn protect_scoped(&mut self, value: GuardedRef, flags: ProtectFlags) -> ProtectGuard {
        debug_assert!(!flags.freeze, "freezing is monotonic; use protect() directly, not a scoped guard");
        self.protect(value, flags);
        ProtectGuard { rt: self as *mut Runtime, value, flags, released: false }
    }
}

/// RAII handle returned by [`Runtime::protect_scoped`]: restores the prior
/// (unprotected) state on `Drop`, the same scoped-acquisition discipline
/// [`crate::lifeguard::LifeguardHandle`] uses for the lifeguard registry.
#[must_use = "dropping a ProtectGuard immediately reverts its protection; bind it to a variable"]
pub struct ProtectGuard {
    rt: *mut Runtime,
    value: GuardedRef,
    flags: ProtectFlags,
    released: bool,
}

impl ProtectGuard {
    /// Revert early, equivalent to (and implemented by) dropping the guard.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if !self.released {
            self.released = true;
            unsafe { (*self.rt).unprotect(self.value, self.flags) };
        }
    }
}

impl Drop for ProtectGuard {
    fn drop(&mut self) {
        self.release_now();
    }
}
