//! Runtime (§4.10-§4.12, §5, §6): the single context value every other
//! subsystem hangs off of. Owns the heap counter, the pool set, the data
//! stack, the lifeguard registry, the mark queue, the manuals list, and the
//! hook tables a host evaluator registers at startup (§9 "Global mutable
//! state": no subsystem in this crate reaches for a process-wide global).

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;

use crate::cell::{Cell, Heart, Word};
use crate::error::{MemError, MAX_EXPAND_DELTA};
use crate::gc::{HeartTraits, PayloadKind};
use crate::heap::HeapAllocator;
use crate::lifeguard::{LifeguardHandle, LifeguardRegistry};
use crate::pool::PoolSet;
use crate::protect::Locker;
use crate::stack::DataStack;
use crate::stub::{
    builtin_flavor_traits, DynamicBuffer, Flavor, FlavorTraits, GuardedRef, ManagedRef, Pairing, PairingRef, Stub,
    StubRef, FLAVOR_DIMINISHED, STUB_WORDS,
};

/// Configuration accepted by `Runtime::startup` (§4.12); three environment
/// variables override these defaults when present.
#[derive(Clone, Copy)]
pub struct Config {
    /// Multiplies every pool's units-per-segment (§4.2).
    pub pool_scale: usize,
    /// Initial allocation-byte budget between collections (GLOSSARY "ballast").
    pub initial_ballast: usize,
    /// `NEPTUNE_ALWAYS_MALLOC`: route every small allocation through the heap (§4.2, §4.12).
    pub always_malloc: bool,
    /// `NEPTUNE_ALLOC_FUZZ`: seed for the debug allocation-fuzz switch (§4.1, §4.12).
    pub alloc_fuzz_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config { pool_scale: 1, initial_ballast: 4 * 1024 * 1024, always_malloc: false, alloc_fuzz_seed: None }
    }
}

impl Config {
    /// Apply `NEPTUNE_RECYCLE_TORTURE`, `NEPTUNE_ALWAYS_MALLOC`, `NEPTUNE_ALLOC_FUZZ` (§4.12).
    pub fn from_env(mut self) -> Self {
        if std::env::var("NEPTUNE_RECYCLE_TORTURE").as_deref() == Ok("1") {
            self.initial_ballast = 0;
        }
        if std::env::var("NEPTUNE_ALWAYS_MALLOC").as_deref() == Ok("1") {
            self.always_malloc = true;
        }
        if let Ok(raw) = std::env::var("NEPTUNE_ALLOC_FUZZ") {
            if let Ok(seed) = raw.parse::<u64>() {
                self.alloc_fuzz_seed = Some(seed);
            }
        }
        self
    }
}

/// A slot in the call-level pool (§4.2 "Two more pools hold call-level and
/// feed records", §4.8 step 6). The evaluator itself is out of scope; this
/// is only the shape the collector needs to trace.
pub struct CallLevel {
    pub active: bool,
    pub feed: Cell,
    pub binding: Cell,
    pub output: Cell,
    pub scratch: Cell,
    pub spare: Cell,
    pub args: Vec<Cell>,
    /// Argument slots `0..fulfilled` are initialized and traced; the rest are not yet live (§4.8 step 6).
    pub fulfilled: usize,
}

impl Default for CallLevel {
    fn default() -> Self {
        CallLevel {
            active: false,
            feed: Cell::erased(),
            binding: Cell::erased(),
            output: Cell::erased(),
            scratch: Cell::erased(),
            spare: Cell::erased(),
            args: Vec::new(),
            fulfilled: 0,
        }
    }
}

const RECENT_EXPANSION_CAPACITY: usize = 8;

pub struct Runtime {
    pub(crate) heap: HeapAllocator,
    pub(crate) pools: PoolSet,
    pub(crate) data_stack: DataStack,
    pub(crate) lifeguards: LifeguardRegistry,
    pub(crate) mark_queue: Vec<StubRef>,
    manuals: Vec<StubRef>,
    manual_ticks: HashMap<StubRef, u64>,
    alloc_tick: u64,
    pub(crate) canon_diminished: StubRef,
    pub(crate) fixed_patches: Vec<StubRef>,
    pub(crate) module_patches: Vec<(StubRef, StubRef)>,
    pub(crate) call_levels: Vec<CallLevel>,
    pub(crate) thrown: Cell,
    pub(crate) label: Cell,
    pub(crate) ballast: usize,
    pub(crate) depletion: usize,
    pub collection_enabled: bool,
    pub deferred_recycle: bool,
    in_recycle: bool,
    pub(crate) marks_added: u64,
    pub(crate) marks_removed: u64,
    pub(crate) lockers: HashMap<StubRef, Locker>,
    cleaners: HashMap<Flavor, crate::stub::Cleaner>,
    heart_traits_table: HashMap<Heart, HeartTraits>,
    flavor_traits_table: HashMap<Flavor, FlavorTraits>,
    recent_expansions: VecDeque<StubRef>,
}

impl Runtime {
    pub fn startup(config: Config) -> Runtime {
        let mut heap = HeapAllocator::new();
        if let Some(seed) = config.alloc_fuzz_seed {
            heap.enable_fuzz(seed);
        }
        let stub_width = STUB_WORDS * std::mem::size_of::<Word>();
        let pools = PoolSet::new(config.pool_scale, stub_width, config.always_malloc);
        let data_stack = DataStack::new(&mut heap).expect("failed to allocate initial data stack");

        let mut rt = Runtime {
            heap,
            pools,
            data_stack,
            lifeguards: LifeguardRegistry::new(),
            mark_queue: Vec::new(),
            manuals: Vec::new(),
            manual_ticks: HashMap::new(),
            alloc_tick: 0,
            canon_diminished: StubRef(NonNull::dangling()),
            fixed_patches: Vec::new(),
            module_patches: Vec::new(),
            call_levels: Vec::new(),
            thrown: Cell::erased(),
            label: Cell::erased(),
            ballast: config.initial_ballast,
            depletion: config.initial_ballast,
            collection_enabled: true,
            deferred_recycle: false,
            in_recycle: false,
            marks_added: 0,
            marks_removed: 0,
            lockers: HashMap::new(),
            cleaners: HashMap::new(),
            heart_traits_table: HashMap::new(),
            flavor_traits_table: HashMap::new(),
            recent_expansions: VecDeque::new(),
        };

        let canon = rt.alloc_raw_stub(FLAVOR_DIMINISHED);
        unsafe { (*canon.as_ptr()).mark_diminished(true) };
        rt.canon_diminished = canon;

        log::info!(
            target: "bedrock::runtime",
            "startup: pool_scale={} ballast={} always_malloc={}",
            config.pool_scale, config.initial_ballast, config.always_malloc
        );
        rt
    }

    /// Allocate a bare stub unit outside the manuals bookkeeping, for the
    /// one permanent exception: the canon diminished stub (§3, §4.3).
    fn alloc_raw_stub(&mut self, flavor: Flavor) -> StubRef {
        let unit = self.pools.alloc_stub_unit(&mut self.heap).expect("pool alloc for the canon diminished stub");
        unsafe {
            let ptr = unit.as_ptr() as *mut Stub;
            std::ptr::write(ptr, Stub::empty(flavor));
            StubRef(NonNull::new_unchecked(ptr))
        }
    }

    fn charge(&mut self, bytes: usize) {
        self.depletion = self.depletion.saturating_sub(bytes);
        if self.depletion == 0 {
            self.recycle();
        }
    }

    // --- allocation (§4.3, §6) -------------------------------------------

    pub fn alloc_stub(&mut self, flavor: Flavor) -> Result<StubRef, MemError> {
        let unit = self.pools.alloc_stub_unit(&mut self.heap)?;
        let sref = unsafe {
            let ptr = unit.as_ptr() as *mut Stub;
            std::ptr::write(ptr, Stub::empty(flavor));
            StubRef(NonNull::new_unchecked(ptr))
        };
        self.alloc_tick += 1;
        self.manuals.push(sref);
        self.manual_ticks.insert(sref, self.alloc_tick);
        self.charge(self.pools.stub_unit_width());
        Ok(sref)
    }

    pub fn alloc_pairing(&mut self) -> Result<PairingRef, MemError> {
        let unit = self.pools.alloc_stub_unit(&mut self.heap)?;
        let pref = unsafe {
            let ptr = unit.as_ptr() as *mut Pairing;
            (*ptr).cells[0] = Cell::new_readable(0);
            (*ptr).cells[1] = Cell::new_readable(0);
            (*ptr).set_managed(true);
            PairingRef(NonNull::new_unchecked(ptr))
        };
        self.charge(self.pools.stub_unit_width());
        Ok(pref)
    }

    pub fn manage(&mut self, obj: impl Into<ManagedRef>) {
        if let ManagedRef::Stub(s) = obj.into() {
            unsafe { (*s.as_ptr()).set_managed(true) };
            if let Some(pos) = self.manuals.iter().position(|m| *m == s) {
                self.manuals.swap_remove(pos);
                self.manual_ticks.remove(&s);
            }
        }
    }

    pub fn unmanage(&mut self, obj: impl Into<ManagedRef>) {
        if let ManagedRef::Stub(s) = obj.into() {
            unsafe { (*s.as_ptr()).set_managed(false) };
            if !self.manuals.contains(&s) {
                self.alloc_tick += 1;
                self.manuals.push(s);
                self.manual_ticks.insert(s, self.alloc_tick);
            }
        }
    }

    /// Diminish then kill an unmanaged stub directly, bypassing sweep
    /// (§4.3). A managed stub here is a precondition violation: fatal in
    /// checked builds, best-effort (proceeds anyway) in release (§7).
    pub fn free_unmanaged(&mut self, stub: StubRef) -> Result<(), MemError> {
        let managed = unsafe { (*stub.as_ptr()).managed() };
        debug_assert!(!managed, "free_unmanaged called on a managed stub");
        if let Some(pos) = self.manuals.iter().position(|m| *m == stub) {
            self.manuals.swap_remove(pos);
            self.manual_ticks.remove(&stub);
        }
        if !unsafe { (*stub.as_ptr()).unreadable() } {
            self.diminish_stub(stub);
        }
        self.kill_stub(stub);
        Ok(())
    }

    /// Diminish an unmanaged stub but leave its unit pool-resident (§4.3 step
    /// 1 only): the identity may still be referenced by a stale pointer from
    /// a managed stub, and that pointer is canonicalized to the canon
    /// diminished stub the next time marking reaches it. The unit itself is
    /// returned to the freelist only when sweep next visits it (§4.8 "Sweep").
    pub fn diminish_unmanaged(&mut self, stub: StubRef) {
        let managed = unsafe { (*stub.as_ptr()).managed() };
        debug_assert!(!managed, "diminish_unmanaged called on a managed stub");
        if let Some(pos) = self.manuals.iter().position(|m| *m == stub) {
            self.manuals.swap_remove(pos);
            self.manual_ticks.remove(&stub);
        }
        if !unsafe { (*stub.as_ptr()).unreadable() } {
            self.diminish_stub(stub);
        }
    }

    // --- diminish / kill (§4.3, shared with sweep in gc.rs) ---------------

    pub(crate) fn diminish_stub(&mut self, stub: StubRef) {
        let ptr = stub.as_ptr();
        unsafe {
            let flavor = (*ptr).flavor();
            if let Some(cleaner) = self.cleaners.get(&flavor).copied() {
                cleaner(&mut *ptr);
            }
            if (*ptr).is_dynamic() {
                let db = (*ptr).dynamic();
                if let Some(head) = db.ptr {
                    let width = self.flavor_traits(flavor).element_width();
                    let total = db.used + db.rest + db.bias;
                    let real_base = NonNull::new_unchecked(head.as_ptr().sub(db.bias * width));
                    self.pools.free_bytes(&mut self.heap, real_base, total * width);
                }
            }
            (*ptr).mark_diminished(false);
            #[cfg(any(debug_assertions, feature = "checked"))]
            {
                (*ptr).link = 0xDEAD_DEAD;
                (*ptr).misc = 0xDEAD_DEAD;
                (*ptr).info = 0xDEAD_DEAD;
            }
        }
    }

    pub(crate) fn kill_stub(&mut self, stub: StubRef) {
        unsafe { self.pools.free_stub_unit(&mut self.heap, NonNull::new_unchecked(stub.as_ptr() as *mut u8)) };
    }

    // --- dynamic buffer expansion (§4.4) -----------------------------------

    fn doubling_target(&mut self, stub: StubRef, want: usize) -> usize {
        let hot = self.recent_expansions.contains(&stub);
        self.recent_expansions.retain(|s| *s != stub);
        self.recent_expansions.push_back(stub);
        if self.recent_expansions.len() > RECENT_EXPANSION_CAPACITY {
            self.recent_expansions.pop_front();
        }
        if hot {
            want.saturating_mul(2)
        } else {
            want + want / 2 + 1
        }
    }

    /// Grow or shrink the dynamic buffer of `stub` at `index` by `delta`
    /// elements (§4.4). Invalidates any raw pointer into the buffer.
    pub fn expand_at(&mut self, stub: StubRef, index: usize, delta: isize) -> Result<(), MemError> {
        if delta == 0 {
            return Ok(());
        }
        if (delta.unsigned_abs() as usize) > MAX_EXPAND_DELTA {
            return Err(MemError::IndexOutOfRange);
        }
        let ptr = stub.as_ptr();
        unsafe {
            if !(*ptr).is_dynamic() || (*ptr).is_locked() {
                return Err(MemError::Locked);
            }
            let flavor = (*ptr).flavor();
            let width = self.flavor_traits(flavor).element_width();

            if delta > 0 {
                self.expand_grow(ptr, stub, index, delta as usize, width)
            } else {
                self.expand_shrink(ptr, index, (-delta) as usize);
                Ok(())
            }
        }
    }

    unsafe fn expand_grow(
        &mut self,
        ptr: *mut Stub,
        stub: StubRef,
        index: usize,
        grow: usize,
        width: usize,
    ) -> Result<(), MemError> {
        {
            let db = (*ptr).dynamic_mut();
            if index == 0 && db.bias >= grow {
                db.bias -= grow;
                db.used += grow;
                let new_head = db.ptr.expect("grown buffer must already have a head").as_ptr().sub(grow * width);
                db.ptr = NonNull::new(new_head);
                return Ok(());
            }
        }
        {
            let db = (*ptr).dynamic_mut();
            if db.rest >= grow {
                let base = db.ptr.expect("non-empty rest implies an existing allocation").as_ptr();
                let tail_len = db.used - index;
                std::ptr::copy(base.add(index * width), base.add((index + grow) * width), tail_len * width);
                db.used += grow;
                db.rest -= grow;
                return Ok(());
            }
        }
        // Reallocate: doubling heuristic keyed off the recent-expansion LRU (§4.4).
        let (old_head, old_bias, old_used, old_rest) = {
            let db = (*ptr).dynamic();
            (db.ptr, db.bias, db.used, db.rest)
        };
        let want = old_used + grow;
        let new_total = self.doubling_target(stub, want).max(want);
        let new_bytes = new_total * width;
        let new_buf = self.pools.alloc_bytes(&mut self.heap, new_bytes)?;
        if let Some(old_base) = old_head {
            let new_base = new_buf.as_ptr();
            std::ptr::copy_nonoverlapping(old_base.as_ptr(), new_base, index * width);
            std::ptr::copy_nonoverlapping(
                old_base.as_ptr().add(index * width),
                new_base.add((index + grow) * width),
                (old_used - index) * width,
            );
            let old_total = old_used + old_rest + old_bias;
            let old_real_base = NonNull::new_unchecked(old_base.as_ptr().sub(old_bias * width));
            self.pools.free_bytes(&mut self.heap, old_real_base, old_total * width);
        }
        let db = (*ptr).dynamic_mut();
        db.ptr = Some(new_buf);
        db.used = want;
        db.rest = new_total - want;
        db.bias = 0;
        self.charge(new_bytes);
        Ok(())
    }

    unsafe fn expand_shrink(&mut self, ptr: *mut Stub, index: usize, shrink: usize) {
        let width = self.flavor_traits((*ptr).flavor()).element_width();
        let db = (*ptr).dynamic_mut();
        if index == 0 {
            // Restoring head bias: P10 round-trip.
            db.bias += shrink;
            db.used -= shrink;
            let new_head = db.ptr.expect("shrinking an empty buffer").as_ptr().add(shrink * width);
            db.ptr = NonNull::new(new_head);
        } else {
            let base = db.ptr.expect("shrinking an empty buffer").as_ptr();
            let tail_len = db.used - index - shrink;
            std::ptr::copy(base.add((index + shrink) * width), base.add(index * width), tail_len * width);
            db.used -= shrink;
            db.rest += shrink;
        }
    }

    // --- data stack (§4.5, §6) --------------------------------------------

    pub fn push_data_stack(&mut self, cell: Cell) -> Result<usize, MemError> {
        let before_cap = self.data_stack.capacity();
        let idx = self.data_stack.push(&mut self.heap, cell)?;
        let after_cap = self.data_stack.capacity();
        if after_cap > before_cap {
            self.charge((after_cap - before_cap) * std::mem::size_of::<Cell>());
        }
        Ok(idx)
    }

    pub fn drop_to(&mut self, index: usize) {
        self.data_stack.drop_to(index);
    }

    pub fn stack_top(&self) -> usize {
        self.data_stack.top()
    }

    pub fn stack_get(&self, index: usize) -> Cell {
        self.data_stack.get(index)
    }

    pub fn stack_set(&mut self, index: usize, cell: Cell) {
        self.data_stack.set(index, cell);
    }

    /// Pop the range `base_index+1..=top` off the data stack into a new
    /// managed array-flavored stub (§4.5, §6).
    pub fn pop_to_array(&mut self, flavor: Flavor, base_index: usize) -> Result<StubRef, MemError> {
        let cells = self.data_stack.pop_to_array(base_index);
        self.data_stack.drop_to(base_index);
        let stub = self.alloc_stub(flavor)?;
        self.manage(stub);
        if !cells.is_empty() {
            let bytes = cells.len() * std::mem::size_of::<Cell>();
            let buf = self.pools.alloc_bytes(&mut self.heap, bytes)?;
            unsafe {
                std::ptr::copy_nonoverlapping(cells.as_ptr(), buf.as_ptr() as *mut Cell, cells.len());
                let s = stub.as_mut();
                s.set_dynamic(true);
                *s.dynamic_mut() = DynamicBuffer { ptr: Some(buf), used: cells.len(), rest: 0, bias: 0 };
            }
            self.charge(bytes);
        }
        Ok(stub)
    }

    // --- lifeguard registry (§4.6, §6) -------------------------------------

    pub fn push_lifeguard(&mut self, ptr: GuardedRef) -> LifeguardHandle {
        self.lifeguards.push(ptr);
        LifeguardHandle::new(self as *mut Runtime, ptr)
    }

    pub fn drop_lifeguard(&mut self, ptr: GuardedRef) {
        self.lifeguards.drop_entry(ptr);
    }

    // --- collector entry points (§4.8, §6) ---------------------------------

    pub fn recycle(&mut self) -> usize {
        self.recycle_core(None)
    }

    pub fn recycle_core(&mut self, sweeplist: Option<&mut Vec<StubRef>>) -> usize {
        if self.in_recycle || !self.collection_enabled {
            self.deferred_recycle = true;
            return 0;
        }
        self.in_recycle = true;
        let swept = crate::gc::recycle_core(self, sweeplist);
        self.in_recycle = false;
        swept
    }

    /// A double-recycle mode for tests and `NEPTUNE_DOUBLE_RECYCLE=1`: the
    /// second pass must reclaim nothing (P7, §4.8 "Reporting and re-entry").
    pub fn recycle_twice(&mut self) -> (usize, usize) {
        let first = self.recycle();
        let second = self.recycle();
        debug_assert_eq!(second, 0, "double recycle: second pass reclaimed garbage the first pass should have caught");
        (first, second)
    }

    pub fn live_stub_count(&self) -> usize {
        self.pools.stub_units().filter(|u| !crate::pool::Pool::is_free_unit(*u)).count()
    }

    // --- hook registration (§6, §9 "extra-needs-mark table") --------------

    pub fn register_cleaner(&mut self, flavor: Flavor, cleaner: crate::stub::Cleaner) {
        self.cleaners.insert(flavor, cleaner);
    }

    pub fn register_heart_traits(&mut self, heart: Heart, traits: HeartTraits) {
        self.heart_traits_table.insert(heart, traits);
    }

    pub fn register_flavor_traits(&mut self, flavor: Flavor, traits: FlavorTraits) {
        self.flavor_traits_table.insert(flavor, traits);
    }

    pub fn register_fixed_patch(&mut self, patch: StubRef) {
        self.fixed_patches.push(patch);
    }

    /// Register a symbol/patch stub as owned by `owner`'s module/context, so
    /// the iterated root-marking fixpoint (§4.8 step 7) keeps it alive once
    /// `owner` is marked.
    pub fn register_module_patch(&mut self, patch: StubRef, owner: StubRef) {
        self.module_patches.push((patch, owner));
    }

    pub(crate) fn flavor_traits(&self, flavor: Flavor) -> FlavorTraits {
        self.flavor_traits_table
            .get(&flavor)
            .copied()
            .or_else(|| builtin_flavor_traits(flavor))
            .unwrap_or(FlavorTraits::holds_neither(false, false, false))
    }

    pub(crate) fn heart_traits(&self, heart: Heart) -> HeartTraits {
        self.heart_traits_table.get(&heart).copied().unwrap_or(HeartTraits {
            extra_kind: PayloadKind::None,
            payload_one_kind: PayloadKind::None,
            payload_two_kind: PayloadKind::None,
        })
    }

    // --- call levels (§4.8 step 6) ------------------------------------------

    pub fn alloc_call_level(&mut self) -> usize {
        self.call_levels.push(CallLevel { active: true, ..Default::default() });
        self.call_levels.len() - 1
    }

    pub fn free_call_level(&mut self, idx: usize) {
        self.call_levels[idx] = CallLevel::default();
    }

    pub fn fulfill_arg(&mut self, idx: usize, cell: Cell) {
        let lvl = &mut self.call_levels[idx];
        if lvl.fulfilled == lvl.args.len() {
            lvl.args.push(cell);
        } else {
            lvl.args[lvl.fulfilled] = cell;
        }
        lvl.fulfilled += 1;
    }

    // --- thrown value (evaluator hook point, §4.8 step 2) ------------------

    pub fn set_thrown(&mut self, cell: Cell) {
        self.thrown = cell;
    }
    pub fn set_label(&mut self, cell: Cell) {
        self.label = cell;
    }

    // --- shutdown & leak check (§4.9) ---------------------------------------

    pub fn shutdown(mut self) -> Result<(), MemError> {
        self.recycle();
        debug_assert!(self.lifeguards.is_empty(), "lifeguard registry not empty at shutdown");
        debug_assert!(self.mark_queue.is_empty(), "mark queue not empty at shutdown");
        if !self.manuals.is_empty() {
            let oldest_tick = self.manuals.iter().filter_map(|s| self.manual_ticks.get(s)).min().copied();
            log::error!(
                target: "bedrock::runtime",
                "shutdown: {} unmanaged stub(s) leaked (oldest alloc tick: {:?})",
                self.manuals.len(), oldest_tick
            );
            debug_assert!(false, "leaked unmanaged stubs at shutdown (§4.9, §8 P6)");
        }

        let Runtime { mut heap, data_stack, mut pools, .. } = self;
        data_stack.release(&mut heap);
        pools.release_all(&mut heap);
        let leaked = heap.bytes_allocated();
        if leaked != 0 {
            log::error!(target: "bedrock::runtime", "shutdown: heap byte counter did not return to zero ({} bytes)", leaked);
            debug_assert!(false, "heap leak at shutdown (§4.9, §8 P5)");
        }
        Ok(())
    }
}
