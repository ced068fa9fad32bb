//! Stub and Pairing representation (§3, §4.3): the fixed-size control block
//! that is the identity of every managed heap object, and the two-cell
//! allocation that shares its pool.

use std::ptr::NonNull;

use crate::cell::{
    Cell, FlagByte, RawHeader, Word, BIT_CANON_DIMINISHED, BIT_MANAGED, BIT_MARKED, BIT_ROOT,
    BIT_UNREADABLE, BIT_VALID,
};

// --- per-stub type-flags bits (byte 3 of the header word; §4.7) ---------

/// The stub's content is a pointer to a separately pooled buffer rather than
/// inline cell-or-bytes content.
pub const BIT_STUB_DYNAMIC: usize = 0;
/// Shallow immutability of the object (§4.7).
pub const BIT_STUB_PROTECTED: usize = 1;
/// Permanent, deeper than `protected` (§4.7).
pub const BIT_STUB_FROZEN_SHALLOW: usize = 2;
/// Permanent and transitive (§4.7).
pub const BIT_STUB_FROZEN_DEEP: usize = 3;

/// A stub's flavor (GLOSSARY): a subtag of type identifying which slots are
/// traced and which cleanup hook applies. The host evaluator owns the
/// concrete enumeration beyond the handful of built-ins this crate needs.
pub type Flavor = u8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlavorClass {
    /// Arrays, varlists, keylists, source: dynamic content is an array of `Cell`.
    HoldsCells,
    /// Binary, string/utf-8, symbol: dynamic content is raw bytes.
    HoldsBytes,
    /// Handles, patches: neither link/misc/info slot is itself cell-bearing content.
    HoldsNeither,
}

/// Which of link/misc/info a flavor traces, and the class governing element width.
#[derive(Clone, Copy)]
pub struct FlavorTraits {
    pub class: FlavorClass,
    pub trace_link: bool,
    pub trace_misc: bool,
    pub trace_info: bool,
}

impl FlavorTraits {
    pub const fn holds_cells(trace_link: bool, trace_misc: bool, trace_info: bool) -> Self {
        FlavorTraits { class: FlavorClass::HoldsCells, trace_link, trace_misc, trace_info }
    }
    pub const fn holds_bytes() -> Self {
        FlavorTraits { class: FlavorClass::HoldsBytes, trace_link: false, trace_misc: false, trace_info: false }
    }
    pub const fn holds_neither(trace_link: bool, trace_misc: bool, trace_info: bool) -> Self {
        FlavorTraits { class: FlavorClass::HoldsNeither, trace_link, trace_misc, trace_info }
    }

    /// Byte width of one element of this flavor's dynamic buffer (§4.4).
    pub fn element_width(&self) -> usize {
        match self.class {
            FlavorClass::HoldsCells => std::mem::size_of::<Cell>(),
            FlavorClass::HoldsBytes => 1,
            FlavorClass::HoldsNeither => 1,
        }
    }
}

// Built-in flavor ids. A host evaluator registers its own flavors above
// `FLAVOR_HOST_BASE`; the table in `Runtime::flavor_traits` falls back to
// `holds_neither` (no tracing) for anything unregistered, which is always
// a safe (if conservative) default, never a silently-wrong one.
pub const FLAVOR_ARRAY: Flavor = 0;
pub const FLAVOR_VARLIST: Flavor = 1;
pub const FLAVOR_KEYLIST: Flavor = 2;
pub const FLAVOR_SOURCE: Flavor = 3;
pub const FLAVOR_BINARY: Flavor = 4;
pub const FLAVOR_STRING: Flavor = 5;
pub const FLAVOR_SYMBOL: Flavor = 6;
pub const FLAVOR_HANDLE: Flavor = 7;
pub const FLAVOR_PATCH: Flavor = 8;
/// The flavor of the single global canon diminished stub (§3, §4.3).
pub const FLAVOR_DIMINISHED: Flavor = 9;
pub const FLAVOR_HOST_BASE: Flavor = 32;

/// Default traits for the built-in flavors; anything else traces nothing.
pub fn builtin_flavor_traits(flavor: Flavor) -> Option<FlavorTraits> {
    match flavor {
        FLAVOR_ARRAY | FLAVOR_VARLIST | FLAVOR_SOURCE => Some(FlavorTraits::holds_cells(false, false, false)),
        // keylists additionally link to their owning varlist's keylist chain.
        FLAVOR_KEYLIST => Some(FlavorTraits::holds_cells(true, false, false)),
        FLAVOR_BINARY | FLAVOR_STRING => Some(FlavorTraits::holds_bytes()),
        // symbols chain through a hitch list (misc) to their next patch.
        FLAVOR_SYMBOL => Some(FlavorTraits::holds_bytes()),
        FLAVOR_HANDLE => Some(FlavorTraits::holds_neither(false, false, false)),
        // patches link to the next patch in a module's hitch chain and
        // reference their owning context via info.
        FLAVOR_PATCH => Some(FlavorTraits::holds_neither(true, false, true)),
        FLAVOR_DIMINISHED => Some(FlavorTraits::holds_neither(false, false, false)),
        _ => None,
    }
}

/// Per-flavor cleanup callback invoked during diminish (§4.3).
pub type Cleaner = fn(&mut Stub);

/// A dynamically-allocated buffer descriptor (§3 "Stub", §4.4).
///
/// `ptr` is the *logical* head (post-bias); the real allocation base is
/// `ptr - bias * element_width`. `used` and `rest` are element counts, not bytes.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct DynamicBuffer {
    pub ptr: Option<NonNull<u8>>,
    pub used: usize,
    pub rest: usize,
    pub bias: usize,
}

impl DynamicBuffer {
    pub const fn empty() -> Self {
        DynamicBuffer { ptr: None, used: 0, rest: 0, bias: 0 }
    }
}

/// Inline content or a dynamic buffer descriptor; which is active is decided
/// by `BIT_STUB_DYNAMIC` on the stub's header, never by inspecting the bytes.
#[derive(Clone, Copy)]
#[repr(C)]
pub union StubContent {
    pub inline: Cell,
    pub dynamic: DynamicBuffer,
}

/// A two-cell-sized control block: the identity of every managed heap object
/// (§3 "Stub"). `header.heart()` doubles as the stub's flavor.
#[repr(C)]
pub struct Stub {
    pub header: RawHeader,
    pub link: Word,
    pub misc: Word,
    pub info: Word,
    pub content: StubContent,
}

/// Stub size in words; by construction equal to [`PAIRING_WORDS`], which is
/// the invariant that lets pairings share the stub pool (§4.2).
pub const STUB_WORDS: usize = std::mem::size_of::<Stub>() / std::mem::size_of::<Word>();

impl Stub {
    pub fn empty(flavor: Flavor) -> Self {
        let mut header = RawHeader::zero();
        header.with_flag(BIT_VALID, true);
        header.set_heart(flavor);
        Stub { header, link: 0, misc: 0, info: 0, content: StubContent { inline: Cell::erased() } }
    }

    #[inline(always)]
    pub fn flavor(&self) -> Flavor {
        self.header.heart()
    }
    #[inline(always)]
    pub fn set_flavor(&mut self, f: Flavor) {
        self.header.set_heart(f)
    }
    #[inline(always)]
    pub fn flags(&self) -> FlagByte {
        self.header.flags()
    }
    #[inline(always)]
    pub fn managed(&self) -> bool {
        self.flags().managed()
    }
    #[inline(always)]
    pub fn set_managed(&mut self, v: bool) {
        self.header.with_flag(BIT_MANAGED, v);
    }
    #[inline(always)]
    pub fn marked(&self) -> bool {
        self.flags().marked()
    }
    #[inline(always)]
    pub fn set_marked(&mut self, v: bool) {
        self.header.with_flag(BIT_MARKED, v);
    }
    #[inline(always)]
    pub fn root(&self) -> bool {
        self.flags().root()
    }
    #[inline(always)]
    pub fn set_root(&mut self, v: bool) {
        self.header.with_flag(BIT_ROOT, v);
    }
    /// A stub with `BIT_UNREADABLE` set is diminished (§3 "Stub" invariants):
    /// its payload is released but the identity may still be referenced.
    #[inline(always)]
    pub fn unreadable(&self) -> bool {
        self.flags().unreadable()
    }
    #[inline(always)]
    pub fn is_canon_diminished(&self) -> bool {
        self.flags().get(BIT_CANON_DIMINISHED)
    }

    #[inline(always)]
    pub fn is_dynamic(&self) -> bool {
        self.header.type_flag(BIT_STUB_DYNAMIC)
    }
    #[inline(always)]
    pub fn set_dynamic(&mut self, v: bool) {
        self.header.set_type_flag(BIT_STUB_DYNAMIC, v);
    }

    /// # Safety
    /// Caller must know `is_dynamic()` is true.
    #[inline(always)]
    pub unsafe fn dynamic(&self) -> DynamicBuffer {
        self.content.dynamic
    }
    /// # Safety
    /// Caller must know `is_dynamic()` is true.
    #[inline(always)]
    pub unsafe fn dynamic_mut(&mut self) -> &mut DynamicBuffer {
        &mut self.content.dynamic
    }
    /// # Safety
    /// Caller must know `is_dynamic()` is false.
    #[inline(always)]
    pub unsafe fn inline_mut(&mut self) -> &mut Cell {
        &mut self.content.inline
    }

    #[inline(always)]
    pub fn protected(&self) -> bool {
        self.header.type_flag(BIT_STUB_PROTECTED)
    }
    #[inline(always)]
    pub fn set_protected(&mut self, v: bool) {
        self.header.set_type_flag(BIT_STUB_PROTECTED, v);
    }
    #[inline(always)]
    pub fn frozen_shallow(&self) -> bool {
        self.header.type_flag(BIT_STUB_FROZEN_SHALLOW)
    }
    #[inline(always)]
    pub fn frozen_deep(&self) -> bool {
        self.header.type_flag(BIT_STUB_FROZEN_DEEP)
    }
    /// Freezing is monotonic (§4.7): this never clears either frozen bit.
    #[inline(always)]
    pub fn freeze_shallow(&mut self) {
        self.header.set_type_flag(BIT_STUB_FROZEN_SHALLOW, true);
    }
    #[inline(always)]
    pub fn freeze_deep(&mut self) {
        self.header.set_type_flag(BIT_STUB_FROZEN_SHALLOW, true);
        self.header.set_type_flag(BIT_STUB_FROZEN_DEEP, true);
    }
    #[inline(always)]
    pub fn is_frozen_deep(&self) -> bool {
        self.frozen_deep()
    }
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.protected() || self.frozen_shallow() || self.frozen_deep()
    }

    /// Cycle guard used by deep protection traversal (§4.7); independent of `BIT_MARKED`.
    #[inline(always)]
    pub fn black(&self) -> bool {
        self.flags().black()
    }
    #[inline(always)]
    pub fn set_black(&mut self, v: bool) {
        self.header.with_flag(crate::cell::BIT_BLACK, v);
    }

    /// Rewrite this stub's header to the non-canon diminished sentinel,
    /// dropping every other flag bit (§4.3, §9 "Dead-reference canonicalization").
    pub(crate) fn mark_diminished(&mut self, canon: bool) {
        let mut f = FlagByte::empty();
        f.set(BIT_VALID, true).set(BIT_UNREADABLE, true).set(BIT_CANON_DIMINISHED, canon);
        if canon {
            f.set(BIT_MARKED, true);
        }
        self.header.set_flags(f);
        if canon {
            self.set_flavor(FLAVOR_DIMINISHED);
        }
    }
}

/// Two cells allocated contiguously from the stub pool (§3 "Pairing").
/// `cells[0].header` doubles as the pairing's flag header: its managed and
/// marked bits are meaningful at the object level, exactly as a stub's are.
#[repr(C)]
pub struct Pairing {
    pub cells: [Cell; 2],
}

pub const PAIRING_WORDS: usize = std::mem::size_of::<Pairing>() / std::mem::size_of::<Word>();

impl Pairing {
    #[inline(always)]
    pub fn managed(&self) -> bool {
        self.cells[0].header.flags().managed()
    }
    #[inline(always)]
    pub fn set_managed(&mut self, v: bool) {
        self.cells[0].header.with_flag(BIT_MANAGED, v);
    }
    #[inline(always)]
    pub fn marked(&self) -> bool {
        self.cells[0].header.flags().marked()
    }
    #[inline(always)]
    pub fn set_marked(&mut self, v: bool) {
        self.cells[0].header.with_flag(BIT_MARKED, v);
    }
}

// --- thin NonNull-based handles (§9 "Cyclic object graphs") -------------
//
// The arena (the pool) governs lifetime, not the borrow checker: these are
// `Copy` pointer handles, not `&`/`&mut` references.

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubRef(pub NonNull<Stub>);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairingRef(pub NonNull<Pairing>);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef(pub NonNull<Cell>);

impl StubRef {
    /// # Safety
    /// The pointee must be a live `Stub` for the duration of the borrow.
    #[inline(always)]
    pub unsafe fn as_ref(&self) -> &Stub {
        &*self.0.as_ptr()
    }
    /// # Safety
    /// The pointee must be a live `Stub`, uniquely accessed, for the duration of the borrow.
    #[inline(always)]
    pub unsafe fn as_mut(&self) -> &mut Stub {
        &mut *self.0.as_ptr()
    }
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut Stub {
        self.0.as_ptr()
    }
}

impl PairingRef {
    /// # Safety
    /// The pointee must be a live `Pairing` for the duration of the borrow.
    #[inline(always)]
    pub unsafe fn as_ref(&self) -> &Pairing {
        &*self.0.as_ptr()
    }
    /// # Safety
    /// The pointee must be a live `Pairing`, uniquely accessed, for the duration of the borrow.
    #[inline(always)]
    pub unsafe fn as_mut(&self) -> &mut Pairing {
        &mut *self.0.as_ptr()
    }
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut Pairing {
        self.0.as_ptr()
    }
}

impl CellRef {
    /// # Safety
    /// The pointee must be a live `Cell` for the duration of the borrow.
    #[inline(always)]
    pub unsafe fn as_ref(&self) -> &Cell {
        &*self.0.as_ptr()
    }
    /// # Safety
    /// The pointee must be a live `Cell`, uniquely accessed, for the duration of the borrow.
    #[inline(always)]
    pub unsafe fn as_mut(&self) -> &mut Cell {
        &mut *self.0.as_ptr()
    }
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut Cell {
        self.0.as_ptr()
    }
}

/// Either a stub or a pairing: the argument to `manage`/`unmanage` (§6).
#[derive(Clone, Copy)]
pub enum ManagedRef {
    Stub(StubRef),
    Pairing(PairingRef),
}

impl From<StubRef> for ManagedRef {
    fn from(s: StubRef) -> Self {
        ManagedRef::Stub(s)
    }
}
impl From<PairingRef> for ManagedRef {
    fn from(p: PairingRef) -> Self {
        ManagedRef::Pairing(p)
    }
}

/// Either a stub or a cell: the argument to `push_lifeguard` (§4.6).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum GuardedRef {
    Cell(CellRef),
    Stub(StubRef),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_and_pairing_share_a_width() {
        // The invariant enabling §4.2's "pairings share the stub pool":
        // enforced here by construction rather than by comment.
        assert_eq!(STUB_WORDS, PAIRING_WORDS);
    }

    #[test]
    fn diminish_drops_managed_and_marked_bits() {
        let mut s = Stub::empty(FLAVOR_ARRAY);
        s.set_managed(true);
        s.set_marked(true);
        s.mark_diminished(false);
        assert!(s.unreadable());
        assert!(!s.managed());
        assert!(!s.marked());
        assert!(!s.is_canon_diminished());
    }

    #[test]
    fn canon_diminished_is_permanently_marked() {
        let mut s = Stub::empty(FLAVOR_ARRAY);
        s.mark_diminished(true);
        assert!(s.is_canon_diminished());
        assert!(s.marked());
        assert!(s.unreadable());
    }
}
