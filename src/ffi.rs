//! C ABI surface (§6): a thin `extern "C"` shim around [`crate::runtime::Runtime`].
//!
//! Unlike the teacher's interface, which reached into a `static mut`
//! singleton and a family of Julia-internal struct layouts, every entry
//! point here takes an explicit `*mut Runtime` handle: the host owns the
//! pointer's lifetime (returned by `bedrock_startup`, retired by
//! `bedrock_shutdown`) and nothing in this module reaches for global state.

use std::ptr::NonNull;

use libc::{c_int, size_t};

use crate::cell::Cell;
use crate::error::MemError;
use crate::lifeguard::LifeguardHandle;
use crate::runtime::{Config, Runtime};
use crate::stub::{CellRef, GuardedRef, Pairing, Stub, StubRef};

/// Status codes returned across the C boundary; mirrors [`MemError`]'s
/// variants plus `0` for success. Negative, so a caller can test `< 0`.
pub const BEDROCK_OK: c_int = 0;
pub const BEDROCK_ERR_OUT_OF_MEMORY: c_int = -1;
pub const BEDROCK_ERR_LOCKED: c_int = -2;
pub const BEDROCK_ERR_PROTECTED_KEY: c_int = -3;
pub const BEDROCK_ERR_INDEX_OUT_OF_RANGE: c_int = -4;
pub const BEDROCK_ERR_STACK_OVERFLOW: c_int = -5;

fn status_of(err: MemError) -> c_int {
    match err {
        MemError::OutOfMemory { .. } => BEDROCK_ERR_OUT_OF_MEMORY,
        MemError::Locked => BEDROCK_ERR_LOCKED,
        MemError::ProtectedKey => BEDROCK_ERR_PROTECTED_KEY,
        MemError::IndexOutOfRange => BEDROCK_ERR_INDEX_OUT_OF_RANGE,
        MemError::StackOverflow => BEDROCK_ERR_STACK_OVERFLOW,
    }
}

fn status_of_result<T>(r: Result<T, MemError>) -> c_int {
    match r {
        Ok(_) => BEDROCK_OK,
        Err(e) => status_of(e),
    }
}

// --- startup / shutdown --------------------------------------------------

/// Construct a runtime, reading `NEPTUNE_*` overrides from the environment
/// (§4.12), and hand the caller an owning pointer.
#[no_mangle]
pub extern "C" fn bedrock_startup() -> *mut Runtime {
    let rt = Runtime::startup(Config::default().from_env());
    Box::into_raw(Box::new(rt))
}

/// Recycle, leak-check, and release `rt` (§4.9). `rt` must not be used again.
///
/// # Safety
/// `rt` must be a pointer previously returned by `bedrock_startup` and not
/// already passed to this function.
#[no_mangle]
pub unsafe extern "C" fn bedrock_shutdown(rt: *mut Runtime) -> c_int {
    let owned = Box::from_raw(rt);
    status_of_result((*owned).shutdown())
}

// --- allocation -----------------------------------------------------------

/// # Safety
/// `rt` must point at a live `Runtime`; `out` must be a valid, writable `*mut Stub` slot.
#[no_mangle]
pub unsafe extern "C" fn bedrock_alloc_stub(rt: *mut Runtime, flavor: u8, out: *mut *mut Stub) -> c_int {
    match (*rt).alloc_stub(flavor) {
        Ok(sref) => {
            *out = sref.as_ptr();
            BEDROCK_OK
        }
        Err(e) => status_of(e),
    }
}

/// # Safety
/// `rt` must point at a live `Runtime`; `out` must be a valid, writable `*mut Pairing` slot.
#[no_mangle]
pub unsafe extern "C" fn bedrock_alloc_pairing(rt: *mut Runtime, out: *mut *mut Pairing) -> c_int {
    match (*rt).alloc_pairing() {
        Ok(pref) => {
            *out = pref.as_ptr();
            BEDROCK_OK
        }
        Err(e) => status_of(e),
    }
}

/// # Safety
/// `rt` and `stub` must be live; `stub` must have come from `bedrock_alloc_stub` on this runtime.
#[no_mangle]
pub unsafe extern "C" fn bedrock_manage_stub(rt: *mut Runtime, stub: *mut Stub) {
    let sref = StubRef(NonNull::new_unchecked(stub));
    (*rt).manage(sref);
}

/// # Safety
/// Same preconditions as [`bedrock_manage_stub`].
#[no_mangle]
pub unsafe extern "C" fn bedrock_unmanage_stub(rt: *mut Runtime, stub: *mut Stub) {
    let sref = StubRef(NonNull::new_unchecked(stub));
    (*rt).unmanage(sref);
}

/// # Safety
/// `stub` must be unmanaged and must not be referenced again after this call.
#[no_mangle]
pub unsafe extern "C" fn bedrock_free_unmanaged(rt: *mut Runtime, stub: *mut Stub) -> c_int {
    let sref = StubRef(NonNull::new_unchecked(stub));
    status_of_result((*rt).free_unmanaged(sref))
}

/// # Safety
/// `stub` must be a live, dynamic stub belonging to `rt`.
#[no_mangle]
pub unsafe extern "C" fn bedrock_expand_at(
    rt: *mut Runtime,
    stub: *mut Stub,
    index: size_t,
    delta: isize,
) -> c_int {
    let sref = StubRef(NonNull::new_unchecked(stub));
    status_of_result((*rt).expand_at(sref, index, delta))
}

// --- data stack -------------------------------------------------------------

/// # Safety
/// `rt` must point at a live `Runtime`; `out_index` must be writable.
#[no_mangle]
pub unsafe extern "C" fn bedrock_push_data_stack(rt: *mut Runtime, cell: Cell, out_index: *mut size_t) -> c_int {
    match (*rt).push_data_stack(cell) {
        Ok(idx) => {
            *out_index = idx;
            BEDROCK_OK
        }
        Err(e) => status_of(e),
    }
}

/// # Safety
/// `rt` must point at a live `Runtime`.
#[no_mangle]
pub unsafe extern "C" fn bedrock_drop_to(rt: *mut Runtime, index: size_t) {
    (*rt).drop_to(index);
}

/// # Safety
/// `rt` must point at a live `Runtime`.
#[no_mangle]
pub unsafe extern "C" fn bedrock_stack_top(rt: *mut Runtime) -> size_t {
    (*rt).stack_top()
}

/// # Safety
/// `rt` must point at a live `Runtime`, `out` writable, and `out_stub` writable.
#[no_mangle]
pub unsafe extern "C" fn bedrock_pop_to_array(
    rt: *mut Runtime,
    flavor: u8,
    base_index: size_t,
    out_stub: *mut *mut Stub,
) -> c_int {
    match (*rt).pop_to_array(flavor, base_index) {
        Ok(sref) => {
            *out_stub = sref.as_ptr();
            BEDROCK_OK
        }
        Err(e) => status_of(e),
    }
}

// --- lifeguard registry -----------------------------------------------------

/// Push a stub as a root and return an opaque handle the caller must later
/// pass to `bedrock_drop_lifeguard` (§4.6). The handle is heap-boxed because
/// C has no RAII to drive `LifeguardHandle`'s `Drop` for it.
///
/// # Safety
/// `rt` and `stub` must be live.
#[no_mangle]
pub unsafe extern "C" fn bedrock_push_lifeguard_stub(rt: *mut Runtime, stub: *mut Stub) -> *mut LifeguardHandle {
    let sref = StubRef(NonNull::new_unchecked(stub));
    let handle = (*rt).push_lifeguard(GuardedRef::Stub(sref));
    Box::into_raw(Box::new(handle))
}

/// # Safety
/// `rt` and `cell` must be live.
#[no_mangle]
pub unsafe extern "C" fn bedrock_push_lifeguard_cell(rt: *mut Runtime, cell: *mut Cell) -> *mut LifeguardHandle {
    let cref = CellRef(NonNull::new_unchecked(cell));
    let handle = (*rt).push_lifeguard(GuardedRef::Cell(cref));
    Box::into_raw(Box::new(handle))
}

/// Release a handle returned by either `bedrock_push_lifeguard_*` function,
/// observing the registry's LIFO discipline (§4.6).
///
/// # Safety
/// `handle` must have come from this runtime and not already been released.
#[no_mangle]
pub unsafe extern "C" fn bedrock_drop_lifeguard(handle: *mut LifeguardHandle) {
    let owned = Box::from_raw(handle);
    owned.release();
}

// --- collector --------------------------------------------------------------

/// # Safety
/// `rt` must point at a live `Runtime`.
#[no_mangle]
pub unsafe extern "C" fn bedrock_recycle(rt: *mut Runtime) -> size_t {
    (*rt).recycle()
}

/// # Safety
/// `rt` must point at a live `Runtime`.
#[no_mangle]
pub unsafe extern "C" fn bedrock_live_stub_count(rt: *mut Runtime) -> size_t {
    (*rt).live_stub_count()
}

// --- protection registry -----------------------------------------------------

/// # Safety
/// `rt` and `stub` must be live.
#[no_mangle]
pub unsafe extern "C" fn bedrock_protect_value(rt: *mut Runtime, stub: *mut Stub, deep: c_int, set: c_int) {
    use crate::protect::ProtectFlags;
    let sref = StubRef(NonNull::new_unchecked(stub));
    let flags = ProtectFlags { deep: deep != 0, values: true, set: set != 0, ..Default::default() };
    (*rt).protect(GuardedRef::Stub(sref), flags);
}

/// # Safety
/// `rt` and `stub` must be live.
#[no_mangle]
pub unsafe extern "C" fn bedrock_freeze_deep(rt: *mut Runtime, stub: *mut Stub) {
    use crate::protect::ProtectFlags;
    let sref = StubRef(NonNull::new_unchecked(stub));
    (*rt).protect(GuardedRef::Stub(sref), ProtectFlags::freeze_deep());
}

/// # Safety
/// `stub` must be live.
#[no_mangle]
pub unsafe extern "C" fn bedrock_is_frozen_deep(rt: *mut Runtime, stub: *mut Stub) -> c_int {
    let sref = StubRef(NonNull::new_unchecked(stub));
    (*rt).is_frozen_deep(GuardedRef::Stub(sref)) as c_int
}
