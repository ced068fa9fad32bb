//! Shared scaffolding for the integration tests in this directory: a heart
//! that carries a stub reference in `payload_one`, and a helper to grow a
//! managed array stub's dynamic buffer and wire up a reference cell inside
//! it — standing in for the datatype layer this crate leaves to a host
//! evaluator (§1 "Out of scope: external collaborators").

use bedrock::cell::{Cell, Heart};
use bedrock::gc::{HeartTraits, PayloadKind};
use bedrock::pool::Pool;
use bedrock::runtime::{Config, Runtime};
use bedrock::stub::{Flavor, StubRef, FLAVOR_ARRAY};
use std::ptr::NonNull;

/// The one heart this test harness registers: its `payload_one` slot is a
/// stub reference, traced by the collector like any real datatype's cells.
pub const HEART_REF: Heart = 1;

pub fn new_runtime() -> Runtime {
    let _ = env_logger::try_init();
    let mut rt = Runtime::startup(Config { initial_ballast: 1 << 20, ..Config::default() });
    rt.register_heart_traits(
        HEART_REF,
        HeartTraits { extra_kind: PayloadKind::None, payload_one_kind: PayloadKind::Stub, payload_two_kind: PayloadKind::None },
    );
    rt
}

/// Allocate and manage a `FLAVOR_ARRAY` stub with a dynamic buffer of `len`
/// reference-carrying cells, all initially pointing at nothing (payload_one == 0).
pub fn alloc_array(rt: &mut Runtime, len: usize) -> StubRef {
    alloc_array_flavor(rt, FLAVOR_ARRAY, len)
}

pub fn alloc_array_flavor(rt: &mut Runtime, flavor: Flavor, len: usize) -> StubRef {
    let stub = rt.alloc_stub(flavor).expect("stub pool allocation");
    rt.manage(stub);
    unsafe { stub.as_mut().set_dynamic(true) };
    if len > 0 {
        rt.expand_at(stub, 0, len as isize).expect("dynamic buffer growth");
        let ptr = unsafe { stub.as_ref().dynamic() }.ptr.expect("grown buffer has a head") ;
        let cells = ptr.as_ptr() as *mut Cell;
        for i in 0..len {
            unsafe { *cells.add(i) = Cell::new_readable(HEART_REF) };
        }
    }
    stub
}

/// Point `container`'s `index`th element at `target`.
pub fn set_ref(container: StubRef, index: usize, target: StubRef) {
    let ptr = unsafe { container.as_ref().dynamic() }.ptr.expect("container has a dynamic buffer");
    let cells = ptr.as_ptr() as *mut Cell;
    unsafe {
        (*cells.add(index)).payload_one = target.as_ptr() as usize;
    }
}

pub fn is_free(stub: StubRef) -> bool {
    Pool::is_free_unit(unsafe { NonNull::new_unchecked(stub.as_ptr() as *mut u8) })
}

pub fn is_unreadable(stub: StubRef) -> bool {
    unsafe { stub.as_ref() }.unreadable()
}
