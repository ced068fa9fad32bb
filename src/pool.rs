//! Pool Allocator (§4.2): segmented, fixed-width free-list pools per size
//! class, with a precomputed size→pool lookup table. Sizes exceeding the
//! largest class fall through to the [`crate::heap::HeapAllocator`].

use std::ptr::NonNull;

use crate::error::MemError;
use crate::heap::HeapAllocator;
use crate::util::round_up;

/// Byte written into the first byte of every free pool unit. No in-use
/// stub or pairing flag byte can share this value, because every live flag
/// byte has `BIT_VALID` (bit 0) set and is therefore odd; this sentinel is
/// even. This single-byte distinguishability is what lets sweep (and the
/// `sweeplist` diagnostic mode) dispatch on a segment scan without a typed
/// dereference (§4.2, §9 "Pointer-based polymorphism via a first-byte tag").
pub const FREE_POOLUNIT_BYTE: u8 = 0xF2;

const ALIGN: usize = std::mem::size_of::<usize>();

/// ~27 size classes (§4.2), ascending. The shape — small linear steps then
/// widening gaps — mirrors the geometry production segmented allocators use
/// to bound worst-case internal fragmentation, scaled here to this crate's
/// stub/pairing/dynamic-buffer granularity rather than to arbitrary object sizes.
const BASE_SIZE_CLASSES: &[usize] = &[
    16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, 288, 320,
    384, 448, 512, 640, 768, 1024,
];

const SEGMENT_TARGET_BYTES: usize = 16 * 1024;
const MIN_UNITS_PER_SEGMENT: usize = 8;

struct Segment {
    data: NonNull<u8>,
    len_bytes: usize,
}

#[inline(always)]
unsafe fn unit_flag_byte(ptr: NonNull<u8>) -> u8 {
    *ptr.as_ptr()
}
#[inline(always)]
unsafe fn set_unit_flag_byte(ptr: NonNull<u8>, b: u8) {
    *ptr.as_ptr() = b;
}
#[inline(always)]
unsafe fn read_next_if_free(ptr: NonNull<u8>) -> Option<NonNull<u8>> {
    let raw = std::ptr::read_unaligned(ptr.as_ptr().add(ALIGN) as *const usize);
    NonNull::new(raw as *mut u8)
}
#[inline(always)]
unsafe fn write_next_if_free(ptr: NonNull<u8>, next: Option<NonNull<u8>>) {
    let raw = next.map_or(0, |p| p.as_ptr() as usize);
    std::ptr::write_unaligned(ptr.as_ptr().add(ALIGN) as *mut usize, raw);
}

/// A single size class: a growable list of segments and a singly linked
/// freelist of `PoolUnit`s threaded through the units themselves.
pub struct Pool {
    unit_width: usize,
    units_per_segment: usize,
    segments: Vec<Segment>,
    freelist: Option<NonNull<u8>>,
    has: usize,
    free: usize,
}

impl Pool {
    fn new(unit_width: usize, units_per_segment: usize) -> Self {
        debug_assert!(unit_width >= 2 * ALIGN, "pool unit too small to hold a freelist link");
        Pool { unit_width, units_per_segment, segments: Vec::new(), freelist: None, has: 0, free: 0 }
    }

    fn grow(&mut self, heap: &mut HeapAllocator) -> Result<(), MemError> {
        let seg_bytes = self.unit_width * self.units_per_segment;
        let base = heap.alloc(seg_bytes)?;
        unsafe {
            let mut next = self.freelist;
            for i in (0..self.units_per_segment).rev() {
                let unit = NonNull::new_unchecked(base.as_ptr().add(i * self.unit_width));
                set_unit_flag_byte(unit, FREE_POOLUNIT_BYTE);
                write_next_if_free(unit, next);
                next = Some(unit);
            }
            self.freelist = next;
        }
        self.segments.push(Segment { data: base, len_bytes: seg_bytes });
        self.has += self.units_per_segment;
        self.free += self.units_per_segment;
        log::debug!(
            target: "bedrock::pool",
            "grew pool(unit_width={}) by {} units ({} segments, {} total units)",
            self.unit_width, self.units_per_segment, self.segments.len(), self.has
        );
        Ok(())
    }

    pub fn alloc(&mut self, heap: &mut HeapAllocator) -> Result<NonNull<u8>, MemError> {
        if self.freelist.is_none() {
            self.grow(heap)?;
        }
        let unit = self.freelist.expect("grow() always populates the freelist on success");
        unsafe {
            self.freelist = read_next_if_free(unit);
        }
        self.free -= 1;
        Ok(unit)
    }

    /// # Safety
    /// `ptr` must be a unit previously returned by `alloc` on this pool and not already freed.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        set_unit_flag_byte(ptr, FREE_POOLUNIT_BYTE);
        write_next_if_free(ptr, self.freelist);
        self.freelist = Some(ptr);
        self.free += 1;
    }

    #[inline(always)]
    pub fn is_free_unit(ptr: NonNull<u8>) -> bool {
        unsafe { unit_flag_byte(ptr) == FREE_POOLUNIT_BYTE }
    }

    /// Every unit of every segment, in allocation order, for sweep and the
    /// `sweeplist` diagnostic mode (§4.2, §4.8).
    pub fn units(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.segments.iter().flat_map(move |seg| {
            let width = self.unit_width;
            (0..self.units_per_segment).map(move |i| unsafe { NonNull::new_unchecked(seg.data.as_ptr().add(i * width)) })
        })
    }

    pub fn release_all(&mut self, heap: &mut HeapAllocator) {
        for seg in self.segments.drain(..) {
            unsafe { heap.free(seg.data, seg.len_bytes) };
        }
        self.has = 0;
        self.free = 0;
        self.freelist = None;
    }

    pub fn unit_width(&self) -> usize {
        self.unit_width
    }
    pub fn has(&self) -> usize {
        self.has
    }
    pub fn free_count(&self) -> usize {
        self.free
    }
}

/// The full array of size-class pools, the size→pool lookup table, and the
/// `ALWAYS_MALLOC` escape hatch (§4.2, §4.12).
pub struct PoolSet {
    classes: Vec<Pool>,
    size_to_class: Vec<u16>,
    max_pool_size: usize,
    pub stub_pool_id: usize,
    pub always_malloc: bool,
}

impl PoolSet {
    /// `pool_scale` multiplies `units_per_segment` for every class (§4.2 "scaled by a `pool_scale` parameter").
    pub fn new(pool_scale: usize, stub_width: usize, always_malloc: bool) -> Self {
        let scale = pool_scale.max(1);
        let mut widths: Vec<usize> = BASE_SIZE_CLASSES.to_vec();
        // Ensure a class exists at exactly the stub/pairing width (§4.3 invariant
        // that the two share a pool): insert it if the base table skipped it.
        if !widths.contains(&stub_width) {
            widths.push(stub_width);
            widths.sort_unstable();
        }
        let classes: Vec<Pool> = widths
            .iter()
            .map(|&w| {
                let units = ((SEGMENT_TARGET_BYTES / w).max(MIN_UNITS_PER_SEGMENT)) * scale;
                Pool::new(w, units)
            })
            .collect();

        let max_pool_size = classes.last().expect("at least one size class").unit_width();
        let slots = max_pool_size / ALIGN + 1;
        let mut size_to_class = vec![0u16; slots];
        let mut class_idx = 0usize;
        for (slot, entry) in size_to_class.iter_mut().enumerate() {
            let size = slot * ALIGN;
            while classes[class_idx].unit_width() < size {
                class_idx += 1;
            }
            *entry = class_idx as u16;
        }

        let stub_pool_id = classes
            .iter()
            .position(|p| p.unit_width() == stub_width)
            .expect("stub width class was inserted above");

        PoolSet { classes, size_to_class, max_pool_size, stub_pool_id, always_malloc }
    }

    fn class_for_size(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.max_pool_size {
            return None;
        }
        let slot = round_up(size, ALIGN) / ALIGN;
        Some(self.size_to_class[slot] as usize)
    }

    pub fn alloc_bytes(&mut self, heap: &mut HeapAllocator, size: usize) -> Result<NonNull<u8>, MemError> {
        if self.always_malloc {
            return heap.alloc(size);
        }
        match self.class_for_size(size) {
            Some(idx) => self.classes[idx].alloc(heap),
            None => heap.alloc(size),
        }
    }

    /// # Safety
    /// `ptr`/`size` must match a prior `alloc_bytes` call that has not already been freed.
    pub unsafe fn free_bytes(&mut self, heap: &mut HeapAllocator, ptr: NonNull<u8>, size: usize) {
        if self.always_malloc {
            heap.free(ptr, size);
            return;
        }
        match self.class_for_size(size) {
            Some(idx) => self.classes[idx].free(ptr),
            None => heap.free(ptr, size),
        }
    }

    pub fn alloc_stub_unit(&mut self, heap: &mut HeapAllocator) -> Result<NonNull<u8>, MemError> {
        if self.always_malloc {
            return heap.alloc(self.stub_unit_width());
        }
        self.classes[self.stub_pool_id].alloc(heap)
    }

    /// # Safety
    /// `ptr` must be a unit previously returned by `alloc_stub_unit` and not already freed.
    pub unsafe fn free_stub_unit(&mut self, heap: &mut HeapAllocator, ptr: NonNull<u8>) {
        if self.always_malloc {
            heap.free(ptr, self.stub_unit_width());
            return;
        }
        self.classes[self.stub_pool_id].free(ptr);
    }

    pub fn stub_unit_width(&self) -> usize {
        self.classes[self.stub_pool_id].unit_width()
    }

    pub fn stub_units(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.classes[self.stub_pool_id].units()
    }

    /// Total units ever handed out across every class, by size: `(unit_width, has, free)`.
    pub fn occupancy(&self) -> Vec<(usize, usize, usize)> {
        self.classes.iter().map(|c| (c.unit_width(), c.has(), c.free_count())).collect()
    }

    pub fn release_all(&mut self, heap: &mut HeapAllocator) {
        for c in &mut self.classes {
            c.release_all(heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_freed_unit_lifo() {
        let mut heap = HeapAllocator::new();
        let mut pool = Pool::new(32, 4);
        let a = pool.alloc(&mut heap).unwrap();
        let b = pool.alloc(&mut heap).unwrap();
        unsafe {
            pool.free(a);
            pool.free(b);
        }
        // Freed units are pushed to the head (§5 "Ordering"): LIFO reuse.
        let c = pool.alloc(&mut heap).unwrap();
        assert_eq!(c, b);
        let d = pool.alloc(&mut heap).unwrap();
        assert_eq!(d, a);
        unsafe {
            pool.free(c);
            pool.free(d);
        }
        pool.release_all(&mut heap);
    }

    #[test]
    fn free_unit_first_byte_is_sentinel() {
        let mut heap = HeapAllocator::new();
        let mut pool = Pool::new(32, 4);
        let a = pool.alloc(&mut heap).unwrap();
        assert!(!Pool::is_free_unit(a));
        unsafe {
            pool.free(a);
        }
        assert!(Pool::is_free_unit(a));
        pool.release_all(&mut heap);
    }

    #[test]
    fn pool_set_routes_by_size_and_falls_through_to_heap() {
        let mut heap = HeapAllocator::new();
        let mut pools = PoolSet::new(1, 64, false);
        let small = pools.alloc_bytes(&mut heap, 20).unwrap();
        unsafe {
            pools.free_bytes(&mut heap, small, 20);
        }
        let huge = pools.alloc_bytes(&mut heap, 1 << 20).unwrap();
        unsafe {
            pools.free_bytes(&mut heap, huge, 1 << 20);
        }
        pools.release_all(&mut heap);
    }

    #[test]
    fn stub_and_pairing_width_share_one_class() {
        let pools = PoolSet::new(1, 64, false);
        assert_eq!(pools.stub_unit_width(), 64);
    }
}
