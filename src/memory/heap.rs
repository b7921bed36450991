//! Kernel heap: two bump arenas.
//!
//! Early boot allocates from a static arena. Once the page allocator has
//! backed the heap region, `promote` switches every later allocation to the
//! main arena. Nothing is ever returned to either arena.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::error::{KResult, KernelError};

const MIN_ALIGN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BumpArena {
    base: u64,
    offset: u64,
    capacity: u64,
}

impl BumpArena {
    pub const fn new(base: u64, capacity: u64) -> Self {
        BumpArena { base, offset: 0, capacity }
    }

    /// `align` must be a power of two.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let size = size.checked_add(MIN_ALIGN - 1)? & !(MIN_ALIGN - 1);
        let start = (self.base + self.offset).checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(size)?;
        if end > self.base.checked_add(self.capacity)? {
            return None;
        }
        self.offset = end - self.base;
        Some(start)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn used(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

pub struct KernelHeap {
    early: BumpArena,
    main: Option<BumpArena>,
}

impl KernelHeap {
    pub const fn new(early_base: u64, early_size: u64) -> Self {
        KernelHeap { early: BumpArena::new(early_base, early_size), main: None }
    }

    /// Switch to the page-backed arena at `base`.
    pub fn promote(&mut self, base: VirtAddr, capacity: u64) {
        crate::log_info!(
            "heap: promoted to {:#x} ({} KiB), early arena used {} bytes",
            base.as_u64(),
            capacity / 1024,
            self.early.used()
        );
        self.main = Some(BumpArena::new(base.as_u64(), capacity));
    }

    pub fn is_promoted(&self) -> bool {
        self.main.is_some()
    }

    pub fn kalloc(&mut self, size: usize) -> KResult<VirtAddr> {
        self.kalloc_aligned(size, MIN_ALIGN as usize)
    }

    /// Exhausting the early arena is fatal; the main arena reports
    /// `OutOfMemory` instead.
    pub fn kalloc_aligned(&mut self, size: usize, align: usize) -> KResult<VirtAddr> {
        if !align.is_power_of_two() {
            return Err(KernelError::InvalidArgument);
        }
        let align = (align as u64).max(MIN_ALIGN);
        match self.main.as_mut() {
            Some(arena) => arena
                .alloc(size as u64, align)
                .map(VirtAddr::new)
                .ok_or(KernelError::OutOfMemory),
            None => match self.early.alloc(size as u64, align) {
                Some(addr) => Ok(VirtAddr::new(addr)),
                None => panic!("heap: early arena exhausted allocating {} bytes", size),
            },
        }
    }

    fn active(&self) -> &BumpArena {
        self.main.as_ref().unwrap_or(&self.early)
    }

    pub fn used(&self) -> u64 {
        self.active().used()
    }

    pub fn capacity(&self) -> u64 {
        self.active().capacity()
    }
}

/// Global allocator: a locked `KernelHeap` whose early arena is the static
/// buffer carried inline.
pub struct LockedHeap<const N: usize> {
    heap: Mutex<KernelHeap>,
    early: UnsafeCell<[u8; N]>,
}

// The buffer is only reached through addresses handed out under `heap`.
unsafe impl<const N: usize> Sync for LockedHeap<N> {}

impl<const N: usize> LockedHeap<N> {
    pub const fn new() -> Self {
        LockedHeap { heap: Mutex::new(KernelHeap::new(0, N as u64)), early: UnsafeCell::new([0; N]) }
    }

    /// Later calls after the first are ignored.
    pub fn promote(&self, base: VirtAddr, capacity: u64) {
        let mut heap = self.heap.lock();
        if heap.is_promoted() {
            crate::log_warn!("heap: already promoted, ignoring {:#x}", base.as_u64());
            return;
        }
        heap.promote(base, capacity);
    }

    pub fn used(&self) -> u64 {
        self.heap.lock().used()
    }
}

impl<const N: usize> Default for LockedHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const N: usize> GlobalAlloc for LockedHeap<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.heap.lock();
        if heap.early.base == 0 {
            heap.early.base = self.early.get() as u64;
        }
        match heap.kalloc_aligned(layout.size(), layout.align()) {
            Ok(addr) => addr.as_mut_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    #[test]
    fn allocations_are_eight_byte_aligned() {
        let mut heap = KernelHeap::new(0x10_0003, 4096);
        let a = heap.kalloc(3).unwrap();
        let b = heap.kalloc(1).unwrap();
        assert_eq!(a.as_u64() % 8, 0);
        assert_eq!(b.as_u64() - a.as_u64(), 8);
    }

    #[test]
    fn aligned_allocation_respects_alignment() {
        let mut heap = KernelHeap::new(0x20_0000, 64 * 1024);
        heap.kalloc(24).unwrap();
        let page = heap.kalloc_aligned(100, 4096).unwrap();
        assert_eq!(page.as_u64() % 4096, 0);
        assert_eq!(heap.kalloc_aligned(8, 24), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn promoted_arena_reports_exhaustion() {
        let mut heap = KernelHeap::new(0x20_0000, 4096);
        heap.promote(VirtAddr::new(0xFFFF_FFFF_9000_0000), 64);
        let first = heap.kalloc(32).unwrap();
        assert_eq!(first.as_u64(), 0xFFFF_FFFF_9000_0000);
        heap.kalloc(32).unwrap();
        assert_eq!(heap.kalloc(8), Err(KernelError::OutOfMemory));
        assert_eq!(heap.used(), 64);
    }

    #[test]
    fn oversized_requests_fail_without_wrapping() {
        let mut heap = KernelHeap::new(0x20_0000, 4096);
        heap.promote(VirtAddr::new(0xFFFF_FFFF_9000_0000), 4096);
        assert_eq!(heap.kalloc(usize::MAX), Err(KernelError::OutOfMemory));
        assert_eq!(heap.kalloc(usize::MAX - 3), Err(KernelError::OutOfMemory));
        assert_eq!(heap.kalloc_aligned(8, 1 << 63), Err(KernelError::OutOfMemory));
        assert_eq!(heap.used(), 0);
        assert!(heap.kalloc(8).is_ok());

        let mut arena = BumpArena::new(u64::MAX - 64, 32);
        assert_eq!(arena.alloc(8, 128), None);
    }

    #[test]
    fn second_promotion_is_ignored() {
        static HEAP: LockedHeap<64> = LockedHeap::new();
        HEAP.promote(VirtAddr::new(0x50_0000), 4096);
        HEAP.promote(VirtAddr::new(0x90_0000), 4096);
        let p = unsafe { HEAP.alloc(Layout::from_size_align(8, 8).unwrap()) };
        assert_eq!(p as u64, 0x50_0000);
    }

    #[test]
    #[should_panic(expected = "early arena exhausted")]
    fn early_exhaustion_is_fatal() {
        let mut heap = KernelHeap::new(0x20_0000, 16);
        heap.kalloc(8).unwrap();
        let _ = heap.kalloc(16);
    }

    #[test]
    fn global_allocator_binds_inline_buffer() {
        static HEAP: LockedHeap<256> = LockedHeap::new();
        let layout = Layout::from_size_align(16, 16).unwrap();
        let p = unsafe { HEAP.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        assert!(HEAP.used() >= 16);
    }

    proptest! {
        #[test]
        fn allocations_never_overlap(reqs in proptest::collection::vec((1usize..300, 0u32..7), 1..80)) {
            let mut heap = KernelHeap::new(0x40_0000, 1 << 20);
            let mut spans: Vec<(u64, u64)> = Vec::new();
            for (size, shift) in reqs {
                let align = 1usize << shift;
                let addr = heap.kalloc_aligned(size, align).unwrap().as_u64();
                prop_assert_eq!(addr % (align as u64).max(8), 0);
                for &(start, end) in &spans {
                    prop_assert!(addr >= end || addr + size as u64 <= start);
                }
                spans.push((addr, addr + size as u64));
            }
        }
    }
}
