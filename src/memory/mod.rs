pub mod buddy;
pub mod heap;
pub mod paging;
pub mod phys;

pub use buddy::{BuddyAllocator, PageBlock, ZoneKind, ZoneStats};
pub use heap::{BumpArena, KernelHeap, LockedHeap};
pub use paging::{AddressSpace, AddressSpaceBuilder};
pub use phys::{DirectMap, PhysMemory};
#[cfg(not(target_os = "none"))]
pub use phys::SimulatedMemory;

use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::config::{PAGE_SHIFT, PAGE_SIZE};

/// Physical page-frame number.
pub type Pfn = u64;

#[inline]
pub fn pfn_to_phys(pfn: Pfn) -> u64 {
    pfn << PAGE_SHIFT
}

#[inline]
pub fn phys_to_pfn(phys: u64) -> Pfn {
    phys >> PAGE_SHIFT
}

#[inline]
pub fn pfn_to_frame(pfn: Pfn) -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new(pfn_to_phys(pfn)))
}

#[inline]
pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// Memory totals in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}
