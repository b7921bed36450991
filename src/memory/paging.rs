//! Per-process address spaces.
//!
//! Every process gets its own level-4 table. The kernel half (entries
//! 256..512) is copied from the kernel template when the space is built, so
//! the kernel's own mappings are shared through the lower-level tables while
//! the user half starts empty.

use alloc::vec::Vec;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use super::buddy::{BuddyAllocator, PageBlock, ZoneKind};
use super::phys::PhysMemory;
use crate::config::{ENTRIES_PER_TABLE, KERNEL_HALF_START, PAGE_SIZE};
use crate::error::{KResult, KernelError};
use crate::security::HardwareSecurity;

/// Flags used for intermediate tables that may hold user mappings.
const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Indices into the four table levels, level 4 first.
fn table_indices(addr: VirtAddr) -> [usize; 4] {
    [
        usize::from(addr.p4_index()),
        usize::from(addr.p3_index()),
        usize::from(addr.p2_index()),
        usize::from(addr.p1_index()),
    ]
}

fn entry_frame(raw: u64, hw: &dyn HardwareSecurity) -> PhysFrame {
    let addr = hw.untag_physical(raw) & 0x000F_FFFF_FFFF_F000;
    PhysFrame::containing_address(PhysAddr::new(addr))
}

/// Install `frame` at `page` under `root`, creating missing tables.
/// Tables created here are appended to `tables` so their owner can free them.
pub fn map_into(
    root: PhysFrame,
    page: VirtAddr,
    frame: PhysFrame,
    flags: PageTableFlags,
    zones: &mut BuddyAllocator,
    phys: &mut dyn PhysMemory,
    hw: &dyn HardwareSecurity,
    tables: &mut Vec<PageBlock>,
) -> KResult<()> {
    let indices = table_indices(page);
    let mut table = root;
    for &index in &indices[..3] {
        let raw = phys.words_mut(table)[index];
        let entry_flags = PageTableFlags::from_bits_truncate(raw);
        table = if entry_flags.contains(PageTableFlags::PRESENT) {
            if entry_flags.contains(PageTableFlags::HUGE_PAGE) {
                return Err(KernelError::InvalidArgument);
            }
            entry_frame(raw, hw)
        } else {
            let block = zones.alloc_fallback(ZoneKind::Normal, 0)?;
            phys.zero_frame(block.frame());
            let addr = hw.tag_physical(block.start_address().as_u64());
            phys.words_mut(table)[index] = addr | TABLE_FLAGS.bits();
            tables.push(block);
            block.frame()
        };
    }

    let leaf = &mut phys.words_mut(table)[indices[3]];
    if PageTableFlags::from_bits_truncate(*leaf).contains(PageTableFlags::PRESENT) {
        return Err(KernelError::InvalidArgument);
    }
    *leaf = hw.tag_physical(frame.start_address().as_u64()) | flags.bits();
    Ok(())
}

/// Walk `root` for `addr`. Understands 1 GiB and 2 MiB pages.
pub fn translate_in(
    root: PhysFrame,
    addr: VirtAddr,
    phys: &mut dyn PhysMemory,
    hw: &dyn HardwareSecurity,
) -> Option<PhysAddr> {
    let indices = table_indices(addr);
    let mut table = root;
    for (level, &index) in indices.iter().enumerate() {
        let raw = phys.words_mut(table)[index];
        let flags = PageTableFlags::from_bits_truncate(raw);
        if !flags.contains(PageTableFlags::PRESENT) {
            return None;
        }
        let base = entry_frame(raw, hw).start_address().as_u64();
        let huge = flags.contains(PageTableFlags::HUGE_PAGE);
        match level {
            1 if huge => return Some(PhysAddr::new(base + (addr.as_u64() & 0x3FFF_FFFF))),
            2 if huge => return Some(PhysAddr::new(base + (addr.as_u64() & 0x1F_FFFF))),
            3 => return Some(PhysAddr::new(base + u64::from(addr.page_offset()))),
            _ => table = entry_frame(raw, hw),
        }
    }
    None
}

/// One page of user memory backed by a frame owned by the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub page: VirtAddr,
    pub block: PageBlock,
    pub flags: PageTableFlags,
}

#[derive(Debug)]
pub struct AddressSpace {
    root: PageBlock,
    tables: Vec<PageBlock>,
    mappings: Vec<Mapping>,
}

impl AddressSpace {
    pub fn root_frame(&self) -> PhysFrame {
        self.root.frame()
    }

    /// Value to load into CR3 for this space.
    pub fn cr3(&self, hw: &dyn HardwareSecurity) -> u64 {
        hw.tag_physical(self.root.start_address().as_u64())
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn is_mapped(&self, page: VirtAddr) -> bool {
        self.mapping(page).is_some()
    }

    pub fn mapping(&self, page: VirtAddr) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.page == page)
    }

    /// Frames owned by this space, root and tables included.
    pub fn frame_count(&self) -> usize {
        1 + self.tables.len() + self.mappings.len()
    }

    /// Back `page` with a fresh zeroed frame.
    pub fn map_page(
        &mut self,
        page: VirtAddr,
        flags: PageTableFlags,
        zones: &mut BuddyAllocator,
        phys: &mut dyn PhysMemory,
        hw: &dyn HardwareSecurity,
    ) -> KResult<PageBlock> {
        if !page.is_aligned(PAGE_SIZE) || usize::from(page.p4_index()) >= KERNEL_HALF_START {
            return Err(KernelError::InvalidArgument);
        }
        let block = zones.alloc_fallback(ZoneKind::High, 0)?;
        phys.zero_frame(block.frame());
        let root = self.root.frame();
        if let Err(e) = map_into(root, page, block.frame(), flags, zones, phys, hw, &mut self.tables) {
            zones.free(block);
            return Err(e);
        }
        self.mappings.push(Mapping { page, block, flags });
        Ok(block)
    }

    /// Remove the mapping of `page` and return its frame to the allocator.
    pub fn unmap_page(
        &mut self,
        page: VirtAddr,
        zones: &mut BuddyAllocator,
        phys: &mut dyn PhysMemory,
        hw: &dyn HardwareSecurity,
    ) -> KResult<()> {
        let pos = self
            .mappings
            .iter()
            .position(|m| m.page == page)
            .ok_or(KernelError::InvalidArgument)?;
        let mapping = self.mappings.swap_remove(pos);

        let indices = table_indices(page);
        let mut table = self.root.frame();
        for &index in &indices[..3] {
            let raw = phys.words_mut(table)[index];
            table = entry_frame(raw, hw);
        }
        phys.words_mut(table)[indices[3]] = 0;
        flush_page(page);

        zones.free(mapping.block);
        Ok(())
    }

    pub fn translate(
        &self,
        addr: VirtAddr,
        phys: &mut dyn PhysMemory,
        hw: &dyn HardwareSecurity,
    ) -> Option<PhysAddr> {
        translate_in(self.root.frame(), addr, phys, hw)
    }

    /// Deep copy of the user half: same layout, private frames.
    pub fn duplicate(
        &self,
        builder: &AddressSpaceBuilder,
        zones: &mut BuddyAllocator,
        phys: &mut dyn PhysMemory,
        hw: &dyn HardwareSecurity,
    ) -> KResult<AddressSpace> {
        let mut copy = builder.build(zones, phys)?;
        for m in &self.mappings {
            match copy.map_page(m.page, m.flags, zones, phys, hw) {
                Ok(block) => phys.copy_frame(m.block.frame(), block.frame()),
                Err(e) => {
                    copy.release(zones);
                    return Err(e);
                }
            }
        }
        Ok(copy)
    }

    /// Free every frame owned by this space: user pages, the user-half
    /// tables, then the root. Kernel-half tables are shared and untouched.
    pub fn release(self, zones: &mut BuddyAllocator) {
        for m in self.mappings {
            zones.free(m.block);
        }
        for t in self.tables {
            zones.free(t);
        }
        zones.free(self.root);
    }
}

#[cfg(target_os = "none")]
fn flush_page(page: VirtAddr) {
    x86_64::instructions::tlb::flush(page);
}

#[cfg(not(target_os = "none"))]
fn flush_page(_page: VirtAddr) {}

/// Builds address spaces sharing the kernel template's upper half.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpaceBuilder {
    kernel_root: PhysFrame,
}

impl AddressSpaceBuilder {
    pub fn new(kernel_root: PhysFrame) -> Self {
        AddressSpaceBuilder { kernel_root }
    }

    pub fn kernel_root(&self) -> PhysFrame {
        self.kernel_root
    }

    pub fn build(&self, zones: &mut BuddyAllocator, phys: &mut dyn PhysMemory) -> KResult<AddressSpace> {
        let root = zones.alloc_fallback(ZoneKind::Normal, 0)?;

        let mut kernel_half = [0u64; ENTRIES_PER_TABLE - KERNEL_HALF_START];
        kernel_half.copy_from_slice(&phys.words_mut(self.kernel_root)[KERNEL_HALF_START..]);

        let words = phys.words_mut(root.frame());
        words[..KERNEL_HALF_START].fill(0);
        words[KERNEL_HALF_START..].copy_from_slice(&kernel_half);

        Ok(AddressSpace { root, tables: Vec::new(), mappings: Vec::new() })
    }
}
