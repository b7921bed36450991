//! Access to physical frames.
//!
//! Everything that reads or writes page tables, stacks or user pages goes
//! through `PhysMemory`. On bare metal frames are reached through the
//! kernel's direct map; the hosted backend keeps frames in a map so the
//! memory subsystem can run under the test harness.

use x86_64::structures::paging::{PageTable, PhysFrame};
use x86_64::PhysAddr;

use crate::config::PAGE_SIZE;

pub trait PhysMemory {
    /// Page-table view of one frame.
    fn table_mut(&mut self, frame: PhysFrame) -> &mut PageTable;

    /// Word view of one frame.
    fn words_mut(&mut self, frame: PhysFrame) -> &mut [u64; 512] {
        let table: *mut PageTable = self.table_mut(frame);
        // PageTable is 512 transparent u64 entries.
        unsafe { &mut *(table as *mut [u64; 512]) }
    }

    /// Byte view of one frame.
    fn bytes_mut(&mut self, frame: PhysFrame) -> &mut [u8; 4096] {
        let table: *mut PageTable = self.table_mut(frame);
        unsafe { &mut *(table as *mut [u8; 4096]) }
    }

    fn zero_frame(&mut self, frame: PhysFrame) {
        self.words_mut(frame).fill(0);
    }

    fn copy_frame(&mut self, src: PhysFrame, dst: PhysFrame) {
        let data = *self.words_mut(src);
        *self.words_mut(dst) = data;
    }

    fn read_u64(&mut self, addr: PhysAddr) -> u64 {
        let frame = PhysFrame::containing_address(addr);
        let index = ((addr.as_u64() % PAGE_SIZE) / 8) as usize;
        self.words_mut(frame)[index]
    }

    fn write_u64(&mut self, addr: PhysAddr, value: u64) {
        let frame = PhysFrame::containing_address(addr);
        let index = ((addr.as_u64() % PAGE_SIZE) / 8) as usize;
        self.words_mut(frame)[index] = value;
    }
}

/// Frames reached through a linear mapping of all physical memory.
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    /// # Safety
    /// All physical memory handed out by the page allocator must be mapped,
    /// writable, at `offset + phys` in every address space.
    pub const unsafe fn new(offset: u64) -> Self {
        DirectMap { offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl PhysMemory for DirectMap {
    fn table_mut(&mut self, frame: PhysFrame) -> &mut PageTable {
        let virt = self.offset + frame.start_address().as_u64();
        unsafe { &mut *(virt as *mut PageTable) }
    }
}

/// Hosted backend: frames materialize zero-filled on first touch.
#[cfg(not(target_os = "none"))]
pub struct SimulatedMemory {
    frames: alloc::collections::BTreeMap<u64, alloc::boxed::Box<PageTable>>,
}

#[cfg(not(target_os = "none"))]
impl SimulatedMemory {
    pub fn new() -> Self {
        SimulatedMemory { frames: alloc::collections::BTreeMap::new() }
    }

    pub fn touched_frames(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(not(target_os = "none"))]
impl Default for SimulatedMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "none"))]
impl PhysMemory for SimulatedMemory {
    fn table_mut(&mut self, frame: PhysFrame) -> &mut PageTable {
        self.frames
            .entry(frame.start_address().as_u64())
            .or_insert_with(|| alloc::boxed::Box::new(PageTable::new()))
    }
}
