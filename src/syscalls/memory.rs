//! Memory calls made by the running process: the program break, anonymous
//! mappings, and copying arguments in and out of its address space.

use alloc::vec::Vec;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use crate::config::{MMAP_BASE, PAGE_SIZE, USER_HEAP_BASE, USER_SPACE_END};
use crate::error::{KResult, KernelError};
use crate::kernel::KernelState;
use crate::memory::{is_page_aligned, page_align_up};
use crate::scheduler::{Capabilities, Pid};

pub const PROT_READ: u64 = 1 << 0;
pub const PROT_WRITE: u64 = 1 << 1;
pub const PROT_EXEC: u64 = 1 << 2;

/// Upper bound on a single copy across the boundary.
const MAX_COPY: usize = 4096;

impl KernelState {
    fn user_flags(&self, writable: bool, executable: bool) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if !executable && self.hw.is_hardened_mode() {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }

    /// Map `pages` fresh pages at `start` in `pid`'s space, all or nothing.
    fn map_range(&mut self, pid: Pid, start: u64, pages: u64, flags: PageTableFlags) -> KResult<()> {
        let space = self
            .table
            .find_mut(pid)
            .and_then(|p| p.address_space.as_mut())
            .ok_or(KernelError::NoCurrentProcess)?;
        for i in 0..pages {
            let page = VirtAddr::new(start + i * PAGE_SIZE);
            if let Err(e) = space.map_page(page, flags, &mut self.zones, &mut *self.phys, &*self.hw) {
                for j in 0..i {
                    let done = VirtAddr::new(start + j * PAGE_SIZE);
                    let _ = space.unmap_page(done, &mut self.zones, &mut *self.phys, &*self.hw);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap whatever is mapped in `[start, start + pages * PAGE_SIZE)`.
    fn unmap_range(&mut self, pid: Pid, start: u64, pages: u64) {
        let Some(space) = self.table.find_mut(pid).and_then(|p| p.address_space.as_mut()) else {
            return;
        };
        for i in 0..pages {
            let page = VirtAddr::new(start + i * PAGE_SIZE);
            if space.is_mapped(page) {
                let _ = space.unmap_page(page, &mut self.zones, &mut *self.phys, &*self.hw);
            }
        }
    }

    fn range_is_free(&self, pid: Pid, start: u64, pages: u64) -> bool {
        let Some(space) = self.table.find(pid).and_then(|p| p.address_space.as_ref()) else {
            return false;
        };
        (0..pages).all(|i| !space.is_mapped(VirtAddr::new(start + i * PAGE_SIZE)))
    }

    fn require_map_memory(&self, pid: Pid) -> KResult<()> {
        let pcb = self.table.find(pid).ok_or(KernelError::NoCurrentProcess)?;
        if pcb.capabilities.contains(Capabilities::MAP_MEMORY) {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied)
        }
    }

    /// Move the program break by `delta` bytes and return the new break.
    /// Growth maps zeroed pages; shrinking unmaps whole pages above it.
    pub fn brk(&mut self, delta: i64) -> KResult<u64> {
        let pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let old = self.table.find(pid).map(|p| p.brk).ok_or(KernelError::NoCurrentProcess)?;
        if delta == 0 {
            return Ok(old);
        }
        if delta > 0 {
            self.require_map_memory(pid)?;
        }
        let new = if delta > 0 {
            old.checked_add(delta as u64)
        } else {
            old.checked_sub(delta.unsigned_abs())
        }
        .ok_or(KernelError::InvalidArgument)?;
        if !(USER_HEAP_BASE..=MMAP_BASE).contains(&new) {
            return Err(KernelError::InvalidArgument);
        }

        let (old_top, new_top) = (page_align_up(old), page_align_up(new));
        if new_top > old_top {
            let flags = self.user_flags(true, false);
            self.map_range(pid, old_top, (new_top - old_top) / PAGE_SIZE, flags)?;
        } else if new_top < old_top {
            self.unmap_range(pid, new_top, (old_top - new_top) / PAGE_SIZE);
        }
        if let Some(pcb) = self.table.find_mut(pid) {
            pcb.brk = new;
        }
        Ok(new)
    }

    /// Anonymous zero-filled mapping. A zero `hint` picks the next free
    /// range above the mapping cursor.
    pub fn mmap(&mut self, hint: u64, length: u64, prot: u64) -> KResult<u64> {
        let pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        self.require_map_memory(pid)?;
        if length == 0 || length > USER_SPACE_END {
            return Err(KernelError::InvalidArgument);
        }
        let pages = page_align_up(length) / PAGE_SIZE;
        let size = pages * PAGE_SIZE;

        let base = if hint == 0 {
            let mut base = self.table.find(pid).map(|p| p.mmap_cursor).ok_or(KernelError::NoCurrentProcess)?;
            while base + size <= USER_SPACE_END && !self.range_is_free(pid, base, pages) {
                base += PAGE_SIZE;
            }
            base
        } else {
            if !is_page_aligned(hint) {
                return Err(KernelError::InvalidArgument);
            }
            hint
        };
        if base < PAGE_SIZE || base.checked_add(size).map_or(true, |end| end > USER_SPACE_END) {
            return Err(KernelError::InvalidArgument);
        }
        if !self.range_is_free(pid, base, pages) {
            return Err(KernelError::InvalidArgument);
        }

        let flags = self.user_flags(prot & PROT_WRITE != 0, prot & PROT_EXEC != 0);
        self.map_range(pid, base, pages, flags)?;
        if hint == 0 {
            if let Some(pcb) = self.table.find_mut(pid) {
                pcb.mmap_cursor = base + size;
            }
        }
        Ok(base)
    }

    pub fn munmap(&mut self, addr: u64, length: u64) -> KResult<()> {
        let pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        if !is_page_aligned(addr) || length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = addr.checked_add(page_align_up(length)).ok_or(KernelError::InvalidArgument)?;
        if end > USER_SPACE_END {
            return Err(KernelError::InvalidArgument);
        }
        self.unmap_range(pid, addr, (end - addr) / PAGE_SIZE);
        Ok(())
    }

    /// Frame and offset backing user address `addr` of the running process.
    /// Only pages the process itself mapped for user access qualify.
    fn user_frame(&self, addr: u64, write: bool) -> KResult<(PhysFrame, usize)> {
        let space = self
            .current_pcb()
            .and_then(|p| p.address_space.as_ref())
            .ok_or(KernelError::NoCurrentProcess)?;
        let page = VirtAddr::new(addr & !(PAGE_SIZE - 1));
        let mapping = space.mapping(page).ok_or(KernelError::InvalidArgument)?;
        let mut needed = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if write {
            needed |= PageTableFlags::WRITABLE;
        }
        if !mapping.flags.contains(needed) {
            return Err(KernelError::InvalidArgument);
        }
        Ok((mapping.block.frame(), (addr % PAGE_SIZE) as usize))
    }

    /// `[addr, addr + len)` must lie in the user half.
    fn check_user_range(addr: u64, len: usize) -> KResult<()> {
        if len > MAX_COPY {
            return Err(KernelError::InvalidArgument);
        }
        match addr.checked_add(len as u64) {
            Some(end) if end <= USER_SPACE_END => Ok(()),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Read `len` bytes at `addr` in the running process's address space.
    pub fn copy_from_current(&mut self, addr: u64, len: usize) -> KResult<Vec<u8>> {
        Self::check_user_range(addr, len)?;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let (frame, offset) = self.user_frame(addr + out.len() as u64, false)?;
            let chunk = (PAGE_SIZE as usize - offset).min(len - out.len());
            out.extend_from_slice(&self.phys.bytes_mut(frame)[offset..offset + chunk]);
        }
        Ok(out)
    }

    /// Fails unless the running process may write all of `[addr, addr + len)`.
    pub fn check_user_writable(&self, addr: u64, len: usize) -> KResult<()> {
        Self::check_user_range(addr, len)?;
        let mut done = 0;
        while done < len {
            let (_, offset) = self.user_frame(addr + done as u64, true)?;
            done += (PAGE_SIZE as usize - offset).min(len - done);
        }
        Ok(())
    }

    /// Write `data` at `addr` in the running process's address space.
    /// Nothing is written unless every page is writable by the process.
    pub fn copy_to_current(&mut self, addr: u64, data: &[u8]) -> KResult<()> {
        self.check_user_writable(addr, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let (frame, offset) = self.user_frame(addr + done as u64, true)?;
            let chunk = (PAGE_SIZE as usize - offset).min(data.len() - done);
            self.phys.bytes_mut(frame)[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::hosted_kernel;
    use crate::scheduler::ProcessSpec;
    use crate::memory::paging::translate_in;
    use crate::security::Classification;

    fn running() -> (KernelState, crate::scheduler::HostedCpu, Pid) {
        let (mut state, mut cpu) = hosted_kernel();
        let pid = state.spawn(ProcessSpec::new("user", Classification::Unclassified, false)).unwrap();
        state.schedule(&mut cpu);
        (state, cpu, pid)
    }

    fn mapped(state: &mut KernelState, addr: u64) -> bool {
        let root = state.current_pcb().unwrap().address_space.as_ref().unwrap().root_frame();
        translate_in(root, VirtAddr::new(addr), &mut *state.phys, &*state.hw).is_some()
    }

    #[test]
    fn brk_grows_and_shrinks_by_pages() {
        let (mut state, _, _) = running();
        assert_eq!(state.brk(0), Ok(USER_HEAP_BASE));
        assert_eq!(state.brk(5000), Ok(USER_HEAP_BASE + 5000));
        assert!(mapped(&mut state, USER_HEAP_BASE));
        assert!(mapped(&mut state, USER_HEAP_BASE + 4096));
        assert!(!mapped(&mut state, USER_HEAP_BASE + 8192));

        assert_eq!(state.brk(-4000), Ok(USER_HEAP_BASE + 1000));
        assert!(mapped(&mut state, USER_HEAP_BASE));
        assert!(!mapped(&mut state, USER_HEAP_BASE + 4096));
        assert_eq!(state.brk(-2000), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn mmap_hands_out_disjoint_zeroed_ranges() {
        let (mut state, _, _) = running();
        let a = state.mmap(0, 3 * PAGE_SIZE, PROT_READ | PROT_WRITE).unwrap();
        let b = state.mmap(0, 1, PROT_READ).unwrap();
        assert_eq!(a, MMAP_BASE);
        assert_eq!(b, a + 3 * PAGE_SIZE);
        assert_eq!(state.copy_from_current(a + 10, 4).unwrap(), [0, 0, 0, 0]);

        let fixed = 0x2000_0000;
        assert_eq!(state.mmap(fixed, PAGE_SIZE, PROT_READ), Ok(fixed));
        assert_eq!(state.mmap(fixed, PAGE_SIZE, PROT_READ), Err(KernelError::InvalidArgument));
        assert_eq!(state.mmap(fixed + 1, PAGE_SIZE, PROT_READ), Err(KernelError::InvalidArgument));
        assert_eq!(state.mmap(0, 0, PROT_READ), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn mapping_needs_the_map_memory_capability() {
        let (mut state, _, pid) = running();
        state.table.find_mut(pid).unwrap().capabilities.remove(Capabilities::MAP_MEMORY);
        assert_eq!(state.mmap(0, PAGE_SIZE, PROT_READ), Err(KernelError::PermissionDenied));
        assert_eq!(state.brk(PAGE_SIZE as i64), Err(KernelError::PermissionDenied));
        assert_eq!(state.brk(0), Ok(USER_HEAP_BASE));
    }

    #[test]
    fn munmap_returns_frames() {
        let (mut state, _, _) = running();
        let free = state.zones().free_pages();
        let a = state.mmap(0, 2 * PAGE_SIZE, PROT_WRITE).unwrap();
        assert!(state.zones().free_pages() < free);
        state.munmap(a, 2 * PAGE_SIZE).unwrap();
        assert!(!mapped(&mut state, a));
        assert_eq!(state.munmap(a + 1, PAGE_SIZE), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn hardened_mode_maps_data_non_executable() {
        use crate::memory::SimulatedMemory;
        use crate::security::SoftwareSecurity;
        use alloc::boxed::Box;

        let mut state = KernelState::boot(
            crate::config::KernelConfig::small(),
            Box::new(SimulatedMemory::new()),
            Box::new(SoftwareSecurity::new(3).hardened(true)),
            None,
        );
        let mut cpu = crate::scheduler::HostedCpu::new();
        state.spawn(ProcessSpec::new("user", Classification::Unclassified, false)).unwrap();
        state.schedule(&mut cpu);

        let data = state.mmap(0, PAGE_SIZE, PROT_READ | PROT_WRITE).unwrap();
        let code = state.mmap(0, PAGE_SIZE, PROT_READ | PROT_EXEC).unwrap();
        let space = state.current_pcb().unwrap().address_space.as_ref().unwrap();
        let flags_of = |addr: u64| space.mappings().iter().find(|m| m.page.as_u64() == addr).unwrap().flags;
        assert!(flags_of(data).contains(PageTableFlags::NO_EXECUTE | PageTableFlags::WRITABLE));
        assert!(!flags_of(code).contains(PageTableFlags::NO_EXECUTE));
        assert!(!flags_of(code).contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn copies_cross_page_boundaries() {
        let (mut state, _, _) = running();
        let base = state.mmap(0, 2 * PAGE_SIZE, PROT_WRITE).unwrap();
        let at = base + PAGE_SIZE - 3;
        state.copy_to_current(at, b"kernel").unwrap();
        assert_eq!(state.copy_from_current(at, 6).unwrap(), b"kernel");
        assert_eq!(state.copy_from_current(0x7000_0000, 1), Err(KernelError::InvalidArgument));
    }
}
