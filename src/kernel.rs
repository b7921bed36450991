//! Kernel-wide state.
//!
//! `KernelState` owns the process table, the ready queue, the page allocator
//! and the hardware seams. It is a plain value: the bare-metal entry point
//! keeps exactly one inside a `KernelLock`, the tests build as many as they
//! like.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use crate::config::{KernelConfig, KERNEL_HEAP_START, MAX_ORDER, PAGE_SIZE};
use crate::klog::{AuditEvent, AuditLog};
use crate::memory::paging::map_into;
use crate::memory::{AddressSpaceBuilder, BuddyAllocator, MemoryStats, PageBlock, PhysMemory, ZoneKind};
use crate::scheduler::{CpuContext, Pcb, Pid, ProcessState, ProcessTable, ReadyQueue};
use crate::security::{Classification, HardwareSecurity};

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    pub schedule_calls: u64,
    pub context_switches: u64,
    pub gate_refusals: u64,
    pub processes_created: u64,
    pub processes_reaped: u64,
}

/// Backed part of the kernel heap region.
#[derive(Debug)]
pub struct HeapRegion {
    pub base: VirtAddr,
    pub size: u64,
    blocks: Vec<PageBlock>,
    tables: Vec<PageBlock>,
}

impl HeapRegion {
    pub fn frames(&self) -> u64 {
        self.blocks.iter().map(|b| b.pages()).sum::<u64>() + self.tables.len() as u64
    }
}

/// One row of the process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub name: String,
    pub state: ProcessState,
    pub classification: Classification,
    pub priority: u64,
    pub uid: u32,
    pub cpu_time: u64,
}

pub struct KernelState {
    pub(crate) config: KernelConfig,
    pub(crate) table: ProcessTable,
    pub(crate) ready: ReadyQueue,
    pub(crate) zones: BuddyAllocator,
    pub(crate) phys: Box<dyn PhysMemory + Send>,
    pub(crate) hw: Box<dyn HardwareSecurity + Send>,
    pub(crate) builder: AddressSpaceBuilder,
    pub(crate) current: Option<Pid>,
    /// Register file of the boot thread, resumed when nothing is runnable.
    pub(crate) idle_context: CpuContext,
    pub(crate) heap: Option<HeapRegion>,
    pub(crate) audit: AuditLog,
    pub(crate) ticks: u64,
    pub(crate) stats: SchedStats,
}

impl KernelState {
    /// Bring up the memory subsystem and an empty process table.
    ///
    /// `kernel_root` is the bootstrap's level-4 table; `None` starts from an
    /// empty template. Failure anywhere in here is fatal.
    pub fn boot(
        config: KernelConfig,
        mut phys: Box<dyn PhysMemory + Send>,
        hw: Box<dyn HardwareSecurity + Send>,
        kernel_root: Option<PhysFrame>,
    ) -> KernelState {
        let mut zones = BuddyAllocator::new(&config);
        let kernel_root = match kernel_root {
            Some(frame) => frame,
            None => {
                let block = zones.alloc_mandatory(ZoneKind::Normal, 0);
                phys.zero_frame(block.frame());
                block.frame()
            }
        };
        let idle_context = CpuContext { cr3: hw.tag_physical(kernel_root.start_address().as_u64()), ..CpuContext::default() };

        let mut state = KernelState {
            table: ProcessTable::new(config.max_processes),
            ready: ReadyQueue::new(),
            zones,
            phys,
            hw,
            builder: AddressSpaceBuilder::new(kernel_root),
            current: None,
            idle_context,
            heap: None,
            audit: AuditLog::new(),
            ticks: 0,
            stats: SchedStats::default(),
            config,
        };
        if state.config.kernel_heap_size > 0 {
            state.map_kernel_heap();
        }
        crate::log_info!(
            "kernel: {} of {} pages free, {} process slots",
            state.zones.free_pages(),
            state.zones.total_pages(),
            state.table.capacity()
        );
        state
    }

    /// Back the start of the heap region with pages, mapped in the kernel
    /// template so every later address space inherits it.
    fn map_kernel_heap(&mut self) {
        let pages = self.config.kernel_heap_size.div_ceil(PAGE_SIZE);
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
        if self.hw.is_hardened_mode() {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        let root = self.builder.kernel_root();
        let mut region = HeapRegion {
            base: VirtAddr::new(KERNEL_HEAP_START),
            size: pages * PAGE_SIZE,
            blocks: Vec::new(),
            tables: Vec::new(),
        };

        let mut mapped = 0;
        while mapped < pages {
            let remaining = pages - mapped;
            let order = (63 - remaining.leading_zeros() as usize).min(MAX_ORDER);
            let block = self.zones.alloc_mandatory(ZoneKind::Normal, order);
            for i in 0..block.pages() {
                let page = region.base + (mapped + i) * PAGE_SIZE;
                let result = map_into(
                    root,
                    page,
                    block.frame_at(i),
                    flags,
                    &mut self.zones,
                    &mut *self.phys,
                    &*self.hw,
                    &mut region.tables,
                );
                if let Err(e) = result {
                    panic!("kernel heap: cannot map {:#x}: {}", page.as_u64(), e);
                }
            }
            mapped += block.pages();
            region.blocks.push(block);
        }

        crate::log_info!(
            "kernel heap: {} KiB at {:#x} ({} frames)",
            region.size / 1024,
            region.base.as_u64(),
            region.frames()
        );
        self.heap = Some(region);
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn heap_region(&self) -> Option<&HeapRegion> {
        self.heap.as_ref()
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn current_pcb(&self) -> Option<&Pcb> {
        self.current.and_then(|pid| self.table.find(pid))
    }

    pub fn find(&self, pid: Pid) -> Option<&Pcb> {
        self.table.find(pid)
    }

    pub fn ready_pids(&self) -> Vec<Pid> {
        self.ready.iter().collect()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn zones(&self) -> &BuddyAllocator {
        &self.zones
    }

    pub fn phys_mut(&mut self) -> &mut dyn PhysMemory {
        &mut *self.phys
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let total = self.zones.total_pages() * PAGE_SIZE;
        let free = self.zones.free_pages() * PAGE_SIZE;
        MemoryStats { total, used: total - free, free }
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.table
            .iter()
            .map(|p| ProcessInfo {
                pid: p.pid,
                parent: p.parent,
                name: p.name.clone(),
                state: p.state(),
                classification: p.classification,
                priority: p.priority,
                uid: p.uid,
                cpu_time: p.cpu_time,
            })
            .collect()
    }

    /// Log the process listing and the counters.
    pub fn log_stats(&self) {
        let mem = self.memory_stats();
        crate::log_info!(
            "stats: tick {}, {} live processes ({} ready, {} blocked, {} zombie), {} switches, {} refusals, {} KiB free",
            self.ticks,
            self.table.live_count(),
            self.table.count_in(ProcessState::Ready),
            self.table.count_in(ProcessState::Blocked),
            self.table.count_in(ProcessState::Zombie),
            self.stats.context_switches,
            self.stats.gate_refusals,
            mem.free / 1024
        );
        for p in self.processes() {
            crate::log_info!(
                "  {:>4} {:<31} {:<8} {:<12} prio {:>3} cpu {}",
                p.pid,
                p.name,
                p.state.name(),
                p.classification.name(),
                p.priority,
                p.cpu_time
            );
        }
    }

    pub(crate) fn record(&mut self, event: AuditEvent, pid: Pid, detail: String) {
        self.audit.push(self.ticks, event, pid, detail);
    }
}

#[cfg(test)]
pub(crate) fn hosted_kernel() -> (KernelState, crate::scheduler::HostedCpu) {
    use crate::memory::SimulatedMemory;
    use crate::security::SoftwareSecurity;

    let state = KernelState::boot(
        KernelConfig::small(),
        Box::new(SimulatedMemory::new()),
        Box::new(SoftwareSecurity::new(0x1234_5678)),
        None,
    );
    let mut cpu = crate::scheduler::HostedCpu::new();
    cpu.cr3 = state.idle_context.cr3;
    (state, cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::translate_in;

    #[test]
    fn boot_maps_kernel_heap_into_template() {
        let (mut state, _) = hosted_kernel();
        let heap_size = state.heap_region().unwrap().size;
        assert_eq!(heap_size, KernelConfig::small().kernel_heap_size);
        let root = state.builder.kernel_root();
        let last = VirtAddr::new(KERNEL_HEAP_START + heap_size - PAGE_SIZE);
        assert!(translate_in(root, last, &mut *state.phys, &*state.hw).is_some());
        let past = VirtAddr::new(KERNEL_HEAP_START + heap_size);
        assert!(translate_in(root, past, &mut *state.phys, &*state.hw).is_none());
    }

    #[test]
    fn new_address_spaces_see_the_kernel_heap() {
        let (mut state, _) = hosted_kernel();
        let space = state.builder.build(&mut state.zones, &mut *state.phys).unwrap();
        let hit = space.translate(VirtAddr::new(KERNEL_HEAP_START), &mut *state.phys, &*state.hw);
        assert!(hit.is_some());
        space.release(&mut state.zones);
    }

    #[test]
    fn fresh_kernel_is_idle_with_empty_table() {
        let (state, _) = hosted_kernel();
        assert!(state.current().is_none());
        assert!(state.processes().is_empty());
        let mem = state.memory_stats();
        assert_eq!(mem.total, mem.used + mem.free);
        assert!(mem.used > 0);
    }
}
