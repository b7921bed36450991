//! Kernel configuration.
//!
//! Compile-time constants describe the fixed memory layout and limits.
//! `KernelConfig` carries the values that differ per machine (amount of RAM,
//! direct-map offset) and lets the host tests shrink the layout.

/// Page size (4 KiB).
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Entries per page-table level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// First level-4 index of the kernel (higher) half.
pub const KERNEL_HALF_START: usize = 256;

/// Kernel image placement, fixed by the bootstrap.
pub const KERNEL_VIRTUAL_BASE: u64 = 0xFFFF_FFFF_8000_0000;
pub const KERNEL_PHYSICAL_BASE: u64 = 0x10_0000;

/// Reserved virtual region for the kernel heap (256 MiB).
pub const KERNEL_HEAP_START: u64 = 0xFFFF_FFFF_9000_0000;
pub const KERNEL_HEAP_RESERVED: u64 = 0x1000_0000;

/// Default backed part of the kernel heap region (16 MiB).
pub const KERNEL_HEAP_SIZE: u64 = 16 * 1024 * 1024;

/// Static arena used before the page allocator is up.
pub const EARLY_HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Per-process stack (16 KiB).
pub const KERNEL_STACK_SIZE: u64 = 0x4000;

/// Largest buddy order: blocks of up to 2^11 pages.
pub const MAX_ORDER: usize = 11;

/// Zone boundaries.
pub const DMA_ZONE_END: u64 = 16 * 1024 * 1024;
pub const NORMAL_ZONE_END: u64 = 896 * 1024 * 1024;

/// Low physical memory kept out of the allocator (real-mode area, kernel image).
pub const RESERVED_LOW_MEMORY: u64 = 8 * 1024 * 1024;

/// Offset of the kernel's direct map of physical memory.
pub const PHYS_MAP_OFFSET: u64 = 0xFFFF_8880_0000_0000;

/// Process table capacity.
pub const MAX_PROCESSES: usize = 256;
pub const PROCESS_NAME_MAX: usize = 31;

/// Scheduling.
pub const SCHEDULE_INTERVAL_TICKS: u64 = 10;
pub const DEFAULT_PRIORITY: u64 = 10;
pub const DEFAULT_TIME_SLICE: u64 = 10;

/// User address space layout.
pub const USER_HEAP_BASE: u64 = 0x40_0000;
pub const MMAP_BASE: u64 = 0x1000_0000;
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Default entry point of processes created without one.
pub const DEFAULT_ENTRY: u64 = KERNEL_VIRTUAL_BASE;

/// Initial RFLAGS of a new process: IF set plus the reserved bit 1.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Kernel code/data selectors as laid out by the GDT.
pub const KERNEL_CODE_SELECTOR: u64 = 0x08;
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;

/// Audit ring capacity.
pub const AUDIT_LOG_CAPACITY: usize = 64;

/// Runtime layout of one machine.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Total physical memory in bytes.
    pub total_memory: u64,
    /// Physical memory below this is never handed to the buddy allocator.
    pub reserved_low: u64,
    pub dma_end: u64,
    pub normal_end: u64,
    /// Virtual offset of the direct physical map.
    pub phys_offset: u64,
    /// Bytes of the heap region backed at boot.
    pub kernel_heap_size: u64,
    pub max_processes: usize,
    pub schedule_interval: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            total_memory: 512 * 1024 * 1024,
            reserved_low: RESERVED_LOW_MEMORY,
            dma_end: DMA_ZONE_END,
            normal_end: NORMAL_ZONE_END,
            phys_offset: PHYS_MAP_OFFSET,
            kernel_heap_size: KERNEL_HEAP_SIZE,
            max_processes: MAX_PROCESSES,
            schedule_interval: SCHEDULE_INTERVAL_TICKS,
        }
    }
}

impl KernelConfig {
    /// Layout derived from the amount of RAM reported by the bootstrap.
    pub fn with_memory(total_memory: u64) -> Self {
        KernelConfig { total_memory, ..KernelConfig::default() }
    }

    /// A compact machine: 1 MiB DMA, 8 MiB normal, 16 MiB total.
    /// Small enough for the host tests to walk every free list.
    pub fn small() -> Self {
        KernelConfig {
            total_memory: 16 * 1024 * 1024,
            reserved_low: 256 * 1024,
            dma_end: 1024 * 1024,
            normal_end: 8 * 1024 * 1024,
            phys_offset: PHYS_MAP_OFFSET,
            kernel_heap_size: 64 * 1024,
            max_processes: 16,
            schedule_interval: SCHEDULE_INTERVAL_TICKS,
        }
    }

    pub fn total_pages(&self) -> u64 {
        self.total_memory >> PAGE_SHIFT
    }
}
