#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

extern crate alloc;

pub mod config;
pub mod error;
#[macro_use]
pub mod klog;
pub mod kernel;
pub mod memory;
pub mod scheduler;
pub mod security;
pub mod sync;
pub mod syscalls;

#[cfg(target_os = "none")]
pub mod interrupts;
#[cfg(target_os = "none")]
pub mod serial;

pub use config::KernelConfig;
pub use error::{KResult, KernelError};
pub use kernel::KernelState;
pub use sync::KernelLock;

/// The kernel instance shared with the interrupt handlers.
pub static KERNEL: KernelLock = KernelLock::new();

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: memory::LockedHeap<{ config::EARLY_HEAP_SIZE }> = memory::LockedHeap::new();

#[cfg(target_os = "none")]
mod boot {
    use alloc::boxed::Box;
    use core::arch::asm;
    use core::panic::PanicInfo;

    use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};
    use x86_64::registers::control::Cr3;

    use crate::config::KernelConfig;
    use crate::kernel::KernelState;
    use crate::memory::DirectMap;
    use crate::scheduler::ANY_CHILD;
    use crate::security::{HardwareSecurity, X86Security};
    use crate::syscalls::{SYS_PAUSE, SYS_WAITPID};
    use crate::{interrupts, serial, ALLOCATOR, KERNEL};

    /// Top of usable RAM from the multiboot memory map.
    fn detect_memory(multiboot_info_addr: usize) -> Option<u64> {
        let info = unsafe { BootInformation::load(multiboot_info_addr as *const BootInformationHeader) }.ok()?;
        let map = info.memory_map_tag()?;
        map.memory_areas()
            .iter()
            .filter(|area| MemoryAreaType::from(area.typ()) == MemoryAreaType::Available)
            .map(|area| area.end_address())
            .max()
    }

    /// Entered from the boot stub in long mode, with the kernel mapped in
    /// the upper half and all of physical memory mapped at `PHYS_MAP_OFFSET`.
    #[no_mangle]
    pub extern "C" fn kernel_main(multiboot_info_addr: usize) -> ! {
        serial::init();
        interrupts::init();
        crate::log_info!("SentinalOS kernel starting");

        let config = match detect_memory(multiboot_info_addr) {
            Some(total) => KernelConfig::with_memory(total),
            None => {
                crate::log_warn!("boot: no multiboot memory map, assuming defaults");
                KernelConfig::default()
            }
        };
        let hw = X86Security::detect();
        crate::log_info!("boot: hardened mode {}", hw.is_hardened_mode());
        let phys = unsafe { DirectMap::new(config.phys_offset) };
        let (boot_root, _) = Cr3::read();

        let state = KernelState::boot(config, Box::new(phys), Box::new(hw), Some(boot_root));
        if let Some(region) = state.heap_region() {
            ALLOCATOR.promote(region.base, region.size);
        }
        KERNEL.install(state);
        KERNEL.with(|state| state.spawn_init(init_main as usize as u64));

        // From here on the boot thread is the idle context.
        x86_64::instructions::interrupts::enable();
        loop {
            x86_64::instructions::hlt();
        }
    }

    fn syscall2(number: u64, arg0: u64, arg1: u64) -> i64 {
        let ret: u64;
        unsafe {
            asm!("int 0x80", inlateout("rax") number => ret, in("rdi") arg0, in("rsi") arg1);
        }
        ret as i64
    }

    /// First process: collects finished children forever. With none to
    /// wait for it sleeps, so lower levels are not held off the CPU.
    extern "C" fn init_main() -> ! {
        loop {
            let reaped = syscall2(SYS_WAITPID, ANY_CHILD, 0);
            if reaped < 0 {
                syscall2(SYS_PAUSE, 0, 0);
            }
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        x86_64::instructions::interrupts::disable();
        crate::log_error!("KERNEL PANIC: {}", info);
        loop {
            x86_64::instructions::hlt();
        }
    }
}
