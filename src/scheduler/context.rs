//! Saved register state and the context-switch engine.
//!
//! The engine never touches registers itself: it drives a `Cpu`, which on
//! bare metal is the trap frame of the interrupt being serviced (the switch
//! takes effect when that frame is popped by `iretq`) and under the test
//! harness is a plain in-memory register file.

use crate::config::{INITIAL_RFLAGS, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

/// Full register file of a suspended process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub cr3: u64,
}

impl CpuContext {
    /// Context for a process that has never run.
    pub fn new(entry: u64, stack_top: u64, cr3: u64) -> Self {
        CpuContext {
            rip: entry,
            rsp: stack_top & !0xF,
            rflags: INITIAL_RFLAGS,
            cs: KERNEL_CODE_SELECTOR,
            ss: KERNEL_DATA_SELECTOR,
            ds: KERNEL_DATA_SELECTOR,
            es: KERNEL_DATA_SELECTOR,
            fs: KERNEL_DATA_SELECTOR,
            gs: KERNEL_DATA_SELECTOR,
            cr3,
            ..CpuContext::default()
        }
    }
}

/// The processor as seen by the scheduler.
pub trait Cpu {
    /// Copy the live register file (and current CR3) into `into`.
    fn save_context(&mut self, into: &mut CpuContext);

    /// Make `from` the register file that resumes.
    fn restore_context(&mut self, from: &CpuContext);

    /// Load a tagged level-4 table address into CR3.
    fn switch_address_space(&mut self, root: u64);

    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&mut self);
    fn enable_interrupts(&mut self);

    /// Write the result register of the system call being serviced.
    fn set_return_value(&mut self, value: u64);

    /// Move the saved instruction pointer back onto the system call
    /// instruction so the call is issued again when the process resumes.
    fn rewind_syscall(&mut self);
}

/// Run `f` with interrupts masked, restoring the previous state after.
pub fn without_interrupts<R>(cpu: &mut dyn Cpu, f: impl FnOnce(&mut dyn Cpu) -> R) -> R {
    let was_enabled = cpu.interrupts_enabled();
    if was_enabled {
        cpu.disable_interrupts();
    }
    let result = f(&mut *cpu);
    if was_enabled {
        cpu.enable_interrupts();
    }
    result
}

/// Save the running context into `outgoing` and resume `incoming`.
pub fn switch(cpu: &mut dyn Cpu, outgoing: &mut CpuContext, incoming: &CpuContext) {
    without_interrupts(cpu, |cpu| {
        cpu.save_context(outgoing);
        cpu.switch_address_space(incoming.cr3);
        cpu.restore_context(incoming);
    });
}

/// Length of `int 0x80`.
pub const SYSCALL_INSN_LEN: u64 = 2;

/// In-memory processor used when the kernel runs hosted.
#[cfg(not(target_os = "none"))]
#[derive(Debug, Default)]
pub struct HostedCpu {
    pub registers: CpuContext,
    pub cr3: u64,
    interrupts: bool,
    /// Interrupt flag observed at each address-space switch.
    pub switch_log: alloc::vec::Vec<(u64, bool)>,
}

#[cfg(not(target_os = "none"))]
impl HostedCpu {
    pub fn new() -> Self {
        HostedCpu { interrupts: true, ..HostedCpu::default() }
    }
}

#[cfg(not(target_os = "none"))]
impl Cpu for HostedCpu {
    fn save_context(&mut self, into: &mut CpuContext) {
        *into = self.registers;
        into.cr3 = self.cr3;
    }

    fn restore_context(&mut self, from: &CpuContext) {
        self.registers = *from;
    }

    fn switch_address_space(&mut self, root: u64) {
        self.switch_log.push((root, self.interrupts));
        self.cr3 = root;
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    fn disable_interrupts(&mut self) {
        self.interrupts = false;
    }

    fn enable_interrupts(&mut self) {
        self.interrupts = true;
    }

    fn set_return_value(&mut self, value: u64) {
        self.registers.rax = value;
    }

    fn rewind_syscall(&mut self) {
        self.registers.rip -= SYSCALL_INSN_LEN;
    }
}
