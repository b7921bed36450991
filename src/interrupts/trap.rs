//! Trap frames and the interrupt stubs that build them.
//!
//! Both entry stubs push every general purpose register on top of the
//! frame the CPU pushed, hand the whole block to Rust as a `TrapFrame`, and
//! pop it back before `iretq`. The scheduler switches processes by
//! rewriting that block, so the switch happens when the stub returns.

use core::arch::{asm, naked_asm};

use super::{InterruptIndex, PICS};
use crate::config::KERNEL_DATA_SELECTOR;
use crate::error::KernelError;
use crate::scheduler::{Cpu, CpuContext, SYSCALL_INSN_LEN};
use crate::syscalls::{dispatch, SyscallArgs};

/// Stack image built by the entry stubs, lowest address first.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // pushed by the CPU
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

macro_rules! trap_stub {
    ($name:ident, $handler:ident) => {
        // 15 pushes on top of the 5-word hardware frame keep RSP 16-byte aligned
        // at the call.
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            naked_asm!(
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "mov rdi, rsp",
                "call {handler}",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop r11",
                "pop r10",
                "pop r9",
                "pop r8",
                "pop rbp",
                "pop rdi",
                "pop rsi",
                "pop rdx",
                "pop rcx",
                "pop rbx",
                "pop rax",
                "iretq",
                handler = sym $handler,
            )
        }
    };
}

trap_stub!(timer_entry, timer_trap);
trap_stub!(syscall_entry, syscall_trap);

extern "C" fn timer_trap(frame: &mut TrapFrame) {
    let mut cpu = TrapFrameCpu::new(frame);
    crate::KERNEL.timer_tick(&mut cpu);
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
}

/// rax = number, rdi/rsi/rdx/r10 = arguments, result in rax.
extern "C" fn syscall_trap(frame: &mut TrapFrame) {
    let args = SyscallArgs::new(frame.rax, frame.rdi, frame.rsi, frame.rdx, frame.r10);
    let mut cpu = TrapFrameCpu::new(frame);
    if crate::KERNEL.with(|state| dispatch(state, &mut cpu, args)).is_none() {
        cpu.set_return_value(KernelError::Unsupported.errno() as u64);
    }
}

/// The interrupted processor: its registers live in the trap frame, CR3
/// and the interrupt flag are the real ones.
pub struct TrapFrameCpu<'a> {
    frame: &'a mut TrapFrame,
}

impl<'a> TrapFrameCpu<'a> {
    pub fn new(frame: &'a mut TrapFrame) -> Self {
        TrapFrameCpu { frame }
    }
}

fn read_cr3() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

impl Cpu for TrapFrameCpu<'_> {
    fn save_context(&mut self, into: &mut CpuContext) {
        let f = &*self.frame;
        *into = CpuContext {
            rax: f.rax,
            rbx: f.rbx,
            rcx: f.rcx,
            rdx: f.rdx,
            rsi: f.rsi,
            rdi: f.rdi,
            rbp: f.rbp,
            rsp: f.rsp,
            r8: f.r8,
            r9: f.r9,
            r10: f.r10,
            r11: f.r11,
            r12: f.r12,
            r13: f.r13,
            r14: f.r14,
            r15: f.r15,
            rip: f.rip,
            rflags: f.rflags,
            cs: f.cs,
            ss: f.ss,
            ds: KERNEL_DATA_SELECTOR,
            es: KERNEL_DATA_SELECTOR,
            fs: KERNEL_DATA_SELECTOR,
            gs: KERNEL_DATA_SELECTOR,
            cr3: read_cr3(),
        };
    }

    // Data segments are flat and shared, only the frame is rewritten.
    fn restore_context(&mut self, from: &CpuContext) {
        *self.frame = TrapFrame {
            r15: from.r15,
            r14: from.r14,
            r13: from.r13,
            r12: from.r12,
            r11: from.r11,
            r10: from.r10,
            r9: from.r9,
            r8: from.r8,
            rbp: from.rbp,
            rdi: from.rdi,
            rsi: from.rsi,
            rdx: from.rdx,
            rcx: from.rcx,
            rbx: from.rbx,
            rax: from.rax,
            rip: from.rip,
            cs: from.cs,
            rflags: from.rflags,
            rsp: from.rsp,
            ss: from.ss,
        };
    }

    fn switch_address_space(&mut self, root: u64) {
        if read_cr3() != root {
            unsafe { asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags)) };
        }
    }

    fn interrupts_enabled(&self) -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }

    fn disable_interrupts(&mut self) {
        x86_64::instructions::interrupts::disable();
    }

    fn enable_interrupts(&mut self) {
        x86_64::instructions::interrupts::enable();
    }

    fn set_return_value(&mut self, value: u64) {
        self.frame.rax = value;
    }

    fn rewind_syscall(&mut self) {
        self.frame.rip -= SYSCALL_INSN_LEN;
    }
}
