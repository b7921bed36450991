pub mod memory;

use alloc::string::String;

use crate::config::{DEFAULT_ENTRY, PROCESS_NAME_MAX};
use crate::error::{KResult, KernelError};
use crate::kernel::KernelState;
use crate::scheduler::{Cpu, Pid, ProcessSpec, WaitStatus};
use crate::security::{self, Classification};

/// Syscall numbers (passed in RAX).
pub const SYS_EXIT: u64 = 0;
pub const SYS_FORK: u64 = 1;
pub const SYS_WAITPID: u64 = 6;
pub const SYS_GETPID: u64 = 15;
pub const SYS_GETUID: u64 = 18;
pub const SYS_KILL: u64 = 27;
pub const SYS_PAUSE: u64 = 29;
pub const SYS_BRK: u64 = 34;
pub const SYS_MMAP: u64 = 59;
pub const SYS_MUNMAP: u64 = 60;
pub const SYS_GETPRIORITY: u64 = 65;
pub const SYS_SETPRIORITY: u64 = 66;
pub const SYS_YIELD: u64 = 100;
pub const SYS_CREATE_PROCESS: u64 = 101;

/// Bit of the create flags requesting a privileged process.
pub const CREATE_PRIVILEGED: u64 = 1 << 8;

/// Registers of one call: rax=number, rdi/rsi/rdx/r10 = arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    pub number: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
}

impl SyscallArgs {
    pub fn new(number: u64, arg0: u64, arg1: u64, arg2: u64, arg3: u64) -> Self {
        SyscallArgs { number, arg0, arg1, arg2, arg3 }
    }
}

/// How a call leaves the caller.
enum Completion {
    Return(i64),
    /// Result goes to the caller, then the CPU is offered to others.
    ReturnAndYield(i64),
    /// Result goes to the caller, which then sleeps until woken.
    Block(i64),
    /// The caller sleeps and re-issues the same call when woken.
    BlockAndRestart,
    /// The caller is gone.
    Exited,
}

/// Central syscall dispatcher, called from the `int 0x80` handler with the
/// caller's trap frame behind `cpu`. Errors come back as negative values.
///
/// Any result is written before the caller can be switched out, so it always
/// lands in the caller's own saved registers.
pub fn dispatch(state: &mut KernelState, cpu: &mut dyn Cpu, args: SyscallArgs) {
    let completion = match state.current() {
        Some(caller) => handle(state, cpu, caller, &args),
        None => Completion::Return(KernelError::NoCurrentProcess.errno()),
    };
    match completion {
        Completion::Return(value) => cpu.set_return_value(value as u64),
        Completion::ReturnAndYield(value) => {
            cpu.set_return_value(value as u64);
            state.schedule(cpu);
        }
        Completion::Block(value) => {
            cpu.set_return_value(value as u64);
            block_caller(state, cpu);
        }
        Completion::BlockAndRestart => {
            cpu.rewind_syscall();
            block_caller(state, cpu);
        }
        Completion::Exited => {}
    }
}

fn block_caller(state: &mut KernelState, cpu: &mut dyn Cpu) {
    if let Err(e) = state.block_current(cpu) {
        crate::log_error!("syscall: cannot block caller: {}", e);
    }
}

fn handle(state: &mut KernelState, cpu: &mut dyn Cpu, caller: Pid, args: &SyscallArgs) -> Completion {
    let result: KResult<i64> = match args.number {
        SYS_EXIT => {
            return match state.exit_current(cpu, args.arg0 as i64) {
                Ok(()) => Completion::Exited,
                Err(e) => Completion::Return(e.errno()),
            };
        }
        SYS_YIELD => return Completion::ReturnAndYield(0),
        SYS_PAUSE => return Completion::Block(0),
        SYS_WAITPID => return sys_waitpid(state, args),
        SYS_FORK => state.fork(cpu).map(|pid| pid.0 as i64),
        SYS_GETPID => Ok(caller.0 as i64),
        SYS_GETUID => state.current_pcb().map(|p| p.uid as i64).ok_or(KernelError::NoCurrentProcess),
        SYS_KILL => state.kill(Pid(args.arg0), args.arg1).map(|()| 0),
        SYS_BRK => state.brk(args.arg0 as i64).map(|b| b as i64),
        SYS_MMAP => state.mmap(args.arg0, args.arg1, args.arg2).map(|a| a as i64),
        SYS_MUNMAP => state.munmap(args.arg0, args.arg1).map(|()| 0),
        SYS_GETPRIORITY => state.get_priority(target_or_self(args.arg0, caller)).map(|p| p as i64),
        SYS_SETPRIORITY => state.set_priority(target_or_self(args.arg0, caller), args.arg1).map(|()| 0),
        SYS_CREATE_PROCESS => sys_create_process(state, args),
        _ => {
            crate::log_warn!("syscall: unknown number {} from process {}", args.number, caller);
            Err(KernelError::Unsupported)
        }
    };
    Completion::Return(result.unwrap_or_else(|e| e.errno()))
}

/// waitpid(pid, status_ptr): the status pointer is checked before any child
/// is reaped, so a bad pointer never loses an exit status.
fn sys_waitpid(state: &mut KernelState, args: &SyscallArgs) -> Completion {
    let status_size = core::mem::size_of::<i64>();
    if args.arg1 != 0 {
        if let Err(e) = state.check_user_writable(args.arg1, status_size) {
            return Completion::Return(e.errno());
        }
    }
    match state.wait(args.arg0) {
        Ok(WaitStatus::Pending) => Completion::BlockAndRestart,
        Ok(WaitStatus::Reaped { pid, status }) => {
            if args.arg1 != 0 {
                if let Err(e) = state.copy_to_current(args.arg1, &status.to_le_bytes()) {
                    crate::log_error!("syscall: waitpid status lost for {}: {}", pid, e);
                }
            }
            Completion::Return(pid.0 as i64)
        }
        Err(e) => Completion::Return(e.errno()),
    }
}

/// Pid argument where 0 names the caller.
fn target_or_self(raw: u64, caller: Pid) -> Pid {
    if raw == 0 {
        caller
    } else {
        Pid(raw)
    }
}

/// create_process(name_ptr, name_len, flags, entry): low byte of `flags` is
/// the classification, `CREATE_PRIVILEGED` asks for privilege.
fn sys_create_process(state: &mut KernelState, args: &SyscallArgs) -> KResult<i64> {
    let len = (args.arg1 as usize).min(PROCESS_NAME_MAX);
    let raw = state.copy_from_current(args.arg0, len)?;
    let name = String::from_utf8(raw).map_err(|_| KernelError::InvalidArgument)?;
    let level = Classification::from_raw(args.arg2 & 0xFF).ok_or(KernelError::InvalidArgument)?;
    let privileged = args.arg2 & CREATE_PRIVILEGED != 0;

    if let Err(e) = security::check_create(state.current_pcb(), level, privileged) {
        let caller = state.current().unwrap_or(Pid(0));
        state.deny(caller, "create");
        return Err(e);
    }
    let entry = if args.arg3 == 0 { DEFAULT_ENTRY } else { args.arg3 };
    state
        .spawn(ProcessSpec::new(&name, level, privileged).entry(entry))
        .map(|pid| pid.0 as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::kernel::hosted_kernel;
    use crate::klog::AuditEvent;
    use crate::scheduler::{HostedCpu, ProcessState, ScheduleOutcome, ANY_CHILD, SYSCALL_INSN_LEN};
    use crate::syscalls::memory::PROT_WRITE;

    fn call(state: &mut KernelState, cpu: &mut HostedCpu, number: u64, a0: u64, a1: u64, a2: u64, a3: u64) -> i64 {
        dispatch(state, cpu, SyscallArgs::new(number, a0, a1, a2, a3));
        cpu.registers.rax as i64
    }

    fn boot_with(level: Classification, privileged: bool) -> (KernelState, HostedCpu, Pid) {
        let (mut state, mut cpu) = hosted_kernel();
        let pid = state.spawn(ProcessSpec::new("caller", level, privileged)).unwrap();
        state.schedule(&mut cpu);
        (state, cpu, pid)
    }

    /// Place `name` in the caller's memory and return its address.
    fn stage_name(state: &mut KernelState, name: &str) -> u64 {
        let buf = state.mmap(0, PAGE_SIZE, PROT_WRITE).unwrap();
        state.copy_to_current(buf, name.as_bytes()).unwrap();
        buf
    }

    #[test]
    fn identity_calls_report_caller() {
        let (mut state, mut cpu, pid) = boot_with(Classification::Secret, false);
        assert_eq!(call(&mut state, &mut cpu, SYS_GETPID, 0, 0, 0, 0), pid.0 as i64);
        assert_eq!(call(&mut state, &mut cpu, SYS_GETUID, 0, 0, 0, 0), 1000);
        assert_eq!(call(&mut state, &mut cpu, SYS_GETPRIORITY, 0, 0, 0, 0), 10);
        assert_eq!(call(&mut state, &mut cpu, SYS_SETPRIORITY, 0, 3, 0, 0), 0);
        assert_eq!(state.get_priority(pid), Ok(3));
        assert_eq!(call(&mut state, &mut cpu, 9999, 0, 0, 0, 0), KernelError::Unsupported.errno());
    }

    #[test]
    fn calls_without_a_process_fail() {
        let (mut state, mut cpu) = hosted_kernel();
        assert_eq!(call(&mut state, &mut cpu, SYS_GETPID, 0, 0, 0, 0), KernelError::NoCurrentProcess.errno());
    }

    #[test]
    fn create_reads_name_from_caller_memory() {
        let (mut state, mut cpu, caller) = boot_with(Classification::Secret, false);
        let name = stage_name(&mut state, "worker");
        let flags = Classification::Confidential as u64;
        let child = call(&mut state, &mut cpu, SYS_CREATE_PROCESS, name, 6, flags, 0);
        assert!(child > 0);
        let pcb = state.find(Pid(child as u64)).unwrap();
        assert_eq!(pcb.name, "worker");
        assert_eq!(pcb.classification, Classification::Confidential);
        assert_eq!(pcb.parent, Some(caller));
        assert_eq!(pcb.state(), ProcessState::Ready);
    }

    #[test]
    fn create_above_own_level_is_denied() {
        let (mut state, mut cpu, _) = boot_with(Classification::Confidential, false);
        let name = stage_name(&mut state, "spy");
        let up = call(&mut state, &mut cpu, SYS_CREATE_PROCESS, name, 3, Classification::TopSecret as u64, 0);
        assert_eq!(up, KernelError::AccessDenied.errno());
        let privileged = call(&mut state, &mut cpu, SYS_CREATE_PROCESS, name, 3, CREATE_PRIVILEGED, 0);
        assert_eq!(privileged, KernelError::AccessDenied.errno());
        assert_eq!(state.audit_log().count(AuditEvent::SyscallDenied), 2);
        assert_eq!(call(&mut state, &mut cpu, SYS_CREATE_PROCESS, name, 3, 9, 0), KernelError::InvalidArgument.errno());
    }

    #[test]
    fn yield_returns_zero_to_caller_before_switching() {
        let (mut state, mut cpu, a) = boot_with(Classification::Unclassified, false);
        let b = state.spawn(ProcessSpec::new("b", Classification::Unclassified, false)).unwrap();
        cpu.registers.rax = SYS_YIELD;
        call(&mut state, &mut cpu, SYS_YIELD, 0, 0, 0, 0);
        assert_eq!(state.current(), Some(b));
        assert_eq!(state.find(a).unwrap().context.rax, 0);
    }

    #[test]
    fn fork_returns_child_pid_to_parent() {
        let (mut state, mut cpu, parent) = boot_with(Classification::Unclassified, false);
        let child = call(&mut state, &mut cpu, SYS_FORK, 0, 0, 0, 0);
        assert!(child as u64 > parent.0);
        assert_eq!(state.find(Pid(child as u64)).unwrap().context.rax, 0);
    }

    fn kernel_word(state: &mut KernelState, addr: u64) -> u64 {
        use crate::memory::paging::translate_in;
        use x86_64::VirtAddr;
        let root = state.builder.kernel_root();
        let pa = translate_in(root, VirtAddr::new(addr), &mut *state.phys, &*state.hw).unwrap();
        state.phys.read_u64(pa)
    }

    #[test]
    fn user_pointers_into_kernel_memory_are_rejected() {
        use crate::config::KERNEL_HEAP_START;

        let (mut state, mut cpu, _) = boot_with(Classification::Secret, false);
        let child = state.create_process("child", Classification::Secret, false).unwrap();
        let before = kernel_word(&mut state, KERNEL_HEAP_START);

        let einval = KernelError::InvalidArgument.errno();
        assert_eq!(call(&mut state, &mut cpu, SYS_WAITPID, child.0, KERNEL_HEAP_START, 0, 0), einval);
        assert_eq!(call(&mut state, &mut cpu, SYS_CREATE_PROCESS, KERNEL_HEAP_START, 8, 0, 0), einval);
        assert_eq!(state.copy_to_current(KERNEL_HEAP_START + 8, b"overrun!"), Err(KernelError::InvalidArgument));
        assert_eq!(state.copy_from_current(KERNEL_HEAP_START, 8), Err(KernelError::InvalidArgument));
        assert_eq!(state.copy_from_current(u64::MAX - 2, 8), Err(KernelError::InvalidArgument));

        assert_eq!(kernel_word(&mut state, KERNEL_HEAP_START), before);
        assert_eq!(state.find(child).unwrap().state(), ProcessState::Ready);
    }

    #[test]
    fn read_only_pages_refuse_kernel_writes() {
        use crate::syscalls::memory::PROT_READ;

        let (mut state, mut cpu, _) = boot_with(Classification::Unclassified, false);
        let child = state.create_process("child", Classification::Unclassified, false).unwrap();
        let ro = state.mmap(0, PAGE_SIZE, PROT_READ).unwrap();
        assert_eq!(state.copy_from_current(ro, 4).unwrap(), [0, 0, 0, 0]);
        assert_eq!(call(&mut state, &mut cpu, SYS_WAITPID, child.0, ro, 0, 0), KernelError::InvalidArgument.errno());
        assert!(state.find(child).is_some());
    }

    #[test]
    fn waitpid_blocks_then_collects_status() {
        let (mut state, mut cpu, parent) = boot_with(Classification::Secret, false);
        let child = state.create_process("child", Classification::Unclassified, false).unwrap();
        let status_buf = stage_name(&mut state, "");
        cpu.registers.rip = 0x1002;

        call(&mut state, &mut cpu, SYS_WAITPID, child.0, status_buf, 0, 0);
        assert_eq!(state.find(parent).unwrap().state(), ProcessState::Blocked);
        assert_eq!(state.find(parent).unwrap().context.rip, 0x1002 - SYSCALL_INSN_LEN);
        assert_eq!(state.current(), Some(child));

        call(&mut state, &mut cpu, SYS_EXIT, 42, 0, 0, 0);
        assert_eq!(state.current(), Some(parent));
        assert_eq!(cpu.registers.rip, 0x1000, "parent resumes on the trap instruction");

        assert_eq!(call(&mut state, &mut cpu, SYS_WAITPID, child.0, status_buf, 0, 0), child.0 as i64);
        assert_eq!(state.copy_from_current(status_buf, 8).unwrap(), 42i64.to_le_bytes());
        assert_eq!(call(&mut state, &mut cpu, SYS_WAITPID, child.0, 0, 0, 0), KernelError::NoChild.errno());
    }

    #[test]
    fn paused_init_lets_lower_levels_run_until_a_child_exits() {
        let (mut state, mut cpu, init) = boot_with(Classification::Pentagon, true);
        assert_eq!(call(&mut state, &mut cpu, SYS_WAITPID, ANY_CHILD, 0, 0, 0), KernelError::NoChild.errno());

        let worker = state.spawn(ProcessSpec::new("worker", Classification::Unclassified, false)).unwrap();
        assert_eq!(state.yield_now(&mut cpu), ScheduleOutcome::Continued(init));

        cpu.registers.rip = 0x2002;
        call(&mut state, &mut cpu, SYS_PAUSE, 0, 0, 0, 0);
        assert_eq!(state.find(init).unwrap().state(), ProcessState::Blocked);
        assert_eq!(state.find(init).unwrap().context.rip, 0x2002, "pause does not restart");
        assert_eq!(state.current(), Some(worker));

        call(&mut state, &mut cpu, SYS_EXIT, 7, 0, 0, 0);
        assert_eq!(state.current(), Some(init));
        assert_eq!(cpu.registers.rax, 0);
        assert_eq!(call(&mut state, &mut cpu, SYS_WAITPID, ANY_CHILD, 0, 0, 0), worker.0 as i64);
    }

    #[test]
    fn kill_from_stranger_is_refused() {
        let (mut state, mut cpu, _) = boot_with(Classification::Unclassified, false);
        let other = state.create_process("other", Classification::Unclassified, false).unwrap();
        state.table.find_mut(other).unwrap().uid = 77;
        assert_eq!(call(&mut state, &mut cpu, SYS_KILL, other.0, 9, 0, 0), KernelError::PermissionDenied.errno());
        assert_eq!(call(&mut state, &mut cpu, SYS_KILL, 12345, 9, 0, 0), KernelError::NotFound.errno());
    }

    #[test]
    fn memory_calls_round_trip_through_dispatch() {
        let (mut state, mut cpu, _) = boot_with(Classification::Unclassified, false);
        let brk = call(&mut state, &mut cpu, SYS_BRK, 0, 0, 0, 0);
        assert_eq!(call(&mut state, &mut cpu, SYS_BRK, 8192, 0, 0, 0), brk + 8192);
        let addr = call(&mut state, &mut cpu, SYS_MMAP, 0, PAGE_SIZE, PROT_WRITE, 0);
        assert!(addr > 0);
        assert_eq!(call(&mut state, &mut cpu, SYS_MUNMAP, addr as u64, PAGE_SIZE, 0, 0), 0);
    }
}
