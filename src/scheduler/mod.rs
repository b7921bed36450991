pub mod context;
pub mod queue;
pub mod table;
pub mod task;

use alloc::format;
use alloc::vec::Vec;
use x86_64::VirtAddr;

pub use context::{switch, without_interrupts, Cpu, CpuContext, SYSCALL_INSN_LEN};
#[cfg(not(target_os = "none"))]
pub use context::HostedCpu;
pub use queue::ReadyQueue;
pub use table::ProcessTable;
pub use task::{Capabilities, Pcb, Pid, ProcessState, StackRegion, Uid};

use crate::config::{DEFAULT_ENTRY, DEFAULT_PRIORITY, DEFAULT_TIME_SLICE, KERNEL_STACK_SIZE, MMAP_BASE, PAGE_SIZE, USER_HEAP_BASE};
use crate::error::{KResult, KernelError};
use crate::kernel::KernelState;
use crate::klog::AuditEvent;
use crate::memory::ZoneKind;
use crate::security::{self, Classification};

/// `wait` target meaning "any child".
pub const ANY_CHILD: u64 = u64::MAX;

/// Parameters of a new process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSpec<'a> {
    pub name: &'a str,
    pub classification: Classification,
    pub privileged: bool,
    pub priority: u64,
    pub entry: u64,
}

impl<'a> ProcessSpec<'a> {
    pub fn new(name: &'a str, classification: Classification, privileged: bool) -> Self {
        ProcessSpec { name, classification, privileged, priority: DEFAULT_PRIORITY, entry: DEFAULT_ENTRY }
    }

    pub fn priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Nothing runnable; the boot thread idles.
    Idle,
    /// The running process keeps the CPU.
    Continued(Pid),
    Switched { from: Option<Pid>, to: Pid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Reaped { pid: Pid, status: i64 },
    /// Children exist but none has exited yet.
    Pending,
}

impl KernelState {
    // ════════════════════════════════════════════════════════════
    //  Creation and teardown
    // ════════════════════════════════════════════════════════════

    pub fn create_process(&mut self, name: &str, classification: Classification, privileged: bool) -> KResult<Pid> {
        self.spawn(ProcessSpec::new(name, classification, privileged))
    }

    /// Create a process in `Ready` and queue it. The caller (if any) becomes
    /// its parent.
    pub fn spawn(&mut self, spec: ProcessSpec) -> KResult<Pid> {
        let slot = self.table.free_slot().ok_or(KernelError::TableFull)?;
        let space = self.builder.build(&mut self.zones, &mut *self.phys)?;
        let stack = match self.alloc_stack() {
            Ok(stack) => stack,
            Err(e) => {
                space.release(&mut self.zones);
                return Err(e);
            }
        };

        let parent = self.current_pcb().map(|p| (p.pid, p.privileged, p.uid));
        let pid = self.table.allocate_pid();
        let mut pcb = Pcb::new(pid, spec.name, spec.classification, spec.privileged);
        if let Some((ppid, parent_privileged, parent_uid)) = parent {
            pcb.parent = Some(ppid);
            if !spec.privileged && !parent_privileged {
                pcb.uid = parent_uid;
            }
        }
        pcb.priority = spec.priority;
        pcb.created_at = self.ticks;
        pcb.brk = USER_HEAP_BASE;
        pcb.mmap_cursor = MMAP_BASE;
        pcb.canary = self.hw.random_u64();
        self.phys.write_u64(stack.block.start_address(), pcb.canary);
        pcb.context = CpuContext::new(spec.entry, stack.top().as_u64(), space.cr3(&*self.hw));
        pcb.stack = Some(stack);
        pcb.address_space = Some(space);

        let detail = format!("{} level {}", pcb.name, pcb.classification);
        crate::log_info!("Created process: {} (PID: {}, Security: {})", pcb.name, pid, pcb.classification);
        self.table.install(slot, pcb);
        self.ready.enqueue(pid, spec.priority);
        self.stats.processes_created += 1;
        self.record(AuditEvent::ProcessCreate, pid, detail);
        Ok(pid)
    }

    /// The first process: privileged, highest level, no parent.
    pub fn spawn_init(&mut self, entry: u64) -> Pid {
        match self.spawn(ProcessSpec::new("init", Classification::Pentagon, true).entry(entry)) {
            Ok(pid) => pid,
            Err(e) => panic!("cannot create init process: {}", e),
        }
    }

    fn alloc_stack(&mut self) -> KResult<StackRegion> {
        let order = (KERNEL_STACK_SIZE / PAGE_SIZE).trailing_zeros() as usize;
        let block = self.zones.alloc_fallback(ZoneKind::Normal, order)?;
        let base = VirtAddr::new(self.config.phys_offset + block.start_address().as_u64());
        Ok(StackRegion { block, base })
    }

    fn release_resources(&mut self, pid: Pid) {
        let Some(pcb) = self.table.find_mut(pid) else {
            return;
        };
        let stack = pcb.stack.take();
        let space = pcb.address_space.take();
        if let Some(stack) = stack {
            self.zones.free(stack.block);
        }
        if let Some(space) = space {
            space.release(&mut self.zones);
        }
    }

    /// Release everything and retire the slot.
    fn reap(&mut self, pid: Pid) {
        self.release_resources(pid);
        if let Some(pcb) = self.table.find_mut(pid) {
            pcb.set_state(ProcessState::Dead);
        }
        self.stats.processes_reaped += 1;
        self.record(AuditEvent::ProcessReap, pid, "reaped".into());
    }

    /// Terminate `pid` and free its resources. The caller must own the
    /// target or hold the kill capability. Destroying the running process
    /// hands the CPU to the scheduler first.
    pub fn destroy(&mut self, cpu: &mut dyn Cpu, pid: Pid) -> KResult<()> {
        let target = self.table.find(pid).ok_or(KernelError::NotFound)?;
        let verdict = security::check_signal(self.current_pcb(), target);
        let was_running = target.state() == ProcessState::Running;
        if let Err(e) = verdict {
            self.deny(pid, "destroy");
            return Err(e);
        }

        self.ready.remove(pid);
        if let Some(pcb) = self.table.find_mut(pid) {
            match pcb.state() {
                ProcessState::Zombie => {}
                ProcessState::Ready | ProcessState::Blocked if !pcb.has_run() => {}
                _ => pcb.set_state(ProcessState::Zombie),
            }
            pcb.exit_status.get_or_insert(-1);
        }
        crate::log_info!("Destroyed process PID {}", pid);
        self.record(AuditEvent::ProcessDestroy, pid, "destroyed".into());

        self.notify_parent(pid);
        if was_running {
            self.schedule(cpu);
        }
        self.reap(pid);
        Ok(())
    }

    /// Wake a parent blocked in `wait` so it re-issues the call.
    fn notify_parent(&mut self, child: Pid) {
        let Some(ppid) = self.table.find(child).and_then(|p| p.parent) else {
            return;
        };
        if self.table.find(ppid).is_some_and(|p| p.state() == ProcessState::Blocked) {
            let _ = self.wake(ppid);
        }
    }

    // ════════════════════════════════════════════════════════════
    //  Lifecycle calls made by the running process
    // ════════════════════════════════════════════════════════════

    pub fn exit_current(&mut self, cpu: &mut dyn Cpu, status: i64) -> KResult<()> {
        let pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let pcb = self.table.find_mut(pid).ok_or(KernelError::NoCurrentProcess)?;
        pcb.exit_status = Some(status);
        pcb.set_state(ProcessState::Zombie);
        crate::log_info!("Process {} exited with status {}", pid, status);
        self.record(AuditEvent::ProcessExit, pid, format!("status {}", status));
        self.notify_parent(pid);
        self.schedule(cpu);
        Ok(())
    }

    pub fn yield_now(&mut self, cpu: &mut dyn Cpu) -> ScheduleOutcome {
        self.schedule(cpu)
    }

    pub fn block_current(&mut self, cpu: &mut dyn Cpu) -> KResult<ScheduleOutcome> {
        let pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let pcb = self.table.find_mut(pid).ok_or(KernelError::NoCurrentProcess)?;
        pcb.set_state(ProcessState::Blocked);
        Ok(self.schedule(cpu))
    }

    pub fn wake(&mut self, pid: Pid) -> KResult<()> {
        let pcb = self.table.find_mut(pid).ok_or(KernelError::NotFound)?;
        if pcb.state() != ProcessState::Blocked {
            return Err(KernelError::InvalidArgument);
        }
        pcb.set_state(ProcessState::Ready);
        let priority = pcb.priority;
        self.ready.enqueue(pid, priority);
        Ok(())
    }

    /// Collect an exited child. `target` is a pid or `ANY_CHILD`.
    /// `Pending` leaves it to the caller to block and retry; the parent is
    /// woken whenever one of its children terminates.
    pub fn wait(&mut self, target: u64) -> KResult<WaitStatus> {
        let me = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let mut any = false;
        let mut exited = None;
        for p in self.table.iter() {
            if p.parent != Some(me) || (target != ANY_CHILD && p.pid.0 != target) {
                continue;
            }
            any = true;
            if p.state() == ProcessState::Zombie {
                exited = Some((p.pid, p.exit_status.unwrap_or(0)));
                break;
            }
        }
        match exited {
            Some((pid, status)) => {
                self.reap(pid);
                Ok(WaitStatus::Reaped { pid, status })
            }
            None if any => Ok(WaitStatus::Pending),
            None => Err(KernelError::NoChild),
        }
    }

    /// Request termination of `pid`. Signal 0 only checks that the target
    /// exists and may be signalled. Delivery happens at the next scheduling
    /// pass with exit status `128 + signal`.
    pub fn kill(&mut self, pid: Pid, signal: u64) -> KResult<()> {
        let target = self.table.find(pid).ok_or(KernelError::NotFound)?;
        let verdict = security::check_signal(self.current_pcb(), target);
        let zombie = target.state() == ProcessState::Zombie;
        if let Err(e) = verdict {
            self.deny(pid, "kill");
            return Err(e);
        }
        if signal == 0 || zombie {
            return Ok(());
        }
        if let Some(pcb) = self.table.find_mut(pid) {
            pcb.pending_kill = Some(signal);
        }
        self.record(AuditEvent::KillRequest, pid, format!("signal {}", signal));
        Ok(())
    }

    /// Duplicate the running process. The child gets a private copy of the
    /// user half and of the stack, and sees 0 as the call's result.
    pub fn fork(&mut self, cpu: &mut dyn Cpu) -> KResult<Pid> {
        let me = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let slot = self.table.free_slot().ok_or(KernelError::TableFull)?;
        let parent = self.table.find(me).ok_or(KernelError::NoCurrentProcess)?;

        let space = match parent.address_space.as_ref() {
            Some(space) => space.duplicate(&self.builder, &mut self.zones, &mut *self.phys, &*self.hw)?,
            None => self.builder.build(&mut self.zones, &mut *self.phys)?,
        };
        let parent_stack = parent.stack;
        let mut child = Pcb::new(Pid(0), &parent.name, parent.classification, parent.privileged);
        child.uid = parent.uid;
        child.capabilities = parent.capabilities;
        child.priority = parent.priority;
        child.brk = parent.brk;
        child.mmap_cursor = parent.mmap_cursor;

        let stack = match self.alloc_stack() {
            Ok(stack) => stack,
            Err(e) => {
                space.release(&mut self.zones);
                return Err(e);
            }
        };

        let mut ctx = CpuContext::default();
        cpu.save_context(&mut ctx);
        ctx.rax = 0;
        if let Some(ps) = parent_stack {
            for i in 0..stack.block.pages() {
                self.phys.copy_frame(ps.block.frame_at(i), stack.block.frame_at(i));
            }
            let delta = stack.base.as_u64().wrapping_sub(ps.base.as_u64());
            if ps.contains(ctx.rsp) {
                ctx.rsp = ctx.rsp.wrapping_add(delta);
            }
            if ps.contains(ctx.rbp) {
                ctx.rbp = ctx.rbp.wrapping_add(delta);
            }
        } else {
            ctx.rsp = stack.top().as_u64() & !0xF;
        }
        ctx.cr3 = space.cr3(&*self.hw);

        let pid = self.table.allocate_pid();
        child.pid = pid;
        child.parent = Some(me);
        child.created_at = self.ticks;
        child.canary = self.hw.random_u64();
        self.phys.write_u64(stack.block.start_address(), child.canary);
        child.context = ctx;
        child.stack = Some(stack);
        child.address_space = Some(space);

        let priority = child.priority;
        let detail = format!("fork of {}", me);
        self.table.install(slot, child);
        self.ready.enqueue(pid, priority);
        self.stats.processes_created += 1;
        crate::log_info!("Process {} forked child {}", me, pid);
        self.record(AuditEvent::ProcessCreate, pid, detail);
        Ok(pid)
    }

    pub fn get_priority(&self, pid: Pid) -> KResult<u64> {
        self.table.find(pid).map(|p| p.priority).ok_or(KernelError::NotFound)
    }

    pub fn set_priority(&mut self, pid: Pid, priority: u64) -> KResult<()> {
        let target = self.table.find(pid).ok_or(KernelError::NotFound)?;
        let verdict = security::check_owner(self.current_pcb(), target, Capabilities::SET_PRIORITY);
        if let Err(e) = verdict {
            self.deny(pid, "setpriority");
            return Err(e);
        }
        if let Some(pcb) = self.table.find_mut(pid) {
            pcb.priority = priority;
        }
        if self.ready.remove(pid) {
            self.ready.enqueue(pid, priority);
        }
        Ok(())
    }

    pub(crate) fn deny(&mut self, target: Pid, op: &str) {
        let caller = self.current.unwrap_or(Pid(0));
        crate::log_warn!("Security: process {} denied {} on process {}", caller, op, target);
        self.record(AuditEvent::SyscallDenied, caller, format!("{} on {}", op, target));
    }

    // ════════════════════════════════════════════════════════════
    //  Scheduling
    // ════════════════════════════════════════════════════════════

    /// Periodic interrupt: account CPU time and schedule every
    /// `schedule_interval` ticks.
    pub fn timer_tick(&mut self, cpu: &mut dyn Cpu) -> Option<ScheduleOutcome> {
        self.ticks += 1;
        if let Some(pcb) = self.current.and_then(|pid| self.table.find_mut(pid)) {
            if pcb.state() == ProcessState::Running {
                pcb.cpu_time += 1;
                pcb.time_slice = pcb.time_slice.saturating_sub(1);
            }
        }
        if self.ticks % self.config.schedule_interval.max(1) == 0 {
            Some(self.schedule(cpu))
        } else {
            None
        }
    }

    /// Pick the next process and switch to it.
    ///
    /// The running process is queued at its priority (behind equals) before
    /// the scan, while still marked `Running`, so the gate judges every
    /// candidate against it. Refused candidates stay queued. Returns with at
    /// most one `Running` process, which is never on the queue.
    pub fn schedule(&mut self, cpu: &mut dyn Cpu) -> ScheduleOutcome {
        self.stats.schedule_calls += 1;
        self.sweep();

        let incumbent = self
            .current
            .filter(|&pid| self.table.find(pid).is_some_and(|p| p.state() == ProcessState::Running));
        if let Some(pid) = incumbent {
            let priority = self.table.find(pid).map_or(DEFAULT_PRIORITY, |p| p.priority);
            self.ready.enqueue(pid, priority);
        }

        let mut chosen = None;
        let mut refused = Vec::new();
        for candidate in self.ready.iter() {
            let admitted = match incumbent {
                Some(inc) if inc != candidate => match (self.table.find(inc), self.table.find(candidate)) {
                    (Some(cur), Some(cand)) => security::check_preempt(cur, cand).is_ok(),
                    _ => panic!("scheduler: queued pid {} has no live PCB", candidate),
                },
                _ => true,
            };
            if admitted {
                chosen = Some(candidate);
                break;
            }
            refused.push(candidate);
        }
        for pid in refused {
            self.note_refusal(incumbent, pid);
        }

        let outcome = match chosen {
            None => {
                self.go_idle(cpu);
                ScheduleOutcome::Idle
            }
            Some(next) => {
                self.ready.remove(next);
                if Some(next) == incumbent {
                    if let Some(pcb) = self.table.find_mut(next) {
                        pcb.time_slice = DEFAULT_TIME_SLICE;
                    }
                    ScheduleOutcome::Continued(next)
                } else {
                    if let Some(pcb) = incumbent.and_then(|pid| self.table.find_mut(pid)) {
                        pcb.set_state(ProcessState::Ready);
                    }
                    let from = self.current;
                    self.switch_to(cpu, next);
                    ScheduleOutcome::Switched { from, to: next }
                }
            }
        };

        if cfg!(debug_assertions) {
            self.verify_consistency();
        }
        outcome
    }

    fn note_refusal(&mut self, incumbent: Option<Pid>, candidate: Pid) {
        let level_of = |pid: Pid| self.table.find(pid).map(|p| p.classification);
        let (Some(inc), Some(cur_level), Some(cand_level)) =
            (incumbent, incumbent.and_then(level_of), level_of(candidate))
        else {
            return;
        };
        crate::log_warn!(
            "Security violation: process {} ({}) may not preempt process {} ({})",
            candidate,
            cand_level,
            inc,
            cur_level
        );
        self.stats.gate_refusals += 1;
        self.record(AuditEvent::GateRefused, candidate, format!("{} below {}", cand_level, cur_level));
    }

    /// Deliver pending kills and retire zombies nobody will wait for.
    fn sweep(&mut self) {
        let doomed: Vec<(Pid, u64)> = self
            .table
            .iter()
            .filter(|p| !matches!(p.state(), ProcessState::Zombie | ProcessState::Dead))
            .filter_map(|p| p.pending_kill.map(|sig| (p.pid, sig)))
            .collect();
        for (pid, signal) in doomed {
            self.ready.remove(pid);
            if let Some(pcb) = self.table.find_mut(pid) {
                pcb.pending_kill = None;
                pcb.exit_status = Some(128 + signal as i64);
                pcb.set_state(ProcessState::Zombie);
            }
            crate::log_info!("Process {} terminated by signal {}", pid, signal);
            self.record(AuditEvent::ProcessExit, pid, format!("signal {}", signal));
            self.notify_parent(pid);
        }

        let orphans: Vec<Pid> = self
            .table
            .iter()
            .filter(|p| p.state() == ProcessState::Zombie && Some(p.pid) != self.current)
            .filter(|p| p.parent.map_or(true, |ppid| self.table.find(ppid).is_none()))
            .map(|p| p.pid)
            .collect();
        for pid in orphans {
            self.reap(pid);
        }
    }

    fn switch_to(&mut self, cpu: &mut dyn Cpu, next: Pid) {
        let outgoing = self.current;
        if let Some(pid) = outgoing {
            self.verify_canary(pid);
        }
        self.verify_canary(next);

        let Some(pcb) = self.table.find_mut(next) else {
            panic!("scheduler: queued pid {} has no live PCB", next);
        };
        pcb.set_state(ProcessState::Running);
        pcb.time_slice = DEFAULT_TIME_SLICE;
        let incoming = pcb.context;

        match outgoing.and_then(|pid| self.table.find_mut(pid)) {
            Some(prev) => switch(cpu, &mut prev.context, &incoming),
            None => switch(cpu, &mut self.idle_context, &incoming),
        }
        self.current = Some(next);
        self.stats.context_switches += 1;
    }

    fn go_idle(&mut self, cpu: &mut dyn Cpu) {
        let Some(pid) = self.current.take() else {
            return;
        };
        self.verify_canary(pid);
        if let Some(prev) = self.table.find_mut(pid) {
            switch(cpu, &mut prev.context, &self.idle_context);
        }
    }

    /// A process whose canary word changed has overrun its stack.
    fn verify_canary(&mut self, pid: Pid) {
        let Some(pcb) = self.table.find(pid) else {
            return;
        };
        let Some(stack) = pcb.stack else {
            return;
        };
        let found = self.phys.read_u64(stack.block.start_address());
        if found != pcb.canary {
            panic!(
                "stack canary corrupted for process {} ({}): expected {:#x}, found {:#x}",
                pid, pcb.name, pcb.canary, found
            );
        }
    }

    /// Scheduler bookkeeping must agree with the PCBs.
    pub fn verify_consistency(&self) {
        let running: Vec<Pid> = self
            .table
            .iter()
            .filter(|p| p.state() == ProcessState::Running)
            .map(|p| p.pid)
            .collect();
        if running.len() > 1 {
            panic!("scheduler: {} processes marked running: {:?}", running.len(), running);
        }
        if let Some(&pid) = running.first() {
            if self.current != Some(pid) {
                panic!("scheduler: running pid {} is not current ({:?})", pid, self.current);
            }
        }
        for pid in self.ready.iter() {
            match self.table.find(pid).map(|p| p.state()) {
                Some(ProcessState::Ready) => {}
                other => panic!("scheduler: queued pid {} is {:?}", pid, other),
            }
        }
    }
}
