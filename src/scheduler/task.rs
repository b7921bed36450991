use alloc::string::String;
use bitflags::bitflags;
use core::fmt;
use x86_64::VirtAddr;

use super::context::CpuContext;
use crate::config::{DEFAULT_PRIORITY, DEFAULT_TIME_SLICE, KERNEL_STACK_SIZE, PROCESS_NAME_MAX};
use crate::memory::{AddressSpace, PageBlock};
use crate::security::Classification;

/// Unique process identifier. Never reused while the kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Uid = u32;
pub const ROOT_UID: Uid = 0;
pub const DEFAULT_USER_UID: Uid = 1000;

/// Process state machine.
///
/// ```text
/// Ready ⇄ Running → Blocked → Ready
///           │
///           └→ Zombie → Dead
/// ```
/// Ready/Blocked → Zombie is forced termination; Ready → Dead is only legal
/// for a process that never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Zombie,
    Dead,
}

impl ProcessState {
    pub fn name(self) -> &'static str {
        match self {
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Blocked => "BLOCKED",
            ProcessState::Zombie => "ZOMBIE",
            ProcessState::Dead => "DEAD",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const BASIC        = 1 << 0;
        const SPAWN        = 1 << 1;
        const KILL         = 1 << 2;
        const SET_PRIORITY = 1 << 3;
        const MAP_MEMORY   = 1 << 4;
    }
}

impl Capabilities {
    pub fn for_privilege(privileged: bool) -> Self {
        if privileged {
            Capabilities::from_bits_retain(u32::MAX)
        } else {
            Capabilities::BASIC | Capabilities::SPAWN | Capabilities::MAP_MEMORY
        }
    }
}

/// Stack memory of one process, reached through the direct map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub block: PageBlock,
    pub base: VirtAddr,
}

impl StackRegion {
    pub fn size(&self) -> u64 {
        KERNEL_STACK_SIZE
    }

    pub fn top(&self) -> VirtAddr {
        self.base + self.size()
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base.as_u64() && addr <= self.top().as_u64()
    }
}

/// Process control block.
pub struct Pcb {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub name: String,
    state: ProcessState,
    pub classification: Classification,
    pub privileged: bool,
    pub uid: Uid,
    pub capabilities: Capabilities,
    pub context: CpuContext,
    pub stack: Option<StackRegion>,
    pub address_space: Option<AddressSpace>,
    pub priority: u64,
    pub time_slice: u64,
    pub cpu_time: u64,
    pub created_at: u64,
    pub canary: u64,
    pub exit_status: Option<i64>,
    /// Signal recorded by `kill`, delivered at the next scheduling pass.
    pub pending_kill: Option<u64>,
    pub brk: u64,
    pub mmap_cursor: u64,
    has_run: bool,
}

impl Pcb {
    /// An unused table slot.
    pub fn vacant() -> Self {
        Pcb {
            pid: Pid(0),
            parent: None,
            name: String::new(),
            state: ProcessState::Dead,
            classification: Classification::Unclassified,
            privileged: false,
            uid: DEFAULT_USER_UID,
            capabilities: Capabilities::empty(),
            context: CpuContext::default(),
            stack: None,
            address_space: None,
            priority: DEFAULT_PRIORITY,
            time_slice: DEFAULT_TIME_SLICE,
            cpu_time: 0,
            created_at: 0,
            canary: 0,
            exit_status: None,
            pending_kill: None,
            brk: 0,
            mmap_cursor: 0,
            has_run: false,
        }
    }

    /// A fresh process in `Ready`.
    pub fn new(pid: Pid, name: &str, classification: Classification, privileged: bool) -> Self {
        Pcb {
            pid,
            name: truncate_name(name),
            state: ProcessState::Ready,
            classification,
            privileged,
            uid: if privileged { ROOT_UID } else { DEFAULT_USER_UID },
            capabilities: Capabilities::for_privilege(privileged),
            ..Pcb::vacant()
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn has_run(&self) -> bool {
        self.has_run
    }

    pub fn is_live(&self) -> bool {
        self.state != ProcessState::Dead
    }

    /// Move to `next`. An illegal transition means the kernel's own
    /// bookkeeping is corrupt and is fatal.
    pub fn set_state(&mut self, next: ProcessState) {
        use ProcessState::*;
        let legal = match (self.state, next) {
            (Ready, Running) | (Running, Ready) => true,
            (Running, Blocked) | (Blocked, Ready) => true,
            (Running, Zombie) | (Ready, Zombie) | (Blocked, Zombie) => true,
            (Zombie, Dead) => true,
            (Ready, Dead) | (Blocked, Dead) => !self.has_run,
            _ => false,
        };
        if !legal {
            panic!(
                "process {} ({}): illegal state transition {} -> {}",
                self.pid,
                self.name,
                self.state.name(),
                next.name()
            );
        }
        if next == Running {
            self.has_run = true;
        }
        self.state = next;
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= PROCESS_NAME_MAX {
        return String::from(name);
    }
    let mut end = PROCESS_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcb() -> Pcb {
        Pcb::new(Pid(7), "worker", Classification::Secret, false)
    }

    #[test]
    fn new_process_is_ready_with_user_identity() {
        let p = pcb();
        assert_eq!(p.state(), ProcessState::Ready);
        assert_eq!(p.uid, DEFAULT_USER_UID);
        assert_eq!(p.capabilities, Capabilities::BASIC | Capabilities::SPAWN | Capabilities::MAP_MEMORY);
        assert!(!p.capabilities.contains(Capabilities::KILL));
        assert!(!p.has_run());

        let root = Pcb::new(Pid(1), "init", Classification::Pentagon, true);
        assert_eq!(root.uid, ROOT_UID);
        assert!(root.capabilities.contains(Capabilities::KILL | Capabilities::SPAWN));
    }

    #[test]
    fn long_names_are_truncated() {
        let p = Pcb::new(Pid(2), "a-process-name-well-beyond-the-table-limit", Classification::Unclassified, false);
        assert_eq!(p.name.len(), PROCESS_NAME_MAX);
    }

    #[test]
    fn lifecycle_follows_legal_edges() {
        let mut p = pcb();
        p.set_state(ProcessState::Running);
        assert!(p.has_run());
        p.set_state(ProcessState::Blocked);
        p.set_state(ProcessState::Ready);
        p.set_state(ProcessState::Running);
        p.set_state(ProcessState::Zombie);
        p.set_state(ProcessState::Dead);
        assert!(!p.is_live());
    }

    #[test]
    fn never_run_process_may_be_discarded() {
        let mut p = pcb();
        p.set_state(ProcessState::Dead);
        assert_eq!(p.state(), ProcessState::Dead);
    }

    #[test]
    #[should_panic(expected = "illegal state transition")]
    fn blocked_cannot_run_directly() {
        let mut p = pcb();
        p.set_state(ProcessState::Running);
        p.set_state(ProcessState::Blocked);
        p.set_state(ProcessState::Running);
    }

    #[test]
    #[should_panic(expected = "illegal state transition")]
    fn dead_is_terminal() {
        let mut p = pcb();
        p.set_state(ProcessState::Dead);
        p.set_state(ProcessState::Ready);
    }

    #[test]
    #[should_panic(expected = "illegal state transition")]
    fn process_that_ran_must_pass_through_zombie() {
        let mut p = pcb();
        p.set_state(ProcessState::Running);
        p.set_state(ProcessState::Ready);
        p.set_state(ProcessState::Dead);
    }
}
