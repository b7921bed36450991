use alloc::vec::Vec;

use super::task::{Pcb, Pid, ProcessState};

/// Fixed-capacity process table. Slots whose PCB is `Dead` are free and get
/// reused; pids keep increasing regardless.
pub struct ProcessTable {
    slots: Vec<Pcb>,
    next_pid: u64,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Pcb::vacant);
        ProcessTable { slots, next_pid: 1 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|p| p.state() == ProcessState::Dead)
    }

    pub fn allocate_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Place a PCB in a free slot.
    pub fn install(&mut self, slot: usize, pcb: Pcb) {
        assert!(
            self.slots[slot].state() == ProcessState::Dead,
            "process table: slot {} is occupied",
            slot
        );
        self.slots[slot] = pcb;
    }

    fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots.iter().position(|p| p.pid == pid && p.is_live())
    }

    pub fn find(&self, pid: Pid) -> Option<&Pcb> {
        self.slot_of(pid).map(|i| &self.slots[i])
    }

    pub fn find_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slot_of(pid).map(move |i| &mut self.slots[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().filter(|p| p.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.iter().count()
    }

    pub fn count_in(&self, state: ProcessState) -> usize {
        self.iter().filter(|p| p.state() == state).count()
    }
}
