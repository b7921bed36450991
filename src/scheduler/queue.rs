use alloc::collections::VecDeque;

use super::task::Pid;

/// Runnable processes, highest priority first, FIFO among equals.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: VecDeque<(Pid, u64)>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        ReadyQueue { entries: VecDeque::new() }
    }

    /// Insert behind every entry of equal or higher priority.
    pub fn enqueue(&mut self, pid: Pid, priority: u64) {
        debug_assert!(!self.contains(pid), "pid {} queued twice", pid);
        let at = self
            .entries
            .iter()
            .position(|&(_, p)| p < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, (pid, priority));
    }

    pub fn remove(&mut self, pid: Pid) -> bool {
        match self.entries.iter().position(|&(p, _)| p == pid) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.iter().any(|&(p, _)| p == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.entries.iter().map(|&(p, _)| p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
