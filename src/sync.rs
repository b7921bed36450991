//! The one global kernel instance.
//!
//! Interrupt handlers reach the scheduler through `KernelLock`. A timer tick
//! that finds the lock held (the interrupted code was already inside the
//! kernel) is counted and dropped instead of spinning on a lock its own CPU
//! holds.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::kernel::KernelState;
use crate::scheduler::{Cpu, ScheduleOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Lock busy or kernel not installed yet.
    Suppressed,
    Counted,
    Scheduled(ScheduleOutcome),
}

pub struct KernelLock {
    state: Mutex<Option<KernelState>>,
    suppressed: AtomicU64,
}

impl KernelLock {
    pub const fn new() -> Self {
        KernelLock { state: Mutex::new(None), suppressed: AtomicU64::new(0) }
    }

    /// Install the booted kernel. Panics if one is already installed.
    pub fn install(&self, state: KernelState) {
        let mut slot = self.state.lock();
        if slot.is_some() {
            panic!("kernel state installed twice");
        }
        *slot = Some(state);
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Run `f` on the kernel, spinning for the lock. `None` before install.
    pub fn with<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> Option<R> {
        self.state.lock().as_mut().map(f)
    }

    /// Like `with`, but gives up at once if the lock is held.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> Option<R> {
        self.state.try_lock().and_then(|mut guard| guard.as_mut().map(f))
    }

    /// Timer interrupt entry.
    pub fn timer_tick(&self, cpu: &mut dyn Cpu) -> TickOutcome {
        match self.try_with(|state| state.timer_tick(cpu)) {
            Some(Some(outcome)) => TickOutcome::Scheduled(outcome),
            Some(None) => TickOutcome::Counted,
            None => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Suppressed
            }
        }
    }

    pub fn suppressed_ticks(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl Default for KernelLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::hosted_kernel;
    use crate::scheduler::ProcessSpec;
    use crate::security::Classification;

    #[test]
    fn ticks_before_install_are_suppressed() {
        let lock = KernelLock::new();
        let (_, mut cpu) = hosted_kernel();
        assert_eq!(lock.timer_tick(&mut cpu), TickOutcome::Suppressed);
        assert_eq!(lock.suppressed_ticks(), 1);
        assert!(lock.with(|s| s.ticks()).is_none());
    }

    #[test]
    fn ticks_schedule_on_the_interval() {
        let lock = KernelLock::new();
        let (state, mut cpu) = hosted_kernel();
        let interval = state.config().schedule_interval;
        lock.install(state);
        let pid = lock
            .with(|s| s.spawn(ProcessSpec::new("a", Classification::Unclassified, false)))
            .unwrap()
            .unwrap();

        let mut scheduled = 0;
        for _ in 0..interval {
            match lock.timer_tick(&mut cpu) {
                TickOutcome::Scheduled(_) => scheduled += 1,
                TickOutcome::Counted => {}
                TickOutcome::Suppressed => panic!("lock was free"),
            }
        }
        assert_eq!(scheduled, 1);
        assert_eq!(lock.with(|s| s.current()), Some(Some(pid)));
        assert_eq!(lock.with(|s| s.ticks()), Some(interval));
    }

    #[test]
    fn tick_inside_the_kernel_is_dropped() {
        let lock = KernelLock::new();
        let (state, mut cpu) = hosted_kernel();
        lock.install(state);
        lock.with(|_| {
            assert_eq!(lock.timer_tick(&mut cpu), TickOutcome::Suppressed);
        });
        assert_eq!(lock.suppressed_ticks(), 1);
        assert_eq!(lock.with(|s| s.ticks()), Some(0));
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn double_install_panics() {
        let lock = KernelLock::new();
        lock.install(hosted_kernel().0);
        lock.install(hosted_kernel().0);
    }
}
