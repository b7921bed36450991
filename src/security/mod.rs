//! Mandatory access control.
//!
//! Every process carries a classification level. The scheduler consults
//! `may_preempt_into` before letting a candidate displace the running
//! process: control may only move to an equal or higher level (no read-down
//! of CPU time from a higher level to a lower one). Creation and signalling
//! have their own checks at the system call boundary.

pub mod hardware;

pub use hardware::{HardwareSecurity, SoftwareSecurity};
#[cfg(target_os = "none")]
pub use hardware::X86Security;

use core::fmt;

use crate::error::{KResult, KernelError};
use crate::scheduler::{Capabilities, Pcb, ProcessState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Classification {
    Unclassified = 0,
    Confidential = 1,
    Secret = 2,
    TopSecret = 3,
    Pentagon = 4,
}

impl Classification {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Classification::Unclassified),
            1 => Some(Classification::Confidential),
            2 => Some(Classification::Secret),
            3 => Some(Classification::TopSecret),
            4 => Some(Classification::Pentagon),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Classification::Unclassified => "UNCLASSIFIED",
            Classification::Confidential => "CONFIDENTIAL",
            Classification::Secret => "SECRET",
            Classification::TopSecret => "TOP_SECRET",
            Classification::Pentagon => "PENTAGON",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// May the scheduler hand the CPU from `current` to `candidate`?
///
/// A `current` that is not running (blocked, exited, destroyed) imposes no
/// constraint.
pub fn may_preempt_into(current: &Pcb, candidate: &Pcb) -> bool {
    if current.state() != ProcessState::Running {
        return true;
    }
    candidate.classification >= current.classification
}

pub fn check_preempt(current: &Pcb, candidate: &Pcb) -> KResult<()> {
    if may_preempt_into(current, candidate) {
        Ok(())
    } else {
        Err(KernelError::AccessDenied)
    }
}

/// Creation through the system call boundary. The kernel itself (no
/// creator) may create anything; an unprivileged process can neither create
/// above its own level nor create a privileged process.
pub fn check_create(creator: Option<&Pcb>, requested: Classification, privileged: bool) -> KResult<()> {
    let Some(creator) = creator else {
        return Ok(());
    };
    if creator.privileged {
        return Ok(());
    }
    if privileged || requested > creator.classification {
        return Err(KernelError::AccessDenied);
    }
    if !creator.capabilities.contains(Capabilities::SPAWN) {
        return Err(KernelError::PermissionDenied);
    }
    Ok(())
}

/// The caller must own `target` or hold `capability`. Kernel-internal
/// calls pass `None`.
pub fn check_owner(caller: Option<&Pcb>, target: &Pcb, capability: Capabilities) -> KResult<()> {
    match caller {
        None => Ok(()),
        Some(c) if c.capabilities.contains(capability) || c.uid == target.uid => Ok(()),
        Some(_) => Err(KernelError::PermissionDenied),
    }
}

/// Destroying or signalling `target`.
pub fn check_signal(caller: Option<&Pcb>, target: &Pcb) -> KResult<()> {
    check_owner(caller, target, Capabilities::KILL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Pid;

    fn proc(level: Classification, state: ProcessState) -> Pcb {
        let mut p = Pcb::new(Pid(1), "p", level, false);
        if state == ProcessState::Running {
            p.set_state(ProcessState::Running);
        }
        p
    }

    #[test]
    fn running_process_cannot_be_displaced_by_lower_level() {
        let current = proc(Classification::Secret, ProcessState::Running);
        assert!(!may_preempt_into(&current, &proc(Classification::Confidential, ProcessState::Ready)));
        assert!(may_preempt_into(&current, &proc(Classification::Secret, ProcessState::Ready)));
        assert!(may_preempt_into(&current, &proc(Classification::Pentagon, ProcessState::Ready)));
        assert_eq!(
            check_preempt(&current, &proc(Classification::Unclassified, ProcessState::Ready)),
            Err(KernelError::AccessDenied)
        );
    }

    #[test]
    fn idle_current_imposes_no_constraint() {
        let current = proc(Classification::Pentagon, ProcessState::Ready);
        assert!(may_preempt_into(&current, &proc(Classification::Unclassified, ProcessState::Ready)));
    }

    #[test]
    fn unprivileged_creator_is_bounded_by_its_level() {
        let creator = proc(Classification::Secret, ProcessState::Running);
        assert!(check_create(Some(&creator), Classification::Confidential, false).is_ok());
        assert!(check_create(Some(&creator), Classification::Secret, false).is_ok());
        assert_eq!(check_create(Some(&creator), Classification::TopSecret, false), Err(KernelError::AccessDenied));
        assert_eq!(check_create(Some(&creator), Classification::Unclassified, true), Err(KernelError::AccessDenied));
        assert!(check_create(None, Classification::Pentagon, true).is_ok());
    }

    #[test]
    fn creating_needs_the_spawn_capability() {
        let mut creator = proc(Classification::Secret, ProcessState::Running);
        creator.capabilities.remove(Capabilities::SPAWN);
        assert_eq!(check_create(Some(&creator), Classification::Secret, false), Err(KernelError::PermissionDenied));
    }

    #[test]
    fn signalling_requires_ownership_or_capability() {
        let target = Pcb::new(Pid(2), "t", Classification::Unclassified, false);
        let mut stranger = Pcb::new(Pid(3), "s", Classification::Unclassified, false);
        assert!(check_signal(Some(&stranger), &target).is_ok());
        stranger.uid = 2000;
        assert_eq!(check_signal(Some(&stranger), &target), Err(KernelError::PermissionDenied));
        let admin = Pcb::new(Pid(4), "a", Classification::Unclassified, true);
        assert!(check_signal(Some(&admin), &target).is_ok());
        assert!(check_signal(None, &target).is_ok());
    }

    #[test]
    fn raw_levels_round_trip_through_names() {
        assert_eq!(Classification::from_raw(4), Some(Classification::Pentagon));
        assert_eq!(Classification::from_raw(5), None);
        assert_eq!(Classification::TopSecret.level(), 3);
    }
}
