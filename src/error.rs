use core::fmt;

/// Recoverable kernel errors. Fatal conditions panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    NotFound,
    PermissionDenied,
    /// Refused by the mandatory access control policy.
    AccessDenied,
    InvalidArgument,
    NoChild,
    TableFull,
    NoCurrentProcess,
    Unsupported,
}

impl KernelError {
    /// Negative result handed back across the syscall boundary.
    pub fn errno(self) -> i64 {
        match self {
            KernelError::PermissionDenied => -1,
            KernelError::NoCurrentProcess => -1,
            KernelError::NotFound => -3,
            KernelError::NoChild => -10,
            KernelError::TableFull => -11,
            KernelError::OutOfMemory => -12,
            KernelError::AccessDenied => -13,
            KernelError::InvalidArgument => -22,
            KernelError::Unsupported => -38,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "Out of memory"),
            KernelError::NotFound => write!(f, "No such process"),
            KernelError::PermissionDenied => write!(f, "Operation not permitted"),
            KernelError::AccessDenied => write!(f, "Denied by security policy"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::NoChild => write!(f, "No child process"),
            KernelError::TableFull => write!(f, "Process table full"),
            KernelError::NoCurrentProcess => write!(f, "No current process"),
            KernelError::Unsupported => write!(f, "Function not implemented"),
        }
    }
}

pub type KResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_negative() {
        for e in [
            KernelError::OutOfMemory,
            KernelError::NotFound,
            KernelError::PermissionDenied,
            KernelError::AccessDenied,
            KernelError::InvalidArgument,
            KernelError::NoChild,
            KernelError::TableFull,
            KernelError::NoCurrentProcess,
            KernelError::Unsupported,
        ] {
            assert!(e.errno() < 0, "{} must map to a negative errno", e);
        }
        assert_eq!(KernelError::OutOfMemory.errno(), -12);
        assert_eq!(KernelError::Unsupported.errno(), -38);
    }

    #[test]
    fn messages_name_the_failure() {
        use alloc::string::ToString;
        assert_eq!(KernelError::NoChild.to_string(), "No child process");
        assert_eq!(KernelError::AccessDenied.to_string(), "Denied by security policy");
    }
}
