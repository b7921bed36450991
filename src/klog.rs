//! Kernel logging and the security audit trail.
//!
//! Log lines go to a single injected `LogSink` (COM1 on bare metal).
//! Audit records are kept in a bounded ring owned by the kernel state so the
//! security-relevant history can be inspected without a sink attached.

use alloc::collections::VecDeque;
use alloc::string::String;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

use crate::config::AUDIT_LOG_CAPACITY;
use crate::scheduler::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn tag(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Destination of formatted log lines.
pub trait LogSink: Sync {
    fn write_line(&self, level: Level, args: fmt::Arguments);
}

static SINK: Mutex<Option<&'static dyn LogSink>> = Mutex::new(None);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub fn set_sink(sink: &'static dyn LogSink) {
    *SINK.lock() = Some(sink);
}

pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 >= MAX_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log(level: Level, args: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    // A line emitted while the sink is busy (an interrupt landing inside
    // another log call) is dropped.
    if let Some(guard) = SINK.try_lock() {
        if let Some(sink) = *guard {
            sink.write_line(level, args);
        }
    }
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::klog::_log($crate::klog::Level::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::klog::_log($crate::klog::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::klog::_log($crate::klog::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::klog::_log($crate::klog::Level::Error, format_args!($($arg)*))
    };
}

// ──────────────────────────────────────────────────────────────
//  Audit trail
// ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    ProcessCreate,
    ProcessExit,
    ProcessDestroy,
    ProcessReap,
    KillRequest,
    GateRefused,
    SyscallDenied,
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub tick: u64,
    pub event: AuditEvent,
    pub pid: Pid,
    pub detail: String,
}

/// Bounded audit ring; the oldest record is evicted when full.
pub struct AuditLog {
    entries: VecDeque<AuditRecord>,
}

impl AuditLog {
    pub fn new() -> Self {
        AuditLog { entries: VecDeque::with_capacity(AUDIT_LOG_CAPACITY) }
    }

    pub fn push(&mut self, tick: u64, event: AuditEvent, pid: Pid, detail: String) {
        if self.entries.len() >= AUDIT_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(AuditRecord { tick, event, pid, detail });
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuditRecord> {
        self.entries.iter()
    }

    pub fn count(&self, event: AuditEvent) -> usize {
        self.entries.iter().filter(|r| r.event == event).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
