//! Error types for scheduler and synchronization operations.
//!
//! Recoverable runtime conditions (timeouts, contention, exhaustion) are
//! reported through these enums. Invariant violations inside the scheduler
//! (queue corruption, lock-ownership mismatches, blocking from interrupt
//! context) are programming errors and panic at the point of detection
//! instead of surfacing here.

use core::fmt;

/// Result type for blocking and queue operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Status codes returned by blocking calls and work-queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedError {
    /// The wait's deadline elapsed before the resource became available.
    TimedOut = 1,
    /// The resource is unavailable and the caller asked not to block,
    /// or the operation cannot proceed while another is in flight
    /// (e.g. cancelling a work item whose handler is running).
    Busy = 2,
    /// The target object is in a state the operation does not apply to
    /// (giving a mutex the caller does not own, resuming a thread that
    /// is not suspended, waiting on a destroyed queue).
    InvalidState = 3,
}

/// Errors that can occur when spawning threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Priority outside the valid cooperative/preemptible range.
    InvalidPriority(i8),
    /// Out of stack memory or thread slots.
    OutOfMemory,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::TimedOut => write!(f, "operation timed out"),
            SchedError::Busy => write!(f, "resource busy"),
            SchedError::InvalidState => write!(f, "object in invalid state for operation"),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::InvalidPriority(prio) => write!(f, "priority {} out of range", prio),
            SpawnError::OutOfMemory => write!(f, "out of memory for thread creation"),
        }
    }
}
